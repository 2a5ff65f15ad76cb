//! In-memory Modbus device used by the integration tests
//!
//! `SimConnector` hands the client one end of a `tokio::io::duplex` pipe per
//! open and serves the other end with a `DeviceModel`. Every request frame
//! the device receives is recorded for wire-level assertions.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
#![allow(dead_code)]

use async_trait::async_trait;
use modbus_link::constants::MEI_READ_DEVICE_ID;
use modbus_link::{
    rtu, tcp, Connector, ModbusError, ModbusStream, ReconnectConfig, Result, TimeoutConfig,
    TransportKind,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

// ============================================================================
// Device Model
// ============================================================================

/// Point tables and identification objects of the simulated device
pub struct DeviceModel {
    pub coils: Vec<bool>,
    pub discrete_inputs: Vec<bool>,
    pub holding_registers: Vec<u16>,
    pub input_registers: Vec<u16>,
    pub objects: Vec<(u8, Vec<u8>)>,
    /// Objects per identification reply
    pub page_size: usize,
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self {
            coils: vec![false; 1000],
            discrete_inputs: vec![false; 1000],
            holding_registers: vec![0; 1000],
            input_registers: vec![0; 1000],
            objects: vec![
                (0x00, b"ACME".to_vec()),
                (0x01, b"PX-100".to_vec()),
                (0x02, b"2.4".to_vec()),
            ],
            page_size: 8,
        }
    }
}

fn exception(fc: u8, code: u8) -> Vec<u8> {
    vec![fc | 0x80, code]
}

fn word(pdu: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([pdu[at], pdu[at + 1]])
}

fn pack(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, _) in bits.iter().enumerate().filter(|(_, on)| **on) {
        out[i / 8] |= 1 << (i % 8);
    }
    out
}

impl DeviceModel {
    /// Answer one request PDU
    pub fn handle(&mut self, pdu: &[u8]) -> Vec<u8> {
        let fc = pdu[0];
        match fc {
            0x01..=0x04 => {
                let (addr, count) = (word(pdu, 1) as usize, word(pdu, 3) as usize);
                let mut reply = vec![fc];
                let body = match fc {
                    0x01 | 0x02 => {
                        let table = if fc == 0x01 { &self.coils } else { &self.discrete_inputs };
                        match table.get(addr..addr + count) {
                            Some(bits) => pack(bits),
                            None => return exception(fc, 0x02),
                        }
                    },
                    _ => {
                        let table = if fc == 0x03 {
                            &self.holding_registers
                        } else {
                            &self.input_registers
                        };
                        match table.get(addr..addr + count) {
                            Some(regs) => regs.iter().flat_map(|r| r.to_be_bytes()).collect(),
                            None => return exception(fc, 0x02),
                        }
                    },
                };
                reply.push(body.len() as u8);
                reply.extend(body);
                reply
            },
            0x05 => {
                let addr = word(pdu, 1) as usize;
                let Some(coil) = self.coils.get_mut(addr) else {
                    return exception(fc, 0x02);
                };
                match word(pdu, 3) {
                    0xFF00 => *coil = true,
                    0x0000 => *coil = false,
                    _ => return exception(fc, 0x03),
                }
                pdu[..5].to_vec()
            },
            0x06 => {
                let addr = word(pdu, 1) as usize;
                let Some(reg) = self.holding_registers.get_mut(addr) else {
                    return exception(fc, 0x02);
                };
                *reg = word(pdu, 3);
                pdu[..5].to_vec()
            },
            0x0F => {
                let (addr, count) = (word(pdu, 1) as usize, word(pdu, 3) as usize);
                if addr + count > self.coils.len() {
                    return exception(fc, 0x02);
                }
                let data = &pdu[6..];
                for i in 0..count {
                    self.coils[addr + i] = data[i / 8] & (1 << (i % 8)) != 0;
                }
                pdu[..5].to_vec()
            },
            0x10 => {
                let (addr, count) = (word(pdu, 1) as usize, word(pdu, 3) as usize);
                if addr + count > self.holding_registers.len() {
                    return exception(fc, 0x02);
                }
                for i in 0..count {
                    self.holding_registers[addr + i] = word(pdu, 6 + i * 2);
                }
                pdu[..5].to_vec()
            },
            0x2B if pdu.get(1) == Some(&MEI_READ_DEVICE_ID) => {
                let (category, start) = (pdu[2], pdu[3]);
                let remaining: Vec<&(u8, Vec<u8>)> = if category == 0x04 {
                    // Individual access answers with exactly the requested object
                    match self.objects.iter().find(|(id, _)| *id == start) {
                        Some(object) => vec![object],
                        None => return exception(fc, 0x02),
                    }
                } else {
                    self.objects.iter().filter(|(id, _)| *id >= start).collect()
                };
                let page: Vec<_> = remaining.iter().take(self.page_size).collect();
                let next = remaining.get(self.page_size).map(|(id, _)| *id);

                let mut reply = vec![
                    fc,
                    MEI_READ_DEVICE_ID,
                    category,
                    0x81,
                    if next.is_some() { 0xFF } else { 0x00 },
                    next.unwrap_or(0),
                    page.len() as u8,
                ];
                for (id, value) in page {
                    reply.push(*id);
                    reply.push(value.len() as u8);
                    reply.extend_from_slice(value);
                }
                reply
            },
            _ => exception(fc, 0x01),
        }
    }
}

// ============================================================================
// Device Task
// ============================================================================

/// State shared between the connector, its device tasks and the test
#[derive(Default)]
pub struct SimState {
    pub model: Mutex<DeviceModel>,
    /// Every request frame received, in arrival order
    pub requests: Mutex<Vec<Vec<u8>>>,
    /// Swallow requests without replying
    pub silent: AtomicBool,
    /// Bytes of a new request arrived before the previous reply was sent
    pub interleaved: AtomicBool,
    /// A received frame failed to parse
    pub corrupt: AtomicBool,
    /// Hold each reply this long before sending
    pub reply_delay_ms: AtomicUsize,
    /// Raw bytes sent instead of the next replies, one entry per request
    pub raw_replies: Mutex<VecDeque<Vec<u8>>>,
}

/// Read one RTU request frame (request shapes differ from reply shapes)
async fn read_rtu_request(stream: &mut DuplexStream) -> std::io::Result<Vec<u8>> {
    let mut frame = vec![0u8; 2];
    stream.read_exact(&mut frame).await?;

    let rest = match frame[1] {
        0x01..=0x06 => 4 + 2,
        0x0F | 0x10 => {
            let mut header = [0u8; 5];
            stream.read_exact(&mut header).await?;
            frame.extend_from_slice(&header);
            header[4] as usize + 2
        },
        0x2B => 3 + 2,
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported FC {other:02X}"),
            ))
        },
    };

    let start = frame.len();
    frame.resize(start + rest, 0);
    stream.read_exact(&mut frame[start..]).await?;
    Ok(frame)
}

async fn serve(mut stream: DuplexStream, kind: TransportKind, state: Arc<SimState>) {
    loop {
        let frame = match kind {
            TransportKind::Tcp => tcp::read_frame(&mut stream).await.ok(),
            TransportKind::Rtu => read_rtu_request(&mut stream).await.ok(),
        };
        let Some(frame) = frame else {
            return;
        };
        state.requests.lock().push(frame.clone());

        let parsed = match kind {
            TransportKind::Tcp => {
                tcp::parse_frame(&frame).map(|(h, pdu)| (h.transaction_id, h.unit_id, pdu.to_vec()))
            },
            TransportKind::Rtu => rtu::parse_frame(&frame).map(|(unit, pdu)| (0, unit, pdu.to_vec())),
        };
        let Ok((tid, unit, pdu)) = parsed else {
            state.corrupt.store(true, Ordering::SeqCst);
            return;
        };

        if state.silent.load(Ordering::SeqCst) {
            continue;
        }

        let delay = state.reply_delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            // Nothing else may be written while this request is unanswered
            let mut early = [0u8; 1];
            if let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(2), stream.read(&mut early)).await
            {
                if n > 0 {
                    state.interleaved.store(true, Ordering::SeqCst);
                }
            }
        }

        let raw = state.raw_replies.lock().pop_front();
        if let Some(raw) = raw {
            if stream.write_all(&raw).await.is_err() {
                return;
            }
            continue;
        }

        let reply_pdu = state.model.lock().handle(&pdu);
        let reply = match kind {
            TransportKind::Tcp => tcp::encode_frame(tid, unit, &reply_pdu),
            TransportKind::Rtu => rtu::encode_frame(unit, &reply_pdu),
        };
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Connector that opens in-memory links to a simulated device
#[derive(Default)]
pub struct SimConnector {
    kind: Option<TransportKind>,
    pub state: Arc<SimState>,
    pub opens: AtomicUsize,
    /// Fail this many upcoming opens
    pub fail_next: AtomicUsize,
    /// Fail every open
    pub refuse: AtomicBool,
    devices: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SimConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimConnector")
            .field("kind", &self.kind)
            .field("opens", &self.opens)
            .finish()
    }
}

impl SimConnector {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind: Some(kind),
            ..Self::default()
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Drop the device side of every open link
    pub fn sever(&self) {
        for device in self.devices.lock().drain(..) {
            device.abort();
        }
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.requests.lock().clone()
    }

    /// Answer the next request with `bytes` verbatim
    pub fn queue_raw_reply(&self, bytes: Vec<u8>) {
        self.state.raw_replies.lock().push_back(bytes);
    }
}

#[async_trait]
impl Connector for SimConnector {
    fn kind(&self) -> TransportKind {
        self.kind.unwrap_or(TransportKind::Tcp)
    }

    fn target(&self) -> String {
        "sim-device".to_string()
    }

    async fn open(&self, _connect_timeout: Duration) -> Result<Box<dyn ModbusStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(ModbusError::io("connection refused"));
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ModbusError::io("connection refused"));
        }

        let (client, device) = tokio::io::duplex(4096);
        let handle = tokio::spawn(serve(device, self.kind(), self.state.clone()));
        self.devices.lock().push(handle);
        Ok(Box::new(client))
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn fast_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        send_timeout_ms: 500,
        receive_timeout_ms: 500,
    }
}

pub fn deadline(ms: u64) -> ReconnectConfig {
    ReconnectConfig {
        deadline_ms: Some(ms),
        ..ReconnectConfig::default()
    }
}
