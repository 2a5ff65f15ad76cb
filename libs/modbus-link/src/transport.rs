//! Transport abstraction
//!
//! `Framing` selects TCP or RTU framing behind one `encode / read_one_frame /
//! parse` contract. `Link` owns an open byte stream plus the timeouts in force
//! when it was opened. `Connector` opens new streams for the connection manager.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::config::{FlowControl, Parity, SerialConfig, TcpConfig, TimeoutConfig};
use crate::error::{ModbusError, Result};
use crate::types::TransportKind;
use crate::{rtu, tcp};

/// Byte stream a link runs over (TCP socket, serial port, in-memory pipe)
pub trait ModbusStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ModbusStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

// ============================================================================
// Framing
// ============================================================================

/// Wire framing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Tcp,
    Rtu,
}

impl From<TransportKind> for Framing {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Tcp => Framing::Tcp,
            TransportKind::Rtu => Framing::Rtu,
        }
    }
}

/// A reply frame split into its addressing fields and PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedFrame<'a> {
    pub transaction_id: Option<u16>,
    pub device_id: u8,
    pub pdu: &'a [u8],
}

impl Framing {
    pub fn kind(&self) -> TransportKind {
        match self {
            Framing::Tcp => TransportKind::Tcp,
            Framing::Rtu => TransportKind::Rtu,
        }
    }

    /// Wrap a PDU for the wire. RTU frames carry no transaction id.
    pub fn encode(&self, device_id: u8, transaction_id: Option<u16>, pdu: &[u8]) -> Vec<u8> {
        match self {
            Framing::Tcp => tcp::encode_frame(transaction_id.unwrap_or(0), device_id, pdu),
            Framing::Rtu => rtu::encode_frame(device_id, pdu),
        }
    }

    /// Read exactly one reply frame from `reader`
    pub async fn read_one_frame<R>(&self, reader: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        match self {
            Framing::Tcp => tcp::read_frame(reader).await,
            Framing::Rtu => rtu::read_frame(reader).await,
        }
    }

    /// Validate the envelope (or CRC) and expose the PDU
    pub fn parse<'a>(&self, frame: &'a [u8]) -> Result<ParsedFrame<'a>> {
        match self {
            Framing::Tcp => {
                let (header, pdu) = tcp::parse_frame(frame)?;
                Ok(ParsedFrame {
                    transaction_id: Some(header.transaction_id),
                    device_id: header.unit_id,
                    pdu,
                })
            },
            Framing::Rtu => {
                let (device_id, pdu) = rtu::parse_frame(frame)?;
                Ok(ParsedFrame {
                    transaction_id: None,
                    device_id,
                    pdu,
                })
            },
        }
    }
}

// ============================================================================
// Link
// ============================================================================

/// An open transport handle with the timeouts applied at open time
pub struct Link {
    stream: Box<dyn ModbusStream>,
    framing: Framing,
    send_timeout: Duration,
    receive_timeout: Duration,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("framing", &self.framing)
            .field("send_timeout", &self.send_timeout)
            .field("receive_timeout", &self.receive_timeout)
            .finish_non_exhaustive()
    }
}

impl Link {
    pub fn new(stream: Box<dyn ModbusStream>, framing: Framing, timeouts: TimeoutConfig) -> Self {
        Self {
            stream,
            framing,
            send_timeout: timeouts.send_timeout(),
            receive_timeout: timeouts.receive_timeout(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    /// Write one complete frame
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let send_timeout = self.send_timeout;
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(frame).await?;
            stream.flush().await?;
            Ok::<(), ModbusError>(())
        };

        match timeout(send_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::timeout(format!(
                "send timeout after {}ms",
                send_timeout.as_millis()
            ))),
        }
    }

    /// Read one complete reply frame within the receive timeout
    pub async fn read_one_frame(&mut self) -> Result<Vec<u8>> {
        let framing = self.framing;
        let receive_timeout = self.receive_timeout;
        match timeout(receive_timeout, framing.read_one_frame(&mut *self.stream)).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::timeout(format!(
                "no reply within {}ms",
                receive_timeout.as_millis()
            ))),
        }
    }

    /// Best-effort close of the underlying stream
    pub async fn shutdown(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Link shutdown: {}", e);
        }
    }
}

// ============================================================================
// Connectors
// ============================================================================

/// Opens fresh transport handles
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Link target used in logs and terminal errors
    fn target(&self) -> String;

    /// Open a stream, bounded by `connect_timeout` where the transport supports it
    async fn open(&self, connect_timeout: Duration) -> Result<Box<dyn ModbusStream>>;
}

/// Modbus TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn target(&self) -> String {
        self.config.address()
    }

    async fn open(&self, connect_timeout: Duration) -> Result<Box<dyn ModbusStream>> {
        let address = self.config.address();
        debug!("TCP connecting to {} (timeout {}ms)", address, connect_timeout.as_millis());

        let stream = match timeout(connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("TCP connect to {} failed: {}", address, e);
                return Err(ModbusError::io(format!("connect to {} failed: {}", address, e)));
            },
            Err(_) => {
                return Err(ModbusError::timeout(format!(
                    "connect to {} timed out after {}ms",
                    address,
                    connect_timeout.as_millis()
                )));
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("TCP_NODELAY on {}: {}", address, e);
        }
        info!("TCP connected to {}", address);
        Ok(Box::new(stream))
    }
}

/// Modbus RTU serial connector
#[derive(Debug, Clone)]
pub struct SerialConnector {
    config: SerialConfig,
}

impl SerialConnector {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }

    fn data_bits(&self) -> Result<tokio_serial::DataBits> {
        match self.config.data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(ModbusError::config(format!("Unsupported data bits: {}", other))),
        }
    }

    fn stop_bits(&self) -> Result<tokio_serial::StopBits> {
        match self.config.stop_bits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            other => Err(ModbusError::config(format!("Unsupported stop bits: {}", other))),
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Rtu
    }

    fn target(&self) -> String {
        self.config.device.clone()
    }

    async fn open(&self, _connect_timeout: Duration) -> Result<Box<dyn ModbusStream>> {
        let config = &self.config;
        debug!("Opening serial port {} at {} baud", config.device, config.baud_rate);

        let port = tokio_serial::new(&config.device, config.baud_rate)
            .data_bits(self.data_bits()?)
            .stop_bits(self.stop_bits()?)
            .parity(config.parity.into())
            .flow_control(config.flow_control.into())
            .open_native_async()
            .map_err(|e| {
                warn!("Serial open {} failed: {}", config.device, e);
                ModbusError::io(format!("open {} failed: {}", config.device, e))
            })?;

        info!("Serial port {} opened", config.device);
        Ok(Box::new(port))
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Running counters for one client
#[derive(Debug, Default)]
pub struct TransportStats {
    requests: AtomicU64,
    responses: AtomicU64,
    timeouts: AtomicU64,
    io_errors: AtomicU64,
    exceptions: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of `TransportStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub responses: u64,
    pub timeouts: u64,
    pub io_errors: u64,
    pub exceptions: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnects: u64,
}

impl TransportStats {
    pub fn record_sent(&self, bytes: usize) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed exchange by error class
    pub fn record_error(&self, error: &ModbusError) {
        match error {
            ModbusError::Timeout(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            },
            ModbusError::Io(_) | ModbusError::NotConnected | ModbusError::Desync(_) => {
                self.io_errors.fetch_add(1, Ordering::Relaxed);
            },
            ModbusError::Exception { .. } => {
                self.exceptions.fetch_add(1, Ordering::Relaxed);
            },
            _ => {},
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
