//! Modbus TCP framing
//!
//! Frame layout: `[TID(2)][Proto(2)=0][Len(2)][Unit(1)][PDU(N)]` where `Len`
//! counts the unit id plus the PDU. Reply boundaries come from the length
//! field: read the 6-byte header, then exactly `Len` more bytes.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error};

use crate::constants::{MAX_MBAP_LENGTH, MBAP_ENVELOPE_LEN, MBAP_HEADER_LEN};
use crate::error::{ModbusError, Result};

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier
    pub transaction_id: u16,
    /// Protocol identifier (fixed to 0)
    pub protocol_id: u16,
    /// Bytes following the length field (unit id + PDU)
    pub length: u16,
    /// Unit identifier (device id)
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse the 7-byte envelope at the start of `frame`
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < MBAP_ENVELOPE_LEN {
            return Err(ModbusError::frame(format!(
                "TCP frame too short: {} bytes",
                frame.len()
            )));
        }

        Ok(Self {
            transaction_id: u16::from_be_bytes([frame[0], frame[1]]),
            protocol_id: u16::from_be_bytes([frame[2], frame[3]]),
            length: u16::from_be_bytes([frame[4], frame[5]]),
            unit_id: frame[6],
        })
    }
}

/// Wrap a PDU in the MBAP envelope
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;

    let mut frame = BytesMut::with_capacity(MBAP_ENVELOPE_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0); // protocol_id
    frame.put_u16(length);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);

    debug!(
        "Building TCP frame: trans_id={:04X}, unit_id={}, PDU_len={}",
        transaction_id,
        unit_id,
        pdu.len()
    );
    frame.to_vec()
}

/// Read exactly one MBAP frame.
///
/// `read_exact` loops over partial reads; a connection closed mid-frame is
/// reported as an I/O failure.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; MBAP_HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(|e| {
        error!("TCP header RX: {}", e);
        read_error("header", e)
    })?;

    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if length == 0 || length > MAX_MBAP_LENGTH {
        error!("TCP invalid len: {}", length);
        // Consume the declared body so the next header starts on a boundary
        discard(reader, length).await?;
        return Err(ModbusError::frame(format!(
            "Invalid TCP frame length: {}",
            length
        )));
    }

    let mut frame = vec![0u8; MBAP_HEADER_LEN + length];
    frame[..MBAP_HEADER_LEN].copy_from_slice(&header);
    reader
        .read_exact(&mut frame[MBAP_HEADER_LEN..])
        .await
        .map_err(|e| {
            error!("TCP PDU RX: {}", e);
            read_error("body", e)
        })?;

    debug!("TCP RX: {}B", frame.len());
    Ok(frame)
}

/// Read and drop `n` bytes
async fn discard<R>(reader: &mut R, mut n: usize) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut scratch = [0u8; 256];
    while n > 0 {
        let chunk = n.min(scratch.len());
        reader
            .read_exact(&mut scratch[..chunk])
            .await
            .map_err(|e| read_error("body", e))?;
        n -= chunk;
    }
    Ok(())
}

fn read_error(part: &str, err: std::io::Error) -> ModbusError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ModbusError::io(format!("connection closed while reading TCP {part}"))
    } else {
        err.into()
    }
}

/// Split a complete frame into its header and PDU
pub fn parse_frame(frame: &[u8]) -> Result<(MbapHeader, &[u8])> {
    let header = MbapHeader::parse(frame)?;

    if header.protocol_id != 0 {
        return Err(ModbusError::protocol(format!(
            "Invalid protocol ID: expected 0, got {}",
            header.protocol_id
        )));
    }

    if frame.len() != MBAP_HEADER_LEN + header.length as usize {
        return Err(ModbusError::frame(format!(
            "Invalid TCP frame length: expected {}, got {}",
            MBAP_HEADER_LEN + header.length as usize,
            frame.len()
        )));
    }

    Ok((header, &frame[MBAP_ENVELOPE_LEN..]))
}
