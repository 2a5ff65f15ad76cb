//! Modbus RTU framing
//!
//! Frame layout: `[Unit(1)][PDU(N)][CRC(2)]`. There is no length field, so
//! the reply boundary is derived from the function code: reads declare a
//! byte count, writes echo 4 bytes, exceptions carry 1 byte and device
//! identification is walked object by object. The CRC-16/MODBUS trailer is
//! sent low byte first and validated before a frame is accepted.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error};

use crate::constants::{self, CRC_LEN, EXCEPTION_FLAG, MAX_PDU_SIZE, MEI_SUB_HEADER_LEN, WRITE_ECHO_LEN};
use crate::error::{ModbusError, Result};

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Largest serial ADU: address + PDU + CRC
const MAX_RTU_FRAME: usize = 1 + MAX_PDU_SIZE + CRC_LEN;

/// Calculate the CRC-16/MODBUS checksum
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Build an RTU frame (`unit_id` + PDU + CRC)
pub fn encode_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(1 + pdu.len() + CRC_LEN);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);

    let crc = crc16(&frame);
    frame.put_u16_le(crc);

    debug!(
        "Building RTU frame: unit_id={}, PDU_len={}, CRC={:04X}",
        unit_id,
        pdu.len(),
        crc
    );
    frame.to_vec()
}

/// Read exactly one RTU reply frame, sized procedurally from its function code.
///
/// A reply whose size cannot be derived leaves unread bytes behind and fails
/// with [`ModbusError::Desync`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut frame = Vec::with_capacity(MAX_RTU_FRAME);

    // Unit id + function code
    read_more(reader, &mut frame, 2).await?;
    let fc = frame[1];

    if fc & EXCEPTION_FLAG != 0 {
        read_more(reader, &mut frame, 1).await?;
    } else {
        match fc {
            constants::FC_READ_COILS
            | constants::FC_READ_DISCRETE_INPUTS
            | constants::FC_READ_HOLDING_REGISTERS
            | constants::FC_READ_INPUT_REGISTERS => {
                read_more(reader, &mut frame, 1).await?;
                let byte_count = frame[2] as usize;
                read_more(reader, &mut frame, byte_count).await?;
            },
            constants::FC_WRITE_SINGLE_COIL
            | constants::FC_WRITE_SINGLE_REGISTER
            | constants::FC_WRITE_MULTIPLE_COILS
            | constants::FC_WRITE_MULTIPLE_REGISTERS => {
                read_more(reader, &mut frame, WRITE_ECHO_LEN).await?;
            },
            constants::FC_ENCAPSULATED_INTERFACE => {
                read_more(reader, &mut frame, MEI_SUB_HEADER_LEN).await?;
                if frame[2] != constants::MEI_READ_DEVICE_ID {
                    return Err(ModbusError::desync(format!(
                        "unexpected MEI type {:02X}",
                        frame[2]
                    )));
                }
                let object_count = frame[2 + MEI_SUB_HEADER_LEN - 1];
                for _ in 0..object_count {
                    read_more(reader, &mut frame, 2).await?;
                    let value_len = frame[frame.len() - 1] as usize;
                    read_more(reader, &mut frame, value_len).await?;
                }
            },
            other => {
                error!("RTU unexpected FC: {:02X}", other);
                return Err(ModbusError::desync(format!(
                    "unexpected function code {:02X} in RTU reply",
                    other
                )));
            },
        }
    }

    read_more(reader, &mut frame, CRC_LEN).await?;
    debug!("RTU RX: {}B", frame.len());
    Ok(frame)
}

/// Append exactly `n` bytes to `frame`
async fn read_more<R>(reader: &mut R, frame: &mut Vec<u8>, n: usize) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let start = frame.len();
    if start + n > MAX_RTU_FRAME {
        return Err(ModbusError::desync(format!(
            "RTU frame exceeds {} bytes",
            MAX_RTU_FRAME
        )));
    }

    frame.resize(start + n, 0);
    reader.read_exact(&mut frame[start..]).await.map_err(|e| {
        error!("RTU RX: {}", e);
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ModbusError::io("serial port closed mid-frame")
        } else {
            e.into()
        }
    })?;
    Ok(())
}

/// Validate the CRC and split a frame into unit id and PDU
pub fn parse_frame(frame: &[u8]) -> Result<(u8, &[u8])> {
    if frame.len() < 2 + CRC_LEN {
        return Err(ModbusError::frame("RTU frame too short"));
    }

    let body_len = frame.len() - CRC_LEN;
    let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    let calculated = crc16(&frame[..body_len]);
    if received != calculated {
        return Err(ModbusError::frame(format!(
            "CRC mismatch: expected 0x{calculated:04X}, got 0x{received:04X}"
        )));
    }

    Ok((frame[0], &frame[1..body_len]))
}
