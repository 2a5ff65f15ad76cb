//! Modbus PDU codec
//!
//! Validates request arguments, serialises requests into function-specific
//! PDU layouts and classifies reply PDUs into success, device exception or
//! protocol violation. Timeouts never come from here; they are synthesised by
//! the transport layer.

use tracing::{debug, trace, warn};

use crate::buffer::DataBuffer;
use crate::constants::{self, EXCEPTION_FLAG, MEI_SUB_HEADER_LEN, WRITE_ECHO_LEN};
use crate::error::{ModbusError, Result};
use crate::pdu::{FunctionCode, IdentificationPage, PduBuilder, Request, Response};
use crate::types::{Coil, DeviceObject, DiscreteInput, Register, TransportKind};

// ============================================================================
// Validation
// ============================================================================

/// Reject device ids the transport cannot address
pub fn validate_device_id(kind: TransportKind, device_id: u8) -> Result<()> {
    if kind.accepts_device_id(device_id) {
        return Ok(());
    }
    let range = kind.device_id_range();
    Err(ModbusError::invalid_argument(format!(
        "device id {} out of range for {} (valid {}-{})",
        device_id,
        kind,
        range.start(),
        range.end()
    )))
}

/// Check `count` against the function's limits and that the addressed block
/// does not run past 65535.
pub fn validate_range(function: FunctionCode, address: u16, count: u16) -> Result<()> {
    let max = function.max_count();
    if count == 0 || count > max {
        return Err(ModbusError::invalid_argument(format!(
            "count {} out of range for {} (valid 1-{})",
            count, function, max
        )));
    }

    let last = u32::from(address) + u32::from(count) - 1;
    if last > u32::from(u16::MAX) {
        return Err(ModbusError::invalid_argument(format!(
            "address range {}+{} exceeds 65535",
            address, count
        )));
    }
    Ok(())
}

/// Verify that sorted addresses form one run without gaps or duplicates.
///
/// Returns the first address and the element count.
pub fn contiguous_run(sorted: impl IntoIterator<Item = u16>, what: &str) -> Result<(u16, u16)> {
    let mut iter = sorted.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| ModbusError::invalid_argument(format!("no {what} values to write")))?;

    let mut prev = first;
    let mut count: u32 = 1;
    for addr in iter {
        if u32::from(addr) != u32::from(prev) + 1 {
            return Err(ModbusError::invalid_argument(format!(
                "{what} addresses not contiguous: {} followed by {}",
                prev, addr
            )));
        }
        prev = addr;
        count += 1;
    }

    let count = u16::try_from(count)
        .map_err(|_| ModbusError::invalid_argument(format!("too many {what} values")))?;
    Ok((first, count))
}

// ============================================================================
// Bit Packing
// ============================================================================

/// Pack booleans LSB-first: bit `i` goes to bit `i % 8` of byte `i / 8`
pub fn pack_bits(bits: &[bool]) -> DataBuffer {
    let mut packed = DataBuffer::new(bits.len().div_ceil(8));
    for (i, &on) in bits.iter().enumerate() {
        if on {
            let byte = packed.get_byte(i / 8) | (1 << (i % 8));
            packed.set_byte(i / 8, byte);
        }
    }
    packed
}

/// Unpack `count` booleans from LSB-first packed bytes
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}

// ============================================================================
// Encoding
// ============================================================================

/// Serialise a request into its PDU (function code + function data)
pub fn encode_request(request: &Request) -> Result<DataBuffer> {
    let function = request.function();
    let builder = PduBuilder::new().function_code(function.code());

    let builder = match function {
        FunctionCode::ReadCoils
        | FunctionCode::ReadDiscreteInputs
        | FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters => {
            builder.address(request.address()).quantity(request.count())
        },
        FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
            let payload = required_payload(request)?;
            builder.address(request.address()).data(payload.as_slice())
        },
        FunctionCode::WriteMultipleCoils => {
            let payload = required_payload(request)?;
            builder
                .address(request.address())
                .quantity(request.count())
                .byte(payload.len() as u8)
                .data(payload.as_slice())
        },
        FunctionCode::WriteMultipleRegisters => {
            // Payload already carries the byte-count prefix
            let payload = required_payload(request)?;
            builder
                .address(request.address())
                .quantity(request.count())
                .data(payload.as_slice())
        },
        FunctionCode::ReadDeviceIdentification => {
            let mei = request.mei().ok_or_else(|| {
                ModbusError::invalid_argument("device identification request without MEI fields")
            })?;
            builder
                .byte(mei.mei_type)
                .byte(mei.category.code())
                .byte(mei.object_id)
        },
    };

    builder.build()
}

fn required_payload(request: &Request) -> Result<&DataBuffer> {
    request.payload().ok_or_else(|| {
        ModbusError::invalid_argument(format!("{} request without payload", request.function()))
    })
}

// ============================================================================
// Decoding
// ============================================================================

/// Classify a reply PDU against the request it answers.
///
/// `transaction_id` is the reply's envelope id (TCP only). A device
/// exception is returned as `ModbusError::Exception`.
pub fn decode_response(
    request: &Request,
    device_id: u8,
    transaction_id: Option<u16>,
    pdu: &[u8],
) -> Result<Response> {
    if let (Some(expected), Some(actual)) = (request.transaction_id(), transaction_id) {
        if expected != actual {
            return Err(ModbusError::protocol(format!(
                "transaction id mismatch: expected {:04X}, got {:04X}",
                expected, actual
            )));
        }
    }

    if device_id != request.device_id() {
        return Err(ModbusError::protocol(format!(
            "reply from device {} to request for device {}",
            device_id,
            request.device_id()
        )));
    }

    let fc = *pdu
        .first()
        .ok_or_else(|| ModbusError::frame("empty reply PDU"))?;
    let expected_fc = request.function().code();

    if fc & EXCEPTION_FLAG != 0 {
        if fc & !EXCEPTION_FLAG != expected_fc {
            return Err(ModbusError::protocol(format!(
                "exception for FC{:02X} in reply to FC{:02X}",
                fc & !EXCEPTION_FLAG,
                expected_fc
            )));
        }
        let code = *pdu
            .get(1)
            .ok_or_else(|| ModbusError::frame("exception reply without exception code"))?;
        let err = ModbusError::exception(fc, code);
        warn!("Device {} rejected FC{:02X}: {}", device_id, expected_fc, err);
        return Err(err);
    }

    if fc != expected_fc {
        return Err(ModbusError::protocol(format!(
            "unexpected function code: expected {:02X}, got {:02X}",
            expected_fc, fc
        )));
    }

    let function = request.function();
    let response = match function {
        FunctionCode::ReadCoils
        | FunctionCode::ReadDiscreteInputs
        | FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters => decode_read(request, pdu)?,
        FunctionCode::WriteSingleCoil
        | FunctionCode::WriteSingleRegister
        | FunctionCode::WriteMultipleCoils
        | FunctionCode::WriteMultipleRegisters => decode_write_echo(request, pdu)?,
        FunctionCode::ReadDeviceIdentification => decode_identification(request, pdu)?,
    };

    trace!(
        "Decoded {} from device {}: {} payload bytes",
        function,
        device_id,
        response.payload.len()
    );
    Ok(Response {
        transaction_id,
        ..response
    })
}

fn decode_read(request: &Request, pdu: &[u8]) -> Result<Response> {
    let byte_count = *pdu
        .get(1)
        .ok_or_else(|| ModbusError::frame("read reply without byte count"))? as usize;
    if pdu.len() != 2 + byte_count {
        return Err(ModbusError::frame(format!(
            "read reply declares {} data bytes but carries {}",
            byte_count,
            pdu.len().saturating_sub(2)
        )));
    }

    let count = request.count() as usize;
    let expected = if request.function().is_bit_access() {
        count.div_ceil(8)
    } else {
        count * 2
    };
    if byte_count != expected {
        return Err(ModbusError::frame(format!(
            "{} reply carries {} bytes, expected {} for {} elements",
            request.function(),
            byte_count,
            expected,
            count
        )));
    }

    Ok(Response {
        device_id: request.device_id(),
        function: request.function(),
        address: request.address(),
        count: request.count(),
        payload: DataBuffer::from_slice(&pdu[2..]),
        transaction_id: None,
        identification: None,
    })
}

fn decode_write_echo(request: &Request, pdu: &[u8]) -> Result<Response> {
    if pdu.len() != 1 + WRITE_ECHO_LEN {
        return Err(ModbusError::frame(format!(
            "write reply must be {} bytes, got {}",
            1 + WRITE_ECHO_LEN,
            pdu.len()
        )));
    }

    let echo = DataBuffer::from_slice(&pdu[1..]);
    let echoed_address = echo.get_u16_be(0);
    let echoed_second = echo.get_u16_be(2);

    // Single writes echo the value, multiple writes echo the quantity
    let expected_second = match request.function() {
        FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
            required_payload(request)?.get_u16_be(0)
        },
        _ => request.count(),
    };

    if echoed_address != request.address() || echoed_second != expected_second {
        return Err(ModbusError::protocol(format!(
            "{} echo mismatch: sent {:04X}/{:04X}, got {:04X}/{:04X}",
            request.function(),
            request.address(),
            expected_second,
            echoed_address,
            echoed_second
        )));
    }

    Ok(Response {
        device_id: request.device_id(),
        function: request.function(),
        address: request.address(),
        count: request.count(),
        payload: echo,
        transaction_id: None,
        identification: None,
    })
}

fn decode_identification(request: &Request, pdu: &[u8]) -> Result<Response> {
    if pdu.len() < 1 + MEI_SUB_HEADER_LEN {
        return Err(ModbusError::frame("device identification reply too short"));
    }

    let mei_type = pdu[1];
    if mei_type != constants::MEI_READ_DEVICE_ID {
        return Err(ModbusError::protocol(format!(
            "unexpected MEI type {:02X}",
            mei_type
        )));
    }

    let page = parse_identification_objects(&pdu[2..])?;
    debug!(
        "Identification page: {} objects, more_follows={}, next={:02X}",
        page.object_count(),
        page.more_follows,
        page.next_object_id
    );

    Ok(Response {
        device_id: request.device_id(),
        function: request.function(),
        address: request.address(),
        count: page.object_count() as u16,
        payload: DataBuffer::from_slice(&pdu[1 + MEI_SUB_HEADER_LEN..]),
        transaction_id: None,
        identification: Some(page),
    })
}

/// Parse the identification body that follows the MEI type byte:
/// category, conformity, more-follows, next id, count, then (id, len, value) triples.
fn parse_identification_objects(body: &[u8]) -> Result<IdentificationPage> {
    let category = body[0];
    let conformity_level = body[1];
    let more_follows = match body[2] {
        0x00 => false,
        0xFF => true,
        other => {
            return Err(ModbusError::frame(format!(
                "invalid more-follows marker {:02X}",
                other
            )))
        },
    };
    let next_object_id = body[3];
    let declared = body[4] as usize;

    let mut objects = Vec::with_capacity(declared);
    let mut pos = 5;
    for _ in 0..declared {
        let header = body
            .get(pos..pos + 2)
            .ok_or_else(|| ModbusError::frame("identification object header truncated"))?;
        let (id, len) = (header[0], header[1] as usize);
        let value = body
            .get(pos + 2..pos + 2 + len)
            .ok_or_else(|| ModbusError::frame(format!("identification object {:02X} truncated", id)))?;
        objects.push(DeviceObject::new(id, value));
        pos += 2 + len;
    }

    if pos != body.len() {
        return Err(ModbusError::frame(format!(
            "{} trailing bytes after identification objects",
            body.len() - pos
        )));
    }

    Ok(IdentificationPage {
        category,
        conformity_level,
        more_follows,
        next_object_id,
        objects,
    })
}

// ============================================================================
// Typed Extraction
// ============================================================================

pub fn to_coils(response: &Response) -> Vec<Coil> {
    unpack_bits(response.payload().as_slice(), response.count() as usize)
        .into_iter()
        .enumerate()
        .map(|(i, value)| Coil::new(response.address().wrapping_add(i as u16), value))
        .collect()
}

pub fn to_discrete_inputs(response: &Response) -> Vec<DiscreteInput> {
    unpack_bits(response.payload().as_slice(), response.count() as usize)
        .into_iter()
        .enumerate()
        .map(|(i, value)| DiscreteInput::new(response.address().wrapping_add(i as u16), value))
        .collect()
}

pub fn to_registers(response: &Response) -> Vec<Register> {
    let payload = response.payload();
    (0..response.count() as usize)
        .map(|i| {
            Register::new(
                response.address().wrapping_add(i as u16),
                payload.get_u16_be(i * 2),
            )
        })
        .collect()
}
