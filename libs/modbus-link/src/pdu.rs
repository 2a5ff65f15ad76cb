//! Modbus PDU data structures
//!
//! `Request` and `Response` are the typed forms exchanged with the codec.
//! A request is validated when it is built and is immutable afterwards.

use bytes::{BufMut, BytesMut};
use std::fmt;
use tracing::debug;

use crate::buffer::DataBuffer;
use crate::codec;
use crate::constants::{self, MAX_PDU_SIZE};
use crate::error::{ModbusError, Result};
use crate::types::{Coil, DeviceIdCategory, DeviceObject, Register, TransportKind};

// ============================================================================
// Function Codes
// ============================================================================

/// Supported function codes (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
    /// Encapsulated Interface Transport (MEI 14: Read Device Identification)
    ReadDeviceIdentification,
}

impl FunctionCode {
    pub fn code(&self) -> u8 {
        match self {
            FunctionCode::ReadCoils => constants::FC_READ_COILS,
            FunctionCode::ReadDiscreteInputs => constants::FC_READ_DISCRETE_INPUTS,
            FunctionCode::ReadHoldingRegisters => constants::FC_READ_HOLDING_REGISTERS,
            FunctionCode::ReadInputRegisters => constants::FC_READ_INPUT_REGISTERS,
            FunctionCode::WriteSingleCoil => constants::FC_WRITE_SINGLE_COIL,
            FunctionCode::WriteSingleRegister => constants::FC_WRITE_SINGLE_REGISTER,
            FunctionCode::WriteMultipleCoils => constants::FC_WRITE_MULTIPLE_COILS,
            FunctionCode::WriteMultipleRegisters => constants::FC_WRITE_MULTIPLE_REGISTERS,
            FunctionCode::ReadDeviceIdentification => constants::FC_ENCAPSULATED_INTERFACE,
        }
    }

    /// Look up a function code with the exception bit cleared
    pub fn from_code(code: u8) -> Option<Self> {
        match code & !constants::EXCEPTION_FLAG {
            constants::FC_READ_COILS => Some(FunctionCode::ReadCoils),
            constants::FC_READ_DISCRETE_INPUTS => Some(FunctionCode::ReadDiscreteInputs),
            constants::FC_READ_HOLDING_REGISTERS => Some(FunctionCode::ReadHoldingRegisters),
            constants::FC_READ_INPUT_REGISTERS => Some(FunctionCode::ReadInputRegisters),
            constants::FC_WRITE_SINGLE_COIL => Some(FunctionCode::WriteSingleCoil),
            constants::FC_WRITE_SINGLE_REGISTER => Some(FunctionCode::WriteSingleRegister),
            constants::FC_WRITE_MULTIPLE_COILS => Some(FunctionCode::WriteMultipleCoils),
            constants::FC_WRITE_MULTIPLE_REGISTERS => Some(FunctionCode::WriteMultipleRegisters),
            constants::FC_ENCAPSULATED_INTERFACE => Some(FunctionCode::ReadDeviceIdentification),
            _ => None,
        }
    }

    /// FC01-04: reply carries a byte count followed by data
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    /// FC05/06/15/16: reply is a fixed 4-byte echo
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            FunctionCode::WriteSingleCoil
                | FunctionCode::WriteSingleRegister
                | FunctionCode::WriteMultipleCoils
                | FunctionCode::WriteMultipleRegisters
        )
    }

    /// Bit-addressed functions (coils and discrete inputs)
    pub fn is_bit_access(&self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::WriteSingleCoil
                | FunctionCode::WriteMultipleCoils
        )
    }

    /// Largest element count a single request may carry
    pub fn max_count(&self) -> u16 {
        match self {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                constants::MAX_READ_COILS
            },
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                constants::MAX_READ_REGISTERS
            },
            FunctionCode::WriteMultipleCoils => constants::MAX_WRITE_COILS,
            FunctionCode::WriteMultipleRegisters => constants::MAX_WRITE_REGISTERS,
            FunctionCode::WriteSingleCoil
            | FunctionCode::WriteSingleRegister
            | FunctionCode::ReadDeviceIdentification => 1,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
            FunctionCode::ReadDeviceIdentification => "Read Device Identification",
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FC{:02X} ({})", self.code(), self.description())
    }
}

// ============================================================================
// PDU Builder
// ============================================================================

/// PDU builder - fluent API over a growable byte buffer
#[derive(Debug, Default)]
pub struct PduBuilder {
    buf: BytesMut,
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_PDU_SIZE),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> Self {
        self.buf.put_u8(fc);
        self
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> Self {
        self.buf.put_u16(addr);
        self
    }

    #[inline]
    pub fn quantity(mut self, qty: u16) -> Self {
        self.buf.put_u16(qty);
        self
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> Self {
        self.buf.put_u8(b);
        self
    }

    #[inline]
    pub fn data(mut self, data: &[u8]) -> Self {
        self.buf.put_slice(data);
        self
    }

    /// Finish the PDU, rejecting anything larger than a PDU may be
    pub fn build(self) -> Result<DataBuffer> {
        if self.buf.len() > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                self.buf.len(),
                MAX_PDU_SIZE
            )));
        }
        if let Some(&fc) = self.buf.first() {
            debug!("PDU built: FC={:02X}, total_len={}", fc, self.buf.len());
        }
        Ok(DataBuffer::from(self.buf.to_vec()))
    }
}

// ============================================================================
// Request
// ============================================================================

/// Read Device Identification parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeiRequest {
    pub mei_type: u8,
    pub category: DeviceIdCategory,
    pub object_id: u8,
}

/// A validated, immutable Modbus request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    device_id: u8,
    function: FunctionCode,
    address: u16,
    count: u16,
    payload: Option<DataBuffer>,
    transaction_id: Option<u16>,
    mei: Option<MeiRequest>,
}

impl Request {
    /// FC01-04 read request
    pub fn read(
        kind: TransportKind,
        function: FunctionCode,
        device_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Self> {
        if !function.is_read() {
            return Err(ModbusError::invalid_argument(format!(
                "{function} is not a read function"
            )));
        }
        codec::validate_device_id(kind, device_id)?;
        codec::validate_range(function, address, count)?;

        Ok(Self {
            device_id,
            function,
            address,
            count,
            payload: None,
            transaction_id: None,
            mei: None,
        })
    }

    /// FC05 request; ON is encoded as 0xFF00 and OFF as 0x0000
    pub fn write_single_coil(
        kind: TransportKind,
        device_id: u8,
        address: u16,
        value: bool,
    ) -> Result<Self> {
        codec::validate_device_id(kind, device_id)?;
        let mut payload = DataBuffer::new(2);
        payload.set_u16_be(
            0,
            if value {
                constants::COIL_ON
            } else {
                constants::COIL_OFF
            },
        );

        Ok(Self {
            device_id,
            function: FunctionCode::WriteSingleCoil,
            address,
            count: 1,
            payload: Some(payload),
            transaction_id: None,
            mei: None,
        })
    }

    /// FC06 request
    pub fn write_single_register(
        kind: TransportKind,
        device_id: u8,
        address: u16,
        value: u16,
    ) -> Result<Self> {
        codec::validate_device_id(kind, device_id)?;
        let mut payload = DataBuffer::new(2);
        payload.set_u16_be(0, value);

        Ok(Self {
            device_id,
            function: FunctionCode::WriteSingleRegister,
            address,
            count: 1,
            payload: Some(payload),
            transaction_id: None,
            mei: None,
        })
    }

    /// FC15 request; the coils must form a contiguous address run once sorted.
    ///
    /// The payload is the bit-packed coil states, `ceil(count / 8)` bytes.
    pub fn write_multiple_coils(kind: TransportKind, device_id: u8, coils: &[Coil]) -> Result<Self> {
        codec::validate_device_id(kind, device_id)?;
        let mut sorted = coils.to_vec();
        sorted.sort_by_key(|c| c.address);
        let (address, count) =
            codec::contiguous_run(sorted.iter().map(|c| c.address), "coil")?;
        codec::validate_range(FunctionCode::WriteMultipleCoils, address, count)?;

        let bits: Vec<bool> = sorted.iter().map(|c| c.value).collect();
        Ok(Self {
            device_id,
            function: FunctionCode::WriteMultipleCoils,
            address,
            count,
            payload: Some(codec::pack_bits(&bits)),
            transaction_id: None,
            mei: None,
        })
    }

    /// FC16 request; the registers must form a contiguous address run once sorted.
    ///
    /// The payload is the byte-count prefix followed by big-endian words,
    /// `count * 2 + 1` bytes.
    pub fn write_multiple_registers(
        kind: TransportKind,
        device_id: u8,
        registers: &[Register],
    ) -> Result<Self> {
        codec::validate_device_id(kind, device_id)?;
        let mut sorted = registers.to_vec();
        sorted.sort_by_key(|r| r.address);
        let (address, count) =
            codec::contiguous_run(sorted.iter().map(|r| r.address), "register")?;
        codec::validate_range(FunctionCode::WriteMultipleRegisters, address, count)?;

        let mut payload = DataBuffer::new(1 + sorted.len() * 2);
        payload.set_byte(0, (sorted.len() * 2) as u8);
        for (i, reg) in sorted.iter().enumerate() {
            payload.set_u16_be(1 + i * 2, reg.value);
        }

        Ok(Self {
            device_id,
            function: FunctionCode::WriteMultipleRegisters,
            address,
            count,
            payload: Some(payload),
            transaction_id: None,
            mei: None,
        })
    }

    /// FC43 / MEI 14 request starting at `object_id`
    pub fn read_device_identification(
        kind: TransportKind,
        device_id: u8,
        category: DeviceIdCategory,
        object_id: u8,
    ) -> Result<Self> {
        codec::validate_device_id(kind, device_id)?;

        Ok(Self {
            device_id,
            function: FunctionCode::ReadDeviceIdentification,
            address: u16::from(object_id),
            count: 0,
            payload: None,
            transaction_id: None,
            mei: Some(MeiRequest {
                mei_type: constants::MEI_READ_DEVICE_ID,
                category,
                object_id,
            }),
        })
    }

    /// Attach the TCP transaction identifier used to correlate the reply
    pub fn with_transaction_id(mut self, transaction_id: u16) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn payload(&self) -> Option<&DataBuffer> {
        self.payload.as_ref()
    }

    pub fn transaction_id(&self) -> Option<u16> {
        self.transaction_id
    }

    pub fn mei(&self) -> Option<&MeiRequest> {
        self.mei.as_ref()
    }
}

// ============================================================================
// Response
// ============================================================================

/// One Read Device Identification reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentificationPage {
    pub category: u8,
    pub conformity_level: u8,
    pub more_follows: bool,
    pub next_object_id: u8,
    pub objects: Vec<DeviceObject>,
}

impl IdentificationPage {
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

/// A decoded successful reply, tied to the request it answers
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub(crate) device_id: u8,
    pub(crate) function: FunctionCode,
    pub(crate) address: u16,
    pub(crate) count: u16,
    pub(crate) payload: DataBuffer,
    pub(crate) transaction_id: Option<u16>,
    pub(crate) identification: Option<IdentificationPage>,
}

impl Response {
    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    /// Function data following the function code (byte count stripped for reads)
    pub fn payload(&self) -> &DataBuffer {
        &self.payload
    }

    pub fn transaction_id(&self) -> Option<u16> {
        self.transaction_id
    }

    pub fn identification(&self) -> Option<&IdentificationPage> {
        self.identification.as_ref()
    }

    /// More identification objects are available
    pub fn more_follows(&self) -> bool {
        self.identification
            .as_ref()
            .map(|p| p.more_follows)
            .unwrap_or(false)
    }

    /// Object id to resume identification from
    pub fn next_object_id(&self) -> Option<u8> {
        self.identification
            .as_ref()
            .filter(|p| p.more_follows)
            .map(|p| p.next_object_id)
    }
}
