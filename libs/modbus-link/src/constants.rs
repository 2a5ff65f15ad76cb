//! Modbus protocol and lifecycle constants
//!
//! Frame limits follow the Modbus application protocol: the serial ADU is
//! capped at 256 bytes, which bounds every PDU at 253 bytes on both transports.

use std::time::Duration;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FC_ENCAPSULATED_INTERFACE: u8 = 0x2B;

/// MEI type for Read Device Identification
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

/// High bit of the function code marks an exception reply
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Write Single Coil ON/OFF encodings
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP prefix read before the length is known:
/// Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Full MBAP envelope including the unit id byte
pub const MBAP_ENVELOPE_LEN: usize = MBAP_HEADER_LEN + 1;

/// Maximum PDU size (RS485 ADU 256 - address 1 - CRC 2)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Serial check sequence length
pub const CRC_LEN: usize = 2;

/// Read Device Identification sub-header following the function code:
/// MEI type, ReadDevId code, conformity level, more follows, next object id, object count
pub const MEI_SUB_HEADER_LEN: usize = 6;

/// Echo length of single and multiple write replies (address + value/quantity)
pub const WRITE_ECHO_LEN: usize = 4;

// ============================================================================
// Quantity Limits
// ============================================================================

/// FC01/FC02: 1 + 1 + ceil(N/8) <= 253, rounded down to 2000
pub const MAX_READ_COILS: u16 = 2000;

/// FC03/FC04: 1 + 1 + 2N <= 253
pub const MAX_READ_REGISTERS: u16 = 125;

/// FC15: 1 + 2 + 2 + 1 + ceil(N/8) <= 253
pub const MAX_WRITE_COILS: u16 = 1968;

/// FC16: 1 + 2 + 2 + 1 + 2N <= 253
pub const MAX_WRITE_REGISTERS: u16 = 123;

// ============================================================================
// Device Addressing
// ============================================================================

/// Serial unicast addresses (0 is broadcast, 248-255 reserved)
pub const MIN_SERIAL_DEVICE_ID: u8 = 1;
pub const MAX_SERIAL_DEVICE_ID: u8 = 247;

/// Default Modbus TCP port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 9600;

// ============================================================================
// Lifecycle Timing
// ============================================================================

/// Initial TCP connect timeout for a reconnect sequence
pub const CONNECT_TIMEOUT_FLOOR: Duration = Duration::from_secs(4);

/// Added to the TCP connect timeout after every failed attempt
pub const CONNECT_TIMEOUT_STEP: Duration = Duration::from_secs(2);

/// Upper bound for the TCP connect timeout
pub const CONNECT_TIMEOUT_CEILING: Duration = Duration::from_secs(20);

/// Sleep between connect attempts (both transports)
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Upper bound on Read Device Identification follow-up requests
pub const MAX_IDENTIFICATION_PAGES: usize = 256;

/// Capacity of the lifecycle event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 32;
