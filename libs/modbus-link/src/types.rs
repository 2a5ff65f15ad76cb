//! Caller-facing Modbus data types
//!
//! Coils, inputs and registers are the decoded forms returned by the client;
//! they never appear on the wire directly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

use crate::constants::{MAX_SERIAL_DEVICE_ID, MIN_SERIAL_DEVICE_ID};

// ============================================================================
// Transport Kind
// ============================================================================

/// Transport selected at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Modbus TCP (MBAP envelope)
    Tcp,
    /// Modbus RTU over a serial line (CRC trailer)
    Rtu,
}

impl TransportKind {
    /// Whether `device_id` is addressable on this transport
    pub fn accepts_device_id(&self, device_id: u8) -> bool {
        self.device_id_range().contains(&device_id)
    }

    /// Addressable device ids on this transport.
    ///
    /// TCP accepts the full unit id range (0-255); serial links only accept
    /// unicast addresses 1-247.
    pub fn device_id_range(&self) -> RangeInclusive<u8> {
        match self {
            TransportKind::Tcp => u8::MIN..=u8::MAX,
            TransportKind::Rtu => MIN_SERIAL_DEVICE_ID..=MAX_SERIAL_DEVICE_ID,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Rtu => write!(f, "RTU"),
        }
    }
}

// ============================================================================
// Point Values
// ============================================================================

/// Single-bit read/write output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coil {
    pub address: u16,
    pub value: bool,
}

impl Coil {
    pub fn new(address: u16, value: bool) -> Self {
        Self { address, value }
    }
}

/// Single-bit read-only input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscreteInput {
    pub address: u16,
    pub value: bool,
}

impl DiscreteInput {
    pub fn new(address: u16, value: bool) -> Self {
        Self { address, value }
    }
}

/// 16-bit register.
///
/// The value is stored once; the high/low byte views are derived from it so
/// both representations always agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Register {
    pub address: u16,
    pub value: u16,
}

impl Register {
    pub fn new(address: u16, value: u16) -> Self {
        Self { address, value }
    }

    /// Build from the two wire bytes (high byte first)
    pub fn from_bytes(address: u16, high: u8, low: u8) -> Self {
        Self {
            address,
            value: u16::from_be_bytes([high, low]),
        }
    }

    #[inline]
    pub fn high(&self) -> u8 {
        (self.value >> 8) as u8
    }

    #[inline]
    pub fn low(&self) -> u8 {
        (self.value & 0xFF) as u8
    }

    pub fn set_high(&mut self, high: u8) {
        self.value = u16::from_be_bytes([high, self.low()]);
    }

    pub fn set_low(&mut self, low: u8) {
        self.value = u16::from_be_bytes([self.high(), low]);
    }
}

// ============================================================================
// Exception Codes
// ============================================================================

/// Exception code reported by a device in an error-flagged reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    NegativeAcknowledge,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Unknown(u8),
}

impl ExceptionCode {
    pub fn code(&self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::ServerDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::ServerDeviceBusy => 0x06,
            ExceptionCode::NegativeAcknowledge => 0x07,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetFailedToRespond => 0x0B,
            ExceptionCode::Unknown(code) => *code,
        }
    }

    /// Human-readable message for the exception
    pub fn description(&self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "Illegal Function",
            ExceptionCode::IllegalDataAddress => "Illegal Data Address",
            ExceptionCode::IllegalDataValue => "Illegal Data Value",
            ExceptionCode::ServerDeviceFailure => "Server Device Failure",
            ExceptionCode::Acknowledge => "Acknowledge",
            ExceptionCode::ServerDeviceBusy => "Server Device Busy",
            ExceptionCode::NegativeAcknowledge => "Negative Acknowledge",
            ExceptionCode::MemoryParityError => "Memory Parity Error",
            ExceptionCode::GatewayPathUnavailable => "Gateway Path Unavailable",
            ExceptionCode::GatewayTargetFailedToRespond => {
                "Gateway Target Device Failed to Respond"
            },
            ExceptionCode::Unknown(_) => "Unknown Exception",
        }
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::ServerDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::ServerDeviceBusy,
            0x07 => ExceptionCode::NegativeAcknowledge,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailedToRespond,
            other => ExceptionCode::Unknown(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), self.code())
    }
}

// ============================================================================
// Device Identification
// ============================================================================

/// Read Device ID code: which object set a device identification request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceIdCategory {
    /// Objects 0x00-0x02 (stream access)
    Basic,
    /// Objects 0x00-0x7F (stream access)
    Regular,
    /// Objects 0x00-0xFF (stream access)
    Extended,
    /// One specific object (individual access)
    Individual,
}

impl DeviceIdCategory {
    pub fn code(&self) -> u8 {
        match self {
            DeviceIdCategory::Basic => 0x01,
            DeviceIdCategory::Regular => 0x02,
            DeviceIdCategory::Extended => 0x03,
            DeviceIdCategory::Individual => 0x04,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(DeviceIdCategory::Basic),
            0x02 => Some(DeviceIdCategory::Regular),
            0x03 => Some(DeviceIdCategory::Extended),
            0x04 => Some(DeviceIdCategory::Individual),
            _ => None,
        }
    }
}

/// Well-known identification object ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceObjectId {
    VendorName = 0x00,
    ProductCode = 0x01,
    MajorMinorRevision = 0x02,
    VendorUrl = 0x03,
    ProductName = 0x04,
    ModelName = 0x05,
    UserApplicationName = 0x06,
}

/// One identification object as reported by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceObject {
    pub id: u8,
    pub value: Vec<u8>,
}

impl DeviceObject {
    pub fn new(id: u8, value: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            value: value.into(),
        }
    }

    /// Object value as text (identification strings are ASCII by convention)
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Merged identification object set in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentification {
    objects: Vec<DeviceObject>,
    conformity_level: u8,
}

impl DeviceIdentification {
    pub fn new(conformity_level: u8) -> Self {
        Self {
            objects: Vec::new(),
            conformity_level,
        }
    }

    /// Insert an object unless its id is already present.
    ///
    /// Returns `true` if the object was added.
    pub fn insert_if_absent(&mut self, object: DeviceObject) -> bool {
        if self.contains(object.id) {
            return false;
        }
        self.objects.push(object);
        true
    }

    pub fn contains(&self, id: u8) -> bool {
        self.objects.iter().any(|o| o.id == id)
    }

    pub fn get(&self, id: u8) -> Option<&DeviceObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    pub fn text(&self, id: DeviceObjectId) -> Option<String> {
        self.get(id as u8).map(DeviceObject::as_text)
    }

    pub fn vendor_name(&self) -> Option<String> {
        self.text(DeviceObjectId::VendorName)
    }

    pub fn product_code(&self) -> Option<String> {
        self.text(DeviceObjectId::ProductCode)
    }

    pub fn revision(&self) -> Option<String> {
        self.text(DeviceObjectId::MajorMinorRevision)
    }

    pub fn objects(&self) -> &[DeviceObject] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn conformity_level(&self) -> u8 {
        self.conformity_level
    }
}

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle state of a client's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// No transport handle (initial, or lost and not yet reconnecting)
    #[default]
    Disconnected,
    /// Reconnect sequence running
    Connecting,
    /// Transport handle open with timeouts applied
    Connected,
    /// Reconnect deadline exhausted, won't retry
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn can_retry(&self) -> bool {
        !matches!(self, ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Lifecycle notification delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    /// Terminal failure; emitted once
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_views_stay_consistent() {
        let mut reg = Register::from_bytes(10, 0x12, 0x34);
        assert_eq!(reg.value, 0x1234);
        assert_eq!((reg.high(), reg.low()), (0x12, 0x34));

        reg.set_low(0xFF);
        assert_eq!(reg.value, 0x12FF);
        reg.set_high(0x00);
        assert_eq!(reg.value, 0x00FF);
    }

    #[test]
    fn test_device_id_ranges() {
        assert!(TransportKind::Tcp.accepts_device_id(0));
        assert!(TransportKind::Tcp.accepts_device_id(255));
        assert!(!TransportKind::Rtu.accepts_device_id(0));
        assert!(TransportKind::Rtu.accepts_device_id(1));
        assert!(TransportKind::Rtu.accepts_device_id(247));
        assert!(!TransportKind::Rtu.accepts_device_id(248));
    }

    #[test]
    fn test_exception_code_round_trip_and_unknown() {
        assert_eq!(ExceptionCode::from(0x04), ExceptionCode::ServerDeviceFailure);
        assert_eq!(ExceptionCode::from(0x0B).code(), 0x0B);
        assert_eq!(ExceptionCode::from(0x42), ExceptionCode::Unknown(0x42));
        assert_eq!(
            ExceptionCode::from(0x42).to_string(),
            "Unknown Exception (0x42)"
        );
    }

    #[test]
    fn test_identification_keeps_first_seen_value() {
        let mut ident = DeviceIdentification::new(0x81);
        assert!(ident.insert_if_absent(DeviceObject::new(0x00, "ACME")));
        assert!(ident.insert_if_absent(DeviceObject::new(0x01, "PX-100")));
        assert!(!ident.insert_if_absent(DeviceObject::new(0x00, "Other")));

        assert_eq!(ident.len(), 2);
        assert_eq!(ident.vendor_name().as_deref(), Some("ACME"));
        assert_eq!(ident.product_code().as_deref(), Some("PX-100"));
        assert_eq!(ident.revision(), None);
        assert_eq!(ident.objects()[1].id, 0x01);
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Disconnected.can_retry());
        assert!(!ConnectionState::Failed.can_retry());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Failed.to_string(), "FAILED");
    }
}
