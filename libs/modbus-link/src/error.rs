//! Modbus Link Error Types
//!
//! One error enum covers argument validation, transport failures, device
//! exceptions, framing violations and the terminal connection state.

use thiserror::Error;

use crate::types::ExceptionCode;

/// Result type for modbus-link operations
pub type Result<T> = std::result::Result<T, ModbusError>;

/// Modbus client errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModbusError {
    /// Device id, address, count or contiguity violation (raised before any I/O)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No complete reply (or no connection) within the configured window
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transport I/O failure (reset, broken pipe, port closed)
    #[error("IO error: {0}")]
    Io(String),

    /// No live transport handle
    #[error("Not connected")]
    NotConnected,

    /// Well-formed reply in which the device rejected the request
    #[error("Device exception on FC{function:02X}: {code}")]
    Exception { function: u8, code: ExceptionCode },

    /// Unexpected function code, transaction id mismatch, bad echo
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Malformed frame or check sequence mismatch
    #[error("Malformed frame: {0}")]
    Frame(String),

    /// Framing stopped partway through a reply; the stream position is unknown
    #[error("Frame sync lost: {0}")]
    Desync(String),

    /// Reconnect deadline exhausted before the first connection ever succeeded
    #[error("Connection to {target} failed permanently after {elapsed_ms}ms (never connected)")]
    NeverConnected { target: String, elapsed_ms: u64 },

    /// Reconnect deadline exhausted after a previously working connection was lost
    #[error("Connection to {target} lost permanently after {elapsed_ms}ms of reconnecting")]
    ConnectionLost { target: String, elapsed_ms: u64 },

    /// The client was disposed
    #[error("Client disposed")]
    Disposed,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ModbusError::Timeout(err.to_string())
            },
            _ => ModbusError::Io(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ModbusError::Timeout("operation timed out".to_string())
    }
}

impl From<figment::Error> for ModbusError {
    fn from(err: figment::Error) -> Self {
        ModbusError::Config(err.to_string())
    }
}

// Helper methods for creating errors
impl ModbusError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ModbusError::InvalidArgument(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ModbusError::Timeout(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        ModbusError::Io(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ModbusError::Protocol(msg.into())
    }

    pub fn frame(msg: impl Into<String>) -> Self {
        ModbusError::Frame(msg.into())
    }

    pub fn desync(msg: impl Into<String>) -> Self {
        ModbusError::Desync(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ModbusError::Config(msg.into())
    }

    pub fn exception(function: u8, code: u8) -> Self {
        ModbusError::Exception {
            function: function & 0x7F,
            code: ExceptionCode::from(code),
        }
    }

    /// Timeouts, transport failures and lost frame sync leave the link in an
    /// unknown state and require the handle to be reopened. Device exceptions
    /// and framing violations consume exactly one reply and leave the link usable.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            ModbusError::Timeout(_)
                | ModbusError::Io(_)
                | ModbusError::NotConnected
                | ModbusError::Desync(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ModbusError::Timeout(_))
    }

    /// Terminal connection failure (the circuit breaker is open)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModbusError::NeverConnected { .. } | ModbusError::ConnectionLost { .. }
        )
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let err: ModbusError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, ModbusError::Io(_)));
        assert!(err.needs_reconnect());

        let err: ModbusError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_exception_strips_error_bit() {
        let err = ModbusError::exception(0x83, 0x02);
        assert_eq!(
            err,
            ModbusError::Exception {
                function: 0x03,
                code: ExceptionCode::IllegalDataAddress
            }
        );
        assert!(!err.needs_reconnect());
        assert!(err.to_string().contains("Illegal Data Address"));
    }

    #[test]
    fn test_reconnect_classification() {
        assert!(ModbusError::desync("unexpected function code 11").needs_reconnect());
        assert!(ModbusError::NotConnected.needs_reconnect());
        assert!(!ModbusError::frame("CRC mismatch").needs_reconnect());
        assert!(!ModbusError::protocol("transaction id mismatch").needs_reconnect());
    }

    #[test]
    fn test_terminal_classification() {
        let never = ModbusError::NeverConnected {
            target: "10.0.0.1:502".to_string(),
            elapsed_ms: 5000,
        };
        let lost = ModbusError::ConnectionLost {
            target: "10.0.0.1:502".to_string(),
            elapsed_ms: 5000,
        };
        assert!(never.is_terminal());
        assert!(lost.is_terminal());
        assert_ne!(never, lost);
        assert!(never.to_string().contains("never connected"));
        assert!(!ModbusError::Disposed.is_terminal());
    }
}
