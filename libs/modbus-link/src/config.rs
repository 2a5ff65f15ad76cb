//! Client configuration
//!
//! Configuration is an immutable value handed to the client at construction.
//! Timeouts are applied when a link is opened; replacing them later only
//! affects the next reconnect.

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::constants;
use crate::error::{ModbusError, Result};
use crate::types::TransportKind;

// ============================================================================
// Serde Defaults
// ============================================================================

fn default_tcp_port() -> u16 {
    constants::DEFAULT_TCP_PORT
}

fn default_baud_rate() -> u32 {
    constants::DEFAULT_BAUD_RATE
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_send_timeout_ms() -> u64 {
    constants::DEFAULT_SEND_TIMEOUT.as_millis() as u64
}

fn default_receive_timeout_ms() -> u64 {
    constants::DEFAULT_RECEIVE_TIMEOUT.as_millis() as u64
}

fn default_retry_interval_ms() -> u64 {
    constants::RECONNECT_INTERVAL.as_millis() as u64
}

fn default_connect_floor_ms() -> u64 {
    constants::CONNECT_TIMEOUT_FLOOR.as_millis() as u64
}

fn default_connect_step_ms() -> u64 {
    constants::CONNECT_TIMEOUT_STEP.as_millis() as u64
}

fn default_connect_ceiling_ms() -> u64 {
    constants::CONNECT_TIMEOUT_CEILING.as_millis() as u64
}

// ============================================================================
// Transport
// ============================================================================

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// Modbus TCP endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
}

impl TcpConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Serial port parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub flow_control: FlowControl,
}

impl SerialConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            flow_control: FlowControl::None,
        }
    }
}

/// Transport selection, tagged by `mode`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TransportConfig {
    Tcp(TcpConfig),
    Rtu(SerialConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Tcp(_) => TransportKind::Tcp,
            TransportConfig::Rtu(_) => TransportKind::Rtu,
        }
    }

    /// Human-readable link target for logs and errors
    pub fn target(&self) -> String {
        match self {
            TransportConfig::Tcp(tcp) => tcp.address(),
            TransportConfig::Rtu(serial) => serial.device.clone(),
        }
    }
}

// ============================================================================
// Timeouts
// ============================================================================

/// Per-exchange send/receive timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

// ============================================================================
// Reconnect
// ============================================================================

/// Reconnect policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Overall time limit for one reconnect sequence; `None` retries forever
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_connect_floor_ms")]
    pub connect_timeout_floor_ms: u64,
    #[serde(default = "default_connect_step_ms")]
    pub connect_timeout_step_ms: u64,
    #[serde(default = "default_connect_ceiling_ms")]
    pub connect_timeout_ceiling_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            deadline_ms: None,
            retry_interval_ms: default_retry_interval_ms(),
            connect_timeout_floor_ms: default_connect_floor_ms(),
            connect_timeout_step_ms: default_connect_step_ms(),
            connect_timeout_ceiling_ms: default_connect_ceiling_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn connect_timeout_floor(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_floor_ms)
    }

    pub fn connect_timeout_step(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_step_ms)
    }

    pub fn connect_timeout_ceiling(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ceiling_ms)
    }
}

// ============================================================================
// Client
// ============================================================================

/// Complete client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: TransportConfig::Tcp(TcpConfig {
                host: host.into(),
                port,
            }),
            timeouts: TimeoutConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn rtu(serial: SerialConfig) -> Self {
        Self {
            transport: TransportConfig::Rtu(serial),
            timeouts: TimeoutConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Load from a YAML/TOML/JSON file merged with `MODBUS_` environment
    /// variables (`__` separates nested keys, e.g. `MODBUS_TIMEOUTS__RECEIVE_TIMEOUT_MS`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ModbusError::config("Invalid file extension"))?;

        let figment = match extension {
            "json" => Figment::new().merge(Json::file(path)),
            "toml" => Figment::new().merge(Toml::file(path)),
            "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
            _ => {
                return Err(ModbusError::config(format!(
                    "Unsupported config format: {}",
                    extension
                )))
            },
        };

        Self::from_figment(figment.merge(Env::prefixed("MODBUS_").split("__")))
    }

    /// Extract and validate from an already assembled figment
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: ClientConfig = figment
            .extract()
            .map_err(|e| ModbusError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        debug!("Loaded {} client config for {}", config.transport.kind(), config.transport.target());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match &self.transport {
            TransportConfig::Tcp(tcp) => {
                if tcp.host.trim().is_empty() {
                    return Err(ModbusError::config("TCP host not specified"));
                }
                if tcp.port == 0 {
                    return Err(ModbusError::config("TCP port must be non-zero"));
                }
            },
            TransportConfig::Rtu(serial) => {
                if serial.device.trim().is_empty() {
                    return Err(ModbusError::config("Serial device not specified"));
                }
                if serial.baud_rate == 0 {
                    return Err(ModbusError::config("Baud rate must be non-zero"));
                }
                if !(5..=8).contains(&serial.data_bits) {
                    return Err(ModbusError::config(format!(
                        "Unsupported data bits: {}",
                        serial.data_bits
                    )));
                }
                if !(1..=2).contains(&serial.stop_bits) {
                    return Err(ModbusError::config(format!(
                        "Unsupported stop bits: {}",
                        serial.stop_bits
                    )));
                }
            },
        }

        if self.timeouts.send_timeout_ms == 0 || self.timeouts.receive_timeout_ms == 0 {
            return Err(ModbusError::config("Timeouts must be non-zero"));
        }

        let r = &self.reconnect;
        if r.connect_timeout_floor_ms == 0 || r.connect_timeout_floor_ms > r.connect_timeout_ceiling_ms {
            return Err(ModbusError::config(format!(
                "Connect timeout floor {}ms must be in 1..={}ms",
                r.connect_timeout_floor_ms, r.connect_timeout_ceiling_ms
            )));
        }
        Ok(())
    }
}
