//! Modbus Link
//!
//! Modbus TCP/RTU master engine: request validation and PDU encoding, reply
//! classification, transport framing, and a connection lifecycle that
//! serialises exchanges and reconnects on failure.
//!
//! # Architecture
//!
//! - **Codec**: `pdu` + `codec` build validated requests and decode replies
//! - **Framing**: `tcp` (MBAP envelope) and `rtu` (CRC-16 trailer) behind `transport::Framing`
//! - **Lifecycle**: `connection::ConnectionManager` owns the transport handle,
//!   runs reconnects and guards the exchange critical section
//! - **Identification**: `identification` merges paginated device identification replies
//! - **Client**: `client::ModbusClient` exposes typed read/write operations
//!
//! # Example
//!
//! ```no_run
//! use modbus_link::{ClientConfig, ModbusClient};
//!
//! # async fn run() -> modbus_link::Result<()> {
//! let client = ModbusClient::from_config(ClientConfig::tcp("192.168.1.10", 502))?;
//! let registers = client.read_holding_registers(1, 0, 10).await?;
//! for reg in registers {
//!     println!("{} = {}", reg.address, reg.value);
//! }
//! client.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod identification;
pub mod logger;
pub mod pdu;
pub mod rtu;
pub mod tcp;
pub mod transport;
pub mod types;

// Re-export core types
pub use buffer::DataBuffer;
pub use client::ModbusClient;
pub use config::{
    ClientConfig, FlowControl, Parity, ReconnectConfig, SerialConfig, TcpConfig, TimeoutConfig,
    TransportConfig,
};
pub use connection::ConnectionManager;
pub use error::{ModbusError, Result};
pub use identification::Exchange;
pub use pdu::{FunctionCode, IdentificationPage, Request, Response};
pub use transport::{
    Connector, Framing, Link, ModbusStream, SerialConnector, StatsSnapshot, TcpConnector,
    TransportStats,
};
pub use types::{
    Coil, ConnectionEvent, ConnectionState, DeviceIdCategory, DeviceIdentification, DeviceObject,
    DeviceObjectId, DiscreteInput, ExceptionCode, Register, TransportKind,
};
