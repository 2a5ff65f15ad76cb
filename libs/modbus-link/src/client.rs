//! Modbus client
//!
//! Typed operations over a `ConnectionManager`. Arguments are validated
//! before any I/O; each call is one serialised exchange (device
//! identification may take several).

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::codec;
use crate::config::{ClientConfig, ReconnectConfig, TimeoutConfig, TransportConfig};
use crate::connection::ConnectionManager;
use crate::error::{ModbusError, Result};
use crate::identification;
use crate::pdu::{FunctionCode, Request, Response};
use crate::transport::{Connector, SerialConnector, StatsSnapshot, TcpConnector};
use crate::types::{
    Coil, ConnectionEvent, ConnectionState, DeviceIdCategory, DeviceIdentification, DeviceObject,
    DeviceObjectId, DiscreteInput, Register, TransportKind,
};

/// Modbus TCP/RTU master
///
/// Dropping the client cancels any background reconnect; call
/// [`ModbusClient::dispose`] to also close the link deterministically.
#[derive(Debug)]
pub struct ModbusClient {
    connection: ConnectionManager,
}

impl ModbusClient {
    /// Build a client from a validated configuration. Nothing is opened until
    /// the first operation or [`ModbusClient::connect`].
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let connector: Arc<dyn Connector> = match &config.transport {
            TransportConfig::Tcp(tcp) => Arc::new(TcpConnector::new(tcp.clone())),
            TransportConfig::Rtu(serial) => Arc::new(SerialConnector::new(serial.clone())),
        };
        Ok(Self::with_connector(connector, config.timeouts, config.reconnect))
    }

    /// Build a client over any connector (custom transports, test doubles)
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        timeouts: TimeoutConfig,
        reconnect: ReconnectConfig,
    ) -> Self {
        debug!("Creating {} client for {}", connector.kind(), connector.target());
        Self {
            connection: ConnectionManager::new(connector, timeouts, reconnect),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.connection.kind()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.connection.stats()
    }

    /// Replacement timeouts take effect on the next reconnect
    pub fn set_timeouts(&self, timeouts: TimeoutConfig) {
        self.connection.set_timeouts(timeouts);
    }

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    pub async fn dispose(&self) {
        self.connection.dispose().await;
    }

    fn check_disposed(&self) -> Result<()> {
        if self.connection.is_disposed() {
            return Err(ModbusError::Disposed);
        }
        Ok(())
    }

    async fn read(
        &self,
        function: FunctionCode,
        device_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Response> {
        self.check_disposed()?;
        let request = Request::read(self.kind(), function, device_id, address, count)?;
        self.connection.exchange(&request).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// FC01
    pub async fn read_coils(&self, device_id: u8, address: u16, count: u16) -> Result<Vec<Coil>> {
        let response = self
            .read(FunctionCode::ReadCoils, device_id, address, count)
            .await?;
        Ok(codec::to_coils(&response))
    }

    /// FC02
    pub async fn read_discrete_inputs(
        &self,
        device_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<DiscreteInput>> {
        let response = self
            .read(FunctionCode::ReadDiscreteInputs, device_id, address, count)
            .await?;
        Ok(codec::to_discrete_inputs(&response))
    }

    /// FC03
    pub async fn read_holding_registers(
        &self,
        device_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<Register>> {
        let response = self
            .read(FunctionCode::ReadHoldingRegisters, device_id, address, count)
            .await?;
        Ok(codec::to_registers(&response))
    }

    /// FC04
    pub async fn read_input_registers(
        &self,
        device_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<Register>> {
        let response = self
            .read(FunctionCode::ReadInputRegisters, device_id, address, count)
            .await?;
        Ok(codec::to_registers(&response))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// FC05
    pub async fn write_single_coil(&self, device_id: u8, address: u16, value: bool) -> Result<()> {
        self.check_disposed()?;
        let request = Request::write_single_coil(self.kind(), device_id, address, value)?;
        self.connection.exchange(&request).await.map(|_| ())
    }

    /// FC06
    pub async fn write_single_register(&self, device_id: u8, address: u16, value: u16) -> Result<()> {
        self.check_disposed()?;
        let request = Request::write_single_register(self.kind(), device_id, address, value)?;
        self.connection.exchange(&request).await.map(|_| ())
    }

    /// FC15. `coils` may be in any order but must cover one contiguous block.
    pub async fn write_multiple_coils(&self, device_id: u8, coils: &[Coil]) -> Result<()> {
        self.check_disposed()?;
        let request = Request::write_multiple_coils(self.kind(), device_id, coils)?;
        self.connection.exchange(&request).await.map(|_| ())
    }

    /// FC16. `registers` may be in any order but must cover one contiguous block.
    pub async fn write_multiple_registers(&self, device_id: u8, registers: &[Register]) -> Result<()> {
        self.check_disposed()?;
        let request = Request::write_multiple_registers(self.kind(), device_id, registers)?;
        self.connection.exchange(&request).await.map(|_| ())
    }

    // ========================================================================
    // Device Identification
    // ========================================================================

    /// FC43/MEI 14, following continuations until the device reports no more objects
    pub async fn read_device_identification(
        &self,
        device_id: u8,
        category: DeviceIdCategory,
    ) -> Result<DeviceIdentification> {
        self.read_device_identification_from(device_id, category, DeviceObjectId::VendorName as u8)
            .await
    }

    /// Same as [`Self::read_device_identification`], starting at `object_id`
    pub async fn read_device_identification_from(
        &self,
        device_id: u8,
        category: DeviceIdCategory,
        object_id: u8,
    ) -> Result<DeviceIdentification> {
        self.check_disposed()?;
        identification::read_device_identification(
            &self.connection,
            self.kind(),
            device_id,
            category,
            object_id,
        )
        .await
    }

    /// Individual access to one identification object
    pub async fn read_device_object(&self, device_id: u8, object_id: u8) -> Result<DeviceObject> {
        let identification = self
            .read_device_identification_from(device_id, DeviceIdCategory::Individual, object_id)
            .await?;
        identification.get(object_id).cloned().ok_or_else(|| {
            ModbusError::protocol(format!(
                "device {} did not return object {:02X}",
                device_id, object_id
            ))
        })
    }
}

impl Drop for ModbusClient {
    fn drop(&mut self) {
        self.connection.cancel();
    }
}
