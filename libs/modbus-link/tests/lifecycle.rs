//! Connection lifecycle integration tests
//!
//! - Reconnect deadline opens the circuit breaker exactly once
//! - Lost links reconnect in the background with Disconnected/Connected events
//! - Timeouts drop the link and trigger reconnect
//! - Disposal unblocks in-flight reads

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use common::{deadline, fast_timeouts, SimConnector};
use modbus_link::{
    ConnectionEvent, ConnectionState, ModbusClient, ModbusError, ReconnectConfig, TimeoutConfig,
    TransportKind,
};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::Receiver;

fn drain(events: &mut Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return seen,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_deadline_fails_once_and_stays_failed() {
    let connector = SimConnector::new(TransportKind::Tcp);
    connector.refuse.store(true, Ordering::SeqCst);
    let client = ModbusClient::with_connector(connector.clone(), fast_timeouts(), deadline(5_000));
    let mut events = client.subscribe();

    let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::NeverConnected { .. }));
    assert!(err.is_terminal());
    assert_eq!(client.state(), ConnectionState::Failed);

    // One attempt per second until the 5s deadline passes
    let attempts = connector.opens();
    assert_eq!(attempts, 6);

    // Circuit stays open: no further I/O
    let again = client.read_coils(1, 0, 1).await.unwrap_err();
    assert_eq!(again, err);
    client.connect().await.unwrap_err();
    assert_eq!(connector.opens(), attempts);

    assert_eq!(drain(&mut events), vec![ConnectionEvent::Failed]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_connect() {
    let connector = SimConnector::new(TransportKind::Tcp);
    connector.fail_next.store(3, Ordering::SeqCst);
    let client = ModbusClient::with_connector(connector.clone(), fast_timeouts(), deadline(60_000));
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    assert_eq!(connector.opens(), 4);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(drain(&mut events), vec![ConnectionEvent::Connected]);

    // Already connected: no new attempt
    client.connect().await.unwrap();
    assert_eq!(connector.opens(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_then_deadline_reports_lost() {
    let connector = SimConnector::new(TransportKind::Tcp);
    let client = ModbusClient::with_connector(connector.clone(), fast_timeouts(), deadline(3_000));

    client.connect().await.unwrap();
    connector.refuse.store(true, Ordering::SeqCst);
    connector.sever();

    let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Io(_)));

    let outcome = client.connection().await_reconnect().await.unwrap();
    assert!(matches!(outcome, Err(ModbusError::ConnectionLost { .. })));
    assert_eq!(client.state(), ConnectionState::Failed);
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test]
async fn test_io_failure_reconnects_in_background() {
    let connector = SimConnector::new(TransportKind::Tcp);
    connector.state.model.lock().holding_registers[0] = 42;
    let client = ModbusClient::with_connector(connector.clone(), fast_timeouts(), ReconnectConfig::default());
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    connector.sever();

    let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
    assert!(err.needs_reconnect());

    client.connection().await_reconnect().await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(
        drain(&mut events),
        vec![
            ConnectionEvent::Connected,
            ConnectionEvent::Disconnected,
            ConnectionEvent::Connected
        ]
    );

    let registers = client.read_holding_registers(1, 0, 1).await.unwrap();
    assert_eq!(registers[0].value, 42);
    assert_eq!(connector.opens(), 2);

    let stats = client.stats();
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.io_errors, 1);
}

#[tokio::test]
async fn test_timeout_drops_link_and_reconnects() {
    let connector = SimConnector::new(TransportKind::Tcp);
    connector.state.silent.store(true, Ordering::SeqCst);
    let client = ModbusClient::with_connector(
        connector.clone(),
        TimeoutConfig {
            send_timeout_ms: 200,
            receive_timeout_ms: 100,
        },
        ReconnectConfig::default(),
    );

    let err = client.read_input_registers(1, 0, 1).await.unwrap_err();
    assert!(err.is_timeout());

    connector.state.silent.store(false, Ordering::SeqCst);
    client.connection().await_reconnect().await.unwrap().unwrap();
    client.read_input_registers(1, 0, 1).await.unwrap();

    assert_eq!(connector.opens(), 2);
    assert_eq!(client.stats().timeouts, 1);
}

#[tokio::test]
async fn test_operation_waits_for_reconnect() {
    let connector = SimConnector::new(TransportKind::Tcp);
    let client = ModbusClient::with_connector(connector.clone(), fast_timeouts(), ReconnectConfig::default());

    client.connect().await.unwrap();
    connector.sever();
    client.read_coils(1, 0, 1).await.unwrap_err();

    // Issued while the background reconnect may still be running
    client.read_coils(1, 0, 1).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_new_timeouts_apply_after_reconnect() {
    let connector = SimConnector::new(TransportKind::Tcp);
    connector.state.reply_delay_ms.store(300, Ordering::SeqCst);
    let client = ModbusClient::with_connector(
        connector.clone(),
        TimeoutConfig {
            send_timeout_ms: 500,
            receive_timeout_ms: 100,
        },
        ReconnectConfig::default(),
    );

    let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
    assert!(err.is_timeout());

    client.set_timeouts(TimeoutConfig {
        send_timeout_ms: 500,
        receive_timeout_ms: 2_000,
    });
    client.connection().await_reconnect().await.unwrap().unwrap();
    // New link picked up the longer receive timeout
    client.read_holding_registers(1, 0, 1).await.unwrap();
}

// ============================================================================
// Disposal
// ============================================================================

#[tokio::test]
async fn test_dispose_unblocks_in_flight_read() {
    let connector = SimConnector::new(TransportKind::Rtu);
    connector.state.silent.store(true, Ordering::SeqCst);
    let client = std::sync::Arc::new(ModbusClient::with_connector(
        connector.clone(),
        TimeoutConfig {
            send_timeout_ms: 1_000,
            receive_timeout_ms: 60_000,
        },
        ReconnectConfig::default(),
    ));
    let mut events = client.subscribe();

    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read_holding_registers(1, 0, 1).await })
    };

    // Wait until the request is on the wire
    while connector.requests().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    client.dispose().await;
    let result = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .expect("dispose did not unblock the read")
        .unwrap();
    assert_eq!(result.unwrap_err(), ModbusError::Disposed);

    client.dispose().await;
    assert_eq!(
        client.write_single_coil(1, 0, true).await.unwrap_err(),
        ModbusError::Disposed
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        drain(&mut events),
        vec![ConnectionEvent::Connected, ConnectionEvent::Disconnected]
    );
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_cancels_reconnect_loop() {
    let connector = SimConnector::new(TransportKind::Tcp);
    connector.refuse.store(true, Ordering::SeqCst);
    let client = std::sync::Arc::new(ModbusClient::with_connector(
        connector.clone(),
        fast_timeouts(),
        ReconnectConfig::default(),
    ));

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(client.state(), ConnectionState::Connecting);

    client.dispose().await;
    assert_eq!(connecting.await.unwrap().unwrap_err(), ModbusError::Disposed);
    let attempts = connector.opens();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.opens(), attempts);
}
