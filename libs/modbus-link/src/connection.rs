//! Connection lifecycle
//!
//! `ConnectionManager` exclusively owns the transport handle. It runs the
//! `Disconnected -> Connecting -> Connected -> ... -> Failed` state machine,
//! serialises request/response exchanges and supervises background
//! reconnects after timeouts or I/O failures.
//!
//! Two locks are involved and always taken in this order:
//! 1. `reconnect_lock` - single permit for a reconnect sequence
//! 2. `link` - the exchange critical section, also taken briefly to install a new handle
//!
//! An exchange never waits on `reconnect_lock` while holding `link`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::{ReconnectConfig, TimeoutConfig};
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::{ModbusError, Result};
use crate::identification::Exchange;
use crate::logger::FrameLogger;
use crate::pdu::{Request, Response};
use crate::transport::{Connector, Framing, Link, StatsSnapshot, TransportStats};
use crate::types::{ConnectionEvent, ConnectionState, TransportKind};

struct Inner {
    connector: Arc<dyn Connector>,
    framing: Framing,
    reconnect: ReconnectConfig,
    /// Applied when the next link is opened
    timeouts: Mutex<TimeoutConfig>,
    link: tokio::sync::Mutex<Option<Link>>,
    reconnect_lock: tokio::sync::Mutex<()>,
    state: Mutex<ConnectionState>,
    terminal: Mutex<Option<ModbusError>>,
    ever_connected: AtomicBool,
    next_transaction_id: AtomicU16,
    events: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<Result<()>>>>,
    stats: TransportStats,
    logger: FrameLogger,
}

/// Shared handle to one connection's lifecycle
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.inner.logger.target())
            .field("framing", &self.inner.framing)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        timeouts: TimeoutConfig,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let logger = FrameLogger::new(connector.target());
        let framing = Framing::from(connector.kind());

        Self {
            inner: Arc::new(Inner {
                connector,
                framing,
                reconnect,
                timeouts: Mutex::new(timeouts),
                link: tokio::sync::Mutex::new(None),
                reconnect_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(ConnectionState::Disconnected),
                terminal: Mutex::new(None),
                ever_connected: AtomicBool::new(false),
                next_transaction_id: AtomicU16::new(1),
                events,
                cancel: CancellationToken::new(),
                supervisor: Mutex::new(None),
                stats: TransportStats::default(),
                logger,
            }),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.framing.kind()
    }

    pub fn target(&self) -> &str {
        self.inner.logger.target()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Replace send/receive timeouts. The open link keeps its timeouts; the
    /// new values apply from the next reconnect.
    pub fn set_timeouts(&self, timeouts: TimeoutConfig) {
        *self.inner.timeouts.lock() = timeouts;
        debug!(link = %self.target(), "Timeouts updated, applied on next connect");
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Fail fast on a disposed or terminally failed connection
    fn check_usable(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ModbusError::Disposed);
        }
        if let Some(err) = self.inner.terminal.lock().as_ref() {
            return Err(err.clone());
        }
        Ok(())
    }

    fn set_state(&self, new_state: ConnectionState, reason: &str) -> ConnectionState {
        let old_state = std::mem::replace(&mut *self.inner.state.lock(), new_state);
        if old_state != new_state {
            self.inner.logger.log_status(old_state, new_state, reason);
        }
        old_state
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Make sure a link is open, driving or awaiting a reconnect if needed
    pub async fn connect(&self) -> Result<()> {
        self.ensure_connected().await
    }

    async fn ensure_connected(&self) -> Result<()> {
        self.check_usable()?;
        if self.state().is_connected() {
            return Ok(());
        }

        let _permit = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return Err(ModbusError::Disposed),
            permit = self.inner.reconnect_lock.lock() => permit,
        };

        // Another caller may have finished a sequence while we waited
        self.check_usable()?;
        if self.state().is_connected() {
            return Ok(());
        }

        self.run_reconnect().await
    }

    /// One reconnect sequence. Caller holds `reconnect_lock`.
    async fn run_reconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let policy = &inner.reconnect;
        let grows = inner.framing == Framing::Tcp;

        self.set_state(ConnectionState::Connecting, "reconnect sequence started");

        let started = Instant::now();
        let mut connect_timeout = policy.connect_timeout_floor();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            inner.logger.log_connect(
                &inner.framing.kind().to_string(),
                &format!("attempt {} (timeout {}ms)", attempt, connect_timeout.as_millis()),
            );

            let opened = tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => return Err(ModbusError::Disposed),
                opened = inner.connector.open(connect_timeout) => opened,
            };

            let failure = match opened {
                Ok(stream) => {
                    let timeouts = *inner.timeouts.lock();
                    let mut link = inner.link.lock().await;
                    if inner.cancel.is_cancelled() {
                        return Err(ModbusError::Disposed);
                    }
                    *link = Some(Link::new(stream, inner.framing, timeouts));
                    if inner.ever_connected.swap(true, Ordering::SeqCst) {
                        inner.stats.record_reconnect();
                    }
                    self.set_state(
                        ConnectionState::Connected,
                        &format!("connected after {} attempt(s)", attempt),
                    );
                    self.emit(ConnectionEvent::Connected);
                    return Ok(());
                },
                Err(e) => e,
            };

            let elapsed = started.elapsed();
            if let Some(deadline) = policy.deadline() {
                if elapsed >= deadline {
                    return Err(self.enter_failed(elapsed, &failure));
                }
            }

            let interval = policy.retry_interval();
            inner
                .logger
                .log_retry(attempt, interval.as_millis() as u64, &failure.to_string());

            if grows {
                connect_timeout =
                    (connect_timeout + policy.connect_timeout_step()).min(policy.connect_timeout_ceiling());
            }

            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => return Err(ModbusError::Disposed),
                _ = tokio::time::sleep(interval) => {},
            }
        }
    }

    /// Open the circuit breaker. Only reachable under `reconnect_lock`, so
    /// `Failed` is emitted once.
    fn enter_failed(&self, elapsed: Duration, last_error: &ModbusError) -> ModbusError {
        let target = self.target().to_string();
        let elapsed_ms = elapsed.as_millis() as u64;
        let err = if self.inner.ever_connected.load(Ordering::SeqCst) {
            ModbusError::ConnectionLost { target, elapsed_ms }
        } else {
            ModbusError::NeverConnected { target, elapsed_ms }
        };

        error!(link = %self.target(), "Reconnect deadline exhausted: {} (last error: {})", err, last_error);
        *self.inner.terminal.lock() = Some(err.clone());
        self.set_state(ConnectionState::Failed, "reconnect deadline exhausted");
        self.emit(ConnectionEvent::Failed);
        err
    }

    /// Drop a broken link. Caller holds the `link` lock.
    fn mark_lost(&self, link: &mut Option<Link>, reason: &ModbusError) {
        if link.take().is_none() {
            return;
        }
        let old = self.set_state(ConnectionState::Disconnected, &reason.to_string());
        if old.is_connected() {
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    /// Start a supervised background reconnect unless one is already running
    fn spawn_reconnect(&self) {
        if self.check_usable().is_err() {
            return;
        }

        let mut supervisor = self.inner.supervisor.lock();
        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let this = self.clone();
        *supervisor = Some(tokio::spawn(async move {
            let result = this.ensure_connected().await;
            match &result {
                Ok(()) => info!(link = %this.target(), "Background reconnect succeeded"),
                Err(ModbusError::Disposed) => debug!(link = %this.target(), "Background reconnect cancelled"),
                Err(e) => warn!(link = %this.target(), "Background reconnect ended: {}", e),
            }
            result
        }));
    }

    /// Wait for the current background reconnect, if any, and return its outcome
    pub async fn await_reconnect(&self) -> Option<Result<()>> {
        let task = self.inner.supervisor.lock().take()?;
        Some(match task.await {
            Ok(result) => result,
            Err(e) => Err(ModbusError::io(format!("reconnect task failed: {}", e))),
        })
    }

    /// Idempotent. Unblocks in-flight reads and connects; every later call
    /// fails with `Disposed`.
    pub async fn dispose(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        info!(link = %self.target(), "Disposing connection");

        let link = self.inner.link.lock().await.take();
        if let Some(link) = link {
            link.shutdown().await;
        }

        if self.state() != ConnectionState::Failed {
            let old = self.set_state(ConnectionState::Disconnected, "disposed");
            if old.is_connected() {
                self.emit(ConnectionEvent::Disconnected);
            }
        }
    }

    /// Synchronous part of `dispose` for use from `Drop`
    pub(crate) fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    // ========================================================================
    // Exchange
    // ========================================================================

    fn next_transaction_id(&self) -> u16 {
        self.inner.next_transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run one request/response round trip inside the exchange critical section
    pub async fn exchange(&self, request: &Request) -> Result<Response> {
        loop {
            self.ensure_connected().await?;

            let mut guard = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => return Err(ModbusError::Disposed),
                guard = self.inner.link.lock() => guard,
            };
            self.check_usable()?;

            let Some(link) = guard.as_mut() else {
                // Lost between the state check and the lock; reconnect first
                continue;
            };

            let result = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => Err(ModbusError::Disposed),
                result = self.transact(link, request) => result,
            };

            return match result {
                Ok(response) => Ok(response),
                Err(e) => {
                    self.inner.stats.record_error(&e);
                    self.inner.logger.log_exchange_error(
                        request.device_id(),
                        request.function().code(),
                        &e,
                    );
                    if e.needs_reconnect() {
                        self.mark_lost(&mut guard, &e);
                        drop(guard);
                        self.spawn_reconnect();
                    }
                    Err(e)
                },
            };
        }
    }

    async fn transact(&self, link: &mut Link, request: &Request) -> Result<Response> {
        let framing = link.framing();
        let request = match framing {
            Framing::Tcp => request.clone().with_transaction_id(self.next_transaction_id()),
            Framing::Rtu => request.clone(),
        };

        let pdu = codec::encode_request(&request)?;
        let frame = framing.encode(request.device_id(), request.transaction_id(), pdu.as_slice());
        self.inner.logger.log_raw_message(
            "TX",
            request.transaction_id(),
            request.device_id(),
            request.function().code(),
            &frame,
        );

        link.send(&frame).await?;
        self.inner.stats.record_sent(frame.len());

        let reply = link.read_one_frame().await?;
        self.inner.stats.record_received(reply.len());

        let parsed = framing.parse(&reply)?;
        self.inner.logger.log_raw_message(
            "RX",
            parsed.transaction_id,
            parsed.device_id,
            parsed.pdu.first().copied().unwrap_or_default(),
            &reply,
        );

        let response =
            codec::decode_response(&request, parsed.device_id, parsed.transaction_id, parsed.pdu)?;
        self.inner.stats.record_response();
        Ok(response)
    }
}

#[async_trait]
impl Exchange for ConnectionManager {
    async fn exchange(&self, request: Request) -> Result<Response> {
        ConnectionManager::exchange(self, &request).await
    }
}
