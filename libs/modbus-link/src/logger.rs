//! Link-scoped structured logging
//!
//! Every message carries the link target so logs from several clients in one
//! process stay distinguishable.

use std::fmt::Write;

use crate::types::ConnectionState;

/// Encode bytes as space-separated uppercase hex: `[0x01, 0xAB]` -> `"01 AB"`
pub fn hex_upper(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        // Writing to String buffer is infallible
        let _ = write!(&mut out, "{:02X}", byte);
    }
    out
}

/// Lightweight logger bound to one link target
#[derive(Debug, Clone)]
pub struct FrameLogger {
    target: String,
}

impl FrameLogger {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Log connection attempt
    pub fn log_connect(&self, protocol: &str, details: &str) {
        tracing::info!(link = %self.target, "[CONNECT] {} - {}", protocol, details);
    }

    /// Log connection status change
    pub fn log_status(&self, old_state: ConnectionState, new_state: ConnectionState, reason: &str) {
        tracing::info!(
            link = %self.target,
            "[STATUS] {} -> {} - {}",
            old_state,
            new_state,
            reason
        );
    }

    /// Log a failed connect attempt before the retry sleep
    pub fn log_retry(&self, attempt: u32, delay_ms: u64, reason: &str) {
        tracing::warn!(
            link = %self.target,
            "[RETRY] Attempt {} failed, reconnecting in {}ms - {}",
            attempt,
            delay_ms,
            reason
        );
    }

    /// Log raw Modbus frame
    pub fn log_raw_message(
        &self,
        direction: &str,
        transaction_id: Option<u16>,
        device_id: u8,
        function_code: u8,
        raw_frame: &[u8],
    ) {
        let hex_str = hex_upper(raw_frame);
        match transaction_id {
            Some(tid) => tracing::debug!(
                link = %self.target,
                "[{}] TID={:04X} Device={} FC={:02X} Frame:[{}]",
                direction,
                tid,
                device_id,
                function_code,
                hex_str
            ),
            None => tracing::debug!(
                link = %self.target,
                "[{}] Device={} FC={:02X} Frame:[{}]",
                direction,
                device_id,
                function_code,
                hex_str
            ),
        }
    }

    /// Log a failed exchange
    pub fn log_exchange_error(&self, device_id: u8, function_code: u8, error: &dyn std::fmt::Display) {
        tracing::warn!(
            link = %self.target,
            "[ERROR] Device={} FC={:02X} - {}",
            device_id,
            function_code,
            error
        );
    }
}
