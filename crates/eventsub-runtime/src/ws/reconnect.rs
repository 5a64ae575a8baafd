//! Single-shot reconnection with exponential backoff and jitter.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use crate::error::RuntimeError;

use super::{ConnectionState, WsSession};

/// Initial backoff before a reconnect attempt.
const INITIAL_BACKOFF_SECS: f64 = 1.0;

/// Exponential backoff state shared across reconnect attempts. Doubles on
/// failure up to the configured cap, resets on success.
pub(super) struct Backoff {
    current: Mutex<f64>,
    max: Duration,
}

impl Backoff {
    pub(super) fn new(max: Duration) -> Self {
        Self {
            current: Mutex::new(INITIAL_BACKOFF_SECS),
            max,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, f64> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Next delay with multiplicative jitter in [0.5, 1.5).
    pub(super) fn next_delay(&self) -> Duration {
        let base = *self.lock();
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64((base * jitter).min(self.max.as_secs_f64()))
    }

    pub(super) fn record_failure(&self) {
        let mut current = self.lock();
        *current = (*current * 2.0).min(self.max.as_secs_f64());
    }

    pub(super) fn record_success(&self) {
        *self.lock() = INITIAL_BACKOFF_SECS;
    }

    #[cfg(test)]
    fn current(&self) -> f64 {
        *self.lock()
    }
}

impl WsSession {
    /// Attempt one reconnect: backoff sleep (short-circuited by a stop
    /// request), then a breaker-guarded connect + welcome.
    ///
    /// Returns `true` on success. When the `websocket_connection` breaker
    /// is open the attempt short-circuits to `false`; the caller may retry
    /// later.
    pub async fn reconnect(&self) -> bool {
        if self.stop_requested() {
            tracing::debug!("Reconnect skipped, stop requested");
            return false;
        }
        if self.breaker.is_open().await {
            tracing::info!("Circuit breaker open, cannot reconnect");
            return false;
        }

        self.state.set_state(ConnectionState::Reconnecting);

        let delay = self.backoff.next_delay();
        let url = self.connector.url().await;
        tracing::info!(
            delay_ms = delay.as_millis() as u64,
            url = %url,
            "Reconnect attempt"
        );
        let stopped = tokio::select! {
            () = tokio::time::sleep(delay) => false,
            () = self.stop_signal.notified() => true,
        };
        if stopped || self.stop_requested() {
            tracing::debug!("Reconnect backoff interrupted by stop request");
            return false;
        }

        match self.connect().await {
            Ok(()) => {
                self.backoff.record_success();
                tracing::info!(
                    session_id = self.session_id().as_deref().unwrap_or(""),
                    "Reconnect successful"
                );
                true
            }
            Err(RuntimeError::BreakerOpen { .. }) => {
                tracing::info!("Reconnect short-circuited by open circuit breaker");
                false
            }
            Err(e) => {
                self.backoff.record_failure();
                self.state.set_state(ConnectionState::Disconnected);
                tracing::error!(error = %e, "Reconnect failed");
                false
            }
        }
    }
}
