//! # Health Supervisor
//!
//! Periodically probes every managed session and walks unhealthy ones
//! through a guarded recovery sequence: re-check, cancel the stale
//! listener, force a reconnect, start a fresh listener, and poll for
//! health. Sessions are recovered one at a time, each under its own
//! reconnect mutex so overlapping probes cannot double-recover.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::engine::SessionEngine;

/// Bounded wait when cancelling a stale listener task.
const LISTENER_CANCEL_TIMEOUT: Duration = Duration::from_millis(1500);

/// Health polling after a reconnect: attempts × spacing ≈ 3 s.
const HEALTH_POLL_ATTEMPTS: u32 = 30;
const HEALTH_POLL_SPACING: Duration = Duration::from_millis(100);

/// Capability surface the supervisor needs from a session: health, a
/// listener future, and a forced-reconnect entry point.
pub trait ManagedSession: Send + Sync + 'static {
    /// Display name used in logs.
    fn name(&self) -> String;
    /// Whether the session currently looks alive.
    fn is_healthy(&self) -> bool;
    /// The inbound loop; runs until the session stops or dies.
    fn listen(self: Arc<Self>) -> BoxFuture<'static, ()>;
    /// Reconnect regardless of current state. Returns success.
    fn force_reconnect(self: Arc<Self>) -> BoxFuture<'static, bool>;
}

impl ManagedSession for SessionEngine {
    fn name(&self) -> String {
        self.username().to_string()
    }

    fn is_healthy(&self) -> bool {
        SessionEngine::is_healthy(self)
    }

    fn listen(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { SessionEngine::listen(&self).await })
    }

    fn force_reconnect(self: Arc<Self>) -> BoxFuture<'static, bool> {
        Box::pin(async move { SessionEngine::force_reconnect(&self).await })
    }
}

struct Slot<S> {
    session: Arc<S>,
    listener: Mutex<Option<JoinHandle<()>>>,
    reconnect_lock: Mutex<()>,
}

/// Periodic health prober and session restarter.
pub struct HealthSupervisor<S: ManagedSession> {
    config: Arc<RuntimeConfig>,
    slots: Mutex<Vec<Arc<Slot<S>>>>,
    running: AtomicBool,
    stop_signal: Notify,
    probe_task: Mutex<Option<JoinHandle<()>>>,
    check_in_progress: AtomicBool,
}

impl<S: ManagedSession> HealthSupervisor<S> {
    #[must_use]
    pub fn new(config: Arc<RuntimeConfig>) -> Self {
        Self {
            config,
            slots: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stop_signal: Notify::new(),
            probe_task: Mutex::new(None),
            check_in_progress: AtomicBool::new(false),
        }
    }

    /// Adopt a session and start its listener task.
    pub async fn add_session(&self, session: Arc<S>) {
        let listener = tokio::spawn(Arc::clone(&session).listen());
        let slot = Arc::new(Slot {
            session,
            listener: Mutex::new(Some(listener)),
            reconnect_lock: Mutex::new(()),
        });
        self.slots.lock().await.push(slot);
    }

    /// Launch the probe loop (idempotent while running).
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let supervisor = Arc::clone(self);
        *self.probe_task.lock().await = Some(tokio::spawn(async move {
            supervisor.probe_loop().await;
        }));
        tracing::debug!("Health supervisor started");
    }

    /// Stop probing and abort every listener.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_signal.notify_waiters();
        if let Some(mut task) = self.probe_task.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                task.abort();
                let _ = task.await;
            }
        }
        for slot in self.slots.lock().await.iter() {
            if let Some(listener) = slot.listener.lock().await.take() {
                listener.abort();
            }
        }
    }

    async fn probe_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let jitter = rand::thread_rng().gen_range(0.8..1.2);
            let interval = self.config.health_probe_interval.mul_f64(jitter);
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = self.stop_signal.notified() => break,
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            tracing::debug!("Health check tick");
            self.check_now().await;
        }
        tracing::debug!("Health supervisor probe loop exited");
    }

    /// Probe every session immediately; reconnect unhealthy ones one at a
    /// time. Skips when a previous check is still running.
    pub async fn check_now(&self) {
        if self.check_in_progress.swap(true, Ordering::SeqCst) {
            tracing::debug!("Health check already running, skipping");
            return;
        }

        let slots: Vec<Arc<Slot<S>>> = self.slots.lock().await.iter().cloned().collect();
        let unhealthy: Vec<Arc<Slot<S>>> = slots
            .into_iter()
            .filter(|slot| !slot.session.is_healthy())
            .collect();

        if unhealthy.is_empty() {
            tracing::info!("All sessions healthy");
        } else {
            tracing::warn!(count = unhealthy.len(), "Reconnecting unhealthy sessions");
            for slot in unhealthy {
                let name = slot.session.name();
                if self.attempt_reconnect(&slot).await {
                    tracing::info!(session = %name, "Reconnected session");
                } else {
                    tracing::error!(session = %name, "Failed to reconnect session");
                }
            }
        }

        self.check_in_progress.store(false, Ordering::SeqCst);
    }

    /// The guarded recovery sequence for one session.
    async fn attempt_reconnect(&self, slot: &Arc<Slot<S>>) -> bool {
        let _guard = slot.reconnect_lock.lock().await;
        let name = slot.session.name();

        // The session may have recovered while we waited on the lock.
        if slot.session.is_healthy() {
            tracing::info!(session = %name, "Session became healthy before reconnect");
            return true;
        }

        self.cancel_stale_listener(slot).await;

        if !Arc::clone(&slot.session).force_reconnect().await {
            return false;
        }

        let listener = tokio::spawn(Arc::clone(&slot.session).listen());
        *slot.listener.lock().await = Some(listener);

        for _ in 0..HEALTH_POLL_ATTEMPTS {
            tokio::time::sleep(HEALTH_POLL_SPACING).await;
            if slot.session.is_healthy() {
                return true;
            }
        }
        tracing::warn!(session = %name, "Health not confirmed after reconnect");
        false
    }

    async fn cancel_stale_listener(&self, slot: &Arc<Slot<S>>) {
        let handle = slot.listener.lock().await.take();
        if let Some(handle) = handle {
            if !handle.is_finished() {
                handle.abort();
                let _ = tokio::time::timeout(LISTENER_CANCEL_TIMEOUT, handle).await;
            }
        }
    }
}
