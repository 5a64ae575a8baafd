//! # Circuit Breaker
//!
//! Failure isolation for external service calls. A breaker passes calls
//! through while CLOSED, fails fast while OPEN, and probes recovery in
//! HALF_OPEN. Named instances are shared through a [`BreakerRegistry`] so
//! that every caller hitting the same endpoint trips the same breaker.
//!
//! The state lock is held only across inspection and outcome recording —
//! the wrapped call itself runs unlocked, so concurrent in-flight calls do
//! not serialize behind each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::error::{RuntimeError, RuntimeResult};

/// Breakers unused for longer than this are evicted by [`BreakerRegistry::cleanup`].
const IDLE_EVICTION_AGE: Duration = Duration::from_secs(3600);

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, calls pass through.
    Closed,
    /// Service is failing, calls fail fast.
    Open,
    /// Probing whether the service has recovered.
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_used: Instant,
}

/// Three-state circuit breaker wrapping fallible async operations.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker with the given name and tuning.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_used: Instant::now(),
            }),
        }
    }

    /// Execute an operation through the breaker.
    ///
    /// While OPEN and before the recovery timeout has elapsed, returns
    /// [`RuntimeError::BreakerOpen`] without invoking `op`. Once the timeout
    /// has elapsed the next call transitions to HALF_OPEN and runs.
    ///
    /// # Errors
    /// Returns `BreakerOpen` when short-circuited, otherwise whatever the
    /// wrapped operation returns.
    pub async fn call<T, F, Fut>(&self, op: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        {
            let mut inner = self.inner.lock().await;
            inner.last_used = Instant::now();
            if inner.state == BreakerState::Open {
                if self.recovery_due(&inner) {
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                    tracing::info!(breaker = %self.name, "Circuit breaker transitioning to HALF_OPEN");
                } else {
                    return Err(RuntimeError::BreakerOpen {
                        name: self.name.clone(),
                    });
                }
            }
        }

        let result = op().await;

        let mut inner = self.inner.lock().await;
        match &result {
            Ok(_) => match inner.state {
                BreakerState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        Self::reset_inner(&mut inner);
                        tracing::info!(breaker = %self.name, "Circuit breaker recovered, transitioning to CLOSED");
                    }
                }
                BreakerState::Closed => inner.failure_count = 0,
                BreakerState::Open => {}
            },
            Err(_) => self.record_failure(&mut inner),
        }
        result
    }

    fn recovery_due(&self, inner: &BreakerInner) -> bool {
        match inner.last_failure {
            Some(at) => at.elapsed() >= self.config.recovery_timeout,
            None => true,
        }
    }

    fn record_failure(&self, inner: &mut BreakerInner) {
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        if inner.failure_count >= self.config.failure_threshold {
            inner.state = BreakerState::Open;
            tracing::warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                "Circuit breaker opened"
            );
        } else if inner.state == BreakerState::HalfOpen {
            // Any failure while probing sends us straight back to OPEN.
            inner.state = BreakerState::Open;
            tracing::warn!(breaker = %self.name, "Circuit breaker returned to OPEN after HALF_OPEN failure");
        }
    }

    fn reset_inner(inner: &mut BreakerInner) {
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
    }

    /// Current breaker state.
    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    /// Whether the breaker is currently OPEN.
    pub async fn is_open(&self) -> bool {
        self.state().await == BreakerState::Open
    }

    /// Manually reset the breaker to CLOSED.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        Self::reset_inner(&mut inner);
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn idle_for(&self) -> Duration {
        self.inner.lock().await.last_used.elapsed()
    }
}

/// Named registry handing out shared breaker instances.
///
/// The same name always maps to the same instance; the config passed to
/// [`get`](Self::get) only applies on first creation.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the breaker registered under `name`.
    pub async fn get(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    /// Current state of a named breaker, if registered.
    pub async fn state(&self, name: &str) -> Option<BreakerState> {
        let breaker = {
            let breakers = self.breakers.lock().await;
            breakers.get(name).cloned()
        };
        match breaker {
            Some(b) => Some(b.state().await),
            None => None,
        }
    }

    /// Reset a named breaker to CLOSED, if registered.
    pub async fn reset(&self, name: &str) {
        let breaker = {
            let breakers = self.breakers.lock().await;
            breakers.get(name).cloned()
        };
        if let Some(b) = breaker {
            b.reset().await;
        }
    }

    /// Remove a named breaker from the registry.
    pub async fn remove(&self, name: &str) {
        let mut breakers = self.breakers.lock().await;
        if breakers.remove(name).is_some() {
            tracing::info!(breaker = name, "Circuit breaker removed from registry");
        }
    }

    /// Evict breakers unused for more than one hour. Returns the count removed.
    pub async fn cleanup(&self) -> usize {
        let snapshot: Vec<(String, Arc<CircuitBreaker>)> = {
            let breakers = self.breakers.lock().await;
            breakers
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };

        let mut stale = Vec::new();
        for (name, breaker) in snapshot {
            if breaker.idle_for().await > IDLE_EVICTION_AGE {
                stale.push(name);
            }
        }

        let mut breakers = self.breakers.lock().await;
        let mut removed = 0;
        for name in stale {
            if breakers.remove(&name).is_some() {
                removed += 1;
                tracing::info!(breaker = %name, "Circuit breaker cleaned up due to inactivity");
            }
        }
        removed
    }
}
