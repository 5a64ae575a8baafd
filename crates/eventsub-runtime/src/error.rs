//! # Error Types
//!
//! Semantic error types for the EventSub runtime. Components surface error
//! *kinds* (network, parsing, auth, rate limit, ...) rather than transport
//! details; orchestrators translate them into state transitions.

use thiserror::Error;

/// Convenient Result alias for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// All errors that can occur inside the EventSub runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    // ─── Network / transport ────────────────────────────────────────

    /// Connectivity, DNS, or transport-level failure. Always recoverable.
    #[error("Network error during {operation}: {reason}")]
    Network { operation: String, reason: String },

    /// An operation timed out waiting for a response.
    #[error("Operation '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    // ─── WebSocket connection ───────────────────────────────────────

    /// WebSocket connection establishment, handshake, send, or receive
    /// failed. The `operation` tag mirrors the failing phase
    /// (`connect`, `welcome`, `challenge`, `send`, `receive`).
    #[error("EventSub connection error during {operation}: {reason}")]
    Connection { operation: String, reason: String },

    // ─── Authentication ─────────────────────────────────────────────

    /// 401 from validate/refresh/subscribe. On the refresh path this is
    /// non-recoverable and fires invalidation hooks.
    #[error("Authentication failed during {operation}: {reason}")]
    Auth { operation: String, reason: String },

    /// The token lacks one or more required OAuth scopes.
    #[error("Missing required OAuth scopes: {missing:?}")]
    MissingScopes { missing: Vec<String> },

    // ─── Rate limiting ──────────────────────────────────────────────

    /// 429 from a remote endpoint. The bucket has been emptied until its
    /// reset instant; the current call is a recoverable failure.
    #[error("Rate limited during {operation}")]
    RateLimited { operation: String },

    // ─── Subscriptions ──────────────────────────────────────────────

    /// EventSub subscription create/verify/delete failure. Carries the
    /// HTTP status when one was observed (403 forbidden, batch errors...).
    #[error("Subscription error during {operation}: {reason}")]
    Subscription {
        operation: String,
        reason: String,
        status: Option<u16>,
    },

    // ─── Circuit breaker ────────────────────────────────────────────

    /// Synthetic short-circuit from an OPEN breaker. Never counted as a
    /// failure by the breaker itself.
    #[error("Circuit breaker '{name}' is open")]
    BreakerOpen { name: String },

    // ─── Parsing ────────────────────────────────────────────────────

    /// Malformed JSON or a missing required field in a remote payload.
    #[error("Parse error during {operation}: {reason}")]
    Parse { operation: String, reason: String },

    // ─── Cache ──────────────────────────────────────────────────────

    /// Non-corruption cache I/O failure, tagged with `load_cache` or
    /// `save_cache`. Corruption never surfaces here (it self-heals).
    #[error("Cache error during {operation}: {reason}")]
    Cache { operation: String, reason: String },

    // ─── Config ─────────────────────────────────────────────────────

    /// Invalid runtime configuration value.
    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

impl RuntimeError {
    /// Shorthand for a [`RuntimeError::Network`] with an operation tag.
    pub fn network(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RuntimeError::Network {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a [`RuntimeError::Connection`] with an operation tag.
    pub fn connection(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RuntimeError::Connection {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a [`RuntimeError::Parse`] with an operation tag.
    pub fn parse(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RuntimeError::Parse {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` if this error is transient and the operation can be
    /// retried on the next loop iteration.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Network { .. }
                | RuntimeError::Timeout { .. }
                | RuntimeError::RateLimited { .. }
                | RuntimeError::Connection { .. }
        )
    }

    /// Returns `true` if this error indicates the WebSocket connection is
    /// dead and a reconnect is needed.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RuntimeError::Connection { .. } | RuntimeError::Timeout { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RuntimeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RuntimeError::connection("transport", err)
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::parse("json", err)
    }
}
