//! # Configuration
//!
//! [`RuntimeConfig`] holds every tunable used by the runtime. Each field has
//! a production default and most can be overridden through an environment
//! variable of the same name as in the table below. Invalid values log a
//! warning and fall back to the default — a misconfigured deployment should
//! degrade, not crash.
//!
//! Configuration *file* loading and watching are out of scope; callers
//! construct a config programmatically or via [`RuntimeConfig::from_env`].

use std::time::Duration;

/// Default Twitch EventSub WebSocket URL.
pub const EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

/// Default Twitch Helix API base URL.
pub const HELIX_BASE_URL: &str = "https://api.twitch.tv/helix";

/// Default OAuth token endpoint.
pub const OAUTH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

/// Default OAuth validate endpoint.
pub const OAUTH_VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";

const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 3600;
const DEFAULT_REFRESH_SAFETY_BUFFER_SECS: u64 = 300;
const DEFAULT_VALIDATION_MIN_INTERVAL_SECS: u64 = 30;
const DEFAULT_BACKGROUND_BASE_SLEEP_SECS: u64 = 60;
const DEFAULT_PERIODIC_VALIDATION_INTERVAL_SECS: u64 = 1800;
const DEFAULT_CACHE_PATH: &str = "broadcaster_ids.cache.json";
const DEFAULT_WS_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_WS_MESSAGE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_EVENTSUB_MAX_BACKOFF_SECS: u64 = 60;
const DEFAULT_SUB_CHECK_INTERVAL_SECS: u64 = 300;
const DEFAULT_CONSECUTIVE_401_THRESHOLD: u32 = 2;
const DEFAULT_HEALTH_PROBE_INTERVAL_SECS: u64 = 60;
const DEFAULT_STALE_THRESHOLD_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_SAFETY_BUFFER: u32 = 3;
const DEFAULT_STALE_BUCKET_AGE_SECS: u64 = 300;
const DEFAULT_BUCKET_LIMIT: u32 = 800;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;

/// Per-breaker tuning: consecutive failures to open, time before probing
/// recovery, consecutive half-open successes to close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
            success_threshold: 3,
        }
    }
}

impl BreakerConfig {
    /// Preset for the `twitch_api` breaker wrapping Helix/OAuth calls.
    #[must_use]
    pub fn api() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }

    /// Preset for the `websocket_connection` breaker wrapping connects.
    #[must_use]
    pub fn websocket() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Runtime configuration shared by every component.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Remaining lifetime below which a token is proactively refreshed.
    pub refresh_threshold: Duration,
    /// Subtracted from raw `expires_in` to schedule refresh early.
    pub refresh_safety_buffer: Duration,
    /// Minimum spacing between remote validations for one user.
    pub validation_min_interval: Duration,
    /// Base sleep between background refresh loop iterations.
    pub background_base_sleep: Duration,
    /// Spacing between periodic remote validations.
    pub periodic_validation_interval: Duration,
    /// Path of the broadcaster login → user-id JSON cache file.
    pub broadcaster_cache_path: String,
    /// In-memory LRU capacity of the cache store.
    pub cache_max_entries: usize,
    /// WebSocket ping interval while idle.
    pub ws_heartbeat: Duration,
    /// Bounded timeout for a single WebSocket receive.
    pub ws_message_timeout: Duration,
    /// Exponential backoff cap for EventSub reconnects.
    pub eventsub_max_backoff: Duration,
    /// Spacing between subscription verification sweeps.
    pub sub_check_interval: Duration,
    /// Consecutive subscribe 401s before the engine marks its token invalid.
    pub consecutive_401_threshold: u32,
    /// Supervisor probe interval (jittered ±20%).
    pub health_probe_interval: Duration,
    /// Inactivity span after which a connection is considered stale.
    pub stale_threshold: Duration,
    /// Points kept in reserve by the rate limiter.
    pub rate_limit_safety_buffer: u32,
    /// Bucket age beyond which header info is too old to trust.
    pub stale_bucket_age: Duration,
    /// Bucket limit assumed when a 429 arrives without usable headers.
    pub default_bucket_limit: u32,
    /// EventSub WebSocket URL.
    pub eventsub_ws_url: String,
    /// Helix API base URL.
    pub helix_base_url: String,
    /// OAuth token endpoint URL.
    pub oauth_token_url: String,
    /// OAuth validate endpoint URL.
    pub oauth_validate_url: String,
    /// `twitch_api` breaker tuning.
    pub api_breaker: BreakerConfig,
    /// `websocket_connection` breaker tuning.
    pub ws_breaker: BreakerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(DEFAULT_REFRESH_THRESHOLD_SECS),
            refresh_safety_buffer: Duration::from_secs(DEFAULT_REFRESH_SAFETY_BUFFER_SECS),
            validation_min_interval: Duration::from_secs(DEFAULT_VALIDATION_MIN_INTERVAL_SECS),
            background_base_sleep: Duration::from_secs(DEFAULT_BACKGROUND_BASE_SLEEP_SECS),
            periodic_validation_interval: Duration::from_secs(
                DEFAULT_PERIODIC_VALIDATION_INTERVAL_SECS,
            ),
            broadcaster_cache_path: DEFAULT_CACHE_PATH.to_string(),
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            ws_heartbeat: Duration::from_secs(DEFAULT_WS_HEARTBEAT_SECS),
            ws_message_timeout: Duration::from_secs(DEFAULT_WS_MESSAGE_TIMEOUT_SECS),
            eventsub_max_backoff: Duration::from_secs(DEFAULT_EVENTSUB_MAX_BACKOFF_SECS),
            sub_check_interval: Duration::from_secs(DEFAULT_SUB_CHECK_INTERVAL_SECS),
            consecutive_401_threshold: DEFAULT_CONSECUTIVE_401_THRESHOLD,
            health_probe_interval: Duration::from_secs(DEFAULT_HEALTH_PROBE_INTERVAL_SECS),
            stale_threshold: Duration::from_secs(DEFAULT_STALE_THRESHOLD_SECS),
            rate_limit_safety_buffer: DEFAULT_RATE_LIMIT_SAFETY_BUFFER,
            stale_bucket_age: Duration::from_secs(DEFAULT_STALE_BUCKET_AGE_SECS),
            default_bucket_limit: DEFAULT_BUCKET_LIMIT,
            eventsub_ws_url: EVENTSUB_WS_URL.to_string(),
            helix_base_url: HELIX_BASE_URL.to_string(),
            oauth_token_url: OAUTH_TOKEN_URL.to_string(),
            oauth_validate_url: OAUTH_VALIDATE_URL.to_string(),
            api_breaker: BreakerConfig::api(),
            ws_breaker: BreakerConfig::websocket(),
        }
    }
}

impl RuntimeConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    ///
    /// Recognized variables:
    /// `TOKEN_REFRESH_THRESHOLD_SECONDS`,
    /// `TOKEN_REFRESH_SAFETY_BUFFER_SECONDS`,
    /// `TOKEN_MANAGER_VALIDATION_MIN_INTERVAL`,
    /// `TOKEN_MANAGER_BACKGROUND_BASE_SLEEP`,
    /// `TOKEN_MANAGER_PERIODIC_VALIDATION_INTERVAL`,
    /// `TWITCH_BROADCASTER_CACHE`,
    /// `WEBSOCKET_HEARTBEAT_SECONDS`,
    /// `WEBSOCKET_MESSAGE_TIMEOUT_SECONDS`,
    /// `EVENTSUB_MAX_BACKOFF_SECONDS`,
    /// `EVENTSUB_SUB_CHECK_INTERVAL_SECONDS`,
    /// `EVENTSUB_CONSECUTIVE_401_THRESHOLD`,
    /// `HEALTH_MONITOR_INTERVAL`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.refresh_threshold =
            env_duration_secs("TOKEN_REFRESH_THRESHOLD_SECONDS", config.refresh_threshold);
        config.refresh_safety_buffer = env_duration_secs(
            "TOKEN_REFRESH_SAFETY_BUFFER_SECONDS",
            config.refresh_safety_buffer,
        );
        config.validation_min_interval = env_duration_secs(
            "TOKEN_MANAGER_VALIDATION_MIN_INTERVAL",
            config.validation_min_interval,
        );
        config.background_base_sleep = env_duration_secs(
            "TOKEN_MANAGER_BACKGROUND_BASE_SLEEP",
            config.background_base_sleep,
        );
        config.periodic_validation_interval = env_duration_secs(
            "TOKEN_MANAGER_PERIODIC_VALIDATION_INTERVAL",
            config.periodic_validation_interval,
        );
        if let Ok(path) = std::env::var("TWITCH_BROADCASTER_CACHE") {
            config.broadcaster_cache_path = path;
        }
        config.ws_heartbeat = env_duration_secs("WEBSOCKET_HEARTBEAT_SECONDS", config.ws_heartbeat);
        config.ws_message_timeout = env_duration_secs(
            "WEBSOCKET_MESSAGE_TIMEOUT_SECONDS",
            config.ws_message_timeout,
        );
        config.eventsub_max_backoff = env_duration_secs(
            "EVENTSUB_MAX_BACKOFF_SECONDS",
            config.eventsub_max_backoff,
        );
        config.sub_check_interval = env_duration_secs(
            "EVENTSUB_SUB_CHECK_INTERVAL_SECONDS",
            config.sub_check_interval,
        );
        config.consecutive_401_threshold = env_u32(
            "EVENTSUB_CONSECUTIVE_401_THRESHOLD",
            config.consecutive_401_threshold,
        );
        config.health_probe_interval = env_duration_secs(
            "HEALTH_MONITOR_INTERVAL",
            config.health_probe_interval,
        );
        config
    }
}

/// Parse a whole-seconds duration from an environment variable, warning and
/// falling back to `default` on absence or parse failure.
fn env_duration_secs(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                tracing::warn!(
                    var = name,
                    value = %raw,
                    default_secs = default.as_secs(),
                    "Invalid integer in environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<u32>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(
                    var = name,
                    value = %raw,
                    default,
                    "Invalid integer in environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
