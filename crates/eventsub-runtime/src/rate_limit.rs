//! # Adaptive Rate Limiter
//!
//! Reads `Ratelimit-*` headers from Helix responses and spaces outgoing
//! requests so the bucket never runs dry. One limiter exists per
//! (client id, user) pair — app-token and user-token requests get separate
//! buckets, mirroring how Twitch accounts points.
//!
//! Once `remaining` dips under the safety buffer the limiter enters
//! *conservative mode*, which widens the buffer by a hysteresis margin so
//! the mode does not oscillate on the boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RuntimeConfig;

/// Floor on the spacing between consecutive requests.
const MIN_DELAY_SECS: f64 = 0.1;

/// Extra points added to the safety buffer while in conservative mode.
const HYSTERESIS_POINTS: u32 = 10;

/// Probe delay applied when bucket info is too stale to trust.
const STALE_PROBE_DELAY_SECS: f64 = 1.0;

/// Rate limit snapshot parsed from response headers.
#[derive(Debug, Clone)]
struct BucketInfo {
    /// Bucket capacity (points regenerate toward this).
    limit: u32,
    /// Points believed to remain; decremented predictively per request.
    remaining: u32,
    /// Unix seconds at which the bucket resets to full.
    reset_at: f64,
    /// Wall-clock seconds when this snapshot was taken.
    updated_wall: f64,
    /// Monotonic instant of the snapshot, used for age and drift math.
    updated_mono: Instant,
}

struct LimiterInner {
    app_bucket: Option<BucketInfo>,
    user_bucket: Option<BucketInfo>,
    conservative: bool,
}

/// Per-(client, user) rate limiter driven by remote headers.
pub struct RateLimiter {
    client_id: String,
    username: Option<String>,
    safety_buffer: u32,
    stale_bucket_age: Duration,
    default_bucket_limit: u32,
    inner: Mutex<LimiterInner>,
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u32>().ok())
}

impl RateLimiter {
    /// Create a limiter for one (client id, user) pair. A `username` of
    /// `None` denotes the app-token bucket family.
    #[must_use]
    pub fn new(config: &RuntimeConfig, client_id: impl Into<String>, username: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            username,
            safety_buffer: config.rate_limit_safety_buffer,
            stale_bucket_age: config.stale_bucket_age,
            default_bucket_limit: config.default_bucket_limit,
            inner: Mutex::new(LimiterInner {
                app_bucket: None,
                user_bucket: None,
                conservative: false,
            }),
        }
    }

    fn bucket_key(&self, is_user_request: bool) -> String {
        match (&self.username, is_user_request) {
            (Some(user), true) => format!("user:{user}"),
            _ => format!("app:{}", self.client_id),
        }
    }

    /// Update bucket state from response headers. Header lookups are
    /// case-insensitive; parse failures are logged and ignored.
    pub async fn update_from_headers(&self, headers: &HeaderMap, is_user_request: bool) {
        let limit = header_u32(headers, "ratelimit-limit");
        let remaining = header_u32(headers, "ratelimit-remaining");
        let reset = header_f64(headers, "ratelimit-reset");

        let (Some(limit), Some(remaining), Some(reset_at)) = (limit, remaining, reset) else {
            tracing::debug!(
                bucket = %self.bucket_key(is_user_request),
                "Rate limit headers missing or unparseable"
            );
            return;
        };

        let info = BucketInfo {
            limit,
            remaining,
            reset_at,
            updated_wall: unix_now(),
            updated_mono: Instant::now(),
        };
        let resets_in = (reset_at - info.updated_wall).max(0.0);
        tracing::debug!(
            bucket = %self.bucket_key(is_user_request),
            remaining,
            limit,
            resets_in_secs = resets_in as u64,
            "Rate limit bucket updated"
        );

        let mut inner = self.inner.lock().await;
        if is_user_request {
            inner.user_bucket = Some(info);
        } else {
            inner.app_bucket = Some(info);
        }
    }

    /// Handle a 429 by emptying the bucket until `Ratelimit-Reset`.
    pub async fn handle_429(&self, headers: &HeaderMap, is_user_request: bool) {
        let bucket_key = self.bucket_key(is_user_request);
        let Some(reset_at) = header_f64(headers, "ratelimit-reset") else {
            tracing::error!(bucket = %bucket_key, "429 received without a usable Ratelimit-Reset header");
            return;
        };

        let wait = (reset_at - unix_now()).max(0.0);
        tracing::error!(
            bucket = %bucket_key,
            wait_secs = wait as u64,
            "429 received, emptying bucket until reset"
        );

        let info = BucketInfo {
            limit: self.default_bucket_limit,
            remaining: 0,
            reset_at,
            updated_wall: unix_now(),
            updated_mono: Instant::now(),
        };
        let mut inner = self.inner.lock().await;
        if is_user_request {
            inner.user_bucket = Some(info);
        } else {
            inner.app_bucket = Some(info);
        }
    }

    /// Whether a request of `points_needed` would currently be rate limited.
    pub async fn is_rate_limited(&self, is_user_request: bool, points_needed: u32) -> bool {
        let inner = self.inner.lock().await;
        let bucket = if is_user_request {
            &inner.user_bucket
        } else {
            &inner.app_bucket
        };
        match bucket {
            Some(b) => b.remaining < points_needed + self.safety_buffer,
            None => false,
        }
    }

    /// Predicted points remaining in the selected bucket, if known.
    pub async fn remaining(&self, is_user_request: bool) -> Option<u32> {
        let inner = self.inner.lock().await;
        let bucket = if is_user_request {
            &inner.user_bucket
        } else {
            &inner.app_bucket
        };
        bucket.as_ref().map(|b| b.remaining)
    }

    /// Block until a request of `points_cost` can proceed, then
    /// predictively decrement the bucket.
    ///
    /// The bucket lock is held across the wait so the decrement cannot be
    /// lost to an interleaved caller; a caller cancelled after this returns
    /// leaves the decrement in place (the HTTP request may still have been
    /// issued).
    pub async fn wait_if_needed(&self, endpoint: &str, is_user_request: bool, points_cost: u32) {
        let mut inner = self.inner.lock().await;

        let has_bucket = if is_user_request {
            inner.user_bucket.is_some()
        } else {
            inner.app_bucket.is_some()
        };
        if !has_bucket {
            tracing::debug!(endpoint, "No rate limit bucket yet, applying minimum delay");
            tokio::time::sleep(Duration::from_secs_f64(MIN_DELAY_SECS)).await;
            return;
        }

        let mut conservative = inner.conservative;
        let delay = {
            let bucket = if is_user_request {
                inner.user_bucket.as_ref().unwrap()
            } else {
                inner.app_bucket.as_ref().unwrap()
            };
            self.calculate_delay(bucket, points_cost, &mut conservative)
        };
        inner.conservative = conservative;

        if delay > 0.0 {
            let bucket_key = self.bucket_key(is_user_request);
            if delay > 1.0 {
                tracing::warn!(
                    bucket = %bucket_key,
                    endpoint,
                    delay_secs = format!("{delay:.1}"),
                    "Rate limit wait"
                );
            } else {
                tracing::debug!(
                    bucket = %bucket_key,
                    endpoint,
                    delay_secs = format!("{delay:.1}"),
                    "Brief rate limit delay"
                );
            }
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        let bucket = if is_user_request {
            inner.user_bucket.as_mut()
        } else {
            inner.app_bucket.as_mut()
        };
        if let Some(bucket) = bucket {
            bucket.remaining = bucket.remaining.saturating_sub(points_cost);
            bucket.updated_wall = unix_now();
        }
    }

    /// Compute the delay before the next request may be sent.
    fn calculate_delay(&self, bucket: &BucketInfo, points_needed: u32, conservative: &mut bool) -> f64 {
        if bucket.updated_mono.elapsed() > self.stale_bucket_age {
            tracing::debug!("Rate limit bucket stale, probing with fixed delay");
            return STALE_PROBE_DELAY_SECS;
        }

        let effective_buffer = self.update_conservative_mode(bucket, points_needed, conservative);

        if bucket.remaining >= points_needed + effective_buffer {
            return 0.0;
        }

        let now = unix_now();
        let adjusted_reset = self.adjusted_reset(bucket, now);

        // Out of points entirely: wait for the reset, plus a small cushion.
        if bucket.remaining < points_needed {
            let reset_delay = (adjusted_reset - now).max(0.0);
            tracing::warn!(
                wait_secs = format!("{reset_delay:.1}"),
                "Rate limit exhausted, waiting until bucket reset"
            );
            return reset_delay + 0.1;
        }

        let time_until_reset = (adjusted_reset - now).max(1.0);
        let points_available = f64::from(bucket.remaining) - f64::from(effective_buffer);
        let regeneration_rate = f64::from(bucket.limit) / time_until_reset;
        let deficit = f64::from(points_needed) - points_available;

        if deficit > 0.0 {
            return (deficit / regeneration_rate).max(MIN_DELAY_SECS);
        }

        if points_available > 0.0 {
            // Spread the remaining points across the remaining window.
            return (time_until_reset / points_available).max(MIN_DELAY_SECS);
        }

        (adjusted_reset - now).max(0.0)
    }

    /// Reset instant corrected for wall-clock drift since the snapshot.
    fn adjusted_reset(&self, bucket: &BucketInfo, now_wall: f64) -> f64 {
        let elapsed_mono = bucket.updated_mono.elapsed().as_secs_f64();
        bucket.reset_at - (now_wall - bucket.updated_wall) + elapsed_mono
    }

    /// Apply hysteresis and return the effective safety buffer.
    fn update_conservative_mode(
        &self,
        bucket: &BucketInfo,
        points_needed: u32,
        conservative: &mut bool,
    ) -> u32 {
        let mut effective = self.safety_buffer;
        if *conservative {
            effective += HYSTERESIS_POINTS;
        }

        if *conservative && bucket.remaining > effective + points_needed + 5 {
            *conservative = false;
            effective = self.safety_buffer;
        }

        if !*conservative && bucket.remaining < self.safety_buffer + points_needed {
            *conservative = true;
            effective = self.safety_buffer + HYSTERESIS_POINTS;
        }

        effective
    }
}

/// Registry of shared limiters keyed by (client id, user|app).
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the limiter for `(client_id, username)`.
    pub async fn get(
        &self,
        config: &RuntimeConfig,
        client_id: &str,
        username: Option<&str>,
    ) -> Arc<RateLimiter> {
        let key = format!("{client_id}:{}", username.unwrap_or("app"));
        let mut limiters = self.limiters.lock().await;
        Arc::clone(limiters.entry(key).or_insert_with(|| {
            Arc::new(RateLimiter::new(
                config,
                client_id,
                username.map(str::to_string),
            ))
        }))
    }
}
