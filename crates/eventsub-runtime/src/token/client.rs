//! Stateless OAuth token operations: remote validate, refresh, and the
//! ensure-fresh decision flow. All expiries handed out by this module are
//! *safety-buffered* — the raw `expires_in` minus a configured buffer,
//! floored at zero — so schedulers upstream refresh early by construction.

use std::time::{Duration, SystemTime};

use serde_json::Value;

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};

use super::format_duration;

/// Outcome of a token validation or refresh operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOutcome {
    /// Token is valid and does not need refresh.
    Valid,
    /// Token was successfully refreshed.
    Refreshed,
    /// No action needed; still within the safe threshold.
    Skipped,
    /// Operation failed.
    Failed,
}

/// Classification of a refresh failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshErrorKind {
    /// Transient (network, rate limit, malformed response); retry later
    /// with the same refresh token.
    Recoverable,
    /// The refresh token was rejected (401). Never retried with the same
    /// refresh token; invalidation hooks fire.
    NonRecoverable,
}

/// Result of a token validation or refresh operation.
#[derive(Debug, Clone)]
pub struct TokenResult {
    pub outcome: TokenOutcome,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expiry: Option<SystemTime>,
    pub error: Option<RefreshErrorKind>,
}

impl TokenResult {
    fn failed(kind: RefreshErrorKind) -> Self {
        Self {
            outcome: TokenOutcome::Failed,
            access_token: None,
            refresh_token: None,
            expiry: None,
            error: Some(kind),
        }
    }
}

/// Client for validating and refreshing Twitch OAuth tokens.
pub struct TokenClient {
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
    token_url: String,
    validate_url: String,
    refresh_threshold: Duration,
    safety_buffer: Duration,
}

/// Per-request timeout for OAuth endpoints.
const OAUTH_TIMEOUT: Duration = Duration::from_secs(30);

impl TokenClient {
    #[must_use]
    pub fn new(
        config: &RuntimeConfig,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            http,
            token_url: config.oauth_token_url.clone(),
            validate_url: config.oauth_validate_url.clone(),
            refresh_threshold: config.refresh_threshold,
            safety_buffer: config.refresh_safety_buffer,
        }
    }

    /// Buffered absolute expiry from a raw `expires_in`.
    fn buffered_expiry(&self, expires_in: u64) -> SystemTime {
        let safe = expires_in.saturating_sub(self.safety_buffer.as_secs());
        SystemTime::now() + Duration::from_secs(safe)
    }

    /// Validate a token against the remote validate endpoint.
    ///
    /// Returns `(true, buffered_expiry)` on 200 and `(false, None)` on any
    /// rejecting status (401 invalid, 429 rate limited, others).
    ///
    /// # Errors
    /// `Network`/`Timeout` when no response was received.
    pub async fn validate_remote(
        &self,
        username: &str,
        access_token: &str,
    ) -> RuntimeResult<(bool, Option<SystemTime>)> {
        let resp = self
            .http
            .get(&self.validate_url)
            .timeout(OAUTH_TIMEOUT)
            .header("Authorization", format!("OAuth {access_token}"))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    tracing::warn!(user = username, "Token validation timeout");
                    RuntimeError::Timeout {
                        operation: "validate".into(),
                        seconds: OAUTH_TIMEOUT.as_secs(),
                    }
                } else {
                    tracing::warn!(user = username, error = %e, "Network error during token validation");
                    RuntimeError::network("validate", e)
                }
            })?;

        let status = resp.status().as_u16();
        if status == 200 {
            let payload: Value = resp
                .json()
                .await
                .map_err(|e| RuntimeError::parse("validate", e))?;
            let expiry = payload
                .get("expires_in")
                .and_then(Value::as_u64)
                .map(|expires_in| {
                    let buffered = expires_in.saturating_sub(self.safety_buffer.as_secs());
                    tracing::debug!(
                        user = username,
                        expires_in,
                        buffered_expires_in = buffered,
                        "Token valid"
                    );
                    self.buffered_expiry(expires_in)
                });
            return Ok((true, expiry));
        }

        match status {
            401 => tracing::info!(user = username, status, "Token validation failed: invalid"),
            429 => tracing::warn!(user = username, status, "Token validation rate limited"),
            _ => tracing::warn!(user = username, status, "Token validation failed"),
        }
        Ok((false, None))
    }

    /// Exchange a refresh token for a fresh access token.
    ///
    /// Never returns an error: every failure mode collapses into a
    /// [`TokenOutcome::Failed`] result whose [`RefreshErrorKind`] tells the
    /// caller whether retrying is worthwhile. A 401 is final for this
    /// refresh token.
    pub async fn refresh(&self, username: &str, refresh_token: &str) -> TokenResult {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let resp = match self
            .http
            .post(&self.token_url)
            .timeout(OAUTH_TIMEOUT)
            .form(&form)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(user = username, error = %e, "Network error during token refresh");
                return TokenResult::failed(RefreshErrorKind::Recoverable);
            }
        };

        match resp.status().as_u16() {
            200 => {
                let payload: Value = match resp.json().await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(user = username, error = %e, "Refresh response was not JSON");
                        return TokenResult::failed(RefreshErrorKind::Recoverable);
                    }
                };
                let Some(new_access) = payload.get("access_token").and_then(Value::as_str) else {
                    tracing::warn!(user = username, "Missing access_token in refresh response");
                    return TokenResult::failed(RefreshErrorKind::Recoverable);
                };
                // Twitch may rotate the refresh token; keep the old one
                // when the response omits it.
                let new_refresh = payload
                    .get("refresh_token")
                    .and_then(Value::as_str)
                    .unwrap_or(refresh_token);
                let expires_in = payload.get("expires_in").and_then(Value::as_u64);
                let expiry = expires_in.map(|e| self.buffered_expiry(e));

                tracing::info!(
                    user = username,
                    lifetime = %format_duration(expires_in.unwrap_or(0)),
                    "Token refreshed"
                );
                TokenResult {
                    outcome: TokenOutcome::Refreshed,
                    access_token: Some(new_access.to_string()),
                    refresh_token: Some(new_refresh.to_string()),
                    expiry,
                    error: None,
                }
            }
            401 => {
                tracing::error!(user = username, "Unauthorized during token refresh");
                TokenResult::failed(RefreshErrorKind::NonRecoverable)
            }
            429 => {
                tracing::warn!(user = username, "Rate limited during token refresh");
                TokenResult::failed(RefreshErrorKind::Recoverable)
            }
            status => {
                tracing::warn!(user = username, status, "HTTP error during token refresh");
                TokenResult::failed(RefreshErrorKind::Recoverable)
            }
        }
    }

    /// Ensure a token is fresh, refreshing when needed.
    ///
    /// Skips when the known expiry is comfortably above the refresh
    /// threshold; otherwise validates remotely (unless forced) and falls
    /// through to a refresh when validation says the token is dying.
    ///
    /// # Errors
    /// Propagates `Network`/`Timeout` from the validation step only; the
    /// refresh step reports failures through the returned [`TokenResult`].
    pub async fn ensure_fresh(
        &self,
        username: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expiry: Option<SystemTime>,
        force_refresh: bool,
    ) -> RuntimeResult<TokenResult> {
        let threshold = self.refresh_threshold.as_secs_f64();

        if !force_refresh {
            if let Some(expiry) = expiry {
                if remaining_secs(expiry) > threshold {
                    return Ok(TokenResult {
                        outcome: TokenOutcome::Skipped,
                        access_token: Some(access_token.to_string()),
                        refresh_token: refresh_token.map(str::to_string),
                        expiry: Some(expiry),
                        error: None,
                    });
                }
            }

            let (is_valid, remote_expiry) = self.validate_remote(username, access_token).await?;
            if is_valid {
                let final_expiry = remote_expiry.or(expiry);
                if let Some(final_expiry) = final_expiry {
                    if remaining_secs(final_expiry) > threshold {
                        return Ok(TokenResult {
                            outcome: TokenOutcome::Skipped,
                            access_token: Some(access_token.to_string()),
                            refresh_token: refresh_token.map(str::to_string),
                            expiry: Some(final_expiry),
                            error: None,
                        });
                    }
                }
                tracing::warn!(user = username, "Token valid but expiring soon, scheduling refresh");
            }
        }

        let Some(refresh_token) = refresh_token else {
            tracing::warn!(user = username, "Refresh needed but no refresh token is known");
            return Ok(TokenResult {
                outcome: TokenOutcome::Failed,
                access_token: None,
                refresh_token: None,
                expiry,
                error: None,
            });
        };
        Ok(self.refresh(username, refresh_token).await)
    }
}

/// Signed seconds until `expiry` (negative when already past).
pub(crate) fn remaining_secs(expiry: SystemTime) -> f64 {
    match expiry.duration_since(SystemTime::now()) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}
