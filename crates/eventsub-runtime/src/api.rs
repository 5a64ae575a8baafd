//! # Helix / OAuth HTTP Client
//!
//! Thin asynchronous client for the Twitch Helix endpoints the runtime
//! needs (user resolution, EventSub subscription CRUD) plus token
//! validation. Every Helix call goes through the `twitch_api` circuit
//! breaker and, when a limiter is attached, is co-scheduled with the
//! adaptive rate limiter (§ pre-call wait, post-call header ingest).
//!
//! Prefer adding focused methods over sprinkling raw request logic across
//! modules.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value;

use crate::breaker::{BreakerRegistry, CircuitBreaker};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::rate_limit::RateLimiter;

/// Name of the breaker wrapping every Helix request.
pub const API_BREAKER_NAME: &str = "twitch_api";

/// Status reported when no HTTP response was received at all.
pub const SYNTHETIC_NETWORK_FAILURE_STATUS: u16 = 599;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum logins per `GET users` call, imposed by Helix.
const USERS_BATCH_LIMIT: usize = 100;

/// Outcome of a raw Helix request. Never an error: transport failures
/// surface as an empty body with a synthetic status so callers can branch
/// on status alone.
#[derive(Debug)]
pub struct ApiResponse {
    pub body: Value,
    pub status: u16,
    pub headers: HeaderMap,
}

/// Payload returned by the OAuth validate endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenValidation {
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Asynchronous Twitch Helix API client.
pub struct HelixClient {
    http: reqwest::Client,
    base_url: String,
    validate_url: String,
    breaker: Arc<CircuitBreaker>,
    limiter: Option<Arc<RateLimiter>>,
}

impl HelixClient {
    /// Build a client sharing the process-wide HTTP pool and the
    /// `twitch_api` breaker from the registry.
    pub async fn new(
        http: reqwest::Client,
        config: &RuntimeConfig,
        breakers: &BreakerRegistry,
    ) -> Self {
        let breaker = breakers
            .get(API_BREAKER_NAME, config.api_breaker.clone())
            .await;
        Self {
            http,
            base_url: config.helix_base_url.clone(),
            validate_url: config.oauth_validate_url.clone(),
            breaker,
            limiter: None,
        }
    }

    /// Attach a rate limiter; subsequent requests wait on it and feed
    /// response headers back into it.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Perform a raw request against a Helix endpoint.
    ///
    /// Sets `Authorization: Bearer`, `Client-Id`, and a JSON content type.
    /// A 204 yields an empty body without parsing. When the breaker is OPEN
    /// the call short-circuits to `(empty, 503, X-Circuit-Breaker: OPEN)`.
    /// Network and timeout errors count as breaker failures and surface as
    /// an empty body with status [`SYNTHETIC_NETWORK_FAILURE_STATUS`].
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        access_token: &str,
        client_id: &str,
        query: Option<&[(&str, &str)]>,
        json_body: Option<&Value>,
    ) -> ApiResponse {
        if let Some(limiter) = &self.limiter {
            limiter.wait_if_needed(endpoint, true, 1).await;
        }

        let url = format!("{}/{}", self.base_url, endpoint);
        let result = self
            .breaker
            .call(|| async {
                let mut req = self
                    .http
                    .request(method.clone(), &url)
                    .timeout(REQUEST_TIMEOUT)
                    .header("Authorization", format!("Bearer {access_token}"))
                    .header("Client-Id", client_id)
                    .header("Content-Type", "application/json");
                if let Some(query) = query {
                    req = req.query(query);
                }
                if let Some(body) = json_body {
                    req = req.json(body);
                }

                let resp = req.send().await.map_err(|e| {
                    if e.is_timeout() {
                        RuntimeError::Timeout {
                            operation: format!("{method} {endpoint}"),
                            seconds: REQUEST_TIMEOUT.as_secs(),
                        }
                    } else {
                        RuntimeError::network(format!("{method} {endpoint}"), e)
                    }
                })?;

                let status = resp.status().as_u16();
                let headers = resp.headers().clone();
                tracing::debug!(%method, endpoint, status, "Helix API response");

                let body = if status == 204 {
                    Value::Object(serde_json::Map::new())
                } else {
                    resp.json::<Value>().await.unwrap_or_else(|e| {
                        tracing::debug!(%method, endpoint, error = %e, "Response body was not JSON");
                        Value::Object(serde_json::Map::new())
                    })
                };

                Ok(ApiResponse {
                    body,
                    status,
                    headers,
                })
            })
            .await;

        let response = match result {
            Ok(response) => response,
            Err(RuntimeError::BreakerOpen { .. }) => {
                tracing::error!(%method, endpoint, "Helix request blocked by open circuit breaker");
                let mut headers = HeaderMap::new();
                headers.insert("X-Circuit-Breaker", "OPEN".parse().expect("static header"));
                return ApiResponse {
                    body: Value::Object(serde_json::Map::new()),
                    status: 503,
                    headers,
                };
            }
            Err(e) => {
                tracing::warn!(%method, endpoint, error = %e, "Helix request failed without a response");
                return ApiResponse {
                    body: Value::Object(serde_json::Map::new()),
                    status: SYNTHETIC_NETWORK_FAILURE_STATUS,
                    headers: HeaderMap::new(),
                };
            }
        };

        if let Some(limiter) = &self.limiter {
            if response.status == 429 {
                limiter.handle_429(&response.headers, true).await;
            } else {
                limiter.update_from_headers(&response.headers, true).await;
            }
        }

        response
    }

    /// Validate an OAuth access token. Returns the parsed payload on 200,
    /// `None` for any other status or transport failure.
    pub async fn validate_token(&self, access_token: &str) -> Option<TokenValidation> {
        let resp = self
            .http
            .get(&self.validate_url)
            .timeout(REQUEST_TIMEOUT)
            .header("Authorization", format!("OAuth {access_token}"))
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().as_u16() == 200 => match resp.json::<TokenValidation>().await
            {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(error = %e, "Token validation payload parse failed");
                    None
                }
            },
            Ok(resp) => {
                tracing::debug!(status = resp.status().as_u16(), "Token validation rejected");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token validation request failed");
                None
            }
        }
    }

    /// Resolve login names to user ids via `GET users`.
    ///
    /// Logins are deduplicated case-insensitively (first occurrence wins)
    /// and chunked into batches of at most 100. Unknown logins are omitted
    /// from the result.
    ///
    /// # Errors
    /// `Auth` on 401, `Network` on synthetic failure statuses, and a
    /// generic `Subscription`-free `Network` for other non-200 statuses.
    pub async fn get_users_by_login(
        &self,
        access_token: &str,
        client_id: &str,
        logins: &[String],
    ) -> RuntimeResult<HashMap<String, String>> {
        if logins.is_empty() {
            return Ok(HashMap::new());
        }
        let deduped = dedupe_logins(logins);
        let mut out = HashMap::new();

        for chunk in deduped.chunks(USERS_BATCH_LIMIT) {
            let query: Vec<(&str, &str)> =
                chunk.iter().map(|login| ("login", login.as_str())).collect();
            let resp = self
                .request(
                    Method::GET,
                    "users",
                    access_token,
                    client_id,
                    Some(&query),
                    None,
                )
                .await;

            match resp.status {
                200 => {}
                401 => {
                    return Err(RuntimeError::Auth {
                        operation: "get_users".into(),
                        reason: "unauthorized".into(),
                    });
                }
                status => {
                    return Err(RuntimeError::network(
                        "get_users",
                        format!("HTTP {status}"),
                    ));
                }
            }

            let rows = resp
                .body
                .get("data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            tracing::debug!(rows = rows.len(), batch = chunk.len(), "Resolved user batch");
            for entry in rows {
                let login = entry.get("login").and_then(Value::as_str);
                let id = entry.get("id").and_then(Value::as_str);
                if let (Some(login), Some(id)) = (login, id) {
                    out.insert(login.to_lowercase(), id.to_string());
                }
            }
        }

        Ok(out)
    }
}

/// Deduplicate logins case-insensitively, lowercasing and preserving
/// first-occurrence order.
fn dedupe_logins(logins: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for raw in logins {
        let lower = raw.to_lowercase();
        if seen.insert(lower.clone()) {
            out.push(lower);
        }
    }
    out
}
