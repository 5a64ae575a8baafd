//! # Subscription Manager
//!
//! Creates, verifies, and deletes `channel.chat.message` EventSub
//! subscriptions scoped to the current WebSocket session id. Subscriptions
//! ride the Helix client (breaker + rate limiter included); concurrent
//! subscribe calls are bounded by a semaphore.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, Semaphore};

use crate::api::HelixClient;
use crate::error::{RuntimeError, RuntimeResult};

const EVENTSUB_SUBSCRIPTIONS: &str = "eventsub/subscriptions";
const CHAT_MESSAGE_TYPE: &str = "channel.chat.message";

/// Bound on concurrently in-flight subscribe calls.
const MAX_CONCURRENT_SUBSCRIBES: usize = 10;

/// Manages the subscription set for one EventSub session.
pub struct SubscriptionManager {
    api: Arc<HelixClient>,
    session_id: RwLock<String>,
    token: RwLock<String>,
    client_id: String,
    /// subscription id → broadcaster (channel) id
    active: Mutex<HashMap<String, String>>,
    permits: Arc<Semaphore>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(
        api: Arc<HelixClient>,
        session_id: impl Into<String>,
        token: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            session_id: RwLock::new(session_id.into()),
            token: RwLock::new(token.into()),
            client_id: client_id.into(),
            active: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_SUBSCRIBES)),
        }
    }

    /// Swap the access token used for subsequent API calls.
    pub async fn update_token(&self, new_token: &str) {
        *self.token.write().await = new_token.to_string();
    }

    /// Current session id.
    pub async fn session_id(&self) -> String {
        self.session_id.read().await.clone()
    }

    /// Channel ids with a tracked subscription.
    pub async fn active_channel_ids(&self) -> Vec<String> {
        let active = self.active.lock().await;
        let mut ids: Vec<String> = active.values().cloned().collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Subscribe to chat messages for one channel.
    ///
    /// Returns `true` when the subscription was accepted and its id stored.
    ///
    /// # Errors
    /// `Auth` on 401, `Subscription` with `status` 403 on forbidden, and
    /// `Subscription` with the observed status otherwise.
    pub async fn subscribe_channel_chat(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> RuntimeResult<bool> {
        let _permit = self.permits.acquire().await.expect("semaphore never closed");

        let session_id = self.session_id().await;
        let token = self.token.read().await.clone();
        let body = build_subscription_body(channel_id, user_id, &session_id);

        let resp = self
            .api
            .request(
                Method::POST,
                EVENTSUB_SUBSCRIPTIONS,
                &token,
                &self.client_id,
                None,
                Some(&body),
            )
            .await;

        match resp.status {
            202 => {
                let Some(sub_id) = extract_subscription_id(&resp.body) else {
                    tracing::warn!(
                        channel_id,
                        "Subscription created but no id returned"
                    );
                    return Ok(false);
                };
                self.active.lock().await.insert(sub_id, channel_id.to_string());
                Ok(true)
            }
            401 => Err(RuntimeError::Auth {
                operation: "subscribe".into(),
                reason: format!("unauthorized for channel {channel_id}"),
            }),
            403 => Err(RuntimeError::Subscription {
                operation: "subscribe".into(),
                reason: format!("forbidden for channel {channel_id}"),
                status: Some(403),
            }),
            status => Err(RuntimeError::Subscription {
                operation: "subscribe".into(),
                reason: format!("HTTP {status} for channel {channel_id}"),
                status: Some(status),
            }),
        }
    }

    /// Fetch the remote subscription list and keep only entries whose type
    /// matches chat messages and whose transport is bound to the current
    /// session. The in-memory map is trimmed to the surviving channels.
    ///
    /// Returns the active channel ids.
    ///
    /// # Errors
    /// `Auth` on 401, `Subscription` on any other non-200.
    pub async fn verify_subscriptions(&self) -> RuntimeResult<Vec<String>> {
        let session_id = self.session_id().await;
        let token = self.token.read().await.clone();
        let resp = self
            .api
            .request(
                Method::GET,
                EVENTSUB_SUBSCRIPTIONS,
                &token,
                &self.client_id,
                None,
                None,
            )
            .await;

        match resp.status {
            200 => {}
            401 => {
                return Err(RuntimeError::Auth {
                    operation: "verify".into(),
                    reason: "unauthorized".into(),
                });
            }
            status => {
                return Err(RuntimeError::Subscription {
                    operation: "verify".into(),
                    reason: format!("HTTP {status}"),
                    status: Some(status),
                });
            }
        }

        let rows = resp
            .body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut active_channel_ids = Vec::new();
        for entry in rows {
            if entry.get("type").and_then(Value::as_str) != Some(CHAT_MESSAGE_TYPE) {
                continue;
            }
            let entry_session = entry
                .get("transport")
                .and_then(|t| t.get("session_id"))
                .and_then(Value::as_str);
            if entry_session != Some(session_id.as_str()) {
                continue;
            }
            if let Some(channel_id) = entry
                .get("condition")
                .and_then(|c| c.get("broadcaster_user_id"))
                .and_then(Value::as_str)
            {
                active_channel_ids.push(channel_id.to_string());
            }
        }

        let mut active = self.active.lock().await;
        active.retain(|_, channel_id| active_channel_ids.contains(channel_id));

        Ok(active_channel_ids)
    }

    /// Delete every tracked subscription, clearing the map regardless of
    /// per-id outcomes.
    ///
    /// # Errors
    /// One aggregated `Subscription` error when any deletion failed (a 404
    /// counts as already-absent, not a failure).
    pub async fn unsubscribe_all(&self) -> RuntimeResult<()> {
        let ids: Vec<String> = {
            let active = self.active.lock().await;
            active.keys().cloned().collect()
        };
        if ids.is_empty() {
            return Ok(());
        }

        let mut errors = Vec::new();
        for sub_id in &ids {
            if let Err(e) = self.unsubscribe_single(sub_id).await {
                tracing::warn!(sub_id = %sub_id, error = %e, "EventSub unsubscribe failed");
                errors.push(format!("{sub_id}: {e}"));
            }
        }

        self.active.lock().await.clear();

        if errors.is_empty() {
            tracing::info!(count = ids.len(), "Unsubscribed from all subscriptions");
            Ok(())
        } else {
            Err(RuntimeError::Subscription {
                operation: "unsubscribe".into(),
                reason: errors.join("; "),
                status: None,
            })
        }
    }

    async fn unsubscribe_single(&self, sub_id: &str) -> RuntimeResult<()> {
        let token = self.token.read().await.clone();
        let resp = self
            .api
            .request(
                Method::DELETE,
                EVENTSUB_SUBSCRIPTIONS,
                &token,
                &self.client_id,
                Some(&[("id", sub_id)]),
                None,
            )
            .await;

        match resp.status {
            204 => {
                tracing::debug!(sub_id, "EventSub unsubscribed");
                Ok(())
            }
            404 => {
                tracing::warn!(sub_id, "Subscription not found (already unsubscribed)");
                Ok(())
            }
            401 => Err(RuntimeError::Auth {
                operation: "unsubscribe".into(),
                reason: format!("unauthorized for {sub_id}"),
            }),
            status => Err(RuntimeError::Subscription {
                operation: "unsubscribe".into(),
                reason: format!("HTTP {status} for {sub_id}"),
                status: Some(status),
            }),
        }
    }

    /// Rotate to a new session id. The old session's subscription set is
    /// deleted *before* the id is swapped, so new subscriptions can only
    /// ever be created under the new id.
    pub async fn update_session_id(&self, new_session_id: &str) {
        {
            let current = self.session_id.read().await;
            if current.as_str() == new_session_id {
                return;
            }
        }
        if let Err(e) = self.unsubscribe_all().await {
            tracing::warn!(error = %e, "Old-session cleanup reported failures during rotation");
        }
        *self.session_id.write().await = new_session_id.to_string();
        tracing::info!(session_id = new_session_id, "EventSub session id updated");
    }
}

fn build_subscription_body(channel_id: &str, user_id: &str, session_id: &str) -> Value {
    serde_json::json!({
        "type": CHAT_MESSAGE_TYPE,
        "version": "1",
        "condition": {
            "broadcaster_user_id": channel_id,
            "user_id": user_id,
        },
        "transport": {
            "method": "websocket",
            "session_id": session_id,
        },
    })
}

fn extract_subscription_id(body: &Value) -> Option<String> {
    body.get("data")?
        .as_array()?
        .first()?
        .get("id")?
        .as_str()
        .map(str::to_string)
}
