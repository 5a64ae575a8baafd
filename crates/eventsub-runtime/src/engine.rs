//! # Session Engine
//!
//! Per-user orchestrator wiring the token manager, channel resolver,
//! WebSocket session, subscription manager, and message dispatcher into
//! one connection state machine:
//!
//! ```text
//! Init → ValidatingToken → Connecting → Handshaking
//!      → ResolvingChannels → Subscribing → Listening
//!      → (Reconnecting ⇄ Connecting… | Stopped)
//! ```
//!
//! Any disconnect, stale timeout, or server-directed reconnect re-enters
//! the machine at `Reconnecting`; a successful reconnect rotates the
//! session id (old subscriptions deleted first) and re-subscribes every
//! joined channel before listening resumes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::api::HelixClient;
use crate::config::RuntimeConfig;
use crate::dispatch::{ChatHandler, MessageDispatcher};
use crate::error::{RuntimeError, RuntimeResult};
use crate::resolver::ChannelResolver;
use crate::subs::SubscriptionManager;
use crate::token::TokenManager;
use crate::ws::{WsFrame, WsSession};

/// OAuth scopes the engine refuses to run without.
pub const REQUIRED_SCOPES: [&str; 3] = ["chat:read", "user:read:chat", "user:manage:chat_color"];

/// Quiet period after which the listen loop starts idle backoff.
const IDLE_QUIET_PERIOD: Duration = Duration::from_secs(30);

/// Idle sleep bounds for the listen loop.
const IDLE_SLEEP_MIN: Duration = Duration::from_millis(100);
const IDLE_SLEEP_MAX: Duration = Duration::from_secs(1);

/// Engine connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    ValidatingToken,
    Connecting,
    Handshaking,
    ResolvingChannels,
    Subscribing,
    Listening,
    Reconnecting,
    Stopped,
}

/// One user's EventSub session engine.
pub struct SessionEngine {
    config: Arc<RuntimeConfig>,
    api: Arc<HelixClient>,
    session: Arc<WsSession>,
    subs: Arc<SubscriptionManager>,
    resolver: Arc<ChannelResolver>,
    dispatcher: MessageDispatcher,
    username: String,
    client_id: String,
    primary_channel: String,
    token: RwLock<String>,
    user_id: RwLock<Option<String>>,
    channels: Mutex<Vec<String>>,
    channel_ids: Mutex<HashMap<String, String>>,
    scopes: std::sync::RwLock<HashSet<String>>,
    state: std::sync::Mutex<EngineState>,
    stop_flag: AtomicBool,
    token_invalid: AtomicBool,
    consecutive_401: AtomicU32,
    next_sub_check: Mutex<Instant>,
}

impl SessionEngine {
    /// Wire an engine from its collaborators. `primary_channel` seeds the
    /// joined channel set.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: Arc<RuntimeConfig>,
        api: Arc<HelixClient>,
        session: Arc<WsSession>,
        subs: Arc<SubscriptionManager>,
        resolver: Arc<ChannelResolver>,
        username: &str,
        primary_channel: &str,
        token: &str,
        client_id: &str,
    ) -> Self {
        let primary = primary_channel.trim_start_matches('#').to_lowercase();
        let sub_check_interval = config.sub_check_interval;
        Self {
            config,
            api,
            session,
            subs,
            resolver,
            dispatcher: MessageDispatcher::new(),
            username: username.to_lowercase(),
            client_id: client_id.to_string(),
            primary_channel: primary.clone(),
            token: RwLock::new(token.to_string()),
            user_id: RwLock::new(None),
            channels: Mutex::new(vec![primary]),
            channel_ids: Mutex::new(HashMap::new()),
            scopes: std::sync::RwLock::new(HashSet::new()),
            state: std::sync::Mutex::new(EngineState::Init),
            stop_flag: AtomicBool::new(false),
            token_invalid: AtomicBool::new(false),
            consecutive_401: AtomicU32::new(0),
            next_sub_check: Mutex::new(Instant::now() + sub_check_interval),
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn primary_channel(&self) -> &str {
        &self.primary_channel
    }

    pub fn state(&self) -> EngineState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_state(&self, state: EngineState) {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = state;
    }

    /// Joined channel logins, in join order.
    pub async fn channels(&self) -> Vec<String> {
        self.channels.lock().await.clone()
    }

    /// OAuth scopes recorded at validation time.
    pub fn scopes(&self) -> HashSet<String> {
        self.scopes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.session_id()
    }

    pub async fn user_id(&self) -> Option<String> {
        self.user_id.read().await.clone()
    }

    /// Session-level health (socket open, handshaken, recent traffic).
    pub fn is_healthy(&self) -> bool {
        self.session.is_healthy()
    }

    pub fn is_token_invalid(&self) -> bool {
        self.token_invalid.load(Ordering::SeqCst)
    }

    /// Register the handler invoked for every chat message.
    pub fn set_message_handler(&self, handler: ChatHandler) {
        self.dispatcher.set_message_handler(handler);
    }

    /// Register the handler invoked for `!`-prefixed messages.
    pub fn set_command_handler(&self, handler: ChatHandler) {
        self.dispatcher.set_command_handler(handler);
    }

    // ─── Token propagation ──────────────────────────────────────────

    /// Swap the access token used by every collaborator. Fired by the
    /// token manager's update hook after a refresh.
    pub async fn update_access_token(&self, new_token: &str) {
        if new_token.is_empty() {
            return;
        }
        *self.token.write().await = new_token.to_string();
        self.session.update_token(new_token).await;
        self.subs.update_token(new_token).await;
        self.consecutive_401.store(0, Ordering::SeqCst);
        self.token_invalid.store(false, Ordering::SeqCst);
        tracing::debug!(user = %self.username, "Access token updated in engine");
    }

    /// Mark the engine's token invalid and request shutdown: the listen
    /// loop exits and reconnect attempts are refused until a fresh token
    /// arrives via [`update_access_token`](Self::update_access_token).
    pub fn mark_token_invalid(&self) {
        tracing::error!(user = %self.username, "Token invalidated, stopping engine");
        self.token_invalid.store(true, Ordering::SeqCst);
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Wire this engine into a token manager: refreshed tokens propagate
    /// into the in-flight session, invalidation shuts the engine down.
    pub async fn register_token_hooks(self: &Arc<Self>, manager: &Arc<TokenManager>) {
        let engine = Arc::downgrade(self);
        let mgr = Arc::downgrade(manager);
        let username = self.username.clone();
        manager
            .register_update_hook(
                &self.username,
                Arc::new(move || {
                    let engine = engine.clone();
                    let mgr = mgr.clone();
                    let username = username.clone();
                    Box::pin(async move {
                        let (Some(engine), Some(mgr)) = (engine.upgrade(), mgr.upgrade()) else {
                            return Ok(());
                        };
                        if let Some(info) = mgr.get_info(&username).await {
                            engine.update_access_token(&info.access_token).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        let engine = Arc::downgrade(self);
        manager
            .register_invalidation_hook(
                &self.username,
                Arc::new(move || {
                    let engine = engine.clone();
                    Box::pin(async move {
                        if let Some(engine) = engine.upgrade() {
                            engine.mark_token_invalid();
                        }
                        Ok(())
                    })
                }),
            )
            .await;
    }

    fn record_subscribe_auth_failure(&self) {
        let count = self.consecutive_401.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.config.consecutive_401_threshold {
            tracing::error!(
                user = %self.username,
                consecutive_401 = count,
                "Consecutive unauthorized subscribe responses, marking token invalid"
            );
            self.mark_token_invalid();
        }
    }

    // ─── Connect state machine ──────────────────────────────────────

    /// Drive the machine from `Init` through to `Listening`.
    ///
    /// # Errors
    /// `Auth` when validation fails, `MissingScopes` when a required scope
    /// is absent, plus connection/subscription errors from the later
    /// stages. Any failure leaves the engine safe to retry.
    pub async fn connect(&self) -> RuntimeResult<()> {
        self.stop_flag.store(false, Ordering::SeqCst);
        self.session.clear_stop();

        self.set_state(EngineState::ValidatingToken);
        let token = self.token.read().await.clone();
        let Some(validation) = self.api.validate_token(&token).await else {
            return Err(RuntimeError::Auth {
                operation: "validate".into(),
                reason: format!("token validation failed for {}", self.username),
            });
        };
        let granted: HashSet<String> = validation.scopes.iter().cloned().collect();
        let missing: Vec<String> = REQUIRED_SCOPES
            .iter()
            .filter(|s| !granted.contains(**s))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(RuntimeError::MissingScopes { missing });
        }
        *self
            .scopes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = granted;
        if let Some(user_id) = validation.user_id {
            *self.user_id.write().await = Some(user_id);
        }

        self.set_state(EngineState::Connecting);
        // The welcome handshake runs inside the session connect.
        self.set_state(EngineState::Handshaking);
        self.session.connect().await?;

        self.set_state(EngineState::ResolvingChannels);
        self.resolve_joined_channels(&token).await?;

        let session_id = self.session.session_id().unwrap_or_default();
        self.subs.update_session_id(&session_id).await;

        self.set_state(EngineState::Subscribing);
        self.subscribe_joined_channels().await?;

        self.set_state(EngineState::Listening);
        tracing::info!(
            user = %self.username,
            session_id = %session_id,
            "Session engine listening"
        );
        Ok(())
    }

    async fn resolve_joined_channels(&self, token: &str) -> RuntimeResult<()> {
        let channels = self.channels.lock().await.clone();
        let ids = self
            .resolver
            .resolve_user_ids(&channels, token, &self.client_id)
            .await?;
        if !ids.contains_key(&self.primary_channel) {
            return Err(RuntimeError::Subscription {
                operation: "resolve".into(),
                reason: format!("primary channel '{}' did not resolve", self.primary_channel),
                status: None,
            });
        }
        *self.channel_ids.lock().await = ids;
        Ok(())
    }

    async fn subscribe_joined_channels(&self) -> RuntimeResult<()> {
        let channels = self.channels.lock().await.clone();
        for channel in channels {
            self.subscribe_channel(&channel).await?;
        }
        Ok(())
    }

    /// Subscribe one joined channel, tracking consecutive 401s.
    async fn subscribe_channel(&self, channel: &str) -> RuntimeResult<bool> {
        let channel_id = {
            let ids = self.channel_ids.lock().await;
            ids.get(channel).cloned()
        };
        let Some(channel_id) = channel_id else {
            tracing::warn!(user = %self.username, channel, "No resolved id for channel, skipping");
            return Ok(false);
        };
        let user_id = self.user_id.read().await.clone().unwrap_or_default();

        match self.subs.subscribe_channel_chat(&channel_id, &user_id).await {
            Ok(ok) => {
                self.consecutive_401.store(0, Ordering::SeqCst);
                Ok(ok)
            }
            Err(e @ RuntimeError::Auth { .. }) => {
                self.record_subscribe_auth_failure();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    // ─── Channel membership ─────────────────────────────────────────

    /// Join a channel: resolve its id and subscribe under the current
    /// session.
    ///
    /// # Errors
    /// Resolution and subscription failures propagate.
    pub async fn join_channel(&self, channel: &str) -> RuntimeResult<bool> {
        let channel = channel.trim_start_matches('#').to_lowercase();
        if self.channels.lock().await.contains(&channel) {
            return Ok(true);
        }

        let token = self.token.read().await.clone();
        let ids = self
            .resolver
            .resolve_user_ids(&[channel.clone()], &token, &self.client_id)
            .await?;
        let Some(channel_id) = ids.get(&channel).cloned() else {
            return Ok(false);
        };
        self.channel_ids
            .lock()
            .await
            .insert(channel.clone(), channel_id);

        if self.subscribe_channel(&channel).await? {
            self.channels.lock().await.push(channel);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Forget a joined channel. Its subscription is garbage-collected at
    /// the next session rotation.
    pub async fn leave_channel(&self, channel: &str) -> bool {
        let channel = channel.trim_start_matches('#').to_lowercase();
        let mut channels = self.channels.lock().await;
        let before = channels.len();
        channels.retain(|c| c != &channel);
        channels.len() != before
    }

    // ─── Listen loop ────────────────────────────────────────────────

    /// Run the inbound loop until stop, token invalidation, or an
    /// unrecoverable reconnect failure.
    pub async fn listen(&self) {
        let mut idle_sleep = IDLE_SLEEP_MIN;

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                self.set_state(EngineState::Stopped);
                break;
            }

            self.maybe_verify_subscriptions().await;
            self.session.maybe_heartbeat().await;

            // Quiet connections back off the receive cadence: 100ms
            // doubling to 1s, reset by any received message.
            if self.session.time_since_activity() > IDLE_QUIET_PERIOD {
                tokio::time::sleep(idle_sleep).await;
                idle_sleep = (idle_sleep * 2).min(IDLE_SLEEP_MAX);
            }

            match self.session.receive().await {
                Ok(WsFrame::Text(text)) => {
                    idle_sleep = IDLE_SLEEP_MIN;
                    self.handle_text_frame(&text).await;
                }
                Ok(WsFrame::Closed { reason }) => {
                    tracing::info!(user = %self.username, %reason, "WebSocket closed, reconnecting");
                    if !self.reconnect_and_resubscribe().await {
                        break;
                    }
                }
                Err(RuntimeError::Timeout { .. }) => {
                    if self.session.time_since_activity() > self.config.stale_threshold {
                        tracing::warn!(user = %self.username, "Connection stale, reconnecting");
                        if !self.reconnect_and_resubscribe().await {
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(user = %self.username, error = %e, "Listen loop receive error");
                    if !self.reconnect_and_resubscribe().await {
                        break;
                    }
                }
            }
        }
        tracing::debug!(user = %self.username, "Listen loop exited");
    }

    async fn handle_text_frame(&self, text: &str) {
        let data: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(user = %self.username, error = %e, "Dropping non-JSON frame");
                return;
            }
        };

        let message_type = data
            .get("metadata")
            .and_then(|m| m.get("message_type"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        match message_type {
            "session_keepalive" => {}
            "session_reconnect" => {
                let session = data.get("payload").and_then(|p| p.get("session"));
                let reconnect_url = session
                    .and_then(|s| s.get("reconnect_url"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let migrating_session = session
                    .and_then(|s| s.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.session
                    .set_pending_reconnect_session_id(migrating_session);
                tracing::info!(
                    user = %self.username,
                    url = %reconnect_url,
                    "Server-directed reconnect"
                );
                self.handle_server_reconnect(&reconnect_url).await;
            }
            _ => self.dispatcher.dispatch(&data).await,
        }
    }

    /// Follow a `session_reconnect` to the replacement URL.
    async fn handle_server_reconnect(&self, reconnect_url: &str) {
        if !reconnect_url.is_empty() {
            self.session.update_url(reconnect_url).await;
        }
        self.reconnect_and_resubscribe().await;
    }

    /// Reconnect the socket, rotate the session id (deleting the old
    /// session's subscriptions first), and re-subscribe every joined
    /// channel. Returns `false` when the attempt failed or was refused.
    pub async fn reconnect_and_resubscribe(&self) -> bool {
        if self.stop_flag.load(Ordering::SeqCst) {
            return false;
        }
        self.set_state(EngineState::Reconnecting);

        if !self.session.reconnect().await {
            return false;
        }

        let new_session_id = self.session.session_id().unwrap_or_default();
        // Rotation ordering: old subscriptions are deleted before any new
        // ones are created under the new id.
        self.subs.update_session_id(&new_session_id).await;

        self.set_state(EngineState::Subscribing);
        let channels = self.channels.lock().await.clone();
        for channel in channels {
            match self.subscribe_channel(&channel).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(user = %self.username, channel = %channel, "Re-subscribe skipped");
                }
                Err(e) => {
                    tracing::error!(
                        user = %self.username,
                        channel = %channel,
                        error = %e,
                        "Re-subscribe failed after reconnect"
                    );
                }
            }
        }

        self.set_state(EngineState::Listening);
        true
    }

    /// Supervisor entry point: reconnect regardless of current health.
    pub async fn force_reconnect(&self) -> bool {
        if self.token_invalid.load(Ordering::SeqCst) {
            tracing::warn!(user = %self.username, "Refusing reconnect with invalidated token");
            return false;
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        self.session.clear_stop();
        self.reconnect_and_resubscribe().await
    }

    /// Periodic verification: re-subscribe any joined channel missing from
    /// the server's view of this session's subscriptions.
    async fn maybe_verify_subscriptions(&self) {
        {
            let mut next = self.next_sub_check.lock().await;
            if Instant::now() < *next {
                return;
            }
            *next = Instant::now() + self.config.sub_check_interval;
        }

        let active = match self.subs.verify_subscriptions().await {
            Ok(active) => active,
            Err(e) => {
                if matches!(e, RuntimeError::Auth { .. }) {
                    self.record_subscribe_auth_failure();
                }
                tracing::info!(user = %self.username, error = %e, "Subscription check error");
                return;
            }
        };

        let channels = self.channels.lock().await.clone();
        for channel in channels {
            let id = {
                let ids = self.channel_ids.lock().await;
                ids.get(&channel).cloned()
            };
            let missing = id.as_ref().is_none_or(|id| !active.contains(id));
            if missing {
                tracing::warn!(user = %self.username, channel = %channel, "Subscription missing, re-subscribing");
                if let Err(e) = self.subscribe_channel(&channel).await {
                    tracing::warn!(user = %self.username, channel = %channel, error = %e, "Re-subscribe failed");
                }
            }
        }
    }

    /// Stop the engine: close the socket and delete this session's
    /// subscriptions.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.session.disconnect().await;
        if let Err(e) = self.subs.unsubscribe_all().await {
            tracing::warn!(user = %self.username, error = %e, "Unsubscribe during stop reported failures");
        }
        self.set_state(EngineState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerRegistry;
    use crate::cache::CacheStore;

    async fn offline_engine() -> Arc<SessionEngine> {
        let config = Arc::new(RuntimeConfig {
            helix_base_url: "http://127.0.0.1:1/helix".into(),
            oauth_validate_url: "http://127.0.0.1:1/validate".into(),
            oauth_token_url: "http://127.0.0.1:1/token".into(),
            eventsub_ws_url: "ws://127.0.0.1:1/ws".into(),
            broadcaster_cache_path: std::env::temp_dir()
                .join(format!(
                    "eventsub-runtime-engine-tests-{}-{}.json",
                    std::process::id(),
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap()
                        .as_nanos()
                ))
                .to_string_lossy()
                .into_owned(),
            ..RuntimeConfig::default()
        });
        let breakers = BreakerRegistry::new();
        let http = reqwest::Client::new();
        let api = Arc::new(HelixClient::new(http.clone(), &config, &breakers).await);
        let session = Arc::new(WsSession::new(Arc::clone(&config), &breakers, "tok", "cid").await);
        let subs = Arc::new(SubscriptionManager::new(Arc::clone(&api), "", "tok", "cid"));
        let cache = Arc::new(CacheStore::new(&config.broadcaster_cache_path, 100));
        let resolver = Arc::new(ChannelResolver::new(Arc::clone(&api), cache));
        Arc::new(SessionEngine::new(
            config,
            api,
            session,
            subs,
            resolver,
            "Alice",
            "#SomeChannel",
            "tok",
            "cid",
        ))
    }

    #[tokio::test]
    async fn test_initial_state_and_normalization() {
        let engine = offline_engine().await;
        assert_eq!(engine.state(), EngineState::Init);
        assert_eq!(engine.username(), "alice");
        assert_eq!(engine.primary_channel(), "somechannel");
        assert_eq!(engine.channels().await, vec!["somechannel"]);
        assert!(!engine.is_healthy());
    }

    #[tokio::test]
    async fn test_connect_fails_at_validation_offline() {
        let engine = offline_engine().await;
        let err = engine.connect().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Auth { ref operation, .. } if operation == "validate"));
        assert_eq!(engine.state(), EngineState::ValidatingToken);
    }

    #[tokio::test]
    async fn test_update_access_token_resets_401_counter() {
        let engine = offline_engine().await;
        engine.consecutive_401.store(1, Ordering::SeqCst);
        engine.update_access_token("new-token").await;
        assert_eq!(engine.consecutive_401.load(Ordering::SeqCst), 0);
        // Empty tokens are ignored.
        engine.update_access_token("").await;
        assert_eq!(*engine.token.read().await, "new-token");
    }

    #[tokio::test]
    async fn test_consecutive_401_threshold_invalidates() {
        let engine = offline_engine().await;
        engine.record_subscribe_auth_failure();
        assert!(!engine.is_token_invalid());
        engine.record_subscribe_auth_failure();
        assert!(engine.is_token_invalid());
        // An invalidated engine refuses reconnects.
        assert!(!engine.force_reconnect().await);
    }

    #[tokio::test]
    async fn test_leave_channel() {
        let engine = offline_engine().await;
        assert!(engine.leave_channel("#somechannel").await);
        assert!(engine.channels().await.is_empty());
        assert!(!engine.leave_channel("ghost").await);
    }

    #[tokio::test]
    async fn test_stop_sets_stopped_state() {
        let engine = offline_engine().await;
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.reconnect_and_resubscribe().await);
    }

    #[tokio::test]
    async fn test_token_hooks_propagate_and_invalidate() {
        let engine = offline_engine().await;
        let config = Arc::new(RuntimeConfig {
            oauth_token_url: "http://127.0.0.1:1/token".into(),
            oauth_validate_url: "http://127.0.0.1:1/validate".into(),
            ..RuntimeConfig::default()
        });
        let manager = Arc::new(TokenManager::new(config, reqwest::Client::new()));
        manager
            .upsert("alice", "fresh-token", Some("r"), "cid", "sec", None)
            .await;
        engine.register_token_hooks(&manager).await;

        // Fire the invalidation path directly through the registry.
        manager.fire_invalidation_hooks("alice").await;
        // Hook tasks are detached; give them a beat.
        for _ in 0..20 {
            if engine.is_token_invalid() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(engine.is_token_invalid());
    }
}
