//! Per-user token records, refresh serialization, and the hook registry.
//!
//! The manager owns one record per (lowercase) username. A global `RwLock`
//! protects the map structure; each record carries its own data mutex and a
//! dedicated refresh mutex so at most one refresh is ever in flight per
//! user. Hooks are scheduled onto detached-but-tracked tasks *after* record
//! locks are released, which keeps hook → manager re-entrancy deadlock-free
//! and guarantees hooks observe the already-mutated record.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RuntimeConfig;
use crate::error::RuntimeResult;

use super::background;
use super::client::{
    RefreshErrorKind, TokenClient, TokenOutcome, TokenResult, remaining_secs,
};
use super::format_duration;

/// Token freshness states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Recently obtained or refreshed.
    Fresh,
    /// Valid but nearing expiry.
    Stale,
    /// Expired; needs a successful refresh before use.
    Expired,
}

/// Asynchronous callback registered per user, fired on token change or
/// invalidation. Errors are logged, never propagated.
pub type TokenHook = Arc<dyn Fn() -> BoxFuture<'static, RuntimeResult<()>> + Send + Sync>;

/// Caller-facing snapshot of one user's token record.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub username: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub expiry: Option<SystemTime>,
    pub state: TokenState,
    pub original_lifetime: Option<Duration>,
}

pub(super) struct RecordData {
    pub(super) access_token: String,
    pub(super) refresh_token: Option<String>,
    pub(super) client_id: String,
    pub(super) client_secret: String,
    pub(super) expiry: Option<SystemTime>,
    pub(super) state: TokenState,
    pub(super) last_validation: Option<Instant>,
    pub(super) forced_unknown_attempts: u32,
    pub(super) original_lifetime: Option<Duration>,
}

pub(super) struct UserEntry {
    pub(super) data: Mutex<RecordData>,
    /// Serializes refresh operations for this user; never held across
    /// hook invocations.
    pub(super) refresh_mutex: Mutex<()>,
}

#[derive(Default)]
struct HookRegistry {
    update: HashMap<String, Vec<TokenHook>>,
    invalidation: HashMap<String, Vec<TokenHook>>,
}

/// Central manager for OAuth tokens across all users.
///
/// One instance per process, constructor-injected into every consumer
/// (tests build isolated instances freely).
pub struct TokenManager {
    pub(super) config: Arc<RuntimeConfig>,
    http: reqwest::Client,
    pub(super) tokens: RwLock<HashMap<String, Arc<UserEntry>>>,
    clients: Mutex<HashMap<(String, String), Arc<TokenClient>>>,
    hooks: Mutex<HookRegistry>,
    /// Detached-but-tracked hook task handles; pruned on each fire.
    hook_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    pub(super) paused: Mutex<HashSet<String>>,
    background_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    pub(super) stop_signal: Notify,
}

impl TokenManager {
    #[must_use]
    pub fn new(config: Arc<RuntimeConfig>, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            tokens: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            hooks: Mutex::new(HookRegistry::default()),
            hook_tasks: std::sync::Mutex::new(Vec::new()),
            paused: Mutex::new(HashSet::new()),
            background_task: Mutex::new(None),
            running: AtomicBool::new(false),
            stop_signal: Notify::new(),
        }
    }

    pub(super) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ─── Record lifecycle ───────────────────────────────────────────

    /// Insert or update a user's token record.
    ///
    /// On insert and on first known expiry, the record's original lifetime
    /// baseline is captured.
    pub async fn upsert(
        &self,
        username: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        client_id: &str,
        client_secret: &str,
        expiry: Option<SystemTime>,
    ) {
        let username = username.to_lowercase();
        let mut tokens = self.tokens.write().await;
        if let Some(entry) = tokens.get(&username) {
            let mut data = entry.data.lock().await;
            data.access_token = access_token.to_string();
            data.refresh_token = refresh_token.map(str::to_string);
            data.client_id = client_id.to_string();
            data.client_secret = client_secret.to_string();
            data.expiry = expiry;
            data.state = TokenState::Fresh;
            if data.original_lifetime.is_none() {
                data.original_lifetime = expiry.and_then(positive_lifetime);
            }
        } else {
            tokens.insert(
                username,
                Arc::new(UserEntry {
                    data: Mutex::new(RecordData {
                        access_token: access_token.to_string(),
                        refresh_token: refresh_token.map(str::to_string),
                        client_id: client_id.to_string(),
                        client_secret: client_secret.to_string(),
                        expiry,
                        state: TokenState::Fresh,
                        last_validation: None,
                        forced_unknown_attempts: 0,
                        original_lifetime: expiry.and_then(positive_lifetime),
                    }),
                    refresh_mutex: Mutex::new(()),
                }),
            );
        }
    }

    /// Remove a user from token tracking. Returns whether a record existed.
    pub async fn remove(&self, username: &str) -> bool {
        let removed = self
            .tokens
            .write()
            .await
            .remove(&username.to_lowercase())
            .is_some();
        if removed {
            tracing::debug!(user = username, "Removed token record");
        }
        removed
    }

    /// Drop every record not named in `active`. Returns the count removed.
    pub async fn prune(&self, active: &HashSet<String>) -> usize {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|name, _| active.contains(name));
        let removed = before - tokens.len();
        if removed > 0 {
            tracing::info!(removed, remaining = tokens.len(), "Pruned token records");
        }
        removed
    }

    /// Snapshot of a user's record.
    pub async fn get_info(&self, username: &str) -> Option<TokenInfo> {
        let username = username.to_lowercase();
        let entry = self.entry(&username).await?;
        let data = entry.data.lock().await;
        Some(TokenInfo {
            username,
            access_token: data.access_token.clone(),
            refresh_token: data.refresh_token.clone(),
            client_id: data.client_id.clone(),
            client_secret: data.client_secret.clone(),
            expiry: data.expiry,
            state: data.state,
            original_lifetime: data.original_lifetime,
        })
    }

    pub(super) async fn entry(&self, username: &str) -> Option<Arc<UserEntry>> {
        self.tokens.read().await.get(username).cloned()
    }

    /// Exclude a user from background loop processing; the record stays.
    pub async fn pause(&self, username: &str) {
        let username = username.to_lowercase();
        if self.tokens.read().await.contains_key(&username) {
            self.paused.lock().await.insert(username.clone());
            tracing::debug!(user = %username, "Paused background refresh");
        }
    }

    /// Re-include a user in background loop processing.
    pub async fn resume(&self, username: &str) {
        self.paused.lock().await.remove(&username.to_lowercase());
        tracing::debug!(user = username, "Resumed background refresh");
    }

    // ─── Hooks ──────────────────────────────────────────────────────

    /// Register a hook fired after a refresh that changed the tokens.
    /// Hooks are additive; several can be registered per user.
    pub async fn register_update_hook(&self, username: &str, hook: TokenHook) {
        self.hooks
            .lock()
            .await
            .update
            .entry(username.to_lowercase())
            .or_default()
            .push(hook);
    }

    /// Register a hook fired when a user's token is invalidated
    /// (non-recoverable refresh failure).
    pub async fn register_invalidation_hook(&self, username: &str, hook: TokenHook) {
        self.hooks
            .lock()
            .await
            .invalidation
            .entry(username.to_lowercase())
            .or_default()
            .push(hook);
    }

    async fn fire_update_hooks(&self, username: &str) {
        let hooks = {
            let registry = self.hooks.lock().await;
            registry.update.get(username).cloned().unwrap_or_default()
        };
        for hook in hooks {
            self.spawn_retained("update_hook", username, hook);
        }
    }

    pub(crate) async fn fire_invalidation_hooks(&self, username: &str) {
        let hooks = {
            let registry = self.hooks.lock().await;
            registry
                .invalidation
                .get(username)
                .cloned()
                .unwrap_or_default()
        };
        for hook in hooks {
            self.spawn_retained("invalidation_hook", username, hook);
        }
    }

    /// Spawn a hook onto a detached task, retaining the handle so the task
    /// set can be awaited or inspected. Finished handles are pruned on
    /// each fire; hook errors are logged.
    fn spawn_retained(&self, category: &'static str, username: &str, hook: TokenHook) {
        let user = username.to_string();
        let fut = hook();
        let handle = tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::debug!(category, user = %user, error = %e, "Retained hook task error");
            }
        });
        let mut tasks = self
            .hook_tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Number of hook tasks still in flight (finished handles pruned).
    pub fn pending_hook_tasks(&self) -> usize {
        let mut tasks = self
            .hook_tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.retain(|h| !h.is_finished());
        tasks.len()
    }

    // ─── Token operations ───────────────────────────────────────────

    async fn client_for(&self, client_id: &str, client_secret: &str) -> Arc<TokenClient> {
        let mut clients = self.clients.lock().await;
        let key = (client_id.to_string(), client_secret.to_string());
        Arc::clone(clients.entry(key).or_insert_with(|| {
            Arc::new(TokenClient::new(
                &self.config,
                client_id,
                client_secret,
                self.http.clone(),
            ))
        }))
    }

    /// Ensure a user's token is fresh, refreshing when needed.
    ///
    /// Serialized per user by the record's refresh mutex. The skip-fast
    /// path avoids the mutex entirely when the known expiry is comfortably
    /// above the threshold.
    ///
    /// # Errors
    /// Propagates network errors from the remote validation step; refresh
    /// failures are reported through the returned outcome.
    pub async fn ensure_fresh(
        &self,
        username: &str,
        force_refresh: bool,
    ) -> RuntimeResult<TokenOutcome> {
        let username = username.to_lowercase();
        let Some(entry) = self.entry(&username).await else {
            return Ok(TokenOutcome::Failed);
        };

        let (client_id, client_secret) = {
            let data = entry.data.lock().await;
            if !force_refresh {
                if let Some(expiry) = data.expiry {
                    if remaining_secs(expiry) > self.config.refresh_threshold.as_secs_f64() {
                        return Ok(TokenOutcome::Valid);
                    }
                }
            }
            (data.client_id.clone(), data.client_secret.clone())
        };

        let client = self.client_for(&client_id, &client_secret).await;
        let (result, _changed) = self
            .refresh_with_lock(&client, &entry, &username, force_refresh)
            .await?;
        Ok(result.outcome)
    }

    /// Run one ensure-fresh cycle under the record's refresh mutex and
    /// apply the outcome. Hooks fire after every lock is released; the
    /// update hook fires iff the access or refresh token actually changed.
    async fn refresh_with_lock(
        &self,
        client: &TokenClient,
        entry: &UserEntry,
        username: &str,
        force_refresh: bool,
    ) -> RuntimeResult<(TokenResult, bool)> {
        let _refresh_guard = entry.refresh_mutex.lock().await;

        let (before_access, before_refresh, expiry) = {
            let data = entry.data.lock().await;
            (
                data.access_token.clone(),
                data.refresh_token.clone(),
                data.expiry,
            )
        };

        let result = client
            .ensure_fresh(
                username,
                &before_access,
                before_refresh.as_deref(),
                expiry,
                force_refresh,
            )
            .await?;

        let mut token_changed = false;
        let mut invalidated = false;
        {
            let mut data = entry.data.lock().await;
            if result.outcome != TokenOutcome::Failed && result.access_token.is_some() {
                apply_successful_result(&mut data, &result);
                token_changed = data.access_token != before_access
                    || data.refresh_token != before_refresh;
            } else if result.outcome == TokenOutcome::Failed
                && result.error == Some(RefreshErrorKind::NonRecoverable)
            {
                data.state = TokenState::Expired;
                invalidated = true;
            }
        }

        // Hooks are scheduled with every record lock released.
        drop(_refresh_guard);
        if invalidated {
            self.fire_invalidation_hooks(username).await;
        }
        if token_changed {
            self.fire_update_hooks(username).await;
        }
        Ok((result, token_changed))
    }

    /// Validate a user's token remotely, rate limited by the per-user
    /// minimum validation interval.
    ///
    /// # Errors
    /// Propagates network errors from the validation request.
    pub async fn validate(&self, username: &str) -> RuntimeResult<TokenOutcome> {
        let username = username.to_lowercase();
        let Some(entry) = self.entry(&username).await else {
            return Ok(TokenOutcome::Failed);
        };

        let (access_token, client_id, client_secret) = {
            let data = entry.data.lock().await;
            if let Some(last) = data.last_validation {
                if last.elapsed() < self.config.validation_min_interval {
                    return Ok(TokenOutcome::Valid);
                }
            }
            if data.expiry.is_none() {
                return Ok(TokenOutcome::Failed);
            }
            (
                data.access_token.clone(),
                data.client_id.clone(),
                data.client_secret.clone(),
            )
        };

        let client = self.client_for(&client_id, &client_secret).await;
        let (valid, expiry) = client.validate_remote(&username, &access_token).await?;

        let mut data = entry.data.lock().await;
        data.last_validation = Some(Instant::now());
        if valid {
            data.expiry = expiry;
            Ok(TokenOutcome::Valid)
        } else {
            Ok(TokenOutcome::Failed)
        }
    }

    // ─── Background loop control ────────────────────────────────────

    /// Start the manager: run the initial validation pass, then launch the
    /// background refresh loop. Idempotent while running; a lingering task
    /// from a prior run is cancelled first.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut slot = self.background_task.lock().await;
        if let Some(task) = slot.take() {
            if !task.is_finished() {
                tracing::debug!("Cancelling stale background task before restart");
                task.abort();
                let _ = task.await;
            }
        }

        self.initial_validation_pass().await;

        let manager = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            background::run(manager).await;
        }));
        tracing::debug!("Started token manager background loop");
    }

    /// Stop the manager and await the background loop's exit.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_signal.notify_waiters();
        let task = self.background_task.lock().await.take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                tracing::warn!("Background loop did not stop in time, aborting");
                task.abort();
                let _ = task.await;
            }
        }
    }

    /// Validate every known token once at startup: refresh those already
    /// under the threshold, force-refresh those failing validation, and
    /// leave unknown-expiry records to the background loop's resolution
    /// protocol.
    async fn initial_validation_pass(self: &Arc<Self>) {
        let users: Vec<String> = self.tokens.read().await.keys().cloned().collect();
        for username in users {
            if let Err(e) = self.initial_validate_user(&username).await {
                tracing::debug!(user = %username, error = %e, "Startup validation error");
            }
        }
    }

    async fn initial_validate_user(&self, username: &str) -> RuntimeResult<()> {
        let Some(entry) = self.entry(username).await else {
            return Ok(());
        };
        let expiry = entry.data.lock().await.expiry;
        let Some(_) = expiry else {
            tracing::info!(user = username, "Startup validation skipped (unknown expiry)");
            return Ok(());
        };

        let outcome = self.validate(username).await?;
        let remaining = self
            .get_info(username)
            .await
            .and_then(|info| info.expiry)
            .map(remaining_secs);

        if outcome == TokenOutcome::Valid {
            if let Some(remaining) = remaining {
                if remaining < self.config.refresh_threshold.as_secs_f64() {
                    let refreshed = self.ensure_fresh(username, false).await?;
                    tracing::info!(
                        user = username,
                        remaining_secs = remaining as i64,
                        outcome = ?refreshed,
                        "Startup validated token near threshold"
                    );
                } else {
                    tracing::info!(
                        user = username,
                        remaining = %format_duration(remaining.max(0.0) as u64),
                        "Startup validated token"
                    );
                }
            }
        } else {
            let refreshed = self.ensure_fresh(username, true).await?;
            tracing::info!(
                user = username,
                outcome = ?refreshed,
                "Startup validation failed, forced refresh"
            );
        }
        Ok(())
    }
}

/// Apply a VALID/SKIPPED/REFRESHED result to a record.
fn apply_successful_result(data: &mut RecordData, result: &TokenResult) {
    if let Some(access) = &result.access_token {
        data.access_token.clone_from(access);
    }
    if let Some(refresh) = &result.refresh_token {
        data.refresh_token = Some(refresh.clone());
    }
    data.expiry = result.expiry;
    data.state = match result.outcome {
        TokenOutcome::Valid | TokenOutcome::Skipped | TokenOutcome::Refreshed => TokenState::Fresh,
        TokenOutcome::Failed => TokenState::Stale,
    };
    // A real refresh establishes a new lifetime baseline.
    if result.outcome == TokenOutcome::Refreshed {
        if let Some(lifetime) = result.expiry.and_then(positive_lifetime) {
            data.original_lifetime = Some(lifetime);
        }
    }
}

fn positive_lifetime(expiry: SystemTime) -> Option<Duration> {
    expiry.duration_since(SystemTime::now()).ok()
}
