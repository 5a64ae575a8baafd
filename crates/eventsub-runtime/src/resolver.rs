//! # Channel Resolver
//!
//! Batched login → user-id resolution with cache-through. Cache hits are
//! served from the [`CacheStore`]; misses are chunked into Helix batches of
//! at most 100 and issued concurrently under a small semaphore. A failed
//! batch reduces the result; the operation only fails when *every* batch
//! fails.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;

use crate::api::HelixClient;
use crate::cache::CacheStore;
use crate::error::{RuntimeError, RuntimeResult};

/// Helix limit on logins per `GET users` request.
const BATCH_SIZE: usize = 100;

/// Default bound on concurrently in-flight batches.
const DEFAULT_MAX_CONCURRENT_BATCHES: usize = 3;

/// Resolves Twitch login names to user ids with caching and batching.
pub struct ChannelResolver {
    api: Arc<HelixClient>,
    cache: Arc<CacheStore>,
    batch_permits: Arc<Semaphore>,
}

impl ChannelResolver {
    #[must_use]
    pub fn new(api: Arc<HelixClient>, cache: Arc<CacheStore>) -> Self {
        Self::with_concurrency(api, cache, DEFAULT_MAX_CONCURRENT_BATCHES)
    }

    /// Resolver with an explicit bound on concurrent API batches.
    #[must_use]
    pub fn with_concurrency(
        api: Arc<HelixClient>,
        cache: Arc<CacheStore>,
        max_concurrent_batches: usize,
    ) -> Self {
        Self {
            api,
            cache,
            batch_permits: Arc::new(Semaphore::new(max_concurrent_batches.max(1))),
        }
    }

    /// Resolve logins to user ids.
    ///
    /// Input is deduplicated case-insensitively preserving first-occurrence
    /// order; the returned map keys are lowercase logins. Unknown logins
    /// are omitted. Cache read failures fall through to the API; cache
    /// write failures are logged and ignored.
    ///
    /// # Errors
    /// Fails only when every API batch fails (cache-only resolutions never
    /// fail).
    pub async fn resolve_user_ids(
        &self,
        logins: &[String],
        access_token: &str,
        client_id: &str,
    ) -> RuntimeResult<HashMap<String, String>> {
        if logins.is_empty() {
            return Ok(HashMap::new());
        }

        let mut seen = HashSet::new();
        let unique: Vec<String> = logins
            .iter()
            .map(|l| l.to_lowercase())
            .filter(|l| seen.insert(l.clone()))
            .collect();
        tracing::debug!(count = unique.len(), "Resolving unique logins");

        let mut resolved: HashMap<String, String> = HashMap::new();
        let mut misses: Vec<String> = Vec::new();
        for login in unique {
            match self.cache.get(&login).await {
                Ok(Some(id)) => {
                    resolved.insert(login, id);
                }
                Ok(None) => misses.push(login),
                Err(e) => {
                    tracing::warn!(login = %login, error = %e, "Cache read failed, falling through to API");
                    misses.push(login);
                }
            }
        }
        tracing::debug!(
            cached = resolved.len(),
            to_resolve = misses.len(),
            "Cache partition complete"
        );

        if !misses.is_empty() {
            let api_results = self
                .resolve_via_api(&misses, access_token, client_id)
                .await?;
            for (login, id) in &api_results {
                if let Err(e) = self.cache.set(login, id).await {
                    tracing::warn!(login = %login, error = %e, "Failed to cache resolved user id");
                }
            }
            resolved.extend(api_results);
        }

        Ok(resolved)
    }

    /// Issue the API batches concurrently, bounded by the semaphore.
    async fn resolve_via_api(
        &self,
        logins: &[String],
        access_token: &str,
        client_id: &str,
    ) -> RuntimeResult<HashMap<String, String>> {
        let batches: Vec<&[String]> = logins.chunks(BATCH_SIZE).collect();
        let batch_count = batches.len();
        tracing::debug!(batches = batch_count, "Issuing user resolution batches");

        let futures = batches.into_iter().map(|batch| {
            let permits = Arc::clone(&self.batch_permits);
            async move {
                let _permit = permits.acquire().await.expect("semaphore never closed");
                self.api
                    .get_users_by_login(access_token, client_id, batch)
                    .await
            }
        });

        let mut merged = HashMap::new();
        let mut failed_batches = 0usize;
        for (index, result) in join_all(futures).await.into_iter().enumerate() {
            match result {
                Ok(map) => merged.extend(map),
                Err(e) => {
                    tracing::error!(batch = index, error = %e, "User resolution batch failed");
                    failed_batches += 1;
                }
            }
        }

        if failed_batches == batch_count {
            return Err(RuntimeError::network(
                "resolve_user_ids",
                format!("all {failed_batches} API batches failed for {} logins", logins.len()),
            ));
        }

        tracing::debug!(resolved = merged.len(), "Resolved users via API");
        Ok(merged)
    }

    /// Drop the cache entry for one login.
    ///
    /// # Errors
    /// `Cache` when the deletion fails.
    pub async fn invalidate(&self, login: &str) -> RuntimeResult<()> {
        self.cache.delete(&login.to_lowercase()).await?;
        tracing::debug!(login, "Invalidated cached user id");
        Ok(())
    }

    /// Drop every cached login → id mapping.
    ///
    /// # Errors
    /// `Cache` when the clear fails.
    pub async fn clear(&self) -> RuntimeResult<()> {
        self.cache.clear().await?;
        tracing::debug!("Cleared user id cache");
        Ok(())
    }
}
