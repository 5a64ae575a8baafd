//! # eventsub-runtime
//!
//! A long-running, unattended client runtime for Twitch EventSub over
//! WebSocket. The crate keeps authenticated real-time chat connections
//! alive for many user identities at once, surviving token expiry, network
//! flaps, server-directed reconnects, rate-limit pressure, and silent
//! stalls.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ HealthSupervisor          periodic probe, guarded restarts │
//! └──────────────┬─────────────────────────────────────────────┘
//!                │ per user
//! ┌──────────────▼─────────────────────────────────────────────┐
//! │ SessionEngine             connect state machine + listen   │
//! │   ├── WsSession           socket, welcome, reconnect       │
//! │   ├── SubscriptionManager chat subscriptions per session   │
//! │   ├── ChannelResolver     login → id, cache-through        │
//! │   └── MessageDispatcher   chat + command handlers          │
//! └──────────────┬─────────────────────────────────────────────┘
//!                │ tokens pushed via hooks
//! ┌──────────────▼─────────────────────────────────────────────┐
//! │ TokenManager              records, refresh serialization,  │
//! │                           drift-compensated background loop│
//! └────────────────────────────────────────────────────────────┘
//!
//! shared: HelixClient (HTTP), BreakerRegistry, RateLimiterRegistry,
//!         CacheStore
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use eventsub_runtime::{
//!     BreakerRegistry, CacheStore, ChannelResolver, HealthSupervisor,
//!     HelixClient, RateLimiterRegistry, RuntimeConfig, SessionEngine,
//!     SubscriptionManager, TokenManager, WsSession,
//! };
//!
//! # async fn demo() {
//! let config = Arc::new(RuntimeConfig::from_env());
//! let http = reqwest::Client::new();
//! let breakers = BreakerRegistry::new();
//! let limiters = RateLimiterRegistry::new();
//!
//! let token_manager = Arc::new(TokenManager::new(Arc::clone(&config), http.clone()));
//! token_manager
//!     .upsert("somestreamer", "access", Some("refresh"), "client-id", "secret", None)
//!     .await;
//!
//! let limiter = limiters.get(&config, "client-id", Some("somestreamer")).await;
//! let api = Arc::new(
//!     HelixClient::new(http.clone(), &config, &breakers)
//!         .await
//!         .with_rate_limiter(limiter),
//! );
//! let cache = Arc::new(CacheStore::new(&config.broadcaster_cache_path, config.cache_max_entries));
//! let resolver = Arc::new(ChannelResolver::new(Arc::clone(&api), cache));
//! let session = Arc::new(WsSession::new(Arc::clone(&config), &breakers, "access", "client-id").await);
//! let subs = Arc::new(SubscriptionManager::new(Arc::clone(&api), "", "access", "client-id"));
//!
//! let engine = Arc::new(SessionEngine::new(
//!     Arc::clone(&config), api, session, subs, resolver,
//!     "somestreamer", "#somestreamer", "access", "client-id",
//! ));
//! engine.register_token_hooks(&token_manager).await;
//! engine.connect().await.expect("connect");
//!
//! let supervisor = Arc::new(HealthSupervisor::new(Arc::clone(&config)));
//! supervisor.add_session(engine).await;
//! supervisor.start().await;
//! token_manager.start().await;
//! # }
//! ```

pub mod api;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod rate_limit;
pub mod resolver;
pub mod subs;
pub mod supervisor;
pub mod token;
pub mod ws;

// ─── Public re-exports ──────────────────────────────────────────────────

pub use api::{ApiResponse, HelixClient, TokenValidation};
pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use cache::CacheStore;
pub use config::{BreakerConfig, RuntimeConfig};
pub use dispatch::{ChatEvent, ChatHandler, MessageDispatcher};
pub use engine::{EngineState, SessionEngine};
pub use error::{RuntimeError, RuntimeResult};
pub use rate_limit::{RateLimiter, RateLimiterRegistry};
pub use resolver::ChannelResolver;
pub use subs::SubscriptionManager;
pub use supervisor::{HealthSupervisor, ManagedSession};
pub use token::{
    RefreshErrorKind, TokenClient, TokenHealth, TokenHook, TokenInfo, TokenManager,
    TokenOutcome, TokenResult, TokenState,
};
pub use ws::{ConnectionState, WsFrame, WsSession};
