//! End-to-end token lifecycle behavior against a scripted OAuth server:
//! proactive refresh, hook delivery, refresh serialization, and
//! non-recoverable failure handling.

mod support;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use eventsub_runtime::{RuntimeConfig, TokenManager, TokenOutcome, TokenState};
use support::mock_helix::{MockHelixServer, MockRequest, MockResponse};

const STEP: Duration = Duration::from_secs(5);

fn config_for(server: &MockHelixServer) -> Arc<RuntimeConfig> {
    Arc::new(RuntimeConfig {
        oauth_token_url: format!("{}/token", server.base_url()),
        oauth_validate_url: format!("{}/validate", server.base_url()),
        helix_base_url: format!("{}/helix", server.base_url()),
        ..RuntimeConfig::default()
    })
}

fn validate_ok(expires_in: u64) -> MockResponse {
    MockResponse::json(
        200,
        &json!({
            "client_id": "cid",
            "login": "alice",
            "user_id": "u-1",
            "scopes": ["chat:read", "user:read:chat", "user:manage:chat_color"],
            "expires_in": expires_in,
        }),
    )
}

fn refresh_ok() -> MockResponse {
    MockResponse::json(
        200,
        &json!({
            "access_token": "new-tok",
            "refresh_token": "new-rtok",
            "expires_in": 14400,
        }),
    )
}

fn near_expiry() -> SystemTime {
    SystemTime::now() + Duration::from_secs(1800)
}

#[tokio::test]
async fn proactive_refresh_updates_record_and_fires_hook_once() {
    // S2: expiry under the threshold forces validate → refresh.
    let server = MockHelixServer::start(|req: &MockRequest| match req.path.as_str() {
        "/validate" => validate_ok(1800),
        "/token" => refresh_ok(),
        _ => MockResponse::empty(404),
    })
    .await
    .unwrap();

    let manager = Arc::new(TokenManager::new(config_for(&server), reqwest::Client::new()));
    manager
        .upsert("alice", "old-tok", Some("old-rtok"), "cid", "sec", Some(near_expiry()))
        .await;

    let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
    manager
        .register_update_hook(
            "alice",
            Arc::new(move || {
                let hook_tx = hook_tx.clone();
                Box::pin(async move {
                    let _ = hook_tx.send(());
                    Ok(())
                })
            }),
        )
        .await;

    let outcome = manager.ensure_fresh("alice", false).await.unwrap();
    assert_eq!(outcome, TokenOutcome::Refreshed);

    let info = manager.get_info("alice").await.unwrap();
    assert_eq!(info.access_token, "new-tok");
    assert_eq!(info.refresh_token.as_deref(), Some("new-rtok"));
    assert_eq!(info.state, TokenState::Fresh);

    // Buffered expiry: 14400 − 300 safety buffer, and the original
    // lifetime baseline was reset to the new full lifetime.
    let remaining = info
        .expiry
        .unwrap()
        .duration_since(SystemTime::now())
        .unwrap();
    assert!(remaining > Duration::from_secs(14000) && remaining <= Duration::from_secs(14100));
    let baseline = info.original_lifetime.unwrap();
    assert!(baseline > Duration::from_secs(14000));

    // Update hook fired exactly once.
    timeout(STEP, hook_rx.recv()).await.expect("hook fired").unwrap();
    assert!(
        timeout(Duration::from_millis(200), hook_rx.recv()).await.is_err(),
        "hook must fire exactly once"
    );

    assert_eq!(server.count_requests("POST", "/token").await, 1);
}

#[tokio::test]
async fn concurrent_ensure_fresh_refreshes_once() {
    let server = MockHelixServer::start(|req: &MockRequest| match req.path.as_str() {
        "/validate" => validate_ok(1800),
        "/token" => refresh_ok(),
        _ => MockResponse::empty(404),
    })
    .await
    .unwrap();

    let manager = Arc::new(TokenManager::new(config_for(&server), reqwest::Client::new()));
    manager
        .upsert("alice", "old-tok", Some("old-rtok"), "cid", "sec", Some(near_expiry()))
        .await;

    let (first, second) = tokio::join!(
        manager.ensure_fresh("alice", false),
        manager.ensure_fresh("alice", false),
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    // One caller performed the refresh; the other observed fresh state
    // (skip-fast Valid or client-level Skipped), never a second refresh.
    assert!(outcomes.contains(&TokenOutcome::Refreshed));
    assert_eq!(server.count_requests("POST", "/token").await, 1);

    let info = manager.get_info("alice").await.unwrap();
    assert_eq!(info.access_token, "new-tok");
}

#[tokio::test]
async fn refresh_401_is_non_recoverable_and_fires_invalidation() {
    let server = MockHelixServer::start(|req: &MockRequest| match req.path.as_str() {
        "/token" => MockResponse::json(401, &json!({"message": "Invalid refresh token"})),
        _ => MockResponse::empty(404),
    })
    .await
    .unwrap();

    let manager = Arc::new(TokenManager::new(config_for(&server), reqwest::Client::new()));
    manager
        .upsert("alice", "tok", Some("bad-rtok"), "cid", "sec", Some(near_expiry()))
        .await;

    let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
    manager
        .register_invalidation_hook(
            "alice",
            Arc::new(move || {
                let hook_tx = hook_tx.clone();
                Box::pin(async move {
                    let _ = hook_tx.send(());
                    Ok(())
                })
            }),
        )
        .await;

    // Forced refresh goes straight to the token endpoint.
    let outcome = manager.ensure_fresh("alice", true).await.unwrap();
    assert_eq!(outcome, TokenOutcome::Failed);

    let info = manager.get_info("alice").await.unwrap();
    assert_eq!(info.state, TokenState::Expired);
    // The old tokens are left in place for operator inspection.
    assert_eq!(info.access_token, "tok");

    timeout(STEP, hook_rx.recv())
        .await
        .expect("invalidation hook fired")
        .unwrap();
    assert_eq!(server.count_requests("POST", "/token").await, 1);
}

#[tokio::test]
async fn validate_updates_expiry() {
    let server = MockHelixServer::start(|req: &MockRequest| match req.path.as_str() {
        "/validate" => validate_ok(5000),
        _ => MockResponse::empty(404),
    })
    .await
    .unwrap();

    let manager = Arc::new(TokenManager::new(config_for(&server), reqwest::Client::new()));
    manager
        .upsert("alice", "tok", Some("rtok"), "cid", "sec", Some(near_expiry()))
        .await;

    let outcome = manager.validate("alice").await.unwrap();
    assert_eq!(outcome, TokenOutcome::Valid);

    let info = manager.get_info("alice").await.unwrap();
    let remaining = info
        .expiry
        .unwrap()
        .duration_since(SystemTime::now())
        .unwrap();
    // 5000 − 300 safety buffer.
    assert!(remaining > Duration::from_secs(4600) && remaining <= Duration::from_secs(4700));
}

#[tokio::test]
async fn rate_limited_refresh_is_recoverable() {
    let server = MockHelixServer::start(|req: &MockRequest| match req.path.as_str() {
        "/token" => MockResponse::json(429, &json!({"message": "Too Many Requests"})),
        _ => MockResponse::empty(404),
    })
    .await
    .unwrap();

    let manager = Arc::new(TokenManager::new(config_for(&server), reqwest::Client::new()));
    manager
        .upsert("alice", "tok", Some("rtok"), "cid", "sec", Some(near_expiry()))
        .await;

    let outcome = manager.ensure_fresh("alice", true).await.unwrap();
    assert_eq!(outcome, TokenOutcome::Failed);

    // Recoverable: state untouched, next loop iteration may retry.
    let info = manager.get_info("alice").await.unwrap();
    assert_eq!(info.state, TokenState::Fresh);
    assert_eq!(info.access_token, "tok");
    assert_eq!(info.refresh_token.as_deref(), Some("rtok"));
}
