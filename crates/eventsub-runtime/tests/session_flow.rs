//! End-to-end session engine behavior against scripted EventSub WebSocket
//! and Helix HTTP servers: the connect state machine, message dispatch,
//! and server-directed reconnect with session-id rotation.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use eventsub_runtime::{
    BreakerRegistry, CacheStore, ChannelResolver, ChatEvent, EngineState, HelixClient,
    RuntimeConfig, SessionEngine, SubscriptionManager, WsSession,
};
use support::mock_eventsub::MockEventSubServer;
use support::mock_helix::{MockHelixServer, MockRequest, MockResponse};

const STEP: Duration = Duration::from_secs(5);

/// Server-side view of the subscription set, shared with the handler.
#[derive(Default)]
struct SubStore {
    entries: std::sync::Mutex<Vec<(String, String, String)>>, // (id, session_id, channel_id)
    next_id: AtomicUsize,
}

impl SubStore {
    fn create(&self, session_id: &str, channel_id: &str) -> String {
        let id = format!("sub-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.entries.lock().unwrap().push((
            id.clone(),
            session_id.to_string(),
            channel_id.to_string(),
        ));
        id
    }

    fn delete(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|(eid, _, _)| eid != id);
        entries.len() != before
    }

    fn list(&self) -> Value {
        let entries = self.entries.lock().unwrap();
        let rows: Vec<Value> = entries
            .iter()
            .map(|(id, session_id, channel_id)| {
                json!({
                    "id": id,
                    "type": "channel.chat.message",
                    "status": "enabled",
                    "condition": {"broadcaster_user_id": channel_id, "user_id": "u-1"},
                    "transport": {"method": "websocket", "session_id": session_id},
                })
            })
            .collect();
        json!({"data": rows})
    }

    fn sessions_in_use(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        let mut sessions: Vec<String> = entries.iter().map(|(_, s, _)| s.clone()).collect();
        sessions.sort();
        sessions.dedup();
        sessions
    }
}

fn helix_handler(store: Arc<SubStore>) -> impl Fn(&MockRequest) -> MockResponse + Send + Sync {
    move |req: &MockRequest| match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/validate") => MockResponse::json(
            200,
            &json!({
                "client_id": "cid",
                "login": "alice",
                "user_id": "u-1",
                "scopes": ["chat:read", "user:read:chat", "user:manage:chat_color"],
                "expires_in": 14400,
            }),
        ),
        ("GET", "/helix/users") => MockResponse::json(
            200,
            &json!({"data": [{"id": "chan-1", "login": "somechannel"}]}),
        ),
        ("POST", "/helix/eventsub/subscriptions") => {
            let body = req.json_body().unwrap_or_default();
            let session_id = body["transport"]["session_id"].as_str().unwrap_or_default();
            let channel_id = body["condition"]["broadcaster_user_id"]
                .as_str()
                .unwrap_or_default();
            let id = store.create(session_id, channel_id);
            MockResponse::json(202, &json!({"data": [{"id": id}]}))
        }
        ("GET", "/helix/eventsub/subscriptions") => MockResponse::json(200, &store.list()),
        ("DELETE", "/helix/eventsub/subscriptions") => {
            let id = req
                .query
                .strip_prefix("id=")
                .unwrap_or_default()
                .to_string();
            if store.delete(&id) {
                MockResponse::empty(204)
            } else {
                MockResponse::json(404, &json!({"message": "subscription not found"}))
            }
        }
        _ => MockResponse::empty(404),
    }
}

fn temp_cache_path(label: &str) -> String {
    std::env::temp_dir()
        .join(format!(
            "eventsub-runtime-session-flow-{}-{}-{}.json",
            label,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
        .to_string_lossy()
        .into_owned()
}

async fn build_engine(
    label: &str,
    ws_url: String,
    helix: &MockHelixServer,
) -> Arc<SessionEngine> {
    let config = Arc::new(RuntimeConfig {
        eventsub_ws_url: ws_url,
        helix_base_url: format!("{}/helix", helix.base_url()),
        oauth_validate_url: format!("{}/validate", helix.base_url()),
        oauth_token_url: format!("{}/token", helix.base_url()),
        broadcaster_cache_path: temp_cache_path(label),
        // Short receive timeout keeps shutdown prompt in tests.
        ws_message_timeout: Duration::from_secs(2),
        ..RuntimeConfig::default()
    });
    let breakers = BreakerRegistry::new();
    let http = reqwest::Client::new();
    let api = Arc::new(HelixClient::new(http, &config, &breakers).await);
    let session = Arc::new(WsSession::new(Arc::clone(&config), &breakers, "tok", "cid").await);
    let subs = Arc::new(SubscriptionManager::new(Arc::clone(&api), "", "tok", "cid"));
    let cache = Arc::new(CacheStore::new(
        &config.broadcaster_cache_path,
        config.cache_max_entries,
    ));
    let resolver = Arc::new(ChannelResolver::new(Arc::clone(&api), cache));
    Arc::new(SessionEngine::new(
        config,
        api,
        session,
        subs,
        resolver,
        "alice",
        "#SomeChannel",
        "tok",
        "cid",
    ))
}

fn event_channel() -> (
    eventsub_runtime::ChatHandler,
    mpsc::UnboundedReceiver<ChatEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: eventsub_runtime::ChatHandler = Arc::new(move |event| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(event);
            Ok(())
        })
    });
    (handler, rx)
}

async fn wait_for_session_id(engine: &SessionEngine, expected: &str) {
    timeout(STEP, async {
        loop {
            if engine.session_id().as_deref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session never rotated to {expected}"));
}

#[tokio::test]
async fn connect_walks_the_state_machine() {
    let mut ws = MockEventSubServer::start().await.unwrap();
    let store = Arc::new(SubStore::default());
    let helix = MockHelixServer::start(helix_handler(Arc::clone(&store)))
        .await
        .unwrap();
    let engine = build_engine("connect", ws.ws_url(), &helix).await;

    let connect_task = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.connect().await }
    });
    let conn = ws.accept_connection().await;
    conn.send_welcome("s1").await;

    timeout(STEP, connect_task).await.unwrap().unwrap().unwrap();
    assert_eq!(engine.state(), EngineState::Listening);
    assert_eq!(engine.session_id().as_deref(), Some("s1"));
    assert_eq!(engine.user_id().await.as_deref(), Some("u-1"));
    assert!(engine.scopes().contains("chat:read"));

    // The subscription was created under the welcome session id.
    let posts = helix.requests().await;
    let sub_post = posts
        .iter()
        .find(|r| r.method == "POST" && r.path == "/helix/eventsub/subscriptions")
        .expect("subscription posted");
    let body = sub_post.json_body().unwrap();
    assert_eq!(body["transport"]["session_id"], "s1");
    assert_eq!(body["condition"]["broadcaster_user_id"], "chan-1");
    assert_eq!(body["condition"]["user_id"], "u-1");
    assert_eq!(store.sessions_in_use(), vec!["s1"]);
}

#[tokio::test]
async fn chat_messages_reach_handlers() {
    let mut ws = MockEventSubServer::start().await.unwrap();
    let store = Arc::new(SubStore::default());
    let helix = MockHelixServer::start(helix_handler(store)).await.unwrap();
    let engine = build_engine("dispatch", ws.ws_url(), &helix).await;

    let (message_handler, mut messages) = event_channel();
    let (command_handler, mut commands) = event_channel();
    engine.set_message_handler(message_handler);
    engine.set_command_handler(command_handler);

    let connect_task = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.connect().await }
    });
    let conn = ws.accept_connection().await;
    conn.send_welcome("s1").await;
    timeout(STEP, connect_task).await.unwrap().unwrap().unwrap();

    let listener = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.listen().await }
    });

    conn.send_keepalive().await;
    conn.send_chat_message("bob", "SomeChannel", "hello there").await;
    let event = timeout(STEP, messages.recv()).await.unwrap().unwrap();
    assert_eq!(event.chatter, "bob");
    assert_eq!(event.channel, "somechannel");
    assert_eq!(event.text, "hello there");
    assert!(
        timeout(Duration::from_millis(100), commands.recv()).await.is_err(),
        "plain chat must not hit the command handler"
    );

    conn.send_chat_message("bob", "SomeChannel", "!color red").await;
    let event = timeout(STEP, messages.recv()).await.unwrap().unwrap();
    assert_eq!(event.text, "!color red");
    let command = timeout(STEP, commands.recv()).await.unwrap().unwrap();
    assert_eq!(command.text, "!color red");

    engine.stop().await;
    let _ = timeout(STEP, listener).await;
}

#[tokio::test]
async fn server_directed_reconnect_rotates_session() {
    let mut ws = MockEventSubServer::start().await.unwrap();
    let store = Arc::new(SubStore::default());
    let helix = MockHelixServer::start(helix_handler(Arc::clone(&store)))
        .await
        .unwrap();
    let engine = build_engine("rotation", ws.ws_url(), &helix).await;

    let (message_handler, mut messages) = event_channel();
    engine.set_message_handler(message_handler);

    let connect_task = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.connect().await }
    });
    let conn1 = ws.accept_connection().await;
    conn1.send_welcome("s1").await;
    timeout(STEP, connect_task).await.unwrap().unwrap().unwrap();
    assert_eq!(store.sessions_in_use(), vec!["s1"]);

    let listener = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.listen().await }
    });

    // S4: the server directs the session to a new URL (same mock) and the
    // engine must come back with a fresh session id.
    conn1.send_session_reconnect(&ws.ws_url()).await;
    let conn2 = ws.accept_connection().await;
    conn2.send_welcome("s2").await;
    wait_for_session_id(&engine, "s2").await;

    // No subscription bound to the old session survives the rotation,
    // and the old-session cleanup preceded the new subscribe.
    timeout(STEP, async {
        loop {
            if store.sessions_in_use() == vec!["s2".to_string()] {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("old session subscriptions must be deleted");

    let requests = helix.requests().await;
    let delete_index = requests
        .iter()
        .position(|r| r.method == "DELETE" && r.path == "/helix/eventsub/subscriptions")
        .expect("old subscription deleted");
    let second_post_index = requests
        .iter()
        .enumerate()
        .filter(|(_, r)| r.method == "POST" && r.path == "/helix/eventsub/subscriptions")
        .map(|(i, _)| i)
        .nth(1)
        .expect("re-subscribe posted");
    assert!(
        delete_index < second_post_index,
        "old-session cleanup must precede re-subscription"
    );

    // Traffic flows on the rotated connection.
    conn2.send_chat_message("carol", "SomeChannel", "back again").await;
    let event = timeout(STEP, messages.recv()).await.unwrap().unwrap();
    assert_eq!(event.chatter, "carol");

    engine.stop().await;
    let _ = timeout(STEP, listener).await;
}

#[tokio::test]
async fn verify_subscriptions_filters_by_session() {
    let store = Arc::new(SubStore::default());
    store.create("s1", "chan-1");
    store.create("s1", "chan-2");
    store.create("other-session", "chan-3");
    let helix = MockHelixServer::start(helix_handler(Arc::clone(&store)))
        .await
        .unwrap();

    let config = Arc::new(RuntimeConfig {
        helix_base_url: format!("{}/helix", helix.base_url()),
        ..RuntimeConfig::default()
    });
    let api = Arc::new(
        HelixClient::new(reqwest::Client::new(), &config, &BreakerRegistry::new()).await,
    );
    let subs = SubscriptionManager::new(api, "s1", "tok", "cid");

    let active = subs.verify_subscriptions().await.unwrap();
    assert_eq!(active.len(), 2);
    assert!(active.contains(&"chan-1".to_string()));
    assert!(active.contains(&"chan-2".to_string()));
    assert!(!active.contains(&"chan-3".to_string()));
}

#[tokio::test]
async fn unsubscribe_tolerates_already_gone() {
    let store = Arc::new(SubStore::default());
    let helix = MockHelixServer::start(helix_handler(Arc::clone(&store)))
        .await
        .unwrap();

    let config = Arc::new(RuntimeConfig {
        helix_base_url: format!("{}/helix", helix.base_url()),
        ..RuntimeConfig::default()
    });
    let api = Arc::new(
        HelixClient::new(reqwest::Client::new(), &config, &BreakerRegistry::new()).await,
    );
    let subs = SubscriptionManager::new(api, "s1", "tok", "cid");

    // One real subscription and one the server has already forgotten.
    store.create("s1", "chan-1");
    assert!(subs.subscribe_channel_chat("chan-9", "u-1").await.unwrap());
    store.delete("sub-2");

    // 404 counts as already-absent, so the aggregate succeeds.
    subs.unsubscribe_all().await.unwrap();
    assert!(subs.active_channel_ids().await.is_empty());
}
