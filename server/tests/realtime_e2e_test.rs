//! End-to-end tests for the realtime WebSocket endpoint.
//!
//! Two server instances share one in-process channel, standing in for two
//! nodes behind a load balancer talking through Redis. These tests verify:
//! - Events published on one instance reach subscribers on the other
//! - Handshake failures close the socket with code 4401 and the error code
//! - Ownership of user topics is enforced
//! - A lost shared channel fails publishes without dropping clients
//! - Subscribers only receive events for their own topics

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use argon2::Params;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pb_realtime::bridge::LinkState;
use pb_realtime::config::Config;
use pb_realtime::identity::{MemoryIdentityStore, Passwords};
use pb_realtime::routes::{create_router, AppState, BackgroundTasks};
use pb_realtime::transport::MemoryTransport;
use pb_realtime::types::{Identity, Role, RoleSet, UserId};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "e2e-test-secret-that-is-long-enough-1234";
const RECV_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Test Helpers
// ============================================================================

struct Instance {
    addr: SocketAddr,
    state: AppState,
    tasks: Option<BackgroundTasks>,
    server: JoinHandle<()>,
}

impl Instance {
    fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={token}", self.addr)
    }

    fn token_for(&self, identity: &Identity) -> String {
        self.state
            .tokens
            .issue(identity, &identity.roles)
            .unwrap()
            .token
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.take() {
            tasks.shutdown();
        }
        self.server.abort();
    }
}

fn test_config() -> Config {
    let mut config = Config::with_secret(SECRET);
    config.reconnect_initial = Duration::from_millis(20);
    config.reconnect_max = Duration::from_millis(200);
    config
}

/// Starts an instance on a random port over `transport` and waits for its
/// bridge link to come up.
async fn spawn_instance(transport: &MemoryTransport, config: Config) -> Instance {
    let state = AppState::with_components(
        config,
        Arc::new(MemoryIdentityStore::new()),
        Passwords::with_params(Params::new(8, 1, 1, None).unwrap()),
        Arc::new(transport.clone()),
    );
    let tasks = state.start_background_tasks();
    assert!(
        state
            .hub
            .bridge()
            .wait_until_connected(Duration::from_secs(2))
            .await,
        "bridge link did not come up"
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Instance {
        addr,
        state,
        tasks: Some(tasks),
        server,
    }
}

fn identity(username: &str, roles: &[Role]) -> Identity {
    Identity {
        id: UserId::new(),
        username: username.to_string(),
        email: format!("{username}@example.com"),
        roles: roles.iter().cloned().collect::<RoleSet>(),
    }
}

/// Connects and consumes the `ready` frame.
async fn connect(url: &str) -> Client {
    let (mut client, _) = connect_async(url).await.expect("websocket connect failed");
    let ready = next_frame(&mut client).await;
    assert_eq!(ready["op"], "ready", "unexpected first frame: {ready}");
    client
}

/// Next JSON frame, skipping control frames.
async fn next_frame(client: &mut Client) -> Value {
    loop {
        let message = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");

        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

/// Asserts no text frame arrives within `wait`.
async fn assert_silent(client: &mut Client, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, client.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected no frame, got {other:?}"),
        }
    }
}

/// Reads until a close frame and returns its code and reason.
async fn expect_close(client: &mut Client) -> (u16, String) {
    loop {
        let message = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended without close frame")
            .expect("websocket error");

        if let Message::Close(frame) = message {
            let frame = frame.expect("close frame without payload");
            return (u16::from(frame.code), frame.reason.as_str().to_string());
        }
    }
}

async fn send(client: &mut Client, frame: Value) {
    client
        .send(Message::text(frame.to_string()))
        .await
        .expect("send failed");
}

async fn subscribe(client: &mut Client, topic: &str) {
    send(client, json!({"op": "subscribe", "topic": topic})).await;
    let reply = next_frame(client).await;
    assert_eq!(reply["op"], "subscribed", "subscribe failed: {reply}");
    assert_eq!(reply["topic"], topic);
}

async fn wait_for_connections(state: &AppState, expected: usize) {
    for _ in 0..100 {
        if state.hub.registry().connection_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {expected} connections, have {}",
        state.hub.registry().connection_count()
    );
}

// ============================================================================
// Cross-instance delivery
// ============================================================================

#[tokio::test]
async fn event_published_on_one_instance_reaches_the_other() {
    let transport = MemoryTransport::new();
    let first = spawn_instance(&transport, test_config()).await;
    let second = spawn_instance(&transport, test_config()).await;

    let alice = identity("alice", &[Role::User]);
    let bob = identity("bob", &[Role::User]);

    let mut subscriber = connect(&first.ws_url(&first.token_for(&alice))).await;
    subscribe(&mut subscriber, "game:42").await;

    let mut publisher = connect(&second.ws_url(&second.token_for(&bob))).await;
    send(
        &mut publisher,
        json!({
            "op": "publish",
            "topic": "game:42",
            "type": "TAG",
            "payload": {"tagger": "bob", "tagged": "alice"}
        }),
    )
    .await;

    let event = next_frame(&mut subscriber).await;
    assert_eq!(event["op"], "event");
    assert_eq!(event["topic"], "game:42");
    assert_eq!(event["type"], "TAG");
    assert_eq!(event["originUserId"], bob.id.to_string());
    assert_eq!(event["payload"]["tagged"], "alice");
    assert!(event["timestamp"].as_i64().unwrap() > 0);

    // Delivered exactly once.
    assert_silent(&mut subscriber, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn publisher_receives_its_own_event() {
    let transport = MemoryTransport::new();
    let instance = spawn_instance(&transport, test_config()).await;
    let carol = identity("carol", &[Role::User]);

    let mut client = connect(&instance.ws_url(&instance.token_for(&carol))).await;
    subscribe(&mut client, "game:echo").await;

    send(
        &mut client,
        json!({
            "op": "publish",
            "topic": "game:echo",
            "type": "SCORE_UPDATE",
            "timestamp": 1_700_000_000_000_i64,
            "payload": {"score": 3}
        }),
    )
    .await;

    let event = next_frame(&mut client).await;
    assert_eq!(event["op"], "event");
    assert_eq!(event["type"], "SCORE_UPDATE");
    assert_eq!(event["timestamp"], 1_700_000_000_000_i64);
    assert_eq!(event["originUserId"], carol.id.to_string());
}

#[tokio::test]
async fn subscribers_only_receive_their_topics() {
    let transport = MemoryTransport::new();
    let first = spawn_instance(&transport, test_config()).await;
    let second = spawn_instance(&transport, test_config()).await;

    let dave = identity("dave", &[Role::User]);
    let erin = identity("erin", &[Role::User]);

    let mut on_one = connect(&first.ws_url(&first.token_for(&dave))).await;
    subscribe(&mut on_one, "game:1").await;

    let mut on_two = connect(&second.ws_url(&second.token_for(&erin))).await;
    subscribe(&mut on_two, "game:2").await;

    send(
        &mut on_two,
        json!({"op": "publish", "topic": "game:2", "type": "TAG", "payload": {}}),
    )
    .await;

    let event = next_frame(&mut on_two).await;
    assert_eq!(event["topic"], "game:2");
    assert_silent(&mut on_one, Duration::from_millis(200)).await;
}

// ============================================================================
// Handshake authentication
// ============================================================================

#[tokio::test]
async fn expired_token_is_closed_with_4401() {
    let transport = MemoryTransport::new();
    let instance = spawn_instance(&transport, test_config()).await;
    let frank = identity("frank", &[Role::User]);

    let expired = instance
        .state
        .tokens
        .issue_at(&frank, &frank.roles, Utc::now() - chrono::Duration::hours(25))
        .unwrap()
        .token;

    let (mut client, _) = connect_async(instance.ws_url(&expired)).await.unwrap();

    let error = next_frame(&mut client).await;
    assert_eq!(error["op"], "error");
    assert_eq!(error["code"], "expired_token");

    let (code, reason) = expect_close(&mut client).await;
    assert_eq!(code, 4401);
    assert_eq!(reason, "expired_token");

    assert_eq!(instance.state.hub.registry().connection_count(), 0);
}

#[tokio::test]
async fn missing_token_is_rejected_unless_anonymous_allowed() {
    let transport = MemoryTransport::new();
    let strict = spawn_instance(&transport, test_config()).await;

    let (mut client, _) = connect_async(format!("ws://{}/ws", strict.addr))
        .await
        .unwrap();
    let (code, reason) = expect_close(&mut client).await;
    assert_eq!(code, 4401);
    assert_eq!(reason, "missing_token");

    let mut config = test_config();
    config.allow_anonymous = true;
    let open = spawn_instance(&transport, config).await;

    let (mut anonymous, _) = connect_async(format!("ws://{}/ws", open.addr))
        .await
        .unwrap();
    let ready = next_frame(&mut anonymous).await;
    assert_eq!(ready["op"], "ready");
    assert!(ready.get("userId").is_none());

    subscribe(&mut anonymous, "game:lobby").await;

    send(
        &mut anonymous,
        json!({"op": "publish", "topic": "game:lobby", "type": "TAG", "payload": {}}),
    )
    .await;
    let error = next_frame(&mut anonymous).await;
    assert_eq!(error["op"], "error");
    assert_eq!(error["code"], "unauthenticated");
}

#[tokio::test]
async fn bearer_header_is_accepted() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let transport = MemoryTransport::new();
    let instance = spawn_instance(&transport, test_config()).await;
    let grace = identity("grace", &[Role::User]);

    let mut request = format!("ws://{}/ws", instance.addr)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {}", instance.token_for(&grace))
            .parse()
            .unwrap(),
    );

    let (mut client, _) = connect_async(request).await.unwrap();
    let ready = next_frame(&mut client).await;
    assert_eq!(ready["op"], "ready");
    assert_eq!(ready["userId"], grace.id.to_string());
}

// ============================================================================
// Authorization
// ============================================================================

#[tokio::test]
async fn user_topics_are_owner_only() {
    let transport = MemoryTransport::new();
    let instance = spawn_instance(&transport, test_config()).await;

    let owner = identity("heidi", &[Role::User]);
    let intruder = identity("ivan", &[Role::User]);
    let topic = format!("user:{}", owner.id);

    let mut owner_client = connect(&instance.ws_url(&instance.token_for(&owner))).await;
    subscribe(&mut owner_client, &topic).await;

    let mut intruder_client = connect(&instance.ws_url(&instance.token_for(&intruder))).await;

    send(&mut intruder_client, json!({"op": "subscribe", "topic": topic})).await;
    let error = next_frame(&mut intruder_client).await;
    assert_eq!(error["op"], "error");
    assert_eq!(error["code"], "not_owner");
    assert_eq!(error["topic"], topic);

    send(
        &mut intruder_client,
        json!({"op": "publish", "topic": topic, "type": "TAG", "payload": {}}),
    )
    .await;
    let error = next_frame(&mut intruder_client).await;
    assert_eq!(error["code"], "not_owner");
    assert_silent(&mut owner_client, Duration::from_millis(200)).await;

    send(
        &mut owner_client,
        json!({"op": "publish", "topic": topic, "type": "NOTIFY", "payload": {"n": 1}}),
    )
    .await;
    let event = next_frame(&mut owner_client).await;
    assert_eq!(event["type"], "NOTIFY");
}

#[tokio::test]
async fn admin_topics_require_admin_role() {
    let transport = MemoryTransport::new();
    let instance = spawn_instance(&transport, test_config()).await;

    let user = identity("judy", &[Role::User]);
    let admin = identity("root", &[Role::Admin, Role::User]);

    let mut user_client = connect(&instance.ws_url(&instance.token_for(&user))).await;
    send(&mut user_client, json!({"op": "subscribe", "topic": "admin:audit"})).await;
    let error = next_frame(&mut user_client).await;
    assert_eq!(error["code"], "insufficient_role");

    let mut admin_client = connect(&instance.ws_url(&instance.token_for(&admin))).await;
    subscribe(&mut admin_client, "admin:audit").await;
}

#[tokio::test]
async fn spoofed_origin_is_rejected() {
    let transport = MemoryTransport::new();
    let instance = spawn_instance(&transport, test_config()).await;
    let mallory = identity("mallory", &[Role::User]);

    let mut client = connect(&instance.ws_url(&instance.token_for(&mallory))).await;
    send(
        &mut client,
        json!({
            "op": "publish",
            "topic": "game:7",
            "type": "TAG",
            "originUserId": UserId::new().to_string(),
            "payload": {}
        }),
    )
    .await;

    let error = next_frame(&mut client).await;
    assert_eq!(error["op"], "error");
    assert_eq!(error["code"], "origin_mismatch");
}

// ============================================================================
// Shared channel outage
// ============================================================================

#[tokio::test]
async fn publish_fails_while_channel_is_down_and_recovers() {
    let transport = MemoryTransport::new();
    let instance = spawn_instance(&transport, test_config()).await;
    let kim = identity("kim", &[Role::User]);

    let mut client = connect(&instance.ws_url(&instance.token_for(&kim))).await;
    subscribe(&mut client, "game:outage").await;

    transport.disconnect();
    let mut link = instance.state.hub.bridge().watch_link();
    timeout(
        Duration::from_secs(2),
        link.wait_for(|state| *state != LinkState::Connected),
    )
    .await
    .expect("link never went down")
    .unwrap();

    send(
        &mut client,
        json!({"op": "publish", "topic": "game:outage", "type": "TAG", "payload": {}}),
    )
    .await;
    let error = next_frame(&mut client).await;
    assert_eq!(error["op"], "error");
    assert_eq!(error["code"], "bridge_unavailable");
    assert_eq!(error["topic"], "game:outage");

    // The connection itself stays up.
    send(&mut client, json!({"op": "ping"})).await;
    assert_eq!(next_frame(&mut client).await["op"], "pong");
    assert_eq!(instance.state.hub.registry().connection_count(), 1);

    transport.restore();
    assert!(
        instance
            .state
            .hub
            .bridge()
            .wait_until_connected(Duration::from_secs(3))
            .await
    );

    send(
        &mut client,
        json!({"op": "publish", "topic": "game:outage", "type": "TAG", "payload": {"ok": true}}),
    )
    .await;
    let event = next_frame(&mut client).await;
    assert_eq!(event["op"], "event");
    assert_eq!(event["payload"]["ok"], true);
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn closing_the_socket_releases_the_connection() {
    let transport = MemoryTransport::new();
    let instance = spawn_instance(&transport, test_config()).await;
    let leo = identity("leo", &[Role::User]);

    let mut client = connect(&instance.ws_url(&instance.token_for(&leo))).await;
    subscribe(&mut client, "game:bye").await;
    assert_eq!(instance.state.hub.registry().connection_count(), 1);
    assert_eq!(instance.state.hub.attached_topic_count(), 1);

    client.close(None).await.unwrap();

    wait_for_connections(&instance.state, 0).await;
    assert_eq!(instance.state.hub.registry().topic_count(), 0);
    assert_eq!(instance.state.hub.attached_topic_count(), 0);
}

#[tokio::test]
async fn shutdown_closes_open_sockets_with_going_away() {
    let transport = MemoryTransport::new();
    let instance = spawn_instance(&transport, test_config()).await;
    let mia = identity("mia", &[Role::User]);
    let ned = identity("ned", &[Role::User]);

    let mut first = connect(&instance.ws_url(&instance.token_for(&mia))).await;
    let mut second = connect(&instance.ws_url(&instance.token_for(&ned))).await;
    subscribe(&mut first, "game:end").await;
    wait_for_connections(&instance.state, 2).await;

    assert_eq!(instance.state.hub.close_all(), 2);

    assert_eq!(expect_close(&mut first).await, (1001, "connection_closed".to_string()));
    assert_eq!(expect_close(&mut second).await, (1001, "connection_closed".to_string()));
    assert_eq!(instance.state.hub.registry().connection_count(), 0);
    assert_eq!(instance.state.hub.attached_topic_count(), 0);
}

#[tokio::test]
async fn malformed_frames_get_error_replies() {
    let transport = MemoryTransport::new();
    let instance = spawn_instance(&transport, test_config()).await;
    let mia = identity("mia", &[Role::User]);

    let mut client = connect(&instance.ws_url(&instance.token_for(&mia))).await;

    client.send(Message::text("not json")).await.unwrap();
    let error = next_frame(&mut client).await;
    assert_eq!(error["code"], "invalid_frame");

    send(&mut client, json!({"op": "subscribe", "topic": "nope"})).await;
    let error = next_frame(&mut client).await;
    assert_eq!(error["code"], "invalid_topic");

    send(
        &mut client,
        json!({"op": "publish", "topic": "game:1", "type": "lowercase", "payload": {}}),
    )
    .await;
    let error = next_frame(&mut client).await;
    assert_eq!(error["code"], "invalid_event_type");
}
