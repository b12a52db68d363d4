//! Realtime connection handling.
//!
//! [`RealtimeHub`] ties the local [`ConnectionRegistry`] to the cross-instance
//! [`Bridge`]: it authorizes subscribe and publish requests, attaches one
//! bridge handler per topic while the topic has local subscribers, and fans
//! bridged events out to those subscribers.
//!
//! [`run_connection`] drives one upgraded WebSocket through its lifecycle:
//!
//! ```text
//! Connecting -> Authenticating -> Active -> Closing -> Closed
//!                      \-> Closed (authentication failed)
//! ```
//!
//! Inbound frames are handled one at a time in arrival order. A separate
//! writer task drains the connection's outbound queue and sends a ping every
//! [`HEARTBEAT_INTERVAL`]. When the registry drops the connection (idle
//! reaping), the queue closes and the writer ends the socket.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::auth::{AuthError, Claims};
use crate::bridge::{Bridge, BridgeError, Handler, SubscriptionId};
use crate::guard::{authorize, Action, AuthzError};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::types::{
    now_millis, ClientFrame, Event, EventType, NameError, PublishRequest, ServerFrame, Topic,
    UserId,
};

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Interval between server pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Close code sent when authentication fails.
pub const AUTH_FAILURE_CLOSE_CODE: u16 = 4401;

/// Close code sent when the server drops a connection (idle or shutdown).
const GOING_AWAY_CLOSE_CODE: u16 = 1001;

/// How long the writer gets to flush its close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Connecting, Closed)
                | (Authenticating, Active)
                | (Authenticating, Closed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ConnectionState,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(from = ?self.state, to = ?next, "Connection state change");
        self.state = next;
    }
}

/// A client request that was rejected. Reported to the client as an `error`
/// frame; the connection stays open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("invalid topic: {0}")]
    Topic(NameError),

    #[error("invalid event type: {0}")]
    EventType(NameError),

    #[error("origin user id does not match the authenticated identity")]
    OriginMismatch,

    #[error(transparent)]
    Authz(#[from] AuthzError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl FrameError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "invalid_frame",
            Self::Topic(_) => "invalid_topic",
            Self::EventType(_) => "invalid_event_type",
            Self::OriginMismatch => "origin_mismatch",
            Self::Authz(err) => err.code(),
            Self::Bridge(err) => err.code(),
        }
    }
}

struct HubInner {
    registry: ConnectionRegistry,
    bridge: Bridge,
    attachments: Mutex<HashMap<Topic, SubscriptionId>>,
}

/// Per-instance realtime hub.
///
/// Cheap to clone; clones share the registry, bridge and attachment table.
#[derive(Clone)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

impl RealtimeHub {
    pub fn new(registry: ConnectionRegistry, bridge: Bridge) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry,
                bridge,
                attachments: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn bridge(&self) -> &Bridge {
        &self.inner.bridge
    }

    /// Registers an authenticated (or anonymous) connection.
    pub fn connect(
        &self,
        identity: Option<Claims>,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> ConnectionHandle {
        self.inner.registry.register(identity, outbound)
    }

    /// Removes a connection and detaches bridge handlers left without
    /// local subscribers.
    pub fn disconnect(&self, handle: ConnectionHandle) {
        if let Some(topics) = self.inner.registry.deregister(handle) {
            for topic in &topics {
                self.release_if_idle(topic);
            }
        }
    }

    /// Closes every local connection; each writer sends a 1001 close.
    ///
    /// Returns how many connections were closed.
    pub fn close_all(&self) -> usize {
        let closed = self.inner.registry.deregister_all();
        for (_, topics) in &closed {
            for topic in topics {
                self.release_if_idle(topic);
            }
        }
        if !closed.is_empty() {
            info!(connections = closed.len(), "Closed all connections");
        }
        closed.len()
    }

    /// Authorizes and records a subscription.
    pub fn subscribe(
        &self,
        handle: ConnectionHandle,
        identity: Option<&Claims>,
        raw_topic: &str,
    ) -> Result<Topic, FrameError> {
        let topic = Topic::parse(raw_topic).map_err(FrameError::Topic)?;
        authorize(identity, Action::Subscribe, &topic.access_rule(Action::Subscribe))?;

        if self.inner.registry.subscribe(handle, &topic) {
            self.ensure_attached(&topic);
        }
        Ok(topic)
    }

    /// Drops a subscription. Unsubscribing a topic that was never
    /// subscribed is not an error.
    pub fn unsubscribe(&self, handle: ConnectionHandle, raw_topic: &str) -> Result<Topic, FrameError> {
        let topic = Topic::parse(raw_topic).map_err(FrameError::Topic)?;
        if self.inner.registry.unsubscribe(handle, &topic) {
            self.release_if_idle(&topic);
        }
        Ok(topic)
    }

    /// Validates, authorizes and publishes an event to every instance.
    ///
    /// The origin is always the authenticated identity: a mismatching
    /// `originUserId` is rejected, a missing one is filled in, and so is a
    /// missing timestamp.
    pub async fn publish(
        &self,
        identity: Option<&Claims>,
        request: PublishRequest,
    ) -> Result<(), FrameError> {
        let topic = Topic::parse(&request.topic).map_err(FrameError::Topic)?;
        let event_type = EventType::parse(&request.event_type).map_err(FrameError::EventType)?;

        let grant = authorize(identity, Action::Publish, &topic.access_rule(Action::Publish))?;
        let actor = grant.actor.ok_or(AuthzError::Unauthenticated {
            action: Action::Publish,
        })?;

        if let Some(claimed) = request.origin_user_id.as_deref() {
            if claimed.parse::<UserId>().ok() != Some(actor) {
                return Err(FrameError::OriginMismatch);
            }
        }

        if grant.relaxed {
            debug!(actor = %actor, topic = %topic, "Publishing on shared topic");
        }

        let event = Event {
            event_type,
            timestamp: request.timestamp.unwrap_or_else(now_millis),
            origin_user_id: actor,
            payload: request.payload,
        };

        self.inner.bridge.publish(&topic, &event).await?;
        Ok(())
    }

    /// Handles one inbound text frame. Failures are reported to the sender
    /// as `error` frames.
    pub async fn handle_text(&self, handle: ConnectionHandle, identity: Option<&Claims>, text: &str) {
        let registry = &self.inner.registry;
        registry.touch(handle);

        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(connection = %handle, error = %err, "Unparseable client frame");
                self.reject(handle, None, &FrameError::Malformed(err.to_string()));
                return;
            }
        };

        match frame {
            ClientFrame::Subscribe { topic } => match self.subscribe(handle, identity, &topic) {
                Ok(topic) => {
                    registry.send_to(
                        handle,
                        ServerFrame::Subscribed {
                            topic: topic.to_string(),
                        },
                    );
                }
                Err(err) => self.reject(handle, Some(topic), &err),
            },
            ClientFrame::Unsubscribe { topic } => match self.unsubscribe(handle, &topic) {
                Ok(topic) => {
                    registry.send_to(
                        handle,
                        ServerFrame::Unsubscribed {
                            topic: topic.to_string(),
                        },
                    );
                }
                Err(err) => self.reject(handle, Some(topic), &err),
            },
            ClientFrame::Publish(request) => {
                let topic = request.topic.clone();
                if let Err(err) = self.publish(identity, request).await {
                    self.reject(handle, Some(topic), &err);
                }
            }
            ClientFrame::Ping => {
                registry.send_to(handle, ServerFrame::Pong);
            }
        }
    }

    fn reject(&self, handle: ConnectionHandle, topic: Option<String>, err: &FrameError) {
        debug!(connection = %handle, code = err.code(), error = %err, "Rejected client frame");
        self.inner
            .registry
            .send_to(handle, ServerFrame::error(err.code(), err.to_string(), topic));
    }

    /// Attaches the fan-out handler for `topic` unless one is attached.
    fn ensure_attached(&self, topic: &Topic) {
        let mut attachments = self.inner.attachments.lock().expect("attachment lock poisoned");
        if attachments.contains_key(topic) {
            return;
        }

        let registry = self.inner.registry.clone();
        let handler: Handler = Arc::new(move |topic: &Topic, event: &Event| {
            let delivered = registry.deliver(topic, &ServerFrame::event(topic, event.clone()));
            trace!(topic = %topic, delivered, "Fanned out bridged event");
        });

        let id = self.inner.bridge.subscribe(topic, handler);
        attachments.insert(topic.clone(), id);
    }

    /// Detaches the handler for `topic` once no local connection needs it.
    fn release_if_idle(&self, topic: &Topic) {
        let mut attachments = self.inner.attachments.lock().expect("attachment lock poisoned");
        if !self.inner.registry.subscribers_of(topic).is_empty() {
            return;
        }
        if let Some(id) = attachments.remove(topic) {
            self.inner.bridge.unsubscribe(id);
        }
    }

    /// Number of topics with an attached bridge handler.
    pub fn attached_topic_count(&self) -> usize {
        self.inner.attachments.lock().expect("attachment lock poisoned").len()
    }

    /// Spawns a task that reaps connections idle for `max_idle`.
    ///
    /// Runs every `interval` until the returned handle is aborted.
    pub fn spawn_reaper_task(&self, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = hub.inner.registry.reap_idle(max_idle);
                for (handle, topics) in &reaped {
                    debug!(connection = %handle, "Dropping idle connection");
                    for topic in topics {
                        hub.release_if_idle(topic);
                    }
                }
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "Reaped idle connections");
                }
            }
        })
    }
}

impl fmt::Debug for RealtimeHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeHub")
            .field("connections", &self.inner.registry.connection_count())
            .field("bridge", &self.inner.bridge)
            .finish_non_exhaustive()
    }
}

/// Drives one upgraded WebSocket until it closes.
///
/// `auth` is the outcome of the handshake: `Ok(Some(claims))` for a valid
/// token, `Ok(None)` for an accepted anonymous connection, or the error that
/// rejected it. A rejected connection gets an `error` frame and a close with
/// [`AUTH_FAILURE_CLOSE_CODE`] and is never registered.
pub async fn run_connection(hub: RealtimeHub, socket: WebSocket, auth: Result<Option<Claims>, AuthError>) {
    let mut lifecycle = Lifecycle::new();
    lifecycle.advance(ConnectionState::Authenticating);

    let identity = match auth {
        Ok(identity) => identity,
        Err(err) => {
            warn!(code = err.code(), "Realtime authentication failed");
            reject_handshake(socket, &err).await;
            lifecycle.advance(ConnectionState::Closed);
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let handle = hub.connect(identity.clone(), outbound_tx);
    lifecycle.advance(ConnectionState::Active);

    let user_id = identity.as_ref().map(|claims| claims.user_id);
    info!(connection = %handle, user_id = ?user_id, "Realtime connection active");
    hub.registry().send_to(
        handle,
        ServerFrame::Ready {
            connection_id: handle.id(),
            user_id,
        },
    );

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_frames(handle, sink, outbound_rx));
    let mut writer_done = false;

    loop {
        tokio::select! {
            _ = &mut writer => {
                writer_done = true;
                debug!(connection = %handle, "Writer finished");
                break;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    hub.handle_text(handle, identity.as_ref(), text.as_str()).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    hub.registry().touch(handle);
                    hub.reject(
                        handle,
                        None,
                        &FrameError::Malformed("binary frames are not supported".to_string()),
                    );
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    hub.registry().touch(handle);
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(connection = %handle, "Client closed connection");
                    break;
                }
                Some(Err(err)) => {
                    debug!(connection = %handle, error = %err, "WebSocket receive error");
                    break;
                }
            }
        }
    }

    lifecycle.advance(ConnectionState::Closing);
    hub.disconnect(handle);

    // Deregistering dropped the outbound sender; give the writer a moment
    // to send its close frame.
    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    lifecycle.advance(ConnectionState::Closed);
    info!(connection = %handle, "Realtime connection closed");
}

async fn write_frames(
    handle: ConnectionHandle,
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerFrame>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // The first tick completes immediately.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let close = CloseFrame {
                        code: GOING_AWAY_CLOSE_CODE,
                        reason: "connection_closed".into(),
                    };
                    let _ = sink.send(Message::Close(Some(close))).await;
                    break;
                };

                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(err) => {
                        error!(connection = %handle, error = %err, "Failed to serialize frame");
                        continue;
                    }
                };

                if sink.send(Message::Text(json.into())).await.is_err() {
                    debug!(connection = %handle, "WebSocket send failed");
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    debug!(connection = %handle, "Heartbeat ping failed");
                    break;
                }
            }
        }
    }
}

async fn reject_handshake(mut socket: WebSocket, err: &AuthError) {
    let frame = ServerFrame::error(err.code(), err.to_string(), None);
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json.into())).await;
    }

    let close = CloseFrame {
        code: AUTH_FAILURE_CLOSE_CODE,
        reason: err.code().into(),
    };
    let _ = socket.send(Message::Close(Some(close))).await;
}
