//! Cross-instance event bridge.
//!
//! The bridge relays events between server instances over a shared
//! [`Transport`]. Every instance keeps one long-lived pattern subscription on
//! `<prefix>*`; incoming messages are decoded and handed to the handlers
//! registered for their topic. Publishing encodes the event and sends it on
//! `<prefix><topic>`.
//!
//! # Wire format
//!
//! ```text
//! channel: <prefix>game:123
//! message: TAG|{"type":"TAG","timestamp":1700000000000,"originUserId":"...","payload":{}}
//! ```
//!
//! The part before the first `|` is the event tag; the rest is the JSON
//! event. The tag must agree with the event's `type`.
//!
//! # Link supervision
//!
//! [`Bridge::start`] spawns the link task. It reports [`LinkState`], and after
//! a lost link retries with exponential backoff (doubling up to a cap, ±25%
//! jitter). While the link is down, [`Bridge::publish`] fails fast with
//! [`BridgeError::Unavailable`] instead of queueing.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pb_realtime::bridge::{decode_envelope, encode_envelope, Bridge, BridgeConfig};
//! use pb_realtime::transport::MemoryTransport;
//! use pb_realtime::types::{Event, EventType, UserId};
//!
//! let event = Event::new(EventType::Tag, UserId::new(), serde_json::json!({"label": "ace"}));
//! let message = encode_envelope(&event).unwrap();
//! assert!(message.starts_with("TAG|"));
//! assert_eq!(decode_envelope(&message).unwrap(), event);
//!
//! let bridge = Bridge::new(Arc::new(MemoryTransport::new()), BridgeConfig::default());
//! assert!(!bridge.is_connected());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::transport::{Transport, TransportError, TransportMessage};
use crate::types::{Event, EventType, Topic};

/// Default upper bound on a single publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// First reconnect delay after a lost link.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Reconnect delay cap.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Jitter factor for reconnect delays (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// Separator between the tag and the JSON body of an envelope.
pub const ENVELOPE_SEPARATOR: char = '|';

/// Errors returned to publishers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The shared channel is unreachable.
    #[error("broadcast bridge is unavailable")]
    Unavailable,

    /// The publish did not complete in time.
    #[error("broadcast bridge publish timed out after {0:?}")]
    Timeout(Duration),

    /// The event could not be serialised.
    #[error("failed to encode event: {0}")]
    Encode(String),
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable | Self::Timeout(_) => "bridge_unavailable",
            Self::Encode(_) => "invalid_event",
        }
    }
}

/// Reasons an inbound envelope is discarded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("missing '|' separator")]
    MissingSeparator,

    #[error("invalid event tag '{0}'")]
    InvalidTag(String),

    #[error("invalid event body: {0}")]
    InvalidBody(String),

    #[error("envelope tag {tag} does not match event type {actual}")]
    TagMismatch { tag: String, actual: String },
}

/// Encodes an event as `TYPE|json`.
pub fn encode_envelope(event: &Event) -> Result<String, BridgeError> {
    let body = serde_json::to_string(event).map_err(|e| BridgeError::Encode(e.to_string()))?;
    Ok(format!("{}{}{}", event.event_type, ENVELOPE_SEPARATOR, body))
}

/// Decodes a `TYPE|json` envelope, splitting on the first separator.
pub fn decode_envelope(message: &str) -> Result<Event, EnvelopeError> {
    let (tag, body) = message
        .split_once(ENVELOPE_SEPARATOR)
        .ok_or(EnvelopeError::MissingSeparator)?;

    let tag = EventType::parse(tag).map_err(|_| EnvelopeError::InvalidTag(tag.to_string()))?;
    let event: Event =
        serde_json::from_str(body).map_err(|e| EnvelopeError::InvalidBody(e.to_string()))?;

    if event.event_type != tag {
        return Err(EnvelopeError::TagMismatch {
            tag: tag.to_string(),
            actual: event.event_type.to_string(),
        });
    }

    Ok(event)
}

/// Health of the link to the shared channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

/// Bridge tuning.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Prefix of every shared channel name.
    pub channel_prefix: String,
    pub publish_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "rt:".to_string(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            initial_backoff: INITIAL_RECONNECT_DELAY,
            max_backoff: MAX_RECONNECT_DELAY,
        }
    }
}

impl From<&Config> for BridgeConfig {
    fn from(config: &Config) -> Self {
        Self {
            channel_prefix: config.bridge_prefix.clone(),
            publish_timeout: config.publish_timeout,
            initial_backoff: config.reconnect_initial,
            max_backoff: config.reconnect_max,
        }
    }
}

/// Identifies one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callback invoked for each event arriving on a topic.
pub type Handler = Arc<dyn Fn(&Topic, &Event) + Send + Sync>;

struct BridgeInner {
    transport: Arc<dyn Transport>,
    config: BridgeConfig,
    handlers: RwLock<HashMap<Topic, Vec<(SubscriptionId, Handler)>>>,
    publish_lock: Mutex<()>,
    state: watch::Sender<LinkState>,
    next_subscription: AtomicU64,
}

/// Relays events between instances over a shared transport.
///
/// Cheap to clone; clones share the same link and handler table.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn new(transport: Arc<dyn Transport>, config: BridgeConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Connecting);
        Self {
            inner: Arc::new(BridgeInner {
                transport,
                config,
                handlers: RwLock::new(HashMap::new()),
                publish_lock: Mutex::new(()),
                state,
                next_subscription: AtomicU64::new(0),
            }),
        }
    }

    /// Spawns the link task. Abort the returned handle on shutdown.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { run_link(inner).await })
    }

    pub fn link_state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// Receiver notified on every link state change.
    pub fn watch_link(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    /// Waits up to `timeout` for the link to be up. Returns whether it is.
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let mut link = self.watch_link();
        tokio::time::timeout(timeout, link.wait_for(|state| *state == LinkState::Connected))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    /// Shared channel name for a topic.
    pub fn channel_for(&self, topic: &Topic) -> String {
        format!("{}{}", self.inner.config.channel_prefix, topic)
    }

    /// Publishes an event on `topic` to every instance, including this one.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Unavailable`] if the link is down or the transport
    ///   rejects the message
    /// - [`BridgeError::Timeout`] if the publish does not finish in time
    pub async fn publish(&self, topic: &Topic, event: &Event) -> Result<(), BridgeError> {
        if !self.is_connected() {
            debug!(topic = %topic, "Bridge link down, rejecting publish");
            return Err(BridgeError::Unavailable);
        }

        let channel = self.channel_for(topic);
        let message = encode_envelope(event)?;
        let limit = self.inner.config.publish_timeout;
        let inner = Arc::clone(&self.inner);

        // One publish in flight per instance keeps events from one origin in order.
        let send = async move {
            let _guard = inner.publish_lock.lock().await;
            inner.transport.publish(channel, message).await
        };

        match tokio::time::timeout(limit, send).await {
            Ok(Ok(())) => {
                trace!(topic = %topic, event_type = %event.event_type, "Published event");
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(topic = %topic, error = %err, "Bridge publish failed");
                Err(BridgeError::Unavailable)
            }
            Err(_) => {
                warn!(topic = %topic, timeout_ms = limit.as_millis() as u64, "Bridge publish timed out");
                Err(BridgeError::Timeout(limit))
            }
        }
    }

    /// Registers `handler` for events arriving on `topic`.
    pub fn subscribe(&self, topic: &Topic, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner
            .handlers
            .write()
            .expect("bridge handler lock poisoned")
            .entry(topic.clone())
            .or_default()
            .push((id, handler));
        debug!(topic = %topic, "Bridge handler attached");
        id
    }

    /// Removes a handler registration. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.handlers.write().expect("bridge handler lock poisoned");

        let Some(topic) = handlers
            .iter()
            .find(|(_, entries)| entries.iter().any(|(entry_id, _)| *entry_id == id))
            .map(|(topic, _)| topic.clone())
        else {
            return false;
        };

        if let Some(entries) = handlers.get_mut(&topic) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                handlers.remove(&topic);
            }
        }
        debug!(topic = %topic, "Bridge handler detached");
        true
    }

    /// Number of topics with at least one handler.
    pub fn handled_topic_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .expect("bridge handler lock poisoned")
            .len()
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("transport", &self.inner.transport.name())
            .field("config", &self.inner.config)
            .field("state", &self.link_state())
            .finish_non_exhaustive()
    }
}

impl BridgeInner {
    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Bridge link state changed");
        }
    }

    fn dispatch(&self, message: &TransportMessage) {
        let Some(name) = message.channel.strip_prefix(&self.config.channel_prefix) else {
            return;
        };
        let topic = match Topic::parse(name) {
            Ok(topic) => topic,
            Err(err) => {
                warn!(channel = %message.channel, error = %err, "Dropping message on unknown channel");
                return;
            }
        };
        let event = match decode_envelope(&message.payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(topic = %topic, error = %err, "Dropping undecodable envelope");
                return;
            }
        };

        let handlers: Vec<Handler> = match self
            .handlers
            .read()
            .expect("bridge handler lock poisoned")
            .get(&topic)
        {
            Some(entries) => entries.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
            None => return,
        };

        trace!(topic = %topic, handlers = handlers.len(), "Dispatching bridge event");
        for handler in handlers {
            handler(&topic, &event);
        }
    }
}

async fn run_link(inner: Arc<BridgeInner>) {
    let mut backoff = Backoff::new(inner.config.initial_backoff, inner.config.max_backoff);

    loop {
        match inner
            .transport
            .subscribe(inner.config.channel_prefix.clone())
            .await
        {
            Ok(mut messages) => {
                inner.set_state(LinkState::Connected);
                backoff.reset();
                info!(
                    transport = inner.transport.name(),
                    prefix = %inner.config.channel_prefix,
                    "Bridge link established"
                );

                while let Some(item) = messages.next().await {
                    match item {
                        Ok(message) => inner.dispatch(&message),
                        Err(err @ TransportError::Decode { .. }) => {
                            warn!(error = %err, "Skipping undecodable transport message");
                        }
                        Err(err) => {
                            warn!(error = %err, "Bridge link failed");
                            break;
                        }
                    }
                }

                inner.set_state(LinkState::Disconnected);
                warn!(transport = inner.transport.name(), "Bridge link lost");
            }
            Err(err) => {
                inner.set_state(LinkState::Disconnected);
                warn!(error = %err, "Bridge link could not be established");
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Retrying bridge link");
        tokio::time::sleep(delay).await;
    }
}

/// Exponential reconnect delay with jitter.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Returns the jittered current delay and doubles the next one.
    fn next_delay(&mut self) -> Duration {
        let delay = add_jitter(self.current);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

/// Adds ±25% jitter to a duration.
fn add_jitter(duration: Duration) -> Duration {
    let jitter_range = duration.as_secs_f64() * JITTER_FACTOR;
    if jitter_range <= 0.0 {
        return duration;
    }
    let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
    Duration::try_from_secs_f64((duration.as_secs_f64() + jitter).max(0.001)).unwrap_or(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::types::UserId;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            channel_prefix: "test:".to_string(),
            publish_timeout: Duration::from_millis(500),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        }
    }

    fn tag_event() -> Event {
        Event::new(EventType::Tag, UserId::new(), json!({"label": "clutch"}))
    }

    fn collecting_handler() -> (Handler, Arc<StdMutex<Vec<(Topic, Event)>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Handler = Arc::new(move |topic: &Topic, event: &Event| {
            sink.lock().unwrap().push((topic.clone(), event.clone()));
        });
        (handler, seen)
    }

    async fn wait_for_count(seen: &Arc<StdMutex<Vec<(Topic, Event)>>>, count: usize) {
        for _ in 0..100 {
            if seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ===== Envelope =====

    #[test]
    fn test_envelope_splits_on_first_separator() {
        let mut event = tag_event();
        event.payload = json!({"note": "a|b|c"});

        let message = encode_envelope(&event).unwrap();
        assert_eq!(decode_envelope(&message).unwrap(), event);
    }

    #[test]
    fn test_envelope_rejects_bad_input() {
        assert_eq!(
            decode_envelope("no separator").unwrap_err(),
            EnvelopeError::MissingSeparator
        );
        assert!(matches!(
            decode_envelope("tag|{}").unwrap_err(),
            EnvelopeError::InvalidTag(_)
        ));
        assert!(matches!(
            decode_envelope("TAG|not json").unwrap_err(),
            EnvelopeError::InvalidBody(_)
        ));

        let body = serde_json::to_string(&tag_event()).unwrap();
        assert!(matches!(
            decode_envelope(&format!("ROUND_END|{body}")).unwrap_err(),
            EnvelopeError::TagMismatch { .. }
        ));
    }

    // ===== Backoff =====

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));

        let bounds = [(74, 125), (149, 250), (299, 500), (299, 500)];
        for (low, high) in bounds {
            let delay = backoff.next_delay().as_millis();
            assert!(
                (low..=high).contains(&delay),
                "delay {delay}ms outside {low}..={high}"
            );
        }

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(125));
    }

    #[test]
    fn test_backoff_saturates_for_huge_delays() {
        let mut backoff = Backoff::new(Duration::from_secs(u64::MAX / 2), Duration::MAX);

        for _ in 0..4 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current, Duration::MAX);
        assert!(add_jitter(Duration::MAX) > Duration::from_secs(u64::MAX / 4));
    }

    #[test]
    fn test_add_jitter_stays_within_bounds() {
        let base = Duration::from_secs(4);
        for _ in 0..100 {
            let secs = add_jitter(base).as_secs_f64();
            assert!((3.0..=5.0).contains(&secs), "jittered {secs}s out of range");
        }
    }

    // ===== Publish / Subscribe =====

    #[tokio::test]
    async fn test_publish_reaches_handlers_on_every_instance() {
        let transport = MemoryTransport::new();
        let first = Bridge::new(Arc::new(transport.clone()), fast_config());
        let second = Bridge::new(Arc::new(transport), fast_config());
        let _first_link = first.start();
        let _second_link = second.start();
        assert!(first.wait_until_connected(Duration::from_secs(1)).await);
        assert!(second.wait_until_connected(Duration::from_secs(1)).await);

        let topic = Topic::game("123").unwrap();
        let (handler_a, seen_a) = collecting_handler();
        let (handler_b, seen_b) = collecting_handler();
        first.subscribe(&topic, handler_a);
        second.subscribe(&topic, handler_b);

        let event = tag_event();
        second.publish(&topic, &event).await.unwrap();

        wait_for_count(&seen_a, 1).await;
        wait_for_count(&seen_b, 1).await;
        assert_eq!(seen_a.lock().unwrap().as_slice(), &[(topic.clone(), event.clone())]);
        assert_eq!(seen_b.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bridge = Bridge::new(Arc::new(MemoryTransport::new()), fast_config());
        let _link = bridge.start();
        assert!(bridge.wait_until_connected(Duration::from_secs(1)).await);

        let (handler, seen) = collecting_handler();
        bridge.subscribe(&Topic::game("1").unwrap(), handler);

        bridge
            .publish(&Topic::game("2").unwrap(), &tag_event())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bridge = Bridge::new(Arc::new(MemoryTransport::new()), fast_config());
        let _link = bridge.start();
        assert!(bridge.wait_until_connected(Duration::from_secs(1)).await);

        let topic = Topic::game("1").unwrap();
        let (handler, seen) = collecting_handler();
        let id = bridge.subscribe(&topic, handler);
        assert_eq!(bridge.handled_topic_count(), 1);

        assert!(bridge.unsubscribe(id));
        assert!(!bridge.unsubscribe(id));
        assert_eq!(bridge.handled_topic_count(), 0);

        bridge.publish(&topic, &tag_event()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_from_one_origin_arrive_in_order() {
        let bridge = Bridge::new(Arc::new(MemoryTransport::new()), fast_config());
        let _link = bridge.start();
        assert!(bridge.wait_until_connected(Duration::from_secs(1)).await);

        let topic = Topic::game("1").unwrap();
        let (handler, seen) = collecting_handler();
        bridge.subscribe(&topic, handler);

        let origin = UserId::new();
        for seq in 0..20 {
            let event = Event::new(EventType::Tag, origin, json!({"seq": seq}));
            bridge.publish(&topic, &event).await.unwrap();
        }

        wait_for_count(&seen, 20).await;
        let order: Vec<i64> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.payload["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
    }

    // ===== Link Supervision =====

    #[tokio::test]
    async fn test_publish_fails_fast_before_link_is_up() {
        let bridge = Bridge::new(Arc::new(MemoryTransport::new()), fast_config());
        assert_eq!(bridge.link_state(), LinkState::Connecting);

        let err = bridge
            .publish(&Topic::game("1").unwrap(), &tag_event())
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Unavailable);
        assert_eq!(err.code(), "bridge_unavailable");
    }

    #[tokio::test]
    async fn test_link_recovers_after_outage() {
        let transport = MemoryTransport::new();
        let bridge = Bridge::new(Arc::new(transport.clone()), fast_config());
        let _link = bridge.start();
        assert!(bridge.wait_until_connected(Duration::from_secs(1)).await);

        let mut link = bridge.watch_link();
        transport.disconnect();
        tokio::time::timeout(
            Duration::from_secs(1),
            link.wait_for(|state| *state == LinkState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        let topic = Topic::game("1").unwrap();
        assert_eq!(
            bridge.publish(&topic, &tag_event()).await.unwrap_err(),
            BridgeError::Unavailable
        );

        transport.restore();
        assert!(bridge.wait_until_connected(Duration::from_secs(2)).await);

        let (handler, seen) = collecting_handler();
        bridge.subscribe(&topic, handler);
        bridge.publish(&topic, &tag_event()).await.unwrap();
        wait_for_count(&seen, 1).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_channel_naming() {
        let bridge = Bridge::new(Arc::new(MemoryTransport::new()), fast_config());
        assert_eq!(
            bridge.channel_for(&Topic::game("42").unwrap()),
            "test:game:42"
        );
    }
}
