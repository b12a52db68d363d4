//! Per-instance connection and subscription bookkeeping.
//!
//! The registry tracks every live realtime connection on this instance, the
//! identity it authenticated as, and the topics it is subscribed to. It is the
//! only owner of each connection's outbound queue: removing an entry drops
//! the sender, which ends the connection's writer task.
//!
//! # Architecture
//!
//! Two concurrent maps are kept in step:
//!
//! - connection handle -> entry (identity, topic set, outbound sender, liveness)
//! - topic -> set of connection handles
//!
//! Writers always lock a connection entry before touching the topic index,
//! and readers never hold a topic guard while looking up a connection, so the
//! two maps cannot deadlock against each other.
//!
//! # Example
//!
//! ```rust
//! use pb_realtime::registry::ConnectionRegistry;
//! use pb_realtime::types::{ServerFrame, Topic};
//! use tokio::sync::mpsc;
//!
//! let registry = ConnectionRegistry::new();
//! let (tx, mut rx) = mpsc::channel(8);
//! let handle = registry.register(None, tx);
//!
//! let topic = Topic::game("123").unwrap();
//! assert!(registry.subscribe(handle, &topic));
//! assert_eq!(registry.deliver(&topic, &ServerFrame::Pong), 1);
//! assert_eq!(rx.try_recv().unwrap(), ServerFrame::Pong);
//!
//! registry.deregister(handle);
//! assert!(registry.subscribers_of(&topic).is_empty());
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::auth::Claims;
use crate::types::{ServerFrame, Topic};

/// Identifier of a live connection on this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    identity: Option<Claims>,
    subscriptions: HashSet<Topic>,
    outbound: mpsc::Sender<ServerFrame>,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: DashMap<ConnectionHandle, ConnectionEntry>,
    topics: DashMap<Topic, HashSet<ConnectionHandle>>,
    next_id: AtomicU64,
}

/// Concurrent registry of connections and their topic subscriptions.
///
/// `ConnectionRegistry` is cheap to clone; clones share the same state.
///
/// Operations on an unknown (already deregistered) handle are no-ops that
/// report `false`/`None`, so a connection task racing the idle reaper never
/// has to handle an error.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and takes ownership of its outbound queue.
    pub fn register(
        &self,
        identity: Option<Claims>,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> ConnectionHandle {
        let handle = ConnectionHandle(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let user_id = identity.as_ref().map(|c| c.user_id);

        self.inner.connections.insert(
            handle,
            ConnectionEntry {
                identity,
                subscriptions: HashSet::new(),
                outbound,
                last_seen: Instant::now(),
            },
        );

        debug!(connection = %handle, user_id = ?user_id, "Registered connection");
        handle
    }

    /// Adds `topic` to the connection's subscriptions.
    ///
    /// Returns `true` if the subscription is new. Subscribing twice is a
    /// no-op, and so is subscribing an unknown handle.
    pub fn subscribe(&self, handle: ConnectionHandle, topic: &Topic) -> bool {
        let Some(mut entry) = self.inner.connections.get_mut(&handle) else {
            trace!(connection = %handle, "Subscribe on unknown connection");
            return false;
        };

        entry.last_seen = Instant::now();
        if !entry.subscriptions.insert(topic.clone()) {
            return false;
        }

        self.inner
            .topics
            .entry(topic.clone())
            .or_default()
            .insert(handle);

        debug!(connection = %handle, topic = %topic, "Subscribed");
        true
    }

    /// Removes `topic` from the connection's subscriptions.
    ///
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&self, handle: ConnectionHandle, topic: &Topic) -> bool {
        let Some(mut entry) = self.inner.connections.get_mut(&handle) else {
            return false;
        };

        entry.last_seen = Instant::now();
        if !entry.subscriptions.remove(topic) {
            return false;
        }

        self.remove_from_topic(handle, topic);
        debug!(connection = %handle, topic = %topic, "Unsubscribed");
        true
    }

    /// Removes a connection and all of its subscriptions.
    ///
    /// Returns the topics it was subscribed to, or `None` if the handle was
    /// already gone. Dropping the entry closes the outbound queue.
    pub fn deregister(&self, handle: ConnectionHandle) -> Option<Vec<Topic>> {
        let (_, entry) = self.inner.connections.remove(&handle)?;

        for topic in &entry.subscriptions {
            self.remove_from_topic(handle, topic);
        }

        debug!(
            connection = %handle,
            topics = entry.subscriptions.len(),
            "Deregistered connection"
        );
        Some(entry.subscriptions.into_iter().collect())
    }

    fn remove_from_topic(&self, handle: ConnectionHandle, topic: &Topic) {
        if let Entry::Occupied(mut occupied) = self.inner.topics.entry(topic.clone()) {
            occupied.get_mut().remove(&handle);
            if occupied.get().is_empty() {
                occupied.remove();
            }
        }
    }

    /// Local connections currently subscribed to `topic`.
    #[must_use]
    pub fn subscribers_of(&self, topic: &Topic) -> HashSet<ConnectionHandle> {
        self.inner
            .topics
            .get(topic)
            .map(|handles| handles.value().clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_subscribed(&self, handle: ConnectionHandle, topic: &Topic) -> bool {
        self.inner
            .connections
            .get(&handle)
            .is_some_and(|entry| entry.subscriptions.contains(topic))
    }

    /// Identity the connection authenticated as (`None` if anonymous or unknown).
    #[must_use]
    pub fn identity_of(&self, handle: ConnectionHandle) -> Option<Claims> {
        self.inner
            .connections
            .get(&handle)
            .and_then(|entry| entry.identity.clone())
    }

    /// Marks the connection as alive. Returns `false` for unknown handles.
    pub fn touch(&self, handle: ConnectionHandle) -> bool {
        match self.inner.connections.get_mut(&handle) {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Queues a frame for one connection without waiting.
    ///
    /// Returns `false` if the connection is unknown, its queue is full, or
    /// its writer has gone away.
    pub fn send_to(&self, handle: ConnectionHandle, frame: ServerFrame) -> bool {
        let Some(entry) = self.inner.connections.get(&handle) else {
            return false;
        };
        queue_frame(handle, &entry.outbound, frame)
    }

    /// Queues `frame` for every local subscriber of `topic`.
    ///
    /// Returns how many connections accepted the frame. A full queue drops
    /// the frame for that connection only.
    pub fn deliver(&self, topic: &Topic, frame: &ServerFrame) -> usize {
        let handles: Vec<ConnectionHandle> = match self.inner.topics.get(topic) {
            Some(handles) => handles.iter().copied().collect(),
            None => return 0,
        };

        handles
            .into_iter()
            .filter(|handle| match self.inner.connections.get(handle) {
                Some(entry) => queue_frame(*handle, &entry.outbound, frame.clone()),
                None => false,
            })
            .count()
    }

    /// Deregisters every connection idle for at least `max_idle`.
    ///
    /// Returns each reaped handle together with the topics it held.
    pub fn reap_idle(&self, max_idle: Duration) -> Vec<(ConnectionHandle, Vec<Topic>)> {
        let stale: Vec<ConnectionHandle> = self
            .inner
            .connections
            .iter()
            .filter(|entry| entry.last_seen.elapsed() >= max_idle)
            .map(|entry| *entry.key())
            .collect();

        stale
            .into_iter()
            .filter_map(|handle| {
                let topics = self.deregister(handle)?;
                debug!(connection = %handle, "Reaped idle connection");
                Some((handle, topics))
            })
            .collect()
    }

    /// Deregisters every connection, closing all outbound queues.
    pub fn deregister_all(&self) -> Vec<(ConnectionHandle, Vec<Topic>)> {
        let handles: Vec<ConnectionHandle> =
            self.inner.connections.iter().map(|entry| *entry.key()).collect();

        handles
            .into_iter()
            .filter_map(|handle| Some((handle, self.deregister(handle)?)))
            .collect()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner.topics.len()
    }
}

fn queue_frame(handle: ConnectionHandle, outbound: &mpsc::Sender<ServerFrame>, frame: ServerFrame) -> bool {
    match outbound.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(connection = %handle, "Outbound queue full, dropping frame");
            false
        }
        Err(TrySendError::Closed(_)) => {
            trace!(connection = %handle, "Outbound queue closed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RoleSet, UserId};
    use chrono::Utc;

    fn claims() -> Claims {
        Claims {
            user_id: UserId::new(),
            username: "tester".to_string(),
            roles: RoleSet::new(),
            issued_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    fn game(id: &str) -> Topic {
        Topic::game(id).unwrap()
    }

    // ===== Register / Deregister =====

    #[test]
    fn test_register_assigns_unique_handles() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);

        let a = registry.register(None, tx.clone());
        let b = registry.register(Some(claims()), tx);

        assert_ne!(a, b);
        assert_eq!(registry.connection_count(), 2);
        assert!(registry.identity_of(a).is_none());
        assert!(registry.identity_of(b).is_some());
    }

    #[test]
    fn test_deregister_removes_all_subscriptions() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let handle = registry.register(None, tx);

        registry.subscribe(handle, &game("1"));
        registry.subscribe(handle, &game("2"));

        let mut topics = registry.deregister(handle).unwrap();
        topics.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(topics, vec![game("1"), game("2")]);

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.topic_count(), 0);
        assert!(registry.subscribers_of(&game("1")).is_empty());
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let handle = registry.register(None, tx);

        assert!(registry.deregister(handle).is_some());
        assert!(registry.deregister(handle).is_none());
    }

    #[tokio::test]
    async fn test_deregister_closes_outbound_queue() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = registry.register(None, tx);

        registry.deregister(handle);
        assert!(rx.recv().await.is_none());
    }

    // ===== Subscribe / Unsubscribe =====

    #[test]
    fn test_subscribe_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let handle = registry.register(None, tx);

        assert!(registry.subscribe(handle, &game("1")));
        assert!(!registry.subscribe(handle, &game("1")));
        assert_eq!(registry.subscribers_of(&game("1")).len(), 1);
        assert!(registry.is_subscribed(handle, &game("1")));
    }

    #[test]
    fn test_unsubscribe() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let handle = registry.register(None, tx);

        registry.subscribe(handle, &game("1"));
        assert!(registry.unsubscribe(handle, &game("1")));
        assert!(!registry.unsubscribe(handle, &game("1")));
        assert!(!registry.is_subscribed(handle, &game("1")));
        assert_eq!(registry.topic_count(), 0);
    }

    #[test]
    fn test_unknown_handle_operations_are_noops() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let handle = registry.register(None, tx);
        registry.deregister(handle);

        assert!(!registry.subscribe(handle, &game("1")));
        assert!(!registry.unsubscribe(handle, &game("1")));
        assert!(!registry.touch(handle));
        assert!(!registry.send_to(handle, ServerFrame::Pong));
        assert_eq!(registry.topic_count(), 0);
    }

    // ===== Delivery =====

    #[test]
    fn test_deliver_reaches_only_subscribers() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = registry.register(None, tx_a);
        let _b = registry.register(None, tx_b);

        registry.subscribe(a, &game("1"));

        assert_eq!(registry.deliver(&game("1"), &ServerFrame::Pong), 1);
        assert_eq!(registry.deliver(&game("2"), &ServerFrame::Pong), 0);

        assert_eq!(rx_a.try_recv().unwrap(), ServerFrame::Pong);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_deliver_skips_full_queue() {
        let registry = ConnectionRegistry::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(4);
        let slow = registry.register(None, slow_tx);
        let fast = registry.register(None, fast_tx);

        registry.subscribe(slow, &game("1"));
        registry.subscribe(fast, &game("1"));

        assert_eq!(registry.deliver(&game("1"), &ServerFrame::Pong), 2);
        assert_eq!(registry.deliver(&game("1"), &ServerFrame::Pong), 1);

        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    // ===== Liveness =====

    #[test]
    fn test_reap_idle() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let handle = registry.register(None, tx);
        registry.subscribe(handle, &game("1"));

        assert!(registry.reap_idle(Duration::from_secs(60)).is_empty());
        assert_eq!(registry.connection_count(), 1);

        let reaped = registry.reap_idle(Duration::ZERO);
        assert_eq!(reaped, vec![(handle, vec![game("1")])]);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_deregister_all_closes_every_queue() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = registry.register(None, tx_a);
        let b = registry.register(Some(claims()), tx_b);
        registry.subscribe(a, &game("1"));
        registry.subscribe(b, &game("1"));

        let mut closed = registry.deregister_all();
        closed.sort_by_key(|(handle, _)| *handle);
        assert_eq!(closed.iter().map(|(h, _)| *h).collect::<Vec<_>>(), vec![a, b]);
        assert!(closed.iter().all(|(_, topics)| topics == &vec![game("1")]));

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.topic_count(), 0);
        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_none());
        assert!(registry.deregister_all().is_empty());
    }

    #[test]
    fn test_concurrent_subscribe_and_deregister() {
        let registry = ConnectionRegistry::new();
        let topic = game("shared");

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let topic = topic.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let (tx, _rx) = mpsc::channel(1);
                        let handle = registry.register(None, tx);
                        registry.subscribe(handle, &topic);
                        registry.deregister(handle);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.topic_count(), 0);
    }
}
