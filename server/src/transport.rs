//! Shared publish/subscribe channel backends.
//!
//! A [`Transport`] moves raw string messages between server instances on
//! named channels. [`MemoryTransport`] is an in-process hub that several
//! instances in one process can share; [`RedisTransport`] uses Redis
//! `PUBLISH`/`PSUBSCRIBE` for real deployments.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::future::{self, BoxFuture};
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Default buffer of the in-process hub.
pub const DEFAULT_MEMORY_CAPACITY: usize = 1024;

/// A message received from the shared channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The shared channel cannot be reached.
    #[error("shared channel unavailable: {0}")]
    Unavailable(String),

    /// The backend could not be configured (e.g. a bad URL).
    #[error("invalid transport configuration: {0}")]
    Config(String),

    /// A message arrived that could not be read as text.
    #[error("undecodable message on {channel}: {reason}")]
    Decode { channel: String, reason: String },
}

/// Stream of messages from a subscription. It ends when the link is lost.
pub type MessageStream = BoxStream<'static, Result<TransportMessage, TransportError>>;

/// A shared publish/subscribe channel.
pub trait Transport: Send + Sync + 'static {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Publishes `payload` on `channel`. Having no receivers is not an error.
    fn publish(&self, channel: String, payload: String) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Subscribes to every channel whose name starts with `prefix`.
    fn subscribe(&self, prefix: String) -> BoxFuture<'_, Result<MessageStream, TransportError>>;
}

// ============================================================================
// In-process hub
// ============================================================================

#[derive(Debug)]
struct MemoryHub {
    sender: RwLock<broadcast::Sender<TransportMessage>>,
    available: AtomicBool,
    capacity: usize,
}

/// In-process shared channel. Clones share the same hub, so several server
/// instances in one process can talk to each other through it.
///
/// [`disconnect`](Self::disconnect) simulates an outage: open subscriptions
/// end and further calls fail until [`restore`](Self::restore).
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            hub: Arc::new(MemoryHub {
                sender: RwLock::new(sender),
                available: AtomicBool::new(true),
                capacity,
            }),
        }
    }

    /// Takes the hub offline and ends every open subscription.
    pub fn disconnect(&self) {
        self.hub.available.store(false, Ordering::SeqCst);
        let (fresh, _) = broadcast::channel(self.hub.capacity);
        // Dropping the old sender closes all of its receivers.
        *self.hub.sender.write().expect("memory hub lock poisoned") = fresh;
        warn!("Memory transport disconnected");
    }

    /// Brings the hub back online.
    pub fn restore(&self) {
        self.hub.available.store(true, Ordering::SeqCst);
        debug!("Memory transport restored");
    }

    pub fn is_available(&self) -> bool {
        self.hub.available.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(TransportError::Unavailable(
                "memory hub is disconnected".to_string(),
            ))
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn publish(&self, channel: String, payload: String) -> BoxFuture<'_, Result<(), TransportError>> {
        let result = self.check_available().map(|()| {
            let sender = self.hub.sender.read().expect("memory hub lock poisoned");
            let receivers = sender.send(TransportMessage { channel, payload }).unwrap_or(0);
            trace!(receivers, "Published to memory hub");
        });
        future::ready(result).boxed()
    }

    fn subscribe(&self, prefix: String) -> BoxFuture<'_, Result<MessageStream, TransportError>> {
        let result = self.check_available().map(|()| {
            let receiver = self
                .hub
                .sender
                .read()
                .expect("memory hub lock poisoned")
                .subscribe();
            prefixed_stream(receiver, prefix)
        });
        future::ready(result).boxed()
    }
}

fn prefixed_stream(receiver: broadcast::Receiver<TransportMessage>, prefix: String) -> MessageStream {
    stream::unfold((receiver, prefix), |(mut receiver, prefix)| async move {
        loop {
            match receiver.recv().await {
                Ok(message) if message.channel.starts_with(&prefix) => {
                    return Some((Ok(message), (receiver, prefix)));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Memory transport subscriber lagged, messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

// ============================================================================
// Redis
// ============================================================================

/// Redis pub/sub backend.
///
/// Publishing goes through one lazily opened multiplexed connection that is
/// dropped and reopened after an error. Each subscription opens its own
/// pub/sub connection with a `PSUBSCRIBE <prefix>*`.
pub struct RedisTransport {
    client: redis::Client,
    publisher: Mutex<Option<MultiplexedConnection>>,
}

impl RedisTransport {
    /// Validates `url`; no connection is made until first use.
    pub fn open(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url).map_err(|e| TransportError::Config(e.to_string()))?;
        Ok(Self {
            client,
            publisher: Mutex::new(None),
        })
    }

    async fn publisher(&self) -> Result<MultiplexedConnection, TransportError> {
        let mut cached = self.publisher.lock().await;
        if let Some(connection) = cached.as_ref() {
            return Ok(connection.clone());
        }

        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        debug!("Opened redis publish connection");
        *cached = Some(connection.clone());
        Ok(connection)
    }
}

impl fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisTransport").finish_non_exhaustive()
    }
}

fn unavailable(err: redis::RedisError) -> TransportError {
    TransportError::Unavailable(err.to_string())
}

impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn publish(&self, channel: String, payload: String) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            let mut connection = self.publisher().await?;
            let result: redis::RedisResult<i64> =
                connection.publish(channel.as_str(), payload.as_str()).await;

            match result {
                Ok(receivers) => {
                    trace!(channel = %channel, receivers, "Published to redis");
                    Ok(())
                }
                Err(err) => {
                    self.publisher.lock().await.take();
                    Err(unavailable(err))
                }
            }
        }
        .boxed()
    }

    fn subscribe(&self, prefix: String) -> BoxFuture<'_, Result<MessageStream, TransportError>> {
        async move {
            let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
            pubsub
                .psubscribe(format!("{prefix}*"))
                .await
                .map_err(unavailable)?;
            debug!(pattern = %format!("{prefix}*"), "Subscribed to redis pattern");

            let messages = pubsub.into_on_message().map(|message| {
                let channel = message.get_channel_name().to_string();
                match message.get_payload::<String>() {
                    Ok(payload) => Ok(TransportMessage { channel, payload }),
                    Err(err) => Err(TransportError::Decode {
                        channel,
                        reason: err.to_string(),
                    }),
                }
            });

            Ok(messages.boxed())
        }
        .boxed()
    }
}
