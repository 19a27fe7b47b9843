//! Bridge between local connections and the shared broadcast medium.
//!
//! Every relay process publishes chat lines to one pub/sub channel and holds
//! exactly one subscription on it. Whatever arrives on that subscription is
//! fanned out to every registered connection of this process, so a line
//! sent on one process reaches clients on all of them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc};

use crate::error::ApiError;

use super::router::MessageRouter;

/// Capacity of each in-memory channel. Slow subscribers that fall behind
/// skip messages (RecvError::Lagged).
const MEMORY_CHANNEL_CAPACITY: usize = 4096;

/// First wait before resubscribing after the subscription is lost. Doubles
/// on every failed attempt up to [`RESUBSCRIBE_MAX_DELAY`].
const RESUBSCRIBE_INITIAL_DELAY: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(10);

/// A publish/subscribe medium shared by all relay processes.
///
/// Delivery is best effort: no acknowledgement, no replay for late
/// subscribers, no ordering across publishers.
#[async_trait]
pub trait BroadcastMedium: Send + Sync {
    async fn publish(&self, channel: &str, text: &str) -> Result<(), ApiError>;
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, ApiError>;
}

// ---------------------------------------------------------------------------
// In-memory medium
// ---------------------------------------------------------------------------

/// Process-local medium built on `tokio::sync::broadcast`.
///
/// Sharing one instance between several relay instances in the same process
/// behaves like several processes sharing a Redis server.
pub struct MemoryMedium {
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastMedium for MemoryMedium {
    async fn publish(&self, channel: &str, text: &str) -> Result<(), ApiError> {
        // send() returns Err if there are no subscribers; ignored.
        let _ = self.sender(channel).send(text.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, ApiError> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();
        let stream = stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                match rx.recv().await {
                    Ok(text) => return Some((text, (rx, channel))),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(%channel, skipped = n, "subscriber lagged behind medium");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ---------------------------------------------------------------------------
// Redis medium
// ---------------------------------------------------------------------------

/// Redis pub/sub. Publishing goes through a multiplexed connection manager;
/// each subscription opens its own dedicated pub/sub connection.
pub struct RedisMedium {
    client: redis::Client,
    publisher: redis::aio::ConnectionManager,
}

impl RedisMedium {
    pub async fn connect(redis_url: &str) -> Result<Self, ApiError> {
        let client = redis::Client::open(redis_url)?;
        let publisher = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl BroadcastMedium for RedisMedium {
    async fn publish(&self, channel: &str, text: &str) -> Result<(), ApiError> {
        use redis::AsyncCommands;
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, text).await.map_err(|e| {
            tracing::error!(?e, %channel, "redis publish failed");
            ApiError::unavailable("Publish failed")
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, ApiError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::warn!(?e, "dropping non-text publication");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

/// Per-process handle for publishing chat lines. Cloneable via `Arc`. Store
/// in AppState.
pub struct Broadcaster {
    channel: String,
    outbound: mpsc::UnboundedSender<String>,
    subscribed: Arc<AtomicBool>,
}

impl Broadcaster {
    /// Subscribe to `channel` on the medium and start the publisher and
    /// subscriber tasks for this process.
    ///
    /// The subscription is in place when this returns, so nothing published
    /// afterwards is missed. If the medium later ends the subscription, the
    /// subscriber task resubscribes with backoff; messages published while
    /// it is down are lost.
    pub async fn start(
        medium: Arc<dyn BroadcastMedium>,
        channel: impl Into<String>,
        router: Arc<MessageRouter>,
    ) -> Result<Arc<Self>, ApiError> {
        let channel = channel.into();

        let inbound = medium.subscribe(&channel).await?;
        let subscribed = Arc::new(AtomicBool::new(true));
        tokio::spawn(run_subscriber(
            medium.clone(),
            inbound,
            router,
            channel.clone(),
            subscribed.clone(),
        ));

        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(run_publisher(medium, channel.clone(), queue));

        tracing::info!(%channel, "broadcaster subscribed");
        Ok(Arc::new(Self {
            channel,
            outbound,
            subscribed,
        }))
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether this process currently holds its subscription. False while
    /// it is resubscribing after the medium dropped it.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    /// Queue `text` for publication. Never blocks; lines queued by this
    /// process are published in order.
    pub fn publish(&self, text: String) {
        if self.outbound.send(text).is_err() {
            tracing::warn!(channel = %self.channel, "publisher stopped, dropping message");
        }
    }

    /// Deliver a publication to every registered local connection. Returns
    /// how many connections it was handed to.
    pub fn on_message(router: &MessageRouter, text: &str) -> usize {
        router.fan_out(text)
    }
}

async fn run_publisher(
    medium: Arc<dyn BroadcastMedium>,
    channel: String,
    mut queue: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = queue.recv().await {
        if let Err(err) = medium.publish(&channel, &text).await {
            tracing::warn!(%channel, %err, "message dropped");
        }
    }
}

async fn run_subscriber(
    medium: Arc<dyn BroadcastMedium>,
    mut inbound: BoxStream<'static, String>,
    router: Arc<MessageRouter>,
    channel: String,
    subscribed: Arc<AtomicBool>,
) {
    loop {
        while let Some(text) = inbound.next().await {
            let delivered = Broadcaster::on_message(&router, &text);
            tracing::trace!(%channel, delivered, "publication fanned out");
        }
        subscribed.store(false, Ordering::Release);
        tracing::error!(%channel, "broadcast subscription lost, resubscribing");

        inbound = resubscribe(medium.as_ref(), &channel).await;
        subscribed.store(true, Ordering::Release);
        tracing::info!(%channel, "broadcast subscription restored");
    }
}

async fn resubscribe(medium: &dyn BroadcastMedium, channel: &str) -> BoxStream<'static, String> {
    let mut delay = RESUBSCRIBE_INITIAL_DELAY;
    loop {
        tokio::time::sleep(delay).await;
        match medium.subscribe(channel).await {
            Ok(stream) => return stream,
            Err(err) => {
                delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
                tracing::warn!(%channel, %err, retry_in_ms = delay.as_millis() as u64, "resubscribe failed");
            }
        }
    }
}
