//! In-process transports.
//!
//! Used by the test-suite and for single-process runs. They mirror the delivery
//! semantics of the broker-backed implementations: the queue redelivers entries that
//! were dropped without acknowledgement, the broadcast only reaches live subscribers.

use super::{
    BroadcastStream, BroadcastTransport, DeliveryMetadata, QueueEntry, QueueStream,
    QueueTransport,
};
use crate::errors::TransportError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Per-subscriber buffer of the in-memory broadcast.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

struct Envelope {
    payload: Vec<u8>,
    metadata: DeliveryMetadata,
}

struct Group {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

#[derive(Default)]
struct Topic {
    groups: HashMap<String, Group>,
    // entries enqueued before any group joined
    backlog: Vec<Envelope>,
}

#[derive(Default)]
struct QueueCounters {
    acknowledged: AtomicU64,
    rejected: AtomicU64,
}

/// Work queue with consumer groups: every group sees every entry, consumers inside a
/// group compete for them.
#[derive(Default)]
pub struct InMemoryQueue {
    topics: Mutex<HashMap<String, Topic>>,
    next_tag: AtomicU64,
    failing: AtomicBool,
    counters: Arc<QueueCounters>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes subsequent `enqueue` calls fail, as if the broker refused them.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Ends every consumer stream of `topic` once its buffered entries are drained.
    pub fn close(&self, topic: &str) {
        self.topics().remove(topic);
    }

    pub fn acknowledged(&self) -> u64 {
        self.counters.acknowledged.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.counters.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn enqueue(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::PublishError(format!(
                "queue {topic} refused entry {key}"
            )));
        }

        let metadata = DeliveryMetadata {
            topic: topic.to_string(),
            key: Some(key.to_string()),
            delivery_tag: self.next_tag.fetch_add(1, Ordering::Relaxed) + 1,
            redelivered: false,
        };

        let mut topics = self.topics();
        let entry = topics.entry(topic.to_string()).or_default();

        if entry.groups.is_empty() {
            entry.backlog.push(Envelope {
                payload: payload.to_vec(),
                metadata,
            });
            return Ok(());
        }

        for group in entry.groups.values() {
            let envelope = Envelope {
                payload: payload.to_vec(),
                metadata: metadata.clone(),
            };
            if group.sender.send(envelope).is_err() {
                return Err(TransportError::Closed);
            }
        }

        Ok(())
    }

    async fn consume(&self, topic: &str, group: &str) -> Result<QueueStream, TransportError> {
        let (receiver, sender) = {
            let mut topics = self.topics();
            let entry = topics.entry(topic.to_string()).or_default();
            let is_first_group = entry.groups.is_empty();

            let state = entry.groups.entry(group.to_string()).or_insert_with(|| {
                let (sender, receiver) = mpsc::unbounded_channel();
                Group {
                    sender,
                    receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                }
            });

            if is_first_group {
                for envelope in entry.backlog.drain(..) {
                    // receiver is alive, held by `state`
                    let _ = state.sender.send(envelope);
                }
            }

            (state.receiver.clone(), state.sender.downgrade())
        };

        debug!(topic, group, "Joined in-memory consumer group");

        let counters = self.counters.clone();
        let entries = stream::unfold(
            (receiver, sender, counters),
            |(receiver, sender, counters)| async move {
                let envelope = receiver.lock().await.recv().await?;
                let entry: Box<dyn QueueEntry> = Box::new(MemoryEntry {
                    payload: envelope.payload,
                    metadata: envelope.metadata,
                    settled: false,
                    requeue: sender.clone(),
                    counters: counters.clone(),
                });
                Some((Ok(entry), (receiver, sender, counters)))
            },
        )
        .boxed();

        Ok(entries)
    }
}

struct MemoryEntry {
    payload: Vec<u8>,
    metadata: DeliveryMetadata,
    settled: bool,
    requeue: mpsc::WeakUnboundedSender<Envelope>,
    counters: Arc<QueueCounters>,
}

#[async_trait]
impl QueueEntry for MemoryEntry {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn metadata(&self) -> &DeliveryMetadata {
        &self.metadata
    }

    async fn acknowledge(&mut self) -> Result<(), TransportError> {
        if !self.settled {
            self.settled = true;
            self.counters.acknowledged.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn reject(&mut self) -> Result<(), TransportError> {
        if !self.settled {
            self.settled = true;
            self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryEntry {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let mut metadata = std::mem::take(&mut self.metadata);
        metadata.redelivered = true;
        let envelope = Envelope {
            payload: std::mem::take(&mut self.payload),
            metadata,
        };

        if let Some(sender) = self.requeue.upgrade() {
            let _ = sender.send(envelope);
        }
    }
}

/// Fan-out channel built on [`tokio::sync::broadcast`].
pub struct InMemoryBroadcast {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
    failing: AtomicBool,
    published: AtomicU64,
}

impl InMemoryBroadcast {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        InMemoryBroadcast {
            channels: Mutex::new(HashMap::new()),
            capacity,
            failing: AtomicBool::new(false),
            published: AtomicU64::new(0),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Vec<u8>>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Makes subsequent `publish` calls fail, as if the broker were overloaded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Ends all subscriptions to `channel`.
    pub fn close(&self, channel: &str) {
        self.channels().remove(channel);
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels()
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Number of successful publish calls, whether or not anybody listened.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastTransport for InMemoryBroadcast {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::PublishError(format!(
                "channel {channel} is overloaded"
            )));
        }

        match self.sender(channel).send(payload.to_vec()) {
            Ok(receivers) => debug!(channel, receivers, "Broadcast published"),
            Err(_) => debug!(channel, "Broadcast dropped (no subscribers)"),
        }
        self.published.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BroadcastStream, TransportError> {
        let receiver = self.sender(channel).subscribe();
        let channel = channel.to_string();

        let messages = stream::unfold(receiver, move |mut receiver| {
            let channel = channel.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "Subscriber lagged behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed();

        Ok(messages)
    }
}
