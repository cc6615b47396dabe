//! Transport seams of the bridge.
//!
//! The work queue and the broadcast channel are deliberately separate traits: the
//! queue is at-least-once and durable, the broadcast is best-effort and only reaches
//! subscribers connected at publish time. The requester's correctness relies on
//! treating the broadcast as unreliable and bounding every wait with a timeout.

pub mod memory;

use crate::errors::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use memory::{InMemoryBroadcast, InMemoryQueue};

/// Where a queue entry came from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub topic: String,
    /// Partitioning key given at enqueue time.
    pub key: Option<String>,
    pub delivery_tag: u64,
    /// Set when the broker has handed this entry out before.
    pub redelivered: bool,
}

/// One entry consumed from a [`QueueTransport`].
///
/// Entries that are neither acknowledged nor rejected may be delivered again.
#[async_trait]
pub trait QueueEntry: Send {
    fn payload(&self) -> &[u8];

    fn metadata(&self) -> &DeliveryMetadata;

    async fn acknowledge(&mut self) -> Result<(), TransportError>;

    /// Drops the entry for good (no requeue).
    async fn reject(&mut self) -> Result<(), TransportError>;
}

pub type QueueStream = BoxStream<'static, Result<Box<dyn QueueEntry>, TransportError>>;

/// Durable work queue with at-least-once delivery.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Returns once the queue has accepted the payload.
    async fn enqueue(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Joins `group` on `topic`. Consumers within a group compete for entries.
    async fn consume(&self, topic: &str, group: &str) -> Result<QueueStream, TransportError>;
}

pub type BroadcastStream = BoxStream<'static, Vec<u8>>;

/// Publish/subscribe channel without persistence or replay.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Publishing with nobody subscribed succeeds; the payload is simply lost.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Returns once the subscription is live.
    async fn subscribe(&self, channel: &str) -> Result<BroadcastStream, TransportError>;
}
