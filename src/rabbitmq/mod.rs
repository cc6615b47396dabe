// src/rabbitmq/mod.rs
// RabbitMQ implementations of the bridge transports

pub mod connection;
mod fanout;
mod queue;

pub use connection::{AmqpSession, ConnectionManager};
pub use fanout::AmqpBroadcast;
pub use queue::AmqpQueue;

use crate::config::AmqpSettings;

fn session(settings: &AmqpSettings) -> AmqpSession {
    AmqpSession::new(
        ConnectionManager::new(&settings.uri)
            .with_reconnect_policy(settings.reconnect_attempts, settings.reconnect_delay_ms),
    )
}

/// Work queue backed by the broker described in `settings`.
pub fn work_queue(settings: &AmqpSettings) -> AmqpQueue {
    AmqpQueue::new(session(settings), settings.prefetch_count)
}

/// Broadcast channel backed by the broker described in `settings`.
pub fn broadcast(settings: &AmqpSettings) -> AmqpBroadcast {
    AmqpBroadcast::new(session(settings))
}
