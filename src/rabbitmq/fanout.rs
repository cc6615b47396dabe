// src/rabbitmq/fanout.rs
// Broadcast channel on a RabbitMQ fanout exchange.

use super::connection::{AmqpSession, DeclareCache, SessionChannel};
use crate::errors::TransportError;
use crate::transport::{BroadcastStream, BroadcastTransport};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::publisher_confirm::Confirmation;
use lapin::{options::*, types::FieldTable, BasicProperties, Channel, ExchangeKind};
use tracing::{debug, info, warn};

/// [`BroadcastTransport`] over a fanout exchange named after the channel.
///
/// The exchange is durable so it outlives broker restarts. Each subscription binds its
/// own exclusive, auto-deleted queue, so a payload reaches exactly the subscribers
/// connected when it is published and is never replayed.
pub struct AmqpBroadcast {
    session: AmqpSession,
    declared: DeclareCache,
}

impl AmqpBroadcast {
    pub fn new(session: AmqpSession) -> Self {
        AmqpBroadcast {
            session,
            declared: DeclareCache::default(),
        }
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.session.close().await
    }
}

fn exchange_options() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    }
}

async fn declare(channel: &Channel, exchange: &str) -> Result<(), TransportError> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Fanout,
            exchange_options(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| TransportError::ChannelError(format!("Failed to declare exchange: {}", e)))?;

    debug!(exchange, "Fanout exchange declared");
    Ok(())
}

#[async_trait]
impl BroadcastTransport for AmqpBroadcast {
    async fn publish(&self, channel_name: &str, payload: &[u8]) -> Result<(), TransportError> {
        let SessionChannel {
            channel,
            generation,
        } = self.session.channel().await?;
        if !self.declared.is_declared(generation, channel_name) {
            declare(&channel, channel_name).await?;
            self.declared.mark(generation, channel_name);
        }

        let confirmation = channel
            .basic_publish(
                channel_name,
                "",
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| TransportError::PublishError(e.to_string()))?
            .await
            .map_err(|e| TransportError::PublishError(e.to_string()))?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(TransportError::PublishError(format!(
                "broker rejected broadcast on {}",
                channel_name
            )));
        }

        Ok(())
    }

    async fn subscribe(&self, channel_name: &str) -> Result<BroadcastStream, TransportError> {
        let channel = self.session.open_channel().await?;
        declare(&channel, channel_name).await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::ChannelError(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                queue.name().as_str(),
                channel_name,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::ChannelError(format!("Failed to bind queue: {}", e)))?;

        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::ConsumeError(e.to_string()))?;

        info!(channel = channel_name, queue = queue.name().as_str(), "Subscribed");

        let channel_name = channel_name.to_string();
        let messages = consumer
            .filter_map(move |delivery| {
                let payload = match delivery {
                    Ok(delivery) => Some(delivery.data),
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "Broadcast delivery failed");
                        None
                    }
                };
                futures::future::ready(payload)
            })
            .boxed();

        Ok(messages)
    }
}
