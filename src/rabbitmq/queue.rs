// src/rabbitmq/queue.rs
// Durable work queue on a RabbitMQ classic queue.

use super::connection::{AmqpSession, DeclareCache, SessionChannel};
use crate::errors::TransportError;
use crate::transport::{DeliveryMetadata, QueueEntry, QueueStream, QueueTransport};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::publisher_confirm::Confirmation;
use lapin::{options::*, types::FieldTable, BasicProperties, Channel};
use tracing::{debug, info};
use uuid::Uuid;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// [`QueueTransport`] over a durable RabbitMQ queue.
///
/// The topic is the queue name. Requests are published persistent with publisher
/// confirms; consumers acknowledge manually, so unacknowledged requests are redelivered.
/// Every consumer of a queue belongs to the same competing group; the group name only
/// prefixes the consumer tag.
pub struct AmqpQueue {
    session: AmqpSession,
    prefetch_count: u16,
    declared: DeclareCache,
}

impl AmqpQueue {
    pub fn new(session: AmqpSession, prefetch_count: u16) -> Self {
        AmqpQueue {
            session,
            prefetch_count,
            declared: DeclareCache::default(),
        }
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.session.close().await
    }
}

fn queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

async fn declare(channel: &Channel, topic: &str) -> Result<(), TransportError> {
    channel
        .queue_declare(topic, queue_options(), FieldTable::default())
        .await
        .map_err(|e| TransportError::ChannelError(format!("Failed to declare queue: {}", e)))?;

    debug!(queue = topic, "Queue declared");
    Ok(())
}

#[async_trait]
impl QueueTransport for AmqpQueue {
    async fn enqueue(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TransportError> {
        let SessionChannel {
            channel,
            generation,
        } = self.session.channel().await?;
        if !self.declared.is_declared(generation, topic) {
            declare(&channel, topic).await?;
            self.declared.mark(generation, topic);
        }

        let properties = BasicProperties::default()
            .with_message_id(key.to_string().into())
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);

        let confirmation = channel
            .basic_publish(
                "",
                topic,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| TransportError::PublishError(e.to_string()))?
            .await
            .map_err(|e| TransportError::PublishError(e.to_string()))?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(TransportError::PublishError(format!(
                "broker rejected entry {} on queue {}",
                key, topic
            )));
        }

        Ok(())
    }

    async fn consume(&self, topic: &str, group: &str) -> Result<QueueStream, TransportError> {
        // dedicated channel, so prefetch applies to this consumer only
        let channel = self.session.open_channel().await?;
        declare(&channel, topic).await?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::ChannelError(format!("Failed to set QoS: {}", e)))?;

        let consumer = channel
            .basic_consume(
                topic,
                &format!("{}-{}", group, Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::ConsumeError(e.to_string()))?;

        info!(queue = topic, group, "Started consuming");

        let topic = topic.to_string();
        let entries = consumer
            .map(move |delivery| {
                delivery
                    .map(|delivery| Box::new(AmqpEntry::new(&topic, delivery)) as Box<dyn QueueEntry>)
                    .map_err(|e| TransportError::ConsumeError(e.to_string()))
            })
            .boxed();

        Ok(entries)
    }
}

struct AmqpEntry {
    delivery: Delivery,
    metadata: DeliveryMetadata,
}

impl AmqpEntry {
    fn new(topic: &str, delivery: Delivery) -> Self {
        let metadata = DeliveryMetadata {
            topic: topic.to_string(),
            key: delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.as_str().to_string()),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        };

        AmqpEntry { delivery, metadata }
    }
}

#[async_trait]
impl QueueEntry for AmqpEntry {
    fn payload(&self) -> &[u8] {
        &self.delivery.data
    }

    fn metadata(&self) -> &DeliveryMetadata {
        &self.metadata
    }

    async fn acknowledge(&mut self) -> Result<(), TransportError> {
        self.delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::AckError(e.to_string()))
    }

    async fn reject(&mut self) -> Result<(), TransportError> {
        self.delivery
            .acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| TransportError::AckError(e.to_string()))
    }
}
