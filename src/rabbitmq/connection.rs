// src/rabbitmq/connection.rs

use crate::backoff::{Backoff, MAX_DELAY};
use crate::errors::TransportError;
use lapin::options::ConfirmSelectOptions;
use lapin::{Channel, Connection, ConnectionProperties, Error as LapinError};
use std::collections::HashSet;
use std::sync::{Mutex as SyncMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info};

pub struct ConnectionManager {
    uri: String,
    connection: Option<Connection>,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
    backoff: Backoff,
}

impl ConnectionManager {
    pub fn new(uri: &str) -> Self {
        ConnectionManager {
            uri: uri.to_string(),
            connection: None,
            reconnect_attempts: 0,
            max_reconnect_attempts: 10,
            backoff: Backoff::default(),
        }
    }

    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_reconnect_attempts = max_attempts.max(1);
        self.backoff = Backoff::new(Duration::from_millis(initial_delay_ms), MAX_DELAY);
        self
    }

    pub async fn get_connection(&mut self) -> Result<&Connection, LapinError> {
        let conn = match self.connection.take() {
            Some(conn) if conn.status().connected() => conn,
            _ => self.establish_connection().await?,
        };

        Ok(self.connection.insert(conn))
    }

    async fn establish_connection(&mut self) -> Result<Connection, LapinError> {
        self.reconnect_attempts = 0;

        loop {
            info!(uri = %redact(&self.uri), "Connecting to RabbitMQ");

            match Connection::connect(&self.uri, ConnectionProperties::default()).await {
                Ok(conn) => {
                    info!("Connected to RabbitMQ");
                    return Ok(conn);
                }
                Err(err) => {
                    self.reconnect_attempts += 1;
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {:?}",
                        self.reconnect_attempts, self.max_reconnect_attempts, err
                    );

                    if self.reconnect_attempts >= self.max_reconnect_attempts {
                        error!("Max reconnection attempts reached. Giving up.");
                        return Err(err);
                    }

                    let wait = self.backoff.delay(self.reconnect_attempts - 1);
                    info!("Waiting {:?} before next reconnect attempt", wait);
                    sleep(wait).await;
                }
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), LapinError> {
        if let Some(conn) = self.connection.take() {
            info!("Closing RabbitMQ connection");
            conn.close(0, "Closing connection").await?;
        }
        Ok(())
    }
}

/// Strips credentials from an AMQP URI before it is logged.
fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &uri[..scheme_end], &uri[at..])
        }
        _ => uri.to_string(),
    }
}

/// A shared channel together with the generation it was opened in.
///
/// The generation changes whenever the session has to open a replacement channel,
/// e.g. after the broker closed the previous one or the connection was re-established.
#[derive(Clone)]
pub struct SessionChannel {
    pub channel: Channel,
    pub generation: u64,
}

struct ChannelSlot {
    current: Option<Channel>,
    generation: u64,
}

/// A connection plus one lazily (re)created channel in publisher-confirm mode.
pub struct AmqpSession {
    manager: Mutex<ConnectionManager>,
    slot: Mutex<ChannelSlot>,
}

impl AmqpSession {
    pub fn new(manager: ConnectionManager) -> Self {
        AmqpSession {
            manager: Mutex::new(manager),
            slot: Mutex::new(ChannelSlot {
                current: None,
                generation: 0,
            }),
        }
    }

    /// Returns the cached channel, reconnecting if it went away.
    pub async fn channel(&self) -> Result<SessionChannel, TransportError> {
        let mut slot = self.slot.lock().await;
        if let Some(channel) = slot.current.as_ref() {
            if channel.status().connected() {
                return Ok(SessionChannel {
                    channel: channel.clone(),
                    generation: slot.generation,
                });
            }
        }

        let channel = self.open_channel().await?;
        slot.generation += 1;
        slot.current = Some(channel.clone());
        debug!(generation = slot.generation, "Opened shared channel");

        Ok(SessionChannel {
            channel,
            generation: slot.generation,
        })
    }

    /// Opens a channel that is not shared with other users of the session.
    pub async fn open_channel(&self) -> Result<Channel, TransportError> {
        let mut manager = self.manager.lock().await;
        let connection = manager
            .get_connection()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::ChannelError(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                TransportError::ChannelError(format!("Failed to enable publisher confirms: {}", e))
            })?;

        Ok(channel)
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        if let Some(channel) = self.slot.lock().await.current.take() {
            channel
                .close(0, "Closing session")
                .await
                .map_err(|e| TransportError::ChannelError(e.to_string()))?;
        }

        self.manager
            .lock()
            .await
            .close()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }
}

/// Names of queues and exchanges already declared on the current shared channel.
///
/// Entries only count for the generation they were recorded in, so everything is
/// declared again on a replacement channel (the broker may have lost it meanwhile).
#[derive(Default)]
pub struct DeclareCache {
    inner: SyncMutex<(u64, HashSet<String>)>,
}

impl DeclareCache {
    pub fn is_declared(&self, generation: u64, name: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.0 == generation && inner.1.contains(name)
    }

    pub fn mark(&self, generation: u64, name: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.0 != generation {
            inner.0 = generation;
            inner.1.clear();
        }
        inner.1.insert(name.to_string());
    }
}
