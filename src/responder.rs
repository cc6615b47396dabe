// src/responder.rs
// Worker side of the bridge: consume requests, answer the fresh ones on the broadcast.

use crate::backoff::Backoff;
use crate::errors::ServiceError;
use crate::message::{InquiryRequest, InquiryResponse, StalenessWindow};
use crate::payload::{DelayRange, PayloadGenerator};
use crate::transport::{BroadcastTransport, QueueEntry, QueueStream, QueueTransport};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How inbound requests are scheduled.
///
/// `Concurrent` spawns one task per request: higher throughput, completion order is
/// not preserved, and a burst spawns as many tasks as it has requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumeMode {
    #[serde(rename = "sync")]
    Sequential,
    #[default]
    #[serde(rename = "async")]
    Concurrent,
}

impl FromStr for ConsumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" | "sequential" => Ok(ConsumeMode::Sequential),
            "async" | "concurrent" => Ok(ConsumeMode::Concurrent),
            other => Err(format!("unknown consume mode {:?}, expected sync or async", other)),
        }
    }
}

impl fmt::Display for ConsumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumeMode::Sequential => f.write_str("sync"),
            ConsumeMode::Concurrent => f.write_str("async"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResponderOptions {
    pub queue: String,
    pub consumer_group: String,
    /// Broadcast channel results are published on.
    pub channel: String,
    pub staleness: StalenessWindow,
    pub delay: DelayRange,
    pub mode: ConsumeMode,
    /// Wait between attempts to consume again after the request stream ended.
    pub resubscribe: Backoff,
}

/// What became of one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    Published,
    /// Issued too long ago; nobody is waiting for it anymore.
    Stale,
    /// The result was lost on the way to the broadcast channel.
    PublishFailed,
}

pub struct Responder {
    options: ResponderOptions,
    broadcast: Arc<dyn BroadcastTransport>,
    generator: Arc<dyn PayloadGenerator>,
}

impl Responder {
    pub fn new(
        options: ResponderOptions,
        broadcast: Arc<dyn BroadcastTransport>,
        generator: Arc<dyn PayloadGenerator>,
    ) -> Self {
        Responder {
            options,
            broadcast,
            generator,
        }
    }

    pub fn options(&self) -> &ResponderOptions {
        &self.options
    }

    /// Answers one request. Duplicates are answered again; callers tolerate that.
    pub async fn handle(&self, request: InquiryRequest) -> HandleOutcome {
        let now = Utc::now();
        if !self.options.staleness.is_fresh_at(request.issued_at, now) {
            debug!(id = %request.id, issued_at = %request.issued_at, "SKIP request: too long ago");
            return HandleOutcome::Stale;
        }

        let quote = self.generator.quote(&request);
        let response = InquiryResponse::answer(&request, quote, now);
        let payload = match response.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(id = %request.id, error = %e, "Failed to serialize result");
                return HandleOutcome::PublishFailed;
            }
        };

        if let Some(delay) = self.options.delay.sample() {
            debug!(id = %request.id, delay = ?delay, "Delaying result");
            tokio::time::sleep(delay).await;
        }

        match self.broadcast.publish(&self.options.channel, &payload).await {
            Ok(()) => {
                info!(id = %request.id, channel = %self.options.channel, "Result published");
                HandleOutcome::Published
            }
            Err(e) => {
                // the requester's timeout covers the lost result
                warn!(id = %request.id, error = %e, "Broadcast maybe too busy, result dropped");
                HandleOutcome::PublishFailed
            }
        }
    }

    /// Consumes the request queue for as long as the future is polled.
    ///
    /// Only a failure of the initial consume is returned. When an established stream
    /// ends (channel or connection lost) the queue is consumed again after a backoff.
    pub async fn run(self: Arc<Self>, queue: Arc<dyn QueueTransport>) -> Result<(), ServiceError> {
        let mut entries = queue
            .consume(&self.options.queue, &self.options.consumer_group)
            .await
            .map_err(|source| ServiceError::Consume {
                topic: self.options.queue.clone(),
                source,
            })?;

        info!(
            queue = %self.options.queue,
            group = %self.options.consumer_group,
            mode = %self.options.mode,
            "Listening now..."
        );

        loop {
            self.drain(&mut entries).await;
            warn!(queue = %self.options.queue, "Request stream ended, consuming again");
            entries = self.reconsume(queue.as_ref()).await;
        }
    }

    async fn drain(self: &Arc<Self>, entries: &mut QueueStream) {
        while let Some(entry) = entries.next().await {
            match entry {
                Ok(entry) => match self.options.mode {
                    ConsumeMode::Sequential => self.process(entry).await,
                    ConsumeMode::Concurrent => {
                        let responder = self.clone();
                        tokio::spawn(async move { responder.process(entry).await });
                    }
                },
                Err(e) => error!(queue = %self.options.queue, error = %e, "Consumer error"),
            }
        }
    }

    async fn reconsume(&self, queue: &dyn QueueTransport) -> QueueStream {
        let mut attempt = 0;
        loop {
            tokio::time::sleep(self.options.resubscribe.delay(attempt)).await;

            match queue
                .consume(&self.options.queue, &self.options.consumer_group)
                .await
            {
                Ok(entries) => {
                    info!(queue = %self.options.queue, attempt, "Consuming again");
                    return entries;
                }
                Err(e) => {
                    error!(queue = %self.options.queue, attempt, error = %e, "Consume failed, retrying");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn process(&self, mut entry: Box<dyn QueueEntry>) {
        let request = match InquiryRequest::decode(entry.payload()) {
            Ok(request) => request,
            Err(e) => {
                error!(
                    delivery_tag = entry.metadata().delivery_tag,
                    error = %e,
                    "Failed to deserialize request"
                );
                if let Err(e) = entry.reject().await {
                    error!(error = %e, "Failed to reject request");
                }
                return;
            }
        };

        if entry.metadata().redelivered {
            debug!(id = %request.id, "Processing redelivered request");
        }

        let id = request.id.clone();
        let outcome = self.handle(request).await;
        debug!(id = %id, outcome = ?outcome, "Request handled");

        // acknowledged whatever the outcome: retrying cannot help a stale or lost result
        if let Err(e) = entry.acknowledge().await {
            error!(id = %id, error = %e, "Failed to acknowledge request");
        }
    }
}
