// src/requester.rs
// Synchronous-looking inquiry calls over the work queue and the result broadcast.

use crate::backoff::Backoff;
use crate::correlation::{CorrelationRegistry, WaiterClosed, WaiterToken};
use crate::errors::{RequestError, ServiceError};
use crate::message::{InquiryRequest, InquiryResponse, StalenessWindow};
use crate::payload::PayloadGenerator;
use crate::transport::{BroadcastStream, BroadcastTransport, QueueTransport};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct RequesterOptions {
    /// Work queue requests are dispatched to.
    pub queue: String,
    /// Broadcast channel results arrive on.
    pub channel: String,
    /// Upper bound for one `issue` call, dispatch included.
    pub timeout: Duration,
    pub staleness: StalenessWindow,
    /// Wait between attempts to subscribe again after the result subscription ended.
    pub resubscribe: Backoff,
}

/// Front side of the bridge.
///
/// Each call registers a waiter, dispatches its request and blocks until the matching
/// result arrives or the timeout fires. One background listener per requester feeds
/// results from the broadcast channel into the registry.
pub struct Requester {
    options: RequesterOptions,
    registry: Arc<CorrelationRegistry>,
    queue: Arc<dyn QueueTransport>,
    generator: Arc<dyn PayloadGenerator>,
    listener: JoinHandle<()>,
}

impl Requester {
    /// Subscribes to the result channel and spawns the listener.
    ///
    /// Returns only after the subscription is live, so no result published afterwards
    /// is missed. The listener subscribes again whenever the subscription ends.
    pub async fn start(
        options: RequesterOptions,
        registry: Arc<CorrelationRegistry>,
        queue: Arc<dyn QueueTransport>,
        broadcast: Arc<dyn BroadcastTransport>,
        generator: Arc<dyn PayloadGenerator>,
    ) -> Result<Self, ServiceError> {
        let results = broadcast
            .subscribe(&options.channel)
            .await
            .map_err(|source| ServiceError::Subscribe {
                channel: options.channel.clone(),
                source,
            })?;

        let listener = tokio::spawn(follow(
            registry.clone(),
            broadcast,
            results,
            options.clone(),
        ));

        Ok(Requester {
            options,
            registry,
            queue,
            generator,
            listener,
        })
    }

    pub fn options(&self) -> &RequesterOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    /// Whether the listener task is still alive.
    pub fn is_listening(&self) -> bool {
        !self.listener.is_finished()
    }

    /// Builds a request for `id` with synthesized fields and issues it.
    pub async fn inquire(&self, id: &str) -> Result<InquiryResponse, RequestError> {
        let request = InquiryRequest::new(id, self.generator.subject());
        self.issue(request).await
    }

    /// Dispatches `request` and waits for the result carrying the same ID.
    pub async fn issue(&self, request: InquiryRequest) -> Result<InquiryResponse, RequestError> {
        let deadline = Instant::now() + self.options.timeout;
        let id = request.id.clone();
        let payload = request.encode()?;

        let waiter = self.registry.register(&id);
        let token = waiter.token();

        debug!(id = %id, queue = %self.options.queue, "Dispatching request");
        match timeout_at(deadline, self.queue.enqueue(&self.options.queue, &id, &payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                error!(id = %id, error = %source, "Dispatch failed");
                self.registry.discard(&id, token);
                return Err(RequestError::Dispatch { id, source });
            }
            Err(_) => return Err(self.give_up(id, token)),
        }
        debug!(id = %id, "Request dispatched");

        match timeout_at(deadline, waiter.recv()).await {
            Ok(Ok(response)) => {
                info!(id = %id, amount = response.amount, "Result received");
                Ok(response)
            }
            Ok(Err(WaiterClosed)) => {
                warn!(id = %id, "Waiter superseded by a newer request with the same ID");
                Err(RequestError::Superseded(id))
            }
            Err(_) => Err(self.give_up(id, token)),
        }
    }

    fn give_up(&self, id: String, token: WaiterToken) -> RequestError {
        // a late result finds no waiter and is dropped by the listener
        self.registry.discard(&id, token);
        warn!(id = %id, timeout = ?self.options.timeout, "Too long waiting for result");
        RequestError::Timeout {
            id,
            timeout: self.options.timeout,
        }
    }
}

impl Drop for Requester {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Feeds results into the registry, subscribing again after every loss of the subscription.
///
/// Results published while no subscription is live are lost; their callers time out.
async fn follow(
    registry: Arc<CorrelationRegistry>,
    broadcast: Arc<dyn BroadcastTransport>,
    mut results: BroadcastStream,
    options: RequesterOptions,
) {
    loop {
        listen(
            registry.clone(),
            results,
            options.staleness,
            options.channel.clone(),
        )
        .await;
        results = resubscribe(broadcast.as_ref(), &options).await;
    }
}

async fn resubscribe(
    broadcast: &dyn BroadcastTransport,
    options: &RequesterOptions,
) -> BroadcastStream {
    let mut attempt = 0;
    loop {
        tokio::time::sleep(options.resubscribe.delay(attempt)).await;

        match broadcast.subscribe(&options.channel).await {
            Ok(results) => {
                info!(channel = %options.channel, attempt, "Subscribed again");
                return results;
            }
            Err(e) => {
                error!(channel = %options.channel, attempt, error = %e, "Subscribe failed, retrying");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Drains one result subscription into the registry until it ends.
pub async fn listen(
    registry: Arc<CorrelationRegistry>,
    mut results: BroadcastStream,
    staleness: StalenessWindow,
    channel: String,
) {
    info!(channel = %channel, "Listening for results");

    while let Some(payload) = results.next().await {
        let response = match InquiryResponse::decode(&payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Skipping undecodable result");
                continue;
            }
        };

        if !staleness.is_fresh(response.produced_at) {
            debug!(id = %response.id, produced_at = %response.produced_at, "SKIP result: too long ago");
            continue;
        }

        let id = response.id.clone();
        if registry.deliver(&id, response) {
            debug!(id = %id, "Result handed to waiter");
        } else {
            debug!(id = %id, "SKIP result: not relevant");
        }
    }

    warn!(channel = %channel, "Result subscription ended");
}
