// End-to-end behaviour of requester and responder over the in-memory transports.

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use rabbit_bridge::backoff::Backoff;
use rabbit_bridge::message::{Quote, Subject};
use rabbit_bridge::payload::{DelayRange, PayloadGenerator};
use rabbit_bridge::transport::{
    BroadcastTransport, InMemoryBroadcast, InMemoryQueue, QueueStream, QueueTransport,
};
use rabbit_bridge::{
    ConsumeMode, CorrelationRegistry, InquiryRequest, InquiryResponse, RequestError, Requester,
    RequesterOptions, Responder, ResponderOptions, StalenessWindow, TransportError,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const QUEUE: &str = "inquiry-request";
const CHANNEL: &str = "inquiry-response";

fn backoff() -> Backoff {
    Backoff::new(Duration::from_millis(10), Duration::from_millis(100))
}

/// Names the subject after the request and quotes a fixed amount.
struct Scripted;

impl PayloadGenerator for Scripted {
    fn subject(&self) -> Subject {
        Subject {
            name: "Barbara Liskov".to_string(),
            date: "1939-11-07".to_string(),
        }
    }

    fn quote(&self, request: &InquiryRequest) -> Quote {
        Quote {
            currency: format!("X-{}", request.id),
            amount: 42.5,
        }
    }
}

/// Delivers every entry twice, like a broker redelivering after a lost ack.
struct Duplicating(Arc<InMemoryQueue>);

#[async_trait]
impl QueueTransport for Duplicating {
    async fn enqueue(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.0.enqueue(topic, key, payload).await?;
        self.0.enqueue(topic, key, payload).await
    }

    async fn consume(&self, topic: &str, group: &str) -> Result<QueueStream, TransportError> {
        self.0.consume(topic, group).await
    }
}

struct Harness {
    queue: Arc<InMemoryQueue>,
    broadcast: Arc<InMemoryBroadcast>,
    registry: Arc<CorrelationRegistry>,
    requester: Arc<Requester>,
}

fn requester_options(timeout: Duration) -> RequesterOptions {
    RequesterOptions {
        queue: QUEUE.to_string(),
        channel: CHANNEL.to_string(),
        timeout,
        staleness: StalenessWindow::new(Duration::from_secs(10)),
        resubscribe: backoff(),
    }
}

fn responder_options(mode: ConsumeMode, delay: DelayRange) -> ResponderOptions {
    ResponderOptions {
        queue: QUEUE.to_string(),
        consumer_group: "responders".to_string(),
        channel: CHANNEL.to_string(),
        staleness: StalenessWindow::new(Duration::from_secs(10)),
        delay,
        mode,
        resubscribe: backoff(),
    }
}

async fn harness_with_queue(
    timeout: Duration,
    dispatch: Arc<dyn QueueTransport>,
    queue: Arc<InMemoryQueue>,
) -> Harness {
    let broadcast = Arc::new(InMemoryBroadcast::new());
    let registry = Arc::new(CorrelationRegistry::new());
    let requester = Requester::start(
        requester_options(timeout),
        registry.clone(),
        dispatch,
        broadcast.clone(),
        Arc::new(Scripted),
    )
    .await
    .unwrap();

    Harness {
        queue,
        broadcast,
        registry,
        requester: Arc::new(requester),
    }
}

async fn harness(timeout: Duration) -> Harness {
    let queue = Arc::new(InMemoryQueue::new());
    harness_with_queue(timeout, queue.clone(), queue).await
}

impl Harness {
    fn spawn_responder(&self, mode: ConsumeMode, delay: DelayRange) -> JoinHandle<()> {
        let responder = Arc::new(Responder::new(
            responder_options(mode, delay),
            self.broadcast.clone(),
            Arc::new(Scripted),
        ));
        let queue: Arc<dyn QueueTransport> = self.queue.clone();
        tokio::spawn(async move {
            responder.run(queue).await.unwrap();
        })
    }
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn answered_request_returns_matching_result() {
    let h = harness(Duration::from_secs(10)).await;
    let responder = h.spawn_responder(
        ConsumeMode::Concurrent,
        DelayRange::new(Duration::from_millis(100), Duration::from_millis(300)),
    );

    let response = h.requester.inquire("u1").await.unwrap();

    assert_eq!(response.id, "u1");
    assert_eq!(response.name, "Barbara Liskov");
    assert_eq!(response.currency, "X-u1");
    assert_eq!(response.amount, 42.5);
    assert!(h.registry.is_empty());
    responder.abort();
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_no_earlier_than_the_deadline() {
    let timeout = Duration::from_secs(10);
    let h = harness(timeout).await;

    let started = tokio::time::Instant::now();
    let err = h.requester.inquire("u2").await.unwrap_err();

    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(started.elapsed() >= timeout);
    // the abandoned waiter does not linger
    assert!(!h.registry.is_waiting("u2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_receive_only_their_own_results() {
    let h = harness(Duration::from_secs(10)).await;
    let responder = h.spawn_responder(
        ConsumeMode::Concurrent,
        DelayRange::new(Duration::from_millis(10), Duration::from_millis(200)),
    );

    let (u3, u4) = tokio::join!(h.requester.inquire("u3"), h.requester.inquire("u4"));

    let (u3, u4) = (u3.unwrap(), u4.unwrap());
    assert_eq!(u3.id, "u3");
    assert_eq!(u3.currency, "X-u3");
    assert_eq!(u4.id, "u4");
    assert_eq!(u4.currency, "X-u4");
    responder.abort();
}

#[tokio::test(start_paused = true)]
async fn stale_result_is_dropped_and_the_call_times_out() {
    let h = harness(Duration::from_secs(10)).await;

    let registry = h.registry.clone();
    let broadcast = h.broadcast.clone();
    let publisher = tokio::spawn(async move {
        eventually(|| registry.is_waiting("u5")).await;
        let request = InquiryRequest::new(
            "u5",
            Subject {
                name: "n".to_string(),
                date: "d".to_string(),
            },
        );
        let produced_at = Utc::now() - TimeDelta::seconds(15);
        let stale = InquiryResponse::answer(
            &request,
            Quote {
                currency: "EUR".to_string(),
                amount: 1.0,
            },
            produced_at,
        );
        broadcast
            .publish(CHANNEL, &stale.encode().unwrap())
            .await
            .unwrap();
    });

    let err = h.requester.inquire("u5").await.unwrap_err();
    publisher.await.unwrap();

    assert!(err.is_timeout(), "unexpected error: {err}");
    assert_eq!(h.broadcast.published(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_delivery_is_answered_twice_and_accepted_once() {
    let queue = Arc::new(InMemoryQueue::new());
    let dispatch: Arc<dyn QueueTransport> = Arc::new(Duplicating(queue.clone()));
    let h = harness_with_queue(Duration::from_secs(10), dispatch, queue).await;
    let responder = h.spawn_responder(ConsumeMode::Sequential, DelayRange::none());

    let response = h.requester.inquire("u6").await.unwrap();
    assert_eq!(response.id, "u6");

    // the second result finds nobody waiting
    let broadcast = h.broadcast.clone();
    eventually(|| broadcast.published() == 2).await;
    let queue = h.queue.clone();
    eventually(|| queue.acknowledged() == 2).await;
    assert!(h.registry.is_empty());
    assert!(h.requester.is_listening());
    responder.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatch_failure_is_reported_without_waiting() {
    let h = harness(Duration::from_secs(10)).await;
    h.queue.set_failing(true);

    let started = Instant::now();
    let err = h.requester.inquire("u7").await.unwrap_err();

    assert!(err.is_dispatch(), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(h.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_result_is_handled_by_the_timeout() {
    let h = harness(Duration::from_millis(300)).await;
    h.broadcast.set_failing(true);
    let responder = h.spawn_responder(ConsumeMode::Sequential, DelayRange::none());

    let err = h.requester.inquire("u8").await.unwrap_err();

    assert!(err.is_timeout(), "unexpected error: {err}");
    // the request was still consumed and acknowledged
    let queue = h.queue.clone();
    eventually(|| queue.acknowledged() == 1).await;
    responder.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_result_after_timeout_is_harmless() {
    let h = harness(Duration::from_millis(100)).await;
    let responder = h.spawn_responder(
        ConsumeMode::Concurrent,
        DelayRange::new(Duration::from_millis(300), Duration::from_millis(301)),
    );

    let err = h.requester.inquire("u9").await.unwrap_err();
    assert!(err.is_timeout());

    let broadcast = h.broadcast.clone();
    eventually(|| broadcast.published() == 1).await;
    assert!(h.registry.is_empty());
    assert!(h.requester.is_listening());

    // the requester keeps working afterwards
    let err = h.requester.inquire("u10").await.unwrap_err();
    assert!(err.is_timeout());
    responder.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_request_is_not_answered() {
    let h = harness(Duration::from_millis(300)).await;
    let responder = h.spawn_responder(ConsumeMode::Sequential, DelayRange::none());

    let mut request = InquiryRequest::new("old", Scripted.subject());
    request.issued_at = Utc::now() - TimeDelta::seconds(30);
    let err = h.requester.issue(request).await.unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(h.broadcast.published(), 0);
    responder.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undecodable_request_is_rejected() {
    let h = harness(Duration::from_secs(1)).await;
    let responder = h.spawn_responder(ConsumeMode::Sequential, DelayRange::none());

    h.queue.enqueue(QUEUE, "junk", b"not json").await.unwrap();
    let queue = h.queue.clone();
    eventually(|| queue.rejected() == 1).await;

    // and the loop carries on
    let response = h.requester.inquire("u11").await.unwrap();
    assert_eq!(response.id, "u11");
    responder.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reusing_an_in_flight_id_supersedes_the_first_call() {
    let h = harness(Duration::from_secs(2)).await;

    let first = {
        let requester = h.requester.clone();
        tokio::spawn(async move { requester.inquire("dup").await })
    };
    let registry = h.registry.clone();
    eventually(|| registry.is_waiting("dup")).await;

    let second = {
        let requester = h.requester.clone();
        tokio::spawn(async move { requester.inquire("dup").await })
    };

    let first = first.await.unwrap();
    assert!(matches!(first, Err(RequestError::Superseded(ref id)) if id == "dup"));

    let responder = h.spawn_responder(ConsumeMode::Sequential, DelayRange::none());
    let second = second.await.unwrap().unwrap();
    assert_eq!(second.id, "dup");
    responder.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requester_recovers_after_losing_the_result_subscription() {
    let h = harness(Duration::from_secs(5)).await;
    let responder = h.spawn_responder(ConsumeMode::Sequential, DelayRange::none());

    h.broadcast.close(CHANNEL);
    let broadcast = h.broadcast.clone();
    eventually(|| broadcast.subscriber_count(CHANNEL) == 1).await;

    let response = h.requester.inquire("u12").await.unwrap();
    assert_eq!(response.id, "u12");
    assert!(h.requester.is_listening());
    responder.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn responder_keeps_serving_after_losing_the_request_queue() {
    let h = harness(Duration::from_secs(5)).await;
    let responder = h.spawn_responder(ConsumeMode::Concurrent, DelayRange::none());

    let response = h.requester.inquire("u13").await.unwrap();
    assert_eq!(response.id, "u13");

    h.queue.close(QUEUE);

    let response = h.requester.inquire("u14").await.unwrap();
    assert_eq!(response.id, "u14");
    assert!(!responder.is_finished());
    responder.abort();
}
