//! Request/response bridge over a durable work queue and a broadcast channel.
//!
//! A [`Requester`](requester::Requester) turns the asynchronous exchange into a call that
//! blocks until the matching result arrives or a deadline expires. A
//! [`Responder`](responder::Responder) consumes the queued requests and broadcasts results.
//! The two transports stay distinct: the queue is at-least-once, the broadcast best-effort.

pub mod backoff;
pub mod config;
pub mod correlation;
pub mod errors;
pub mod message;
pub mod payload;
pub mod rabbitmq;
pub mod requester;
pub mod responder;
pub mod transport;

pub use correlation::{CorrelationRegistry, WaiterHandle};
pub use errors::{RequestError, ServiceError, TransportError};
pub use message::{InquiryRequest, InquiryResponse, StalenessWindow};
pub use requester::{Requester, RequesterOptions};
pub use responder::{ConsumeMode, HandleOutcome, Responder, ResponderOptions};
