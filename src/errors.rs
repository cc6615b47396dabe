// src/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

/// Failure of one of the external transports (work queue or broadcast exchange).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connection error: {0}")]
    ConnectionError(String),

    #[error("transport channel error: {0}")]
    ChannelError(String),

    #[error("transport publish error: {0}")]
    PublishError(String),

    #[error("transport consume error: {0}")]
    ConsumeError(String),

    #[error("transport acknowledge error: {0}")]
    AckError(String),

    #[error("transport closed")]
    Closed,
}

// Converting from lapin errors
impl From<LapinError> for TransportError {
    fn from(error: LapinError) -> Self {
        // lapin does not expose a stable classification, so go by the rendered text
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") {
            TransportError::ConnectionError(error_text)
        } else if lowered.contains("channel") {
            TransportError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            TransportError::PublishError(error_text)
        } else if lowered.contains("consume") {
            TransportError::ConsumeError(error_text)
        } else if lowered.contains("ack") {
            TransportError::AckError(error_text)
        } else {
            TransportError::ChannelError(error_text)
        }
    }
}

/// Outcome of a failed [`Requester::issue`](crate::requester::Requester::issue) call.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The work queue did not accept the request.
    #[error("dispatch of request {id} failed")]
    Dispatch {
        id: String,
        #[source]
        source: TransportError,
    },

    /// No result arrived within the wait window.
    #[error("no result for request {id} within {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    /// A later registration under the same ID replaced this waiter.
    #[error("waiter for request {0} was superseded by a newer registration")]
    Superseded(String),

    #[error("request serialization error: {0}")]
    Serialization(#[from] SerdeError),
}

impl RequestError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Timeout { .. })
    }

    pub fn is_dispatch(&self) -> bool {
        matches!(self, RequestError::Dispatch { .. })
    }
}

/// Setup failures of the long-running consume and subscribe loops.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unable to consume from queue {topic}")]
    Consume {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("unable to subscribe to channel {channel}")]
    Subscribe {
        channel: String,
        #[source]
        source: TransportError,
    },
}

pub type Result<T> = std::result::Result<T, TransportError>;
