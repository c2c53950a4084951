// Publish failure taxonomy surfaced to callers and the error observer.
use std::sync::Arc;
use std::time::Duration;

use crate::client::{CorrelationToken, PublishRequest};

pub const CODE_BACKPRESSURE_TIMEOUT: u16 = 1;
pub const CODE_ACK_TIMEOUT: u16 = 2;
pub const CODE_TRANSPORT: u16 = 3;
pub const CODE_CLOSED: u16 = 4;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The pending window stayed full for longer than the stall wait.
    #[error("pending window full ({max_pending} in flight) for {waited:?}")]
    BackpressureTimeout { max_pending: usize, waited: Duration },
    /// No ack or error arrived before the deadline. The request may still resolve later.
    #[error("no acknowledgement for request {token} within {timeout:?}")]
    AckTimeout {
        token: CorrelationToken,
        timeout: Duration,
    },
    #[error("broker rejected publish ({code}): {text}")]
    BrokerRejected { code: u16, text: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("publisher closed")]
    Closed,
}

impl PublishError {
    /// Broker error code for rejections, fixed client codes otherwise.
    pub fn code(&self) -> u16 {
        match self {
            PublishError::BackpressureTimeout { .. } => CODE_BACKPRESSURE_TIMEOUT,
            PublishError::AckTimeout { .. } => CODE_ACK_TIMEOUT,
            PublishError::BrokerRejected { code, .. } => *code,
            PublishError::Transport(_) => CODE_TRANSPORT,
            PublishError::Closed => CODE_CLOSED,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PublishError::BackpressureTimeout { .. } | PublishError::AckTimeout { .. }
        )
    }

    pub(crate) fn result_label(&self) -> &'static str {
        match self {
            PublishError::BackpressureTimeout { .. } => "backpressure_timeout",
            PublishError::AckTimeout { .. } => "ack_timeout",
            PublishError::BrokerRejected { .. } => "rejected",
            PublishError::Transport(_) => "transport",
            PublishError::Closed => "closed",
        }
    }
}

impl From<felix_broker::BrokerError> for PublishError {
    fn from(err: felix_broker::BrokerError) -> Self {
        PublishError::BrokerRejected {
            code: err.code(),
            text: err.to_string(),
        }
    }
}

/// A failed asynchronous publish as seen by the error observer.
#[derive(Debug, Clone)]
pub struct FailedPublish {
    pub request: Arc<PublishRequest>,
    pub error: PublishError,
}

/// Callback invoked for every failed asynchronous publish.
pub type ErrorHandler = Arc<dyn Fn(FailedPublish) + Send + Sync>;

/// Requests still unresolved when a drain gave up. They remain pending.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{} publishes still pending", .requests.len())]
pub struct StillPending {
    pub requests: Vec<Arc<PublishRequest>>,
}

impl StillPending {
    pub fn tokens(&self) -> Vec<CorrelationToken> {
        self.requests.iter().map(|request| request.token).collect()
    }
}
