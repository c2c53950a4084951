// Publish requests, correlation tokens, and the pipeline built on them.
use bytes::Bytes;
use felix_wire::Expectations;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod correlator;
pub mod publisher;
pub mod window;

/// Opaque identifier matching an outgoing publish to its acknowledgement.
///
/// Tokens are unique per publisher and never reused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CorrelationToken(u64);

impl CorrelationToken {
    /// Wrap a raw token, e.g. a `request_id` read off the wire.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic token source. Starts at 1 so that 0 never names a live request.
#[derive(Debug)]
pub(crate) struct TokenSource(AtomicU64);

impl TokenSource {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn mint(&self) -> CorrelationToken {
        CorrelationToken(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// An accepted publish. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub token: CorrelationToken,
    pub subject: String,
    pub payload: Bytes,
    pub expectations: Expectations,
}

impl PublishRequest {
    pub(crate) fn new(
        token: CorrelationToken,
        subject: impl Into<String>,
        payload: Bytes,
        expectations: Expectations,
    ) -> Self {
        Self {
            token,
            subject: subject.into(),
            payload,
            expectations,
        }
    }

    /// The wire message carrying this request.
    pub fn to_message(&self) -> felix_wire::Message {
        felix_wire::Message::Publish {
            subject: self.subject.clone(),
            payload: self.payload.to_vec(),
            request_id: self.token.as_u64(),
            expect: self.expectations.clone(),
        }
    }
}
