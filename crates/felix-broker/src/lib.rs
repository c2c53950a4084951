// In-process persistent stream store.
// Streams own a set of subject patterns; a publish lands in the single stream
// bound to its subject, receives the next per-stream sequence number, and is
// checked against the caller's expectations (dedup id, expected stream,
// expected last sequence) before it is appended.
use bytes::Bytes;
use felix_wire::{Expectations, PublishAck};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod subject;

use subject::{is_valid_pattern, patterns_overlap, subject_matches};

pub type Result<T> = std::result::Result<T, BrokerError>;

pub const ERR_NO_STREAM: u16 = 503;
pub const ERR_MESSAGE_TOO_LARGE: u16 = 10054;
pub const ERR_STREAM_MISMATCH: u16 = 10060;
pub const ERR_WRONG_LAST_SEQUENCE: u16 = 10071;
pub const ERR_STREAM_ADMIN: u16 = 10058;

const DEFAULT_MAX_MESSAGES: usize = 1024;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
const DEFAULT_DUPLICATE_WINDOW: usize = 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("no stream matches subject {subject}")]
    NoStream { subject: String },
    #[error("expected stream {expected} does not match {actual}")]
    StreamMismatch { expected: String, actual: String },
    #[error("wrong last sequence: {actual}")]
    WrongLastSequence { expected: u64, actual: u64 },
    #[error("message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("stream already exists: {0}")]
    StreamExists(String),
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("subjects overlap with stream {stream}: {subject}")]
    SubjectOverlap { stream: String, subject: String },
    #[error("invalid stream config: {0}")]
    InvalidConfig(String),
}

impl BrokerError {
    /// Numeric code reported to publishers alongside the error text.
    pub fn code(&self) -> u16 {
        match self {
            BrokerError::NoStream { .. } => ERR_NO_STREAM,
            BrokerError::StreamMismatch { .. } => ERR_STREAM_MISMATCH,
            BrokerError::WrongLastSequence { .. } => ERR_WRONG_LAST_SEQUENCE,
            BrokerError::MessageTooLarge { .. } => ERR_MESSAGE_TOO_LARGE,
            BrokerError::StreamExists(_)
            | BrokerError::StreamNotFound(_)
            | BrokerError::SubjectOverlap { .. }
            | BrokerError::InvalidConfig(_) => ERR_STREAM_ADMIN,
        }
    }
}

/// Definition of a persistent stream.
///
/// ```
/// use felix_broker::StreamConfig;
///
/// let config = StreamConfig::new("ORDERS", ["orders.>"]).with_max_messages(16);
/// assert_eq!(config.subjects, vec!["orders.>".to_string()]);
/// assert_eq!(config.max_messages, 16);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    // Oldest messages are dropped once the log exceeds this count.
    pub max_messages: usize,
    pub max_message_bytes: usize,
    // Number of most recent dedup ids remembered per stream.
    pub duplicate_window: usize,
}

impl StreamConfig {
    pub fn new<I, S>(name: impl Into<String>, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            max_messages: DEFAULT_MAX_MESSAGES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
        }
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }

    pub fn with_duplicate_window(mut self, duplicate_window: usize) -> Self {
        self.duplicate_window = duplicate_window;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(['.', '*', '>', ' ']) {
            return Err(BrokerError::InvalidConfig(format!(
                "invalid stream name {:?}",
                self.name
            )));
        }
        if self.subjects.is_empty() {
            return Err(BrokerError::InvalidConfig(
                "stream needs at least one subject".to_string(),
            ));
        }
        if let Some(subject) = self.subjects.iter().find(|s| !is_valid_pattern(s)) {
            return Err(BrokerError::InvalidConfig(format!(
                "invalid subject {subject:?}"
            )));
        }
        if self.max_messages == 0 || self.max_message_bytes == 0 {
            return Err(BrokerError::InvalidConfig(
                "limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub subjects: Vec<String>,
    pub messages: usize,
    // Zero while the stream is empty.
    pub first_sequence: u64,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub sequence: u64,
    pub subject: String,
    pub payload: Bytes,
}

#[derive(Debug)]
struct StreamState {
    config: StreamConfig,
    log_state: Mutex<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    log: VecDeque<StoredMessage>,
    last_seq: u64,
    // msg id -> sequence it was first stored under.
    dedup: HashMap<String, u64>,
    dedup_order: VecDeque<String>,
}

impl StreamState {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            log_state: Mutex::new(LogState::default()),
        }
    }

    fn append(&self, subject: &str, payload: Bytes, expect: &Expectations) -> Result<PublishAck> {
        let mut state = self.log_state.lock();
        if let Some(msg_id) = expect.msg_id.as_deref()
            && let Some(sequence) = state.dedup.get(msg_id)
        {
            return Ok(PublishAck {
                stream: self.config.name.clone(),
                sequence: *sequence,
                duplicate: true,
            });
        }
        if let Some(expected) = expect.expected_last_sequence
            && expected != state.last_seq
        {
            return Err(BrokerError::WrongLastSequence {
                expected,
                actual: state.last_seq,
            });
        }

        let sequence = state.last_seq + 1;
        state.last_seq = sequence;
        state.log.push_back(StoredMessage {
            sequence,
            subject: subject.to_string(),
            payload,
        });
        let overflow = state.log.len().saturating_sub(self.config.max_messages);
        if overflow > 0 {
            state.log.drain(..overflow);
        }

        if let Some(msg_id) = expect.msg_id.as_ref()
            && self.config.duplicate_window > 0
        {
            state.dedup.insert(msg_id.clone(), sequence);
            state.dedup_order.push_back(msg_id.clone());
            while state.dedup_order.len() > self.config.duplicate_window {
                if let Some(expired) = state.dedup_order.pop_front() {
                    state.dedup.remove(&expired);
                }
            }
        }

        Ok(PublishAck {
            stream: self.config.name.clone(),
            sequence,
            duplicate: false,
        })
    }

    fn info(&self) -> StreamInfo {
        let state = self.log_state.lock();
        StreamInfo {
            name: self.config.name.clone(),
            subjects: self.config.subjects.clone(),
            messages: state.log.len(),
            first_sequence: state.log.front().map(|m| m.sequence).unwrap_or(0),
            last_sequence: state.last_seq,
        }
    }
}

/// Stream registry plus the publish entry point.
///
/// ```
/// use bytes::Bytes;
/// use felix_broker::{Broker, StreamConfig};
/// use felix_wire::Expectations;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = Broker::new();
///     broker
///         .add_stream(StreamConfig::new("ORDERS", ["orders.*"]))
///         .await
///         .expect("stream");
///     let ack = broker
///         .publish("orders.created", Bytes::from_static(b"1"), &Expectations::default())
///         .await
///         .expect("publish");
///     assert_eq!(ack.stream, "ORDERS");
///     assert_eq!(ack.sequence, 1);
/// });
/// ```
#[derive(Debug, Default)]
pub struct Broker {
    streams: RwLock<HashMap<String, Arc<StreamState>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        config.validate()?;
        let mut streams = self.streams.write().await;
        if streams.contains_key(&config.name) {
            return Err(BrokerError::StreamExists(config.name));
        }
        for existing in streams.values() {
            for subject in &config.subjects {
                if existing
                    .config
                    .subjects
                    .iter()
                    .any(|other| patterns_overlap(other, subject))
                {
                    return Err(BrokerError::SubjectOverlap {
                        stream: existing.config.name.clone(),
                        subject: subject.clone(),
                    });
                }
            }
        }
        tracing::debug!(stream = %config.name, subjects = ?config.subjects, "stream added");
        let state = Arc::new(StreamState::new(config));
        let info = state.info();
        streams.insert(info.name.clone(), state);
        Ok(info)
    }

    pub async fn delete_stream(&self, name: &str) -> Result<()> {
        let mut streams = self.streams.write().await;
        match streams.remove(name) {
            Some(_) => {
                tracing::debug!(stream = %name, "stream deleted");
                Ok(())
            }
            None => Err(BrokerError::StreamNotFound(name.to_string())),
        }
    }

    pub async fn stream_info(&self, name: &str) -> Result<StreamInfo> {
        let streams = self.streams.read().await;
        streams
            .get(name)
            .map(|state| state.info())
            .ok_or_else(|| BrokerError::StreamNotFound(name.to_string()))
    }

    pub async fn get_message(&self, name: &str, sequence: u64) -> Result<Option<StoredMessage>> {
        let stream = self.stream_by_name(name).await?;
        let state = stream.log_state.lock();
        Ok(state
            .log
            .iter()
            .find(|message| message.sequence == sequence)
            .cloned())
    }

    /// Stores `payload` in the stream bound to `subject`.
    pub async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        expect: &Expectations,
    ) -> Result<PublishAck> {
        let result = self.publish_inner(subject, payload, expect).await;
        match &result {
            Ok(ack) if ack.duplicate => {
                metrics::counter!("felix_broker_publish_total", "result" => "duplicate")
                    .increment(1);
            }
            Ok(_) => {
                metrics::counter!("felix_broker_publish_total", "result" => "ok").increment(1);
            }
            Err(err) => {
                metrics::counter!("felix_broker_publish_total", "result" => "error").increment(1);
                tracing::debug!(subject = %subject, error = %err, "publish rejected");
            }
        }
        result
    }

    async fn publish_inner(
        &self,
        subject: &str,
        payload: Bytes,
        expect: &Expectations,
    ) -> Result<PublishAck> {
        let stream = self.stream_for_subject(subject).await?;
        if let Some(expected) = expect.expected_stream.as_deref()
            && expected != stream.config.name
        {
            return Err(BrokerError::StreamMismatch {
                expected: expected.to_string(),
                actual: stream.config.name.clone(),
            });
        }
        if payload.len() > stream.config.max_message_bytes {
            return Err(BrokerError::MessageTooLarge {
                size: payload.len(),
                max: stream.config.max_message_bytes,
            });
        }
        stream.append(subject, payload, expect)
    }

    async fn stream_for_subject(&self, subject: &str) -> Result<Arc<StreamState>> {
        let streams = self.streams.read().await;
        streams
            .values()
            .find(|state| {
                state
                    .config
                    .subjects
                    .iter()
                    .any(|pattern| subject_matches(pattern, subject))
            })
            .cloned()
            .ok_or_else(|| BrokerError::NoStream {
                subject: subject.to_string(),
            })
    }

    async fn stream_by_name(&self, name: &str) -> Result<Arc<StreamState>> {
        let streams = self.streams.read().await;
        streams
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::StreamNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broker_with_orders() -> Broker {
        let broker = Broker::new();
        broker
            .add_stream(StreamConfig::new("ORDERS", ["orders.>"]))
            .await
            .expect("stream");
        broker
    }

    fn payload(value: &'static [u8]) -> Bytes {
        Bytes::from_static(value)
    }

    #[tokio::test]
    async fn sequences_increase_per_stream() {
        let broker = broker_with_orders().await;
        broker
            .add_stream(StreamConfig::new("INVOICES", ["invoices.*"]))
            .await
            .expect("stream");
        let none = Expectations::default();
        let first = broker.publish("orders.a", payload(b"1"), &none).await.expect("publish");
        let second = broker.publish("orders.b", payload(b"2"), &none).await.expect("publish");
        let other = broker.publish("invoices.x", payload(b"3"), &none).await.expect("publish");
        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert_eq!(other.stream, "INVOICES");
        assert_eq!(other.sequence, 1);
    }

    #[tokio::test]
    async fn unbound_subject_is_rejected() {
        let broker = broker_with_orders().await;
        let err = broker
            .publish("payments.new", payload(b"x"), &Expectations::default())
            .await
            .expect_err("no stream");
        assert_eq!(err.code(), ERR_NO_STREAM);
    }

    #[tokio::test]
    async fn duplicate_msg_id_returns_original_sequence() {
        let broker = broker_with_orders().await;
        let expect = Expectations::default().with_msg_id("order-1");
        let first = broker.publish("orders.a", payload(b"1"), &expect).await.expect("publish");
        let second = broker.publish("orders.a", payload(b"1"), &expect).await.expect("publish");
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.sequence, second.sequence);
        let info = broker.stream_info("ORDERS").await.expect("info");
        assert_eq!(info.messages, 1);
    }

    #[tokio::test]
    async fn dedup_window_forgets_old_ids() {
        let broker = Broker::new();
        broker
            .add_stream(StreamConfig::new("ORDERS", ["orders.>"]).with_duplicate_window(1))
            .await
            .expect("stream");
        let a = Expectations::default().with_msg_id("a");
        let b = Expectations::default().with_msg_id("b");
        broker.publish("orders.x", payload(b"1"), &a).await.expect("a");
        broker.publish("orders.x", payload(b"2"), &b).await.expect("b");
        let again = broker.publish("orders.x", payload(b"1"), &a).await.expect("a again");
        assert!(!again.duplicate);
        assert_eq!(again.sequence, 3);
    }

    #[tokio::test]
    async fn expected_last_sequence_is_enforced() {
        let broker = broker_with_orders().await;
        let first = Expectations::default().with_expected_last_sequence(0);
        broker.publish("orders.a", payload(b"1"), &first).await.expect("first");
        let err = broker
            .publish("orders.a", payload(b"2"), &first)
            .await
            .expect_err("stale expectation");
        assert_eq!(
            err,
            BrokerError::WrongLastSequence {
                expected: 0,
                actual: 1
            }
        );
        assert_eq!(err.code(), ERR_WRONG_LAST_SEQUENCE);
    }

    #[tokio::test]
    async fn expected_stream_is_enforced() {
        let broker = broker_with_orders().await;
        let expect = Expectations::default().with_expected_stream("INVOICES");
        let err = broker
            .publish("orders.a", payload(b"1"), &expect)
            .await
            .expect_err("mismatch");
        assert_eq!(err.code(), ERR_STREAM_MISMATCH);
        let ok = Expectations::default().with_expected_stream("ORDERS");
        broker.publish("orders.a", payload(b"1"), &ok).await.expect("match");
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let broker = Broker::new();
        broker
            .add_stream(StreamConfig::new("SMALL", ["small"]).with_max_message_bytes(2))
            .await
            .expect("stream");
        let err = broker
            .publish("small", payload(b"abc"), &Expectations::default())
            .await
            .expect_err("too large");
        assert_eq!(err.code(), ERR_MESSAGE_TOO_LARGE);
    }

    #[tokio::test]
    async fn log_is_trimmed_to_max_messages() {
        let broker = Broker::new();
        broker
            .add_stream(StreamConfig::new("TINY", ["tiny"]).with_max_messages(2))
            .await
            .expect("stream");
        for value in [b"a", b"b", b"c"] {
            broker
                .publish("tiny", Bytes::from_static(value), &Expectations::default())
                .await
                .expect("publish");
        }
        let info = broker.stream_info("TINY").await.expect("info");
        assert_eq!(info.messages, 2);
        assert_eq!(info.first_sequence, 2);
        assert_eq!(info.last_sequence, 3);
        assert!(broker.get_message("TINY", 1).await.expect("get").is_none());
        let last = broker.get_message("TINY", 3).await.expect("get").expect("present");
        assert_eq!(last.payload, Bytes::from_static(b"c"));
    }

    #[tokio::test]
    async fn stream_admin_rejects_conflicts() {
        let broker = broker_with_orders().await;
        let err = broker
            .add_stream(StreamConfig::new("ORDERS", ["other"]))
            .await
            .expect_err("exists");
        assert!(matches!(err, BrokerError::StreamExists(_)));
        let err = broker
            .add_stream(StreamConfig::new("EU", ["orders.eu"]))
            .await
            .expect_err("overlap");
        assert!(matches!(err, BrokerError::SubjectOverlap { .. }));
        let err = broker
            .add_stream(StreamConfig::new("bad.name", ["x"]))
            .await
            .expect_err("invalid");
        assert!(matches!(err, BrokerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn delete_stream_unbinds_subjects() {
        let broker = broker_with_orders().await;
        broker.delete_stream("ORDERS").await.expect("delete");
        assert!(broker.stream_info("ORDERS").await.is_err());
        assert!(matches!(
            broker.delete_stream("ORDERS").await,
            Err(BrokerError::StreamNotFound(_))
        ));
        let err = broker
            .publish("orders.a", payload(b"1"), &Expectations::default())
            .await
            .expect_err("unbound");
        assert!(matches!(err, BrokerError::NoStream { .. }));
    }
}
