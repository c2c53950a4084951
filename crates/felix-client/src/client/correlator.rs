// Correlates broker outcomes with pending publishes by token.
//
// Outcomes may arrive in any order. Unknown tokens are stale and dropped.
use felix_wire::PublishAck;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::window::WindowSlot;
use super::{CorrelationToken, PublishRequest};
use crate::counters::PublishCounters;
use crate::error::{FailedPublish, PublishError};

/// Terminal result of one publish.
pub type PublishOutcome = Result<PublishAck, PublishError>;

/// What `resolve` did with an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiting caller.
    Delivered,
    /// Entry resolved, but its caller had stopped waiting.
    Abandoned,
    /// No pending entry for the token; the outcome was discarded.
    Stale,
}

/// How the submitting caller consumes the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingMode {
    Sync,
    Async,
}

struct PendingEntry {
    request: Arc<PublishRequest>,
    responder: oneshot::Sender<PublishOutcome>,
    mode: PendingMode,
    submitted_at: Instant,
    slot: WindowSlot,
}

pub struct AckCorrelator {
    pending: Mutex<HashMap<CorrelationToken, PendingEntry>>,
    pending_len: watch::Sender<usize>,
    counters: PublishCounters,
    observer: Option<mpsc::UnboundedSender<FailedPublish>>,
}

impl AckCorrelator {
    pub fn new(observer: Option<mpsc::UnboundedSender<FailedPublish>>) -> Self {
        let (pending_len, _) = watch::channel(0);
        Self {
            pending: Mutex::new(HashMap::new()),
            pending_len,
            counters: PublishCounters::default(),
            observer,
        }
    }

    /// Inserts a pending entry that owns `slot` until it is resolved.
    pub fn register(
        &self,
        request: Arc<PublishRequest>,
        slot: WindowSlot,
        mode: PendingMode,
    ) -> oneshot::Receiver<PublishOutcome> {
        let (responder, receiver) = oneshot::channel();
        let token = request.token;
        let entry = PendingEntry {
            request,
            responder,
            mode,
            submitted_at: Instant::now(),
            slot,
        };
        let len = {
            let mut pending = self.pending.lock();
            pending.insert(token, entry);
            let len = pending.len();
            self.pending_len.send_replace(len);
            len
        };
        PublishCounters::bump(&self.counters.submitted);
        t_gauge!("felix_client_pending").set(len as f64);
        tracing::debug!(token = %token, ?mode, pending = len, "publish registered");
        receiver
    }

    /// Completes the pending entry for `token` with `outcome`.
    pub fn resolve(&self, token: CorrelationToken, outcome: PublishOutcome) -> Resolution {
        let removed = {
            let mut pending = self.pending.lock();
            let removed = pending.remove(&token);
            if removed.is_some() {
                self.pending_len.send_replace(pending.len());
            }
            removed.map(|entry| (entry, pending.len()))
        };
        let Some((entry, len)) = removed else {
            PublishCounters::bump(&self.counters.stale);
            t_counter!("felix_client_stale_acks_total").increment(1);
            tracing::warn!(token = %token, ok = outcome.is_ok(), "outcome for unknown token dropped");
            return Resolution::Stale;
        };
        self.complete(token, entry, len, outcome)
    }

    // Finishes an entry already taken out of the pending set.
    fn complete(
        &self,
        token: CorrelationToken,
        entry: PendingEntry,
        len: usize,
        outcome: PublishOutcome,
    ) -> Resolution {
        let PendingEntry {
            request,
            responder,
            mode,
            submitted_at,
            slot,
        } = entry;
        drop(slot);
        t_gauge!("felix_client_pending").set(len as f64);
        t_histogram!("felix_client_ack_latency_ms")
            .record(submitted_at.elapsed().as_secs_f64() * 1000.0);

        match &outcome {
            Ok(ack) => {
                PublishCounters::bump(&self.counters.acked);
                if ack.duplicate {
                    PublishCounters::bump(&self.counters.duplicates);
                }
                t_counter!("felix_client_publish_total", "result" => "ok").increment(1);
                tracing::debug!(
                    token = %token,
                    stream = %ack.stream,
                    sequence = ack.sequence,
                    duplicate = ack.duplicate,
                    "publish acknowledged"
                );
            }
            Err(err) => {
                PublishCounters::bump(&self.counters.failed);
                t_counter!("felix_client_publish_total", "result" => err.result_label())
                    .increment(1);
                tracing::debug!(token = %token, code = err.code(), error = %err, "publish failed");
                if mode == PendingMode::Async
                    && let Some(observer) = &self.observer
                    && observer
                        .send(FailedPublish {
                            request,
                            error: err.clone(),
                        })
                        .is_err()
                {
                    tracing::warn!(token = %token, "error observer stopped; failure not reported");
                }
            }
        }

        match responder.send(outcome) {
            Ok(()) => Resolution::Delivered,
            Err(_) => Resolution::Abandoned,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot of unresolved requests, oldest token first.
    pub fn pending_requests(&self) -> Vec<Arc<PublishRequest>> {
        let mut requests: Vec<_> = self
            .pending
            .lock()
            .values()
            .map(|entry| entry.request.clone())
            .collect();
        requests.sort_by_key(|request| request.token);
        requests
    }

    /// Fails async entries submitted at least `age` ago with `AckTimeout`.
    /// Sync entries are left alone. Returns the tokens that were expired.
    pub fn expire_older_than(&self, age: Duration) -> Vec<CorrelationToken> {
        let now = Instant::now();
        // Taken out under one lock so a concurrent outcome sees them as gone.
        let (mut expired, len) = {
            let mut pending = self.pending.lock();
            let tokens: Vec<CorrelationToken> = pending
                .iter()
                .filter(|(_, entry)| {
                    entry.mode == PendingMode::Async
                        && now.saturating_duration_since(entry.submitted_at) >= age
                })
                .map(|(token, _)| *token)
                .collect();
            let expired: Vec<(CorrelationToken, PendingEntry)> = tokens
                .into_iter()
                .filter_map(|token| pending.remove(&token).map(|entry| (token, entry)))
                .collect();
            if !expired.is_empty() {
                self.pending_len.send_replace(pending.len());
            }
            (expired, pending.len())
        };
        expired.sort_by_key(|(token, _)| *token);

        let mut tokens = Vec::with_capacity(expired.len());
        for (token, entry) in expired {
            let outcome = Err(PublishError::AckTimeout {
                token,
                timeout: age,
            });
            self.complete(token, entry, len, outcome);
            PublishCounters::bump(&self.counters.swept);
            PublishCounters::bump(&self.counters.ack_timeouts);
            tokens.push(token);
        }
        if !tokens.is_empty() {
            tracing::info!(count = tokens.len(), ?age, "expired unacknowledged publishes");
        }
        tokens
    }

    /// Waits until nothing is pending. Returns false if `timeout` elapsed first.
    pub async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let mut pending_len = self.pending_len.subscribe();
        tokio::time::timeout(timeout, pending_len.wait_for(|len| *len == 0))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    pub(crate) fn counters(&self) -> &PublishCounters {
        &self.counters
    }
}

/// Handle transports use to deliver outcomes.
///
/// Holds only a weak reference: an outcome delivered after the publisher is
/// gone is reported as [`Resolution::Stale`].
#[derive(Clone)]
pub struct AckSink {
    correlator: Weak<AckCorrelator>,
}

impl AckSink {
    pub fn new(correlator: &Arc<AckCorrelator>) -> Self {
        Self {
            correlator: Arc::downgrade(correlator),
        }
    }

    pub fn resolve(&self, token: CorrelationToken, outcome: PublishOutcome) -> Resolution {
        match self.correlator.upgrade() {
            Some(correlator) => correlator.resolve(token, outcome),
            None => {
                tracing::debug!(token = %token, "outcome arrived after publisher shutdown");
                Resolution::Stale
            }
        }
    }

    pub fn ack(&self, token: CorrelationToken, ack: PublishAck) -> Resolution {
        self.resolve(token, Ok(ack))
    }

    pub fn reject(
        &self,
        token: CorrelationToken,
        code: u16,
        text: impl Into<String>,
    ) -> Resolution {
        self.resolve(
            token,
            Err(PublishError::BrokerRejected {
                code,
                text: text.into(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::window::PendingWindow;
    use crate::client::TokenSource;
    use bytes::Bytes;
    use felix_wire::Expectations;

    struct Harness {
        window: PendingWindow,
        tokens: TokenSource,
        correlator: Arc<AckCorrelator>,
    }

    impl Harness {
        fn new(max_pending: usize) -> Self {
            Self {
                window: PendingWindow::new(max_pending),
                tokens: TokenSource::new(),
                correlator: Arc::new(AckCorrelator::new(None)),
            }
        }

        fn submit(&self, mode: PendingMode) -> (CorrelationToken, oneshot::Receiver<PublishOutcome>) {
            let slot = self.window.try_acquire().expect("slot");
            let token = self.tokens.mint();
            let request = Arc::new(PublishRequest::new(
                token,
                "orders.created",
                Bytes::from_static(b"x"),
                Expectations::default(),
            ));
            (token, self.correlator.register(request, slot, mode))
        }
    }

    fn ack(sequence: u64) -> PublishAck {
        PublishAck {
            stream: "ORDERS".to_string(),
            sequence,
            duplicate: false,
        }
    }

    #[tokio::test]
    async fn out_of_order_outcomes_reach_their_own_callers() {
        let harness = Harness::new(4);
        let (first, first_rx) = harness.submit(PendingMode::Async);
        let (second, second_rx) = harness.submit(PendingMode::Async);
        let (third, third_rx) = harness.submit(PendingMode::Async);

        assert_eq!(harness.correlator.resolve(third, Ok(ack(30))), Resolution::Delivered);
        assert_eq!(harness.correlator.resolve(first, Ok(ack(10))), Resolution::Delivered);
        assert_eq!(
            harness
                .correlator
                .resolve(second, Err(PublishError::Transport("reset".into()))),
            Resolution::Delivered
        );

        assert_eq!(third_rx.await.expect("third").expect("ack").sequence, 30);
        assert_eq!(first_rx.await.expect("first").expect("ack").sequence, 10);
        assert!(second_rx.await.expect("second").is_err());
        assert_eq!(harness.window.in_flight(), 0);
        assert_eq!(harness.correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn stale_outcome_leaves_pending_set_alone() {
        let harness = Harness::new(4);
        let (token, _rx) = harness.submit(PendingMode::Async);
        assert_eq!(
            harness
                .correlator
                .resolve(CorrelationToken::from_raw(999), Ok(ack(1))),
            Resolution::Stale
        );
        assert_eq!(harness.correlator.pending_len(), 1);
        assert_eq!(harness.window.in_flight(), 1);

        harness.correlator.resolve(token, Ok(ack(1)));
        assert_eq!(harness.correlator.resolve(token, Ok(ack(1))), Resolution::Stale);
        let stats = harness.correlator.counters().snapshot();
        assert_eq!(stats.stale, 2);
        assert_eq!(stats.acked, 1);
    }

    #[tokio::test]
    async fn dropped_receiver_is_abandoned_but_frees_the_slot() {
        let harness = Harness::new(1);
        let (token, rx) = harness.submit(PendingMode::Sync);
        drop(rx);
        assert_eq!(harness.correlator.resolve(token, Ok(ack(1))), Resolution::Abandoned);
        assert_eq!(harness.window.in_flight(), 0);
    }

    #[tokio::test]
    async fn async_failures_are_observed_sync_ones_are_not() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let correlator = Arc::new(AckCorrelator::new(Some(tx)));
        let window = PendingWindow::new(4);
        let tokens = TokenSource::new();
        let submit = |mode| {
            let token = tokens.mint();
            let request = Arc::new(PublishRequest::new(
                token,
                "orders.created",
                Bytes::new(),
                Expectations::default(),
            ));
            let receiver = correlator.register(request, window.try_acquire().expect("slot"), mode);
            (token, receiver)
        };
        let (sync_token, _sync_rx) = submit(PendingMode::Sync);
        let (async_token, _async_rx) = submit(PendingMode::Async);

        let sink = AckSink::new(&correlator);
        sink.reject(sync_token, 10071, "wrong last sequence");
        sink.reject(async_token, 10071, "wrong last sequence");

        let failed = rx.recv().await.expect("observed");
        assert_eq!(failed.request.token, async_token);
        assert_eq!(failed.error.code(), 10071);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expire_only_touches_old_async_entries() {
        let harness = Harness::new(4);
        let (old_async, old_rx) = harness.submit(PendingMode::Async);
        let (_old_sync, _sync_rx) = harness.submit(PendingMode::Sync);
        tokio::time::advance(Duration::from_millis(100)).await;
        let (_young, _young_rx) = harness.submit(PendingMode::Async);

        let expired = harness.correlator.expire_older_than(Duration::from_millis(50));
        assert_eq!(expired, vec![old_async]);
        assert!(matches!(
            old_rx.await.expect("outcome"),
            Err(PublishError::AckTimeout { .. })
        ));
        assert_eq!(harness.correlator.pending_len(), 2);
        assert_eq!(harness.correlator.counters().snapshot().swept, 1);
        assert_eq!(
            harness.correlator.resolve(old_async, Ok(ack(1))),
            Resolution::Stale
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_resolves_each_entry_once_without_stale_noise() {
        let harness = Harness::new(8);
        let submitted: Vec<_> = (0..4).map(|_| harness.submit(PendingMode::Async)).collect();
        tokio::time::advance(Duration::from_millis(100)).await;

        // One entry is acked before the sweep runs.
        let (acked, _) = &submitted[1];
        assert_eq!(harness.correlator.resolve(*acked, Ok(ack(1))), Resolution::Delivered);

        let expired = harness.correlator.expire_older_than(Duration::from_millis(50));
        let expected: Vec<_> = submitted
            .iter()
            .map(|(token, _)| *token)
            .filter(|token| token != acked)
            .collect();
        assert_eq!(expired, expected);
        assert_eq!(harness.correlator.pending_len(), 0);
        assert_eq!(harness.window.in_flight(), 0);

        let stats = harness.correlator.counters().snapshot();
        assert_eq!(stats.stale, 0);
        assert_eq!(stats.swept, 3);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.acked, 1);
        assert!(harness.correlator.expire_older_than(Duration::ZERO).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_last_resolution() {
        let harness = Harness::new(2);
        let (token, _rx) = harness.submit(PendingMode::Async);
        assert!(!harness.correlator.wait_until_drained(Duration::from_millis(10)).await);

        let correlator = harness.correlator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            correlator.resolve(token, Ok(ack(1)));
        });
        assert!(harness.correlator.wait_until_drained(Duration::from_secs(1)).await);
    }

    #[test]
    fn sink_outlives_correlator() {
        let correlator = Arc::new(AckCorrelator::new(None));
        let sink = AckSink::new(&correlator);
        drop(correlator);
        assert_eq!(
            sink.ack(CorrelationToken::from_raw(1), ack(1)),
            Resolution::Stale
        );
    }
}
