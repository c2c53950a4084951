// Publish pipeline: one submission path shared by sync and async callers.
use anyhow::Result;
use bytes::Bytes;
use felix_wire::{Expectations, PublishAck};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::correlator::{AckCorrelator, AckSink, PendingMode, PublishOutcome};
use super::window::PendingWindow;
use super::{CorrelationToken, PublishRequest, TokenSource};
use crate::config::ClientConfig;
use crate::counters::{PublishCounters, PublisherStats};
use crate::error::{ErrorHandler, FailedPublish, PublishError, StillPending};
use crate::transport::PublishTransport;

/// Flow-controlled publisher with per-request acknowledgement tracking.
///
/// Cloning is cheap; clones share the window, the pending set and the
/// transport.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    config: ClientConfig,
    window: PendingWindow,
    correlator: Arc<AckCorrelator>,
    tokens: TokenSource,
    transport: Box<dyn PublishTransport>,
    closed: AtomicBool,
    sweeper: Option<JoinHandle<()>>,
}

impl Drop for PublisherInner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Deferred outcome of [`Publisher::publish_async`].
#[must_use = "dropping the future does not cancel the publish"]
#[derive(Debug)]
pub struct PublishAckFuture {
    token: CorrelationToken,
    receiver: oneshot::Receiver<PublishOutcome>,
}

impl PublishAckFuture {
    pub fn token(&self) -> CorrelationToken {
        self.token
    }
}

impl Future for PublishAckFuture {
    type Output = PublishOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PublishError::Closed)))
    }
}

impl Publisher {
    /// Builds a publisher whose transport is created from the sink it must
    /// deliver outcomes to. Must be called inside a tokio runtime.
    pub fn new<T, F>(config: ClientConfig, make_transport: F) -> Result<Self>
    where
        T: PublishTransport,
        F: FnOnce(AckSink) -> T,
    {
        config.validate()?;
        let observer = config.error_handler.clone().map(spawn_observer);
        let correlator = Arc::new(AckCorrelator::new(observer));
        let transport = make_transport(AckSink::new(&correlator));
        let sweeper = config
            .async_ack_timeout
            .map(|timeout| spawn_sweeper(Arc::downgrade(&correlator), timeout));
        tracing::info!(
            max_pending = config.max_pending_async,
            publish_timeout = ?config.publish_timeout,
            async_ack_timeout = ?config.async_ack_timeout,
            "publisher started"
        );
        Ok(Self {
            inner: Arc::new(PublisherInner {
                window: PendingWindow::new(config.max_pending_async),
                config,
                correlator,
                tokens: TokenSource::new(),
                transport: Box::new(transport),
                closed: AtomicBool::new(false),
                sweeper,
            }),
        })
    }

    /// Publishes and waits for the outcome for at most `publish_timeout`.
    pub async fn publish(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        expectations: Expectations,
    ) -> Result<PublishAck, PublishError> {
        let timeout = self.inner.config.publish_timeout;
        self.publish_with_timeout(subject, payload, expectations, timeout)
            .await
    }

    /// Like [`publish`](Self::publish) with a per-call ack deadline.
    ///
    /// The deadline starts once the request is accepted into the window. On
    /// `AckTimeout` the request stays pending and a late outcome still
    /// resolves it and frees its slot.
    pub async fn publish_with_timeout(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        expectations: Expectations,
        timeout: Duration,
    ) -> Result<PublishAck, PublishError> {
        let (token, receiver) = self
            .submit(subject.into(), payload.into(), expectations, PendingMode::Sync)
            .await?;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(PublishError::Closed),
            Err(_) => {
                PublishCounters::bump(&self.inner.correlator.counters().ack_timeouts);
                t_counter!("felix_client_publish_total", "result" => "ack_timeout").increment(1);
                tracing::debug!(token = %token, ?timeout, "publish ack wait timed out");
                Err(PublishError::AckTimeout { token, timeout })
            }
        }
    }

    /// Submits without waiting for the outcome.
    ///
    /// Returns once the request holds a window slot and has been handed to the
    /// transport. Failures reach the returned future and, if configured, the
    /// error handler.
    pub async fn publish_async(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        expectations: Expectations,
    ) -> Result<PublishAckFuture, PublishError> {
        let (token, receiver) = self
            .submit(
                subject.into(),
                payload.into(),
                expectations,
                PendingMode::Async,
            )
            .await?;
        Ok(PublishAckFuture { token, receiver })
    }

    /// Resubmits the subject, payload and expectations of `request` under a
    /// fresh token.
    pub async fn republish(
        &self,
        request: &PublishRequest,
    ) -> Result<PublishAckFuture, PublishError> {
        tracing::debug!(previous = %request.token, "republishing");
        self.publish_async(
            request.subject.clone(),
            request.payload.clone(),
            request.expectations.clone(),
        )
        .await
    }

    /// Waits until every accepted request has resolved.
    ///
    /// On timeout the unresolved requests are returned and remain pending.
    pub async fn await_all_complete(&self, timeout: Duration) -> Result<(), StillPending> {
        if self.inner.correlator.wait_until_drained(timeout).await {
            return Ok(());
        }
        let requests = self.inner.correlator.pending_requests();
        tracing::warn!(pending = requests.len(), ?timeout, "drain timed out");
        Err(StillPending { requests })
    }

    /// Refuses new publishes, then drains like
    /// [`await_all_complete`](Self::await_all_complete).
    pub async fn close(&self, timeout: Duration) -> Result<(), StillPending> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.window.close();
            tracing::info!(pending = self.pending_count(), "publisher closing");
        }
        self.await_all_complete(timeout).await
    }

    pub fn pending_count(&self) -> usize {
        self.inner.correlator.pending_len()
    }

    pub fn pending_requests(&self) -> Vec<Arc<PublishRequest>> {
        self.inner.correlator.pending_requests()
    }

    pub fn stats(&self) -> PublisherStats {
        self.inner.correlator.counters().snapshot()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // Slot, token, registration, then send. Registration precedes the send so
    // an ack can never arrive for an unknown token.
    async fn submit(
        &self,
        subject: String,
        payload: Bytes,
        expectations: Expectations,
        mode: PendingMode,
    ) -> Result<(CorrelationToken, oneshot::Receiver<PublishOutcome>), PublishError> {
        if self.is_closed() {
            return Err(PublishError::Closed);
        }
        let wait = self.inner.config.backpressure_timeout;
        let slot = match self.inner.window.acquire(wait).await {
            Ok(slot) => slot,
            Err(err) => {
                if matches!(err, PublishError::BackpressureTimeout { .. }) {
                    PublishCounters::bump(&self.inner.correlator.counters().backpressure_timeouts);
                    tracing::debug!(subject = %subject, ?wait, "pending window stayed full");
                }
                t_counter!("felix_client_publish_total", "result" => err.result_label())
                    .increment(1);
                return Err(err);
            }
        };
        let token = self.inner.tokens.mint();
        let request = Arc::new(PublishRequest::new(token, subject, payload, expectations));
        let receiver = self.inner.correlator.register(request.clone(), slot, mode);
        let unsent = UnsentGuard {
            correlator: &self.inner.correlator,
            token,
        };
        let sent = self.inner.transport.send(&request).await;
        std::mem::forget(unsent);
        if let Err(err) = sent {
            let message = format!("{err:#}");
            tracing::warn!(token = %token, error = %message, "publish send failed");
            self.inner
                .correlator
                .resolve(token, Err(PublishError::Transport(message)));
        }
        Ok((token, receiver))
    }
}

// Resolves a registered request whose send was cancelled, so it cannot hold
// its slot forever.
struct UnsentGuard<'a> {
    correlator: &'a AckCorrelator,
    token: CorrelationToken,
}

impl Drop for UnsentGuard<'_> {
    fn drop(&mut self) {
        tracing::debug!(token = %self.token, "publish cancelled before send completed");
        self.correlator.resolve(
            self.token,
            Err(PublishError::Transport("send cancelled".to_string())),
        );
    }
}

fn spawn_observer(handler: ErrorHandler) -> mpsc::UnboundedSender<FailedPublish> {
    let (tx, mut rx) = mpsc::unbounded_channel::<FailedPublish>();
    tokio::spawn(async move {
        while let Some(failed) = rx.recv().await {
            let token = failed.request.token;
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(failed))).is_err() {
                tracing::warn!(token = %token, "error handler panicked");
            }
        }
    });
    tx
}

fn spawn_sweeper(correlator: Weak<AckCorrelator>, timeout: Duration) -> JoinHandle<()> {
    let period = (timeout / 4).max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(correlator) = correlator.upgrade() else {
                return;
            };
            correlator.expire_older_than(timeout);
        }
    })
}
