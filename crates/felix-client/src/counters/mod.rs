// Always-on publish counters and their point-in-time snapshot.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default, Debug)]
pub(crate) struct PublishCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) acked: AtomicU64,
    pub(crate) duplicates: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) stale: AtomicU64,
    pub(crate) backpressure_timeouts: AtomicU64,
    pub(crate) ack_timeouts: AtomicU64,
    pub(crate) swept: AtomicU64,
}

/// Snapshot returned by `Publisher::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Requests accepted into the pending window.
    pub submitted: u64,
    pub acked: u64,
    /// Acks the broker flagged as duplicates of an earlier message id.
    pub duplicates: u64,
    /// Requests resolved with an error, swept ones included.
    pub failed: u64,
    /// Outcomes that arrived for tokens no longer pending.
    pub stale: u64,
    pub backpressure_timeouts: u64,
    /// Ack deadlines that passed, sync waits and async sweeps alike.
    pub ack_timeouts: u64,
    pub swept: u64,
}

impl PublishCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PublisherStats {
        PublisherStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            backpressure_timeouts: self.backpressure_timeouts.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }
}

impl PublisherStats {
    /// Accepted requests that have not reached a terminal outcome.
    pub fn outstanding(&self) -> u64 {
        self.submitted.saturating_sub(self.acked + self.failed)
    }
}
