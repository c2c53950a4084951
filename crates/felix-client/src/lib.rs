// Publishing client for Felix streams.
//
// Every publish passes through one path:
//
// - the pending window hands out a slot, or waits (bounded by the stall wait)
//   until an outcome frees one;
// - a fresh correlation token is minted and the request is registered in the
//   pending set together with its slot;
// - the transport sends the request, and outcomes come back through an
//   `AckSink` in whatever order the broker produces them.
//
// Synchronous callers wait on the outcome with a deadline. Asynchronous callers
// get a future instead. Failed async publishes are also reported to an optional
// error handler running on its own task. Nothing is ever retried implicitly.
//
// The pending set mutex is never held across an await point. The slot owned by
// an entry is released exactly when the entry leaves the set.
#[macro_use]
mod macros;

pub mod client;
pub mod config;
pub mod counters;
pub mod error;
pub mod transport;
mod wire;

pub use client::correlator::{AckCorrelator, AckSink, PendingMode, PublishOutcome, Resolution};
pub use client::publisher::{PublishAckFuture, Publisher};
pub use client::window::{PendingWindow, WindowSlot};
pub use client::{CorrelationToken, PublishRequest};
pub use config::ClientConfig;
pub use counters::PublisherStats;
pub use error::{ErrorHandler, FailedPublish, PublishError, StillPending};
pub use felix_wire::{Expectations, PublishAck};
pub use transport::{FramedTransport, InProcessTransport, PublishTransport};
