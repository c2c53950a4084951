// Transports carry publish requests to a broker and feed outcomes back
// through an `AckSink`.
use async_trait::async_trait;

use crate::client::PublishRequest;

pub mod framed;
pub mod inprocess;

pub use framed::FramedTransport;
pub use inprocess::InProcessTransport;

/// Outbound half of a broker connection.
///
/// `send` hands the request off and returns; the outcome arrives later on the
/// `AckSink` the transport was built with. An `Err` means the request never
/// left and will not be answered.
#[async_trait]
pub trait PublishTransport: Send + Sync + 'static {
    async fn send(&self, request: &PublishRequest) -> anyhow::Result<()>;
}
