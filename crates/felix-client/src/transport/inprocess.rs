// Transport that forwards publishes to a broker in this process.
use anyhow::Result;
use async_trait::async_trait;
use felix_broker::Broker;
use std::sync::Arc;
use std::time::Duration;

use super::PublishTransport;
use crate::client::PublishRequest;
use crate::client::correlator::AckSink;

/// Forwards each publish to a shared [`Broker`] on its own task.
///
/// Outcomes are delivered from that task, never from inside `send`, so the
/// caller always observes an asynchronous acknowledgement.
///
/// ```
/// use bytes::Bytes;
/// use felix_broker::{Broker, StreamConfig};
/// use felix_client::{ClientConfig, InProcessTransport, Publisher};
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = Arc::new(Broker::new());
///     broker
///         .add_stream(StreamConfig::new("ORDERS", ["orders.>"]))
///         .await
///         .expect("stream");
///     let publisher = Publisher::new(ClientConfig::default(), |sink| {
///         InProcessTransport::new(broker.clone(), sink)
///     })
///     .expect("publisher");
///     let ack = publisher
///         .publish("orders.created", Bytes::from_static(b"payload"), Default::default())
///         .await
///         .expect("publish");
///     assert_eq!(ack.stream, "ORDERS");
///     assert_eq!(ack.sequence, 1);
/// });
/// ```
#[derive(Clone)]
pub struct InProcessTransport {
    broker: Arc<Broker>,
    sink: AckSink,
    delay: Option<Duration>,
}

impl InProcessTransport {
    pub fn new(broker: Arc<Broker>, sink: AckSink) -> Self {
        Self {
            broker,
            sink,
            delay: None,
        }
    }

    /// Holds every outcome back by `delay`, standing in for network latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl PublishTransport for InProcessTransport {
    async fn send(&self, request: &PublishRequest) -> Result<()> {
        let broker = self.broker.clone();
        let sink = self.sink.clone();
        let delay = self.delay;
        let token = request.token;
        let subject = request.subject.clone();
        let payload = request.payload.clone();
        let expectations = request.expectations.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let outcome = broker
                .publish(&subject, payload, &expectations)
                .await
                .map_err(Into::into);
            sink.resolve(token, outcome);
        });
        Ok(())
    }
}
