mod common;

use bytes::Bytes;
use felix_client::{ClientConfig, Expectations, InProcessTransport, PublishError, Publisher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::broker_with_orders;

#[tokio::test]
async fn expected_last_sequence_chains_publishes() {
    let broker = broker_with_orders().await;
    let publisher = Publisher::new(ClientConfig::default(), |sink| {
        InProcessTransport::new(broker.clone(), sink)
    })
    .expect("publisher");

    let mut last = 0;
    for index in 0..5u32 {
        let ack = publisher
            .publish(
                "orders.created",
                Bytes::from(index.to_string()),
                Expectations::default().with_expected_last_sequence(last),
            )
            .await
            .expect("publish");
        assert_eq!(ack.sequence, last + 1);
        last = ack.sequence;
    }

    let err = publisher
        .publish(
            "orders.created",
            "stale",
            Expectations::default().with_expected_last_sequence(2),
        )
        .await
        .expect_err("stale expectation");
    assert_eq!(err.code(), felix_broker::ERR_WRONG_LAST_SEQUENCE);
}

#[tokio::test]
async fn error_handler_sees_every_async_failure() {
    let broker = broker_with_orders().await;
    let observed = Arc::new(AtomicUsize::new(0));
    let config = {
        let observed = observed.clone();
        ClientConfig::default().with_error_handler(move |failed| {
            assert!(matches!(failed.error, PublishError::BrokerRejected { .. }));
            observed.fetch_add(1, Ordering::SeqCst);
        })
    };
    let publisher = Publisher::new(config, |sink| {
        InProcessTransport::new(broker.clone(), sink)
    })
    .expect("publisher");

    let mut pending = Vec::new();
    for subject in ["orders.created", "invoices.created", "orders.updated", "nowhere"] {
        pending.push(
            publisher
                .publish_async(subject, "x", Expectations::default())
                .await
                .expect("accepted"),
        );
    }
    publisher
        .await_all_complete(Duration::from_secs(1))
        .await
        .expect("drained");
    let failures = futures::future::join_all(pending)
        .await
        .into_iter()
        .filter(Result::is_err)
        .count();
    assert_eq!(failures, 2);

    tokio::time::timeout(Duration::from_secs(1), async {
        while observed.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("observer caught up");
    let stats = publisher.stats();
    assert_eq!(stats.acked, 2);
    assert_eq!(stats.failed, 2);
}
