// Test harness publisher: drives the publish pipeline against an in-process broker.
use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use felix_broker::{Broker, StreamConfig};
use felix_client::{ClientConfig, Expectations, InProcessTransport, Publisher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Mode {
    /// Wait for each acknowledgement before the next publish.
    Sync,
    /// Keep up to `--max-pending` publishes in flight.
    Async,
}

#[derive(Parser, Debug)]
#[command(name = "publisher")]
#[command(about = "Test harness publisher for the Felix publish pipeline")]
struct Args {
    /// Stream to create before publishing
    #[arg(long, default_value = "ORDERS")]
    stream: String,

    /// Subject pattern bound to the stream
    #[arg(long, default_value = "orders.>")]
    subjects: String,

    /// Subject to publish to
    #[arg(long, default_value = "orders.created")]
    subject: String,

    /// Message payload size in bytes
    #[arg(long, default_value = "1024")]
    payload_size: usize,

    /// Total number of messages to publish
    #[arg(long, default_value = "10000")]
    count: u64,

    #[arg(long, value_enum, default_value = "async")]
    mode: Mode,

    /// Overrides the configured pending window
    #[arg(long, env = "FELIX_PUB_MAX_PENDING")]
    max_pending: Option<usize>,

    /// Simulated broker round trip in milliseconds
    #[arg(long, default_value = "0")]
    ack_delay_ms: u64,

    /// Attach a message id to every publish; ids repeat every N messages
    #[arg(long)]
    dedup_every: Option<u64>,

    /// How long to wait for outstanding acknowledgements at the end
    #[arg(long, default_value = "5000")]
    drain_timeout_ms: u64,

    /// YAML client config overrides
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(
        stream = %args.stream,
        subject = %args.subject,
        payload_size = args.payload_size,
        count = args.count,
        mode = ?args.mode,
        "Starting publisher"
    );

    let broker = Arc::new(Broker::new());
    broker
        .add_stream(StreamConfig::new(
            args.stream.clone(),
            args.subjects.split(',').map(str::trim),
        ))
        .await
        .context("create stream")?;

    let mut config = ClientConfig::from_env_or_yaml(args.config.as_deref())?
        .with_error_handler(|failed| {
            warn!(
                token = %failed.request.token,
                code = failed.error.code(),
                error = %failed.error,
                "Async publish failed"
            );
        });
    if let Some(max_pending) = args.max_pending {
        config = config.with_max_pending(max_pending);
    }
    let ack_delay = Duration::from_millis(args.ack_delay_ms);
    let publisher = Publisher::new(config, |sink| {
        let transport = InProcessTransport::new(broker.clone(), sink);
        if ack_delay.is_zero() {
            transport
        } else {
            transport.with_delay(ack_delay)
        }
    })?;

    let payload = Bytes::from(vec![b'x'; args.payload_size]);
    let start_time = Instant::now();
    let mut errors = 0u64;

    for index in 0..args.count {
        let expectations = match args.dedup_every {
            Some(every) if every > 0 => {
                Expectations::default().with_msg_id(format!("msg-{}", index % every))
            }
            _ => Expectations::default(),
        };
        let result = match args.mode {
            Mode::Sync => publisher
                .publish(args.subject.clone(), payload.clone(), expectations)
                .await
                .map(|_| ()),
            // Outcomes are collected by the drain below; failures go to the error handler.
            Mode::Async => publisher
                .publish_async(args.subject.clone(), payload.clone(), expectations)
                .await
                .map(drop),
        };
        if let Err(err) = result {
            errors += 1;
            if errors % 100 == 1 {
                error!(error = %err, errors, "Publish error");
            }
        }
        if (index + 1) % 1000 == 0 {
            let rate = (index + 1) as f64 / start_time.elapsed().as_secs_f64();
            info!(
                submitted = index + 1,
                pending = publisher.pending_count(),
                rate = format!("{rate:.2}"),
                "Publishing progress"
            );
        }
    }

    if let Err(still) = publisher
        .close(Duration::from_millis(args.drain_timeout_ms))
        .await
    {
        warn!(pending = still.requests.len(), "Drain timed out");
    }

    let elapsed = start_time.elapsed();
    let stats = publisher.stats();
    let info_snapshot = broker.stream_info(&args.stream).await?;
    info!(
        acked = stats.acked,
        duplicates = stats.duplicates,
        failed = stats.failed,
        backpressure_timeouts = stats.backpressure_timeouts,
        ack_timeouts = stats.ack_timeouts,
        stored = info_snapshot.messages,
        last_sequence = info_snapshot.last_sequence,
        elapsed = format!("{:.2}s", elapsed.as_secs_f64()),
        rate = format!("{:.2} msg/s", stats.acked as f64 / elapsed.as_secs_f64()),
        "Publisher completed"
    );

    Ok(())
}
