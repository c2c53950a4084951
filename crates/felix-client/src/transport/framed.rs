// felix-wire framed transport over a duplex byte stream.
//
// One writer task owns the write half and one reader task owns the read half.
// `send` only enqueues; write failures and acks both reach the caller through
// the sink. Once the reader stops, no outcome can arrive and `send` fails.
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use felix_wire::{Message, PublishAck};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::PublishTransport;
use crate::client::correlator::AckSink;
use crate::client::{CorrelationToken, PublishRequest};
use crate::config::ClientConfig;
use crate::error::PublishError;
use crate::wire::{ReadOutcome, read_message, write_message};

struct Outbound {
    token: CorrelationToken,
    message: Message,
}

pub struct FramedTransport {
    tx: mpsc::Sender<Outbound>,
    reader: JoinHandle<()>,
    reader_alive: Arc<AtomicBool>,
}

impl FramedTransport {
    /// Splits `stream` and starts the writer and reader tasks.
    pub fn new<S>(stream: S, sink: AckSink, config: &ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(config.writer_queue_depth);
        tokio::spawn(run_writer(write_half, rx, sink.clone()));
        let reader_alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(run_reader(
            read_half,
            sink,
            config.max_frame_bytes,
            reader_alive.clone(),
        ));
        Self {
            tx,
            reader,
            reader_alive,
        }
    }
}

impl Drop for FramedTransport {
    fn drop(&mut self) {
        // The writer exits on its own once the queue sender is gone.
        self.reader.abort();
    }
}

#[async_trait]
impl PublishTransport for FramedTransport {
    async fn send(&self, request: &PublishRequest) -> Result<()> {
        if !self.reader_alive.load(Ordering::Acquire) {
            anyhow::bail!("broker stream reader stopped");
        }
        self.tx
            .send(Outbound {
                token: request.token,
                message: request.to_message(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("publish writer stopped"))
            .context("enqueue publish")
    }
}

async fn run_writer<S>(mut send: WriteHalf<S>, mut rx: mpsc::Receiver<Outbound>, sink: AckSink)
where
    S: AsyncWrite,
{
    // Single writer: frames never interleave on the stream.
    while let Some(outbound) = rx.recv().await {
        if let Err(err) = write_message(&mut send, &outbound.message).await {
            let message = format!("{err:#}");
            tracing::warn!(token = %outbound.token, error = %message, "publish write failed");
            sink.resolve(outbound.token, Err(PublishError::Transport(message.clone())));
            drain_publish_queue(&mut rx, &sink, &message);
            return;
        }
    }
    tracing::debug!("publish writer finished");
}

fn drain_publish_queue(rx: &mut mpsc::Receiver<Outbound>, sink: &AckSink, message: &str) {
    rx.close();
    while let Ok(outbound) = rx.try_recv() {
        sink.resolve(
            outbound.token,
            Err(PublishError::Transport(message.to_string())),
        );
    }
}

async fn run_reader<S>(
    recv: ReadHalf<S>,
    sink: AckSink,
    max_frame_bytes: usize,
    alive: Arc<AtomicBool>,
) where
    S: AsyncRead,
{
    read_outcomes(recv, sink, max_frame_bytes).await;
    alive.store(false, Ordering::Release);
}

async fn read_outcomes<S>(mut recv: ReadHalf<S>, sink: AckSink, max_frame_bytes: usize)
where
    S: AsyncRead,
{
    let mut scratch = BytesMut::with_capacity(64 * 1024);
    loop {
        let message = match read_message(&mut recv, &mut scratch, max_frame_bytes).await {
            Ok(ReadOutcome::Message(message)) => message,
            Ok(ReadOutcome::Undecodable) => continue,
            Ok(ReadOutcome::Closed) => {
                tracing::info!("broker stream closed");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "broker stream read failed");
                return;
            }
        };
        match message {
            Message::PublishOk {
                request_id,
                stream,
                seq,
                duplicate,
            } => {
                sink.ack(
                    CorrelationToken::from_raw(request_id),
                    PublishAck {
                        stream,
                        sequence: seq,
                        duplicate,
                    },
                );
            }
            Message::PublishError {
                request_id,
                code,
                message,
            } => {
                sink.reject(CorrelationToken::from_raw(request_id), code, message);
            }
            Message::Error { message } => {
                tracing::warn!(error = %message, "broker reported protocol error");
            }
            Message::Publish { request_id, .. } => {
                tracing::warn!(request_id, "unexpected publish frame from broker");
            }
        }
    }
}
