// Shared helpers for integration tests: a framed broker loop over a duplex stream.
#![allow(dead_code)]

use anyhow::{Context, Result};
use bytes::Bytes;
use felix_broker::{Broker, StreamConfig};
use felix_wire::{Frame, FrameHeader, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

pub async fn broker_with_orders() -> Arc<Broker> {
    let broker = Arc::new(Broker::new());
    broker
        .add_stream(StreamConfig::new("ORDERS", ["orders.>"]))
        .await
        .expect("stream");
    broker
}

#[derive(Clone, Copy, Default)]
pub struct ServeOptions {
    /// Even request ids are answered this much later than odd ones.
    pub delay_even: Option<Duration>,
    /// Write one undecodable frame before serving.
    pub garbage_first: bool,
}

/// Starts a broker loop on one end of a duplex pipe and returns the other end.
pub fn spawn_broker_server(broker: Arc<Broker>, options: ServeOptions) -> DuplexStream {
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        if let Err(err) = serve(server, broker, options).await {
            tracing::debug!(error = %err, "test broker loop ended");
        }
    });
    client
}

async fn serve(stream: DuplexStream, broker: Arc<Broker>, options: ServeOptions) -> Result<()> {
    let (mut recv, mut send) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        if options.garbage_first {
            let frame = Frame::new(0, Bytes::from_static(b"\x00not-json"))?;
            write_frame(&mut send, &frame).await?;
        }
        while let Some(message) = rx.recv().await {
            let frame = message.encode().context("encode reply")?;
            write_frame(&mut send, &frame).await?;
        }
        anyhow::Ok(())
    });

    while let Some(frame) = read_frame(&mut recv).await? {
        let Message::Publish {
            subject,
            payload,
            request_id,
            expect,
        } = Message::decode(frame).context("decode request")?
        else {
            continue;
        };
        let broker = broker.clone();
        let tx = tx.clone();
        let delay = options.delay_even.filter(|_| request_id % 2 == 0);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let reply = match broker.publish(&subject, Bytes::from(payload), &expect).await {
                Ok(ack) => Message::publish_ok(request_id, ack),
                Err(err) => Message::PublishError {
                    request_id,
                    code: err.code(),
                    message: err.to_string(),
                },
            };
            let _ = tx.send(reply);
        });
    }
    drop(tx);
    writer.await.context("writer task")?
}

pub async fn read_frame<R: AsyncRead + Unpin>(recv: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let header = FrameHeader::decode(Bytes::copy_from_slice(&header))?;
    let mut payload = vec![0u8; header.length as usize];
    recv.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        header,
        payload: Bytes::from(payload),
    }))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(send: &mut W, frame: &Frame) -> Result<()> {
    send.write_all(&frame.encode()).await?;
    send.flush().await?;
    Ok(())
}
