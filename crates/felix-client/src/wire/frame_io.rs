// Frame IO for felix-wire over any tokio byte stream.
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use felix_wire::{Frame, FrameHeader, Message};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::decode_log::{log_decode_error, log_oversized_frame};

/// Outcome of reading one message off the stream.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    Message(Message),
    /// A well-framed payload that did not decode or exceeded the frame cap;
    /// the stream is still usable.
    Undecodable,
    Closed,
}

/// One frame off the stream, or the length of a payload that was skipped.
#[derive(Debug)]
pub(crate) enum FrameRead {
    Frame(Frame),
    Oversized { length: usize },
    Closed,
}

pub(crate) async fn read_message<R>(
    recv: &mut R,
    frame_scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<ReadOutcome>
where
    R: AsyncRead + Unpin,
{
    let frame = match read_frame_into(recv, frame_scratch, max_frame_bytes).await? {
        FrameRead::Frame(frame) => frame,
        FrameRead::Oversized { length } => {
            log_oversized_frame("read_message", length, max_frame_bytes);
            return Ok(ReadOutcome::Undecodable);
        }
        FrameRead::Closed => return Ok(ReadOutcome::Closed),
    };
    match Message::decode(frame.clone()).context("decode message") {
        Ok(message) => Ok(ReadOutcome::Message(message)),
        Err(err) => {
            log_decode_error("read_message", &err, &frame);
            Ok(ReadOutcome::Undecodable)
        }
    }
}

/// Reads one frame into `scratch`.
///
/// A payload longer than `max_frame_bytes` is discarded without buffering it
/// and reported as `Oversized`. A clean end of stream at a frame boundary is
/// `Closed`. A bad header is an error: the stream cannot be resynchronised.
pub(crate) async fn read_frame_into<R>(
    recv: &mut R,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<FrameRead>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(FrameRead::Closed),
        Err(err) => return Err(err).context("read frame header"),
    }

    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))
        .context("decode frame header")?;
    let length = usize::try_from(header.length).context("frame length")?;

    // The cap is checked before the payload buffer is sized.
    if length > max_frame_bytes {
        let expected = u64::from(header.length);
        let mut payload = (&mut *recv).take(expected);
        let skipped = tokio::io::copy(&mut payload, &mut tokio::io::sink())
            .await
            .context("skip oversized frame payload")?;
        if skipped < expected {
            return Err(anyhow::anyhow!(
                "stream ended inside oversized frame: {skipped} of {expected} bytes"
            ));
        }
        return Ok(FrameRead::Oversized { length });
    }

    scratch.clear();
    scratch.resize(length, 0u8);
    recv.read_exact(&mut scratch[..])
        .await
        .context("read frame payload")?;

    Ok(FrameRead::Frame(Frame {
        header,
        payload: scratch.split().freeze(),
    }))
}

pub(crate) async fn write_frame_parts<W>(send: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    frame.header.encode_into(&mut header_bytes);
    send.write_all(&header_bytes)
        .await
        .context("write frame header")?;
    send.write_all(&frame.payload)
        .await
        .context("write frame payload")?;
    Ok(())
}

pub(crate) async fn write_message<W>(send: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode().context("encode message")?;
    write_frame_parts(send, &frame).await?;
    send.flush().await.context("flush frame")
}
