// Framed wire format for publish requests and their acknowledgements.
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const MAGIC: u32 = 0x464C5831;
pub const VERSION: u16 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("failed to serialize message")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut raw = [0u8; Self::LEN];
        self.encode_into(&mut raw);
        buf.extend_from_slice(&raw);
    }

    /// Writes the header in network byte order into a fixed buffer.
    pub fn encode_into(&self, out: &mut [u8; Self::LEN]) {
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate magic and version before trusting the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use felix_wire::Frame;
///
/// let frame = Frame::new(0, Bytes::from_static(b"hello")).expect("frame");
/// let decoded = Frame::decode(frame.encode()).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        let length = u32::try_from(payload.len()).map_err(|_| Error::FrameTooLarge)?;
        Ok(Self {
            header: FrameHeader::new(flags, length),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// Broker-side constraints attached to a publish.
///
/// The client never evaluates these; it only carries them to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectations {
    /// Deduplication id; repeats inside the broker's window are acked as duplicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_last_sequence: Option<u64>,
}

impl Expectations {
    pub fn is_empty(&self) -> bool {
        self.msg_id.is_none()
            && self.expected_stream.is_none()
            && self.expected_last_sequence.is_none()
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = Some(msg_id.into());
        self
    }

    pub fn with_expected_stream(mut self, stream: impl Into<String>) -> Self {
        self.expected_stream = Some(stream.into());
        self
    }

    pub fn with_expected_last_sequence(mut self, sequence: u64) -> Self {
        self.expected_last_sequence = Some(sequence);
        self
    }
}

/// Broker acknowledgement for one stored (or deduplicated) publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    pub duplicate: bool,
}

/// Wire messages encoded in framed payloads.
///
/// ```
/// use felix_wire::{Expectations, Message};
///
/// let message = Message::Publish {
///     subject: "orders.created".to_string(),
///     payload: b"hello".to_vec(),
///     request_id: 1,
///     expect: Expectations::default().with_msg_id("order-1"),
/// };
/// let frame = message.encode().expect("encode");
/// let decoded = Message::decode(frame).expect("decode");
/// assert_eq!(message, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Publish {
        subject: String,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
        request_id: u64,
        #[serde(default, skip_serializing_if = "Expectations::is_empty")]
        expect: Expectations,
    },
    PublishOk {
        request_id: u64,
        stream: String,
        seq: u64,
        #[serde(default)]
        duplicate: bool,
    },
    PublishError {
        request_id: u64,
        code: u16,
        message: String,
    },
    // Protocol-level error not tied to a request id.
    Error {
        message: String,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(0, Bytes::from(payload))
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)
    }

    pub fn publish_ok(request_id: u64, ack: PublishAck) -> Self {
        Message::PublishOk {
            request_id,
            stream: ack.stream,
            seq: ack.sequence,
            duplicate: ack.duplicate,
        }
    }

    /// Correlation id carried by request and response variants.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Message::Publish { request_id, .. }
            | Message::PublishOk { request_id, .. }
            | Message::PublishError { request_id, .. } => Some(*request_id),
            Message::Error { .. } => None,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, de::Error};

    pub fn serialize<S>(value: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)
    }
}
