// Wire helpers for felix-wire framing over tokio byte streams.
pub(crate) use self::frame_io::{ReadOutcome, read_message, write_message};

mod decode_log;
mod frame_io;
