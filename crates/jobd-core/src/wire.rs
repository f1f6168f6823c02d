//! Protocol messages and framing.
//!
//! Every exchange on the wire is a protobuf message inside a
//! length-prefixed frame:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! The client sends one [`Request`] at a time. Unary operations answer with
//! exactly one [`Response`]; `stream` answers with any number of `data`
//! frames followed by `end`. While a stream is in flight, any inbound frame
//! from the client (or the client closing its half) is the cancellation
//! signal for that stream.
//!
//! Frame lengths are validated against [`MAX_FRAME_SIZE`] before any
//! allocation happens.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length of the frame header (u32, big-endian).
const HEADER_LEN: usize = 4;

/// Errors raised by the codec and message decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// A frame announced or carried more bytes than the protocol allows.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// The payload was not a valid protobuf message.
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Launch a command on the worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartRequest {
    /// Program path or name resolved on the worker.
    #[prost(string, tag = "1")]
    pub path: String,
    /// Program arguments.
    #[prost(string, repeated, tag = "2")]
    pub args: Vec<String>,
}

/// Reference to a job by its opaque id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobRef {
    #[prost(string, tag = "1")]
    pub id: String,
}

/// Snapshot of a job's lifecycle state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusReply {
    #[prost(enumeration = "ProcStatus", tag = "1")]
    pub proc_status: i32,
    /// Meaningful only when `proc_status` is `Stopped`.
    #[prost(int32, tag = "2")]
    pub exit_code: i32,
    /// Terminating signal number, `0` when the job was not signalled.
    #[prost(int32, tag = "3")]
    pub signal: i32,
}

/// One chunk of captured job output.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogData {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

/// Structured failure reported to the client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorReply {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Empty acknowledgement body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {}

/// Envelope for everything a client can ask.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(oneof = "request::Op", tags = "1, 2, 3, 4")]
    pub op: Option<request::Op>,
}

pub mod request {
    /// The requested operation.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Op {
        #[prost(message, tag = "1")]
        Start(super::StartRequest),
        #[prost(message, tag = "2")]
        Stop(super::JobRef),
        #[prost(message, tag = "3")]
        Status(super::JobRef),
        #[prost(message, tag = "4")]
        Stream(super::JobRef),
    }
}

/// Envelope for everything the server can answer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(oneof = "response::Body", tags = "1, 2, 3, 4, 5, 6")]
    pub body: Option<response::Body>,
}

pub mod response {
    /// The response body.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        /// `start` succeeded; carries the new job id.
        #[prost(message, tag = "1")]
        Started(super::JobRef),
        /// `stop` succeeded.
        #[prost(message, tag = "2")]
        Stopped(super::Ack),
        /// `status` snapshot.
        #[prost(message, tag = "3")]
        Status(super::StatusReply),
        /// One chunk of streamed output.
        #[prost(message, tag = "4")]
        Data(super::LogData),
        /// The stream reached end-of-stream or was cancelled.
        #[prost(message, tag = "5")]
        End(super::Ack),
        /// The operation failed.
        #[prost(message, tag = "6")]
        Error(super::ErrorReply),
    }
}

/// Job lifecycle states on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProcStatus {
    NotStarted = 0,
    Running = 1,
    Stopped = 2,
}

impl std::fmt::Display for ProcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Failure kinds surfaced to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    BadArgument = 0,
    PermissionDenied = 1,
    NotFound = 2,
    Internal = 3,
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Length-prefixed frame codec for [`tokio_util::codec::Framed`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with the protocol's maximum frame size.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Codec with a smaller cap, for tests.
    #[must_use]
    pub const fn with_max_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Validate the announced length before reserving anything.
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), WireError> {
        if item.len() > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // validated above
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
