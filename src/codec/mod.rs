//! Frame codec subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound: RequestHead / body chunk
//!     → Frame::{Headers, Data}
//!     → FrameCodec::encode (into a BytesMut)
//!     → raw write on the connection
//!
//! Inbound: raw bytes appended to a read buffer
//!     → FrameCodec::decode (zero or more complete frames)
//!     → Frame::{Response, Reset, GoAway} routed by stream id
//! ```
//!
//! # Design Decisions
//! - The codec is a capability: the conn layer only relies on frame
//!   boundaries and stream ids, never on the byte layout
//! - Decode errors say whether the frame boundary survived, so a bad frame
//!   can fail one stream instead of the whole connection

pub mod wire;

use bytes::{Bytes, BytesMut};

use crate::http::{RequestHead, Response};

pub use wire::WireCodec;

/// One unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Request head opening a stream.
    Headers {
        stream_id: u32,
        head: RequestHead,
        end_stream: bool,
    },
    /// A chunk of request body.
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
    },
    /// Complete response for a stream.
    Response { stream_id: u32, response: Response },
    /// Abandon a stream.
    Reset { stream_id: u32, reason: String },
    /// Sender accepts no new streams above `last_stream_id`.
    GoAway { last_stream_id: u32 },
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Headers { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::Response { stream_id, .. }
            | Frame::Reset { stream_id, .. } => *stream_id,
            Frame::GoAway { last_stream_id } => *last_stream_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Headers { .. } => "headers",
            Frame::Data { .. } => "data",
            Frame::Response { .. } => "response",
            Frame::Reset { .. } => "reset",
            Frame::GoAway { .. } => "goaway",
        }
    }
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Declared frame length over the limit. The stream is out of sync.
    #[error("frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// The frame was consumed but its content is unusable.
    #[error("invalid {kind} frame on stream {stream_id}: {reason}")]
    InvalidFrame {
        kind: &'static str,
        stream_id: u32,
        reason: String,
    },

    /// The frame could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),
}

impl CodecError {
    /// True when decoding cannot continue on this byte stream.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::FrameTooLarge { .. })
    }
}

/// Serializes frames to bytes and back.
pub trait FrameCodec: Send + Sync + 'static {
    /// Append the encoding of `frame` to `dst`.
    fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError>;

    /// Take one complete frame off the front of `src`. `Ok(None)` means more
    /// bytes are needed and `src` is left untouched.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError>;

    /// Encode a single frame into its own buffer.
    fn encode_to_bytes(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        let mut dst = BytesMut::new();
        self.encode(frame, &mut dst)?;
        Ok(dst.freeze())
    }
}
