//! Length-delimited frame format.
//!
//! ```text
//! +----------------+--------+------------------+-----------------+
//! | length (u32)   | kind   | stream id (u32)  | payload         |
//! | payload bytes  | (u8)   |                  | (length bytes)  |
//! +----------------+--------+------------------+-----------------+
//!
//! headers:  flags (u8) | JSON RequestHead
//! data:     flags (u8) | body bytes
//! response: head length (u32) | JSON ResponseHead | body bytes
//! reset:    UTF-8 reason
//! goaway:   empty, stream id field carries the last accepted stream
//! ```
//!
//! All integers are big endian. Flag bit 0 is END_STREAM.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{CodecError, Frame, FrameCodec};
use crate::http::{RequestHead, Response, ResponseHead};

const HEADER_LEN: usize = 9;

const KIND_HEADERS: u8 = 1;
const KIND_DATA: u8 = 2;
const KIND_RESPONSE: u8 = 3;
const KIND_RESET: u8 = 4;
const KIND_GOAWAY: u8 = 5;

const FLAG_END_STREAM: u8 = 0x1;

/// Default upper bound on a frame payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// The crate's built-in [`FrameCodec`].
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_frame_size: usize,
}

impl WireCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn put_header(&self, dst: &mut BytesMut, kind: u8, stream_id: u32, len: usize) -> Result<(), CodecError> {
        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        dst.reserve(HEADER_LEN + len);
        dst.put_u32(len as u32);
        dst.put_u8(kind);
        dst.put_u32(stream_id);
        Ok(())
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

fn flags(end_stream: bool) -> u8 {
    if end_stream {
        FLAG_END_STREAM
    } else {
        0
    }
}

impl FrameCodec for WireCodec {
    fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        match frame {
            Frame::Headers {
                stream_id,
                head,
                end_stream,
            } => {
                let json = serde_json::to_vec(head).map_err(|e| CodecError::Encode(e.to_string()))?;
                self.put_header(dst, KIND_HEADERS, *stream_id, 1 + json.len())?;
                dst.put_u8(flags(*end_stream));
                dst.put_slice(&json);
            }
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => {
                self.put_header(dst, KIND_DATA, *stream_id, 1 + payload.len())?;
                dst.put_u8(flags(*end_stream));
                dst.put_slice(payload);
            }
            Frame::Response {
                stream_id,
                response,
            } => {
                let json = serde_json::to_vec(response.head())
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
                let body = response.body();
                self.put_header(dst, KIND_RESPONSE, *stream_id, 4 + json.len() + body.len())?;
                dst.put_u32(json.len() as u32);
                dst.put_slice(&json);
                dst.put_slice(body);
            }
            Frame::Reset { stream_id, reason } => {
                self.put_header(dst, KIND_RESET, *stream_id, reason.len())?;
                dst.put_slice(reason.as_bytes());
            }
            Frame::GoAway { last_stream_id } => {
                self.put_header(dst, KIND_GOAWAY, *last_stream_id, 0)?;
            }
        }
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(HEADER_LEN + len);
        frame.advance(4);
        let kind = frame.get_u8();
        let stream_id = frame.get_u32();
        let payload = frame.freeze();

        decode_payload(kind, stream_id, payload).map(Some)
    }
}

fn decode_payload(kind: u8, stream_id: u32, mut payload: Bytes) -> Result<Frame, CodecError> {
    let invalid = |kind: &'static str, reason: String| CodecError::InvalidFrame {
        kind,
        stream_id,
        reason,
    };

    match kind {
        KIND_HEADERS => {
            if payload.is_empty() {
                return Err(invalid("headers", "missing flags".into()));
            }
            let end_stream = payload.get_u8() & FLAG_END_STREAM != 0;
            let head: RequestHead =
                serde_json::from_slice(&payload).map_err(|e| invalid("headers", e.to_string()))?;
            Ok(Frame::Headers {
                stream_id,
                head,
                end_stream,
            })
        }
        KIND_DATA => {
            if payload.is_empty() {
                return Err(invalid("data", "missing flags".into()));
            }
            let end_stream = payload.get_u8() & FLAG_END_STREAM != 0;
            Ok(Frame::Data {
                stream_id,
                payload,
                end_stream,
            })
        }
        KIND_RESPONSE => {
            if payload.len() < 4 {
                return Err(invalid("response", "missing head length".into()));
            }
            let head_len = payload.get_u32() as usize;
            if head_len > payload.len() {
                return Err(invalid(
                    "response",
                    format!("head length {} exceeds payload {}", head_len, payload.len()),
                ));
            }
            let head_bytes = payload.split_to(head_len);
            let head: ResponseHead =
                serde_json::from_slice(&head_bytes).map_err(|e| invalid("response", e.to_string()))?;
            Ok(Frame::Response {
                stream_id,
                response: Response::from_parts(head, payload),
            })
        }
        KIND_RESET => {
            let reason = String::from_utf8(payload.to_vec())
                .map_err(|e| invalid("reset", e.to_string()))?;
            Ok(Frame::Reset { stream_id, reason })
        }
        KIND_GOAWAY => Ok(Frame::GoAway {
            last_stream_id: stream_id,
        }),
        other => Err(invalid("unknown", format!("unknown frame kind {}", other))),
    }
}
