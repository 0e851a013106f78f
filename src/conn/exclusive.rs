//! Exclusive connection: one request at a time.
//!
//! # Responsibilities
//! - Write one request (headers, then body chunks) and read its response
//! - Decide whether the connection can carry another request
//!
//! # Design Decisions
//! - The connection is owned by the task running the request, so no lock
//!   exists to be held while the body is read
//! - Reuse needs two confirmations: the exchange finished with an empty read
//!   buffer, and the previous request body reported its close through the
//!   shared reuse flag
//! - An exchange that is interrupted (error or dropped future) leaves the
//!   connection broken; it is never reused
//! - Input that shows up while the connection is idle (late bytes or EOF)
//!   breaks it; it is checked without waiting before every exchange

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::codec::{Frame, FrameCodec};
use crate::error::{TransportError, TransportResult};
use crate::http::{RequestBody, RequestHead, Response};
use crate::net::connection::ConnectionGuard;
use crate::net::{BoxedIo, ConnectionId, ConnectionState, Destination};

/// Exclusive exchanges always use stream 1.
const STREAM_ID: u32 = 1;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// A connection owned by one request at a time.
pub struct ExclusiveConn {
    id: ConnectionId,
    destination: Destination,
    io: BoxedIo,
    read_buf: BytesMut,
    write_buf: BytesMut,
    codec: Arc<dyn FrameCodec>,
    /// Set once the previous occupant's body close returned.
    body_closed: Arc<AtomicBool>,
    broken: bool,
    state: ConnectionState,
    idle_since: Instant,
    _guard: ConnectionGuard,
}

impl ExclusiveConn {
    pub fn new(
        io: BoxedIo,
        destination: Destination,
        codec: Arc<dyn FrameCodec>,
        guard: ConnectionGuard,
    ) -> Self {
        Self {
            id: guard.id(),
            destination,
            io,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buf: BytesMut::new(),
            codec,
            body_closed: Arc::new(AtomicBool::new(true)),
            broken: false,
            state: ConnectionState::Idle,
            idle_since: Instant::now(),
            _guard: guard,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Flag the body closer sets once the current request body is closed.
    pub fn reuse_flag(&self) -> Arc<AtomicBool> {
        self.body_closed.clone()
    }

    /// Ready for another request: last exchange clean and its body closed.
    pub fn is_reusable(&self) -> bool {
        !self.broken && self.body_closed.load(Ordering::Acquire)
    }

    /// True if the last exchange left the connection unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
        self.state = ConnectionState::Closed;
    }

    /// True if the connection sat idle for longer than `idle_timeout`.
    pub fn is_expired(&self, idle_timeout: Duration) -> bool {
        !idle_timeout.is_zero() && self.idle_since.elapsed() > idle_timeout
    }

    /// Poll the socket once without waiting. Returns false, and marks the
    /// connection broken, if the peer sent bytes or closed while idle.
    pub fn check_idle_input(&mut self) -> bool {
        if self.broken {
            return false;
        }
        let pending = match self.io.read_buf(&mut self.read_buf).now_or_never() {
            None => return true,
            Some(Ok(0)) => "peer closed the idle connection".to_string(),
            Some(Ok(n)) => format!("{} unsolicited bytes while idle", n),
            Some(Err(e)) => format!("read failed while idle: {}", e),
        };
        tracing::debug!(
            connection_id = %self.id,
            destination = %self.destination,
            reason = %pending,
            "Idle connection out of step, will not be reused"
        );
        self.mark_broken();
        false
    }

    /// Run one request/response exchange.
    ///
    /// The body is read but not closed here.
    pub async fn dispatch(
        &mut self,
        head: &RequestHead,
        body: &mut dyn RequestBody,
    ) -> TransportResult<Response> {
        if !self.check_idle_input() {
            return Err(TransportError::ConnectionLost(format!("{} is closed", self.id)));
        }
        self.body_closed.store(false, Ordering::Release);
        // Cleared only when the exchange completes; a dropped future leaves it set.
        self.broken = true;
        self.state = ConnectionState::Active;

        tracing::debug!(
            connection_id = %self.id,
            method = %head.method,
            target = %head.target,
            "Exclusive exchange started"
        );

        let response = match self.exchange(head, body).await {
            Ok(response) => response,
            Err(e) => {
                self.state = ConnectionState::Closed;
                return Err(e);
            }
        };

        if self.read_buf.is_empty() {
            self.broken = false;
            self.state = ConnectionState::Idle;
            self.idle_since = Instant::now();
        } else {
            tracing::debug!(
                connection_id = %self.id,
                leftover = self.read_buf.len(),
                "Bytes left after response, connection will not be reused"
            );
            self.state = ConnectionState::Closed;
        }
        Ok(response)
    }

    async fn exchange(
        &mut self,
        head: &RequestHead,
        body: &mut dyn RequestBody,
    ) -> TransportResult<Response> {
        let empty_body = head.content_length == Some(0);
        self.write_frame(&Frame::Headers {
            stream_id: STREAM_ID,
            head: head.clone(),
            end_stream: empty_body,
        })
        .await?;
        if !empty_body {
            self.write_body(head.content_length, body).await?;
        }
        self.io
            .flush()
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("write failed: {}", e)))?;
        self.read_response().await
    }

    async fn write_body(&mut self, declared: Option<u64>, body: &mut dyn RequestBody) -> TransportResult<()> {
        let mut sent: u64 = 0;
        while let Some(chunk) = body
            .read_chunk()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?
        {
            if chunk.is_empty() {
                continue;
            }
            sent += chunk.len() as u64;
            if let Some(declared) = declared.filter(|declared| sent > *declared) {
                return Err(TransportError::InvalidRequest(format!(
                    "body longer than declared content length {}",
                    declared
                )));
            }
            self.write_frame(&Frame::Data {
                stream_id: STREAM_ID,
                payload: chunk,
                end_stream: false,
            })
            .await?;
        }
        if let Some(declared) = declared {
            if sent != declared {
                return Err(TransportError::InvalidRequest(format!(
                    "content length {} declared but body produced {} bytes",
                    declared, sent
                )));
            }
        }
        self.write_frame(&Frame::Data {
            stream_id: STREAM_ID,
            payload: Bytes::new(),
            end_stream: true,
        })
        .await
    }

    async fn write_frame(&mut self, frame: &Frame) -> TransportResult<()> {
        self.write_buf.clear();
        self.codec
            .encode(frame, &mut self.write_buf)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        self.io
            .write_all(&self.write_buf)
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("write failed: {}", e)))
    }

    async fn read_response(&mut self) -> TransportResult<Response> {
        loop {
            let decoded = self
                .codec
                .decode(&mut self.read_buf)
                .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;
            match decoded {
                Some(Frame::Response {
                    stream_id: STREAM_ID,
                    response,
                }) => return Ok(response),
                Some(Frame::Reset {
                    stream_id: STREAM_ID,
                    reason,
                }) => {
                    return Err(TransportError::StreamReset {
                        stream_id: STREAM_ID,
                        reason,
                    })
                }
                Some(other) => {
                    return Err(TransportError::ProtocolViolation(format!(
                        "unexpected {} frame on stream {} of an exclusive connection",
                        other.kind(),
                        other.stream_id()
                    )))
                }
                None => {}
            }

            let n = self
                .io
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| TransportError::ConnectionLost(format!("read failed: {}", e)))?;
            if n == 0 {
                return Err(TransportError::ConnectionLost(
                    "peer closed the connection".into(),
                ));
            }
        }
    }
}

impl std::fmt::Debug for ExclusiveConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveConn")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("state", &self.state)
            .field("broken", &self.broken)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireCodec;
    use crate::http::{Empty, Full, Headers};
    use crate::net::connection::ConnectionTracker;
    use tokio::io::DuplexStream;

    fn connect() -> (ExclusiveConn, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let tracker = ConnectionTracker::new();
        let conn = ExclusiveConn::new(
            Box::new(client),
            "example.com:80".parse().unwrap(),
            Arc::new(WireCodec::default()),
            tracker.track(),
        );
        (conn, server)
    }

    fn head(content_length: Option<u64>) -> RequestHead {
        RequestHead {
            method: "POST".into(),
            authority: "example.com".into(),
            target: "/echo".into(),
            headers: Headers::new(),
            content_length,
        }
    }

    /// Echo the request body back; append `trailing` after the response.
    async fn serve_one(mut io: DuplexStream, trailing: &'static [u8]) -> DuplexStream {
        let codec = WireCodec::default();
        let mut buf = BytesMut::new();
        let mut body = Vec::new();
        loop {
            match codec.decode(&mut buf).unwrap() {
                Some(Frame::Headers { end_stream: true, .. }) => break,
                Some(Frame::Headers { .. }) => {}
                Some(Frame::Data {
                    payload,
                    end_stream,
                    ..
                }) => {
                    body.extend_from_slice(&payload);
                    if end_stream {
                        break;
                    }
                }
                Some(other) => panic!("unexpected frame {:?}", other),
                None => {
                    if io.read_buf(&mut buf).await.unwrap() == 0 {
                        return io;
                    }
                }
            }
        }
        let response = Frame::Response {
            stream_id: STREAM_ID,
            response: Response::new(200, Headers::new(), body),
        };
        io.write_all(&codec.encode_to_bytes(&response).unwrap()).await.unwrap();
        io.write_all(trailing).await.unwrap();
        io
    }

    #[tokio::test]
    async fn reusable_only_after_body_closed() {
        let (mut conn, server) = connect();
        let peer = tokio::spawn(serve_one(server, b""));

        let mut body = Full::new("hello exclusive").with_chunk_size(4);
        let response = conn.dispatch(&head(Some(15)), &mut body).await.unwrap();
        assert_eq!(response.text(), "hello exclusive");
        peer.await.unwrap();

        assert!(!conn.is_broken());
        assert!(!conn.is_reusable());
        conn.reuse_flag().store(true, Ordering::Release);
        assert!(conn.is_reusable());
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn leftover_bytes_prevent_reuse() {
        let (mut conn, server) = connect();
        let peer = tokio::spawn(serve_one(server, b"junk"));

        let response = conn.dispatch(&head(Some(0)), &mut Empty).await.unwrap();
        assert_eq!(response.status(), 200);
        let _server = peer.await.unwrap();

        conn.reuse_flag().store(true, Ordering::Release);
        assert!(conn.is_broken());
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn late_response_breaks_idle_connection() {
        let (mut conn, server) = connect();
        let peer = tokio::spawn(serve_one(server, b""));

        let response = conn.dispatch(&head(Some(0)), &mut Empty).await.unwrap();
        assert_eq!(response.status(), 200);
        let mut server = peer.await.unwrap();
        conn.reuse_flag().store(true, Ordering::Release);
        assert!(conn.is_reusable());

        let stale = Frame::Response {
            stream_id: STREAM_ID,
            response: Response::new(200, Headers::new(), "STALE"),
        };
        let codec = WireCodec::default();
        server.write_all(&codec.encode_to_bytes(&stale).unwrap()).await.unwrap();

        assert!(!conn.check_idle_input());
        assert!(conn.is_broken());
        let err = conn.dispatch(&head(Some(0)), &mut Empty).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn idle_eof_breaks_connection() {
        let (mut conn, server) = connect();
        let peer = tokio::spawn(serve_one(server, b""));
        conn.dispatch(&head(Some(0)), &mut Empty).await.unwrap();
        drop(peer.await.unwrap());

        assert!(!conn.check_idle_input());
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn quiet_idle_connection_stays_usable() {
        let (mut conn, _server) = connect();
        assert!(conn.check_idle_input());
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn peer_hangup_is_connection_lost() {
        let (mut conn, server) = connect();
        drop(server);
        let err = conn.dispatch(&head(Some(0)), &mut Empty).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost(_)));
        assert!(conn.is_broken());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn content_length_mismatch_is_invalid_request() {
        let (mut conn, _server) = connect();
        let mut body = Full::new("short");
        let err = conn.dispatch(&head(Some(100)), &mut body).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
        assert!(conn.is_broken());
    }

    #[test]
    fn zero_idle_timeout_never_expires() {
        let (client, _server) = tokio::io::duplex(64);
        let conn = ExclusiveConn::new(
            Box::new(client),
            "example.com:80".parse().unwrap(),
            Arc::new(WireCodec::default()),
            ConnectionTracker::new().track(),
        );
        assert!(!conn.is_expired(Duration::ZERO));
        assert!(!conn.is_expired(Duration::from_secs(60)));
    }
}
