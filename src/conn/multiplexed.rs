//! Multiplexed connection: many requests, one byte stream.
//!
//! # Responsibilities
//! - Register one stream per request in a short-held registry
//! - Serialize frame writes through a single writer task
//! - Demultiplex responses by stream id on a single reader task
//! - Fail every live stream when the byte stream dies
//!
//! # Design Decisions
//! - The registry mutex guards bookkeeping only. Request bodies are read by
//!   the dispatching task with no lock held, and result slots are written
//!   after the lock is released
//! - The writer task only writes pre-encoded bytes, so a stalled body can
//!   never hold up frames of sibling streams
//! - A request abandoned mid-flight (cancellation) resets its stream without
//!   blocking, from a drop guard

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use crate::codec::{CodecError, Frame, FrameCodec};
use crate::conn::stream::{
    slot_outcome, Lookup, OpenError, Stream, StreamRegistry, StreamResult, StreamState,
};
use crate::error::{TransportError, TransportResult};
use crate::http::{RequestBody, RequestHead, Response};
use crate::net::connection::{ConnectionGuard, StateCell};
use crate::net::{BoxedIo, ConnectionId, ConnectionState, Destination};
use crate::observability::metrics;

/// Frames queued for the writer before senders wait.
const WRITE_QUEUE_DEPTH: usize = 64;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// State shared between dispatching tasks, the reader and the writer.
struct Shared {
    id: ConnectionId,
    destination: Destination,
    registry: Mutex<StreamRegistry>,
    state: StateCell,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, StreamRegistry> {
        // The registry has no invariants a panicking holder could break halfway.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_stream(&self) -> TransportResult<(u32, oneshot::Receiver<StreamResult>)> {
        let opened = {
            let mut registry = self.registry();
            let opened = registry.open();
            if opened.is_ok() {
                self.state.set(ConnectionState::Active);
            }
            opened
        };
        match opened {
            Ok((stream_id, rx)) => {
                metrics::record_stream_opened(&self.destination);
                Ok((stream_id, rx))
            }
            Err(OpenError::NotAccepting) => Err(TransportError::ConnectionLost(format!(
                "{} is not accepting new streams",
                self.id
            ))),
            Err(OpenError::Exhausted) => {
                self.begin_drain("stream ids exhausted");
                Err(TransportError::ConnectionLost(format!(
                    "{} ran out of stream ids",
                    self.id
                )))
            }
        }
    }

    fn half_close(&self, stream_id: u32) {
        let mut registry = self.registry();
        registry.half_close(stream_id);
    }

    /// Deliver `result` to a live stream. Returns how the id was known.
    fn complete(&self, stream_id: u32, result: TransportResult<Response>) -> Lookup {
        let (lookup, taken) = {
            let mut registry = self.registry();
            let lookup = registry.lookup(stream_id);
            (lookup, registry.take(stream_id))
        };
        if let Some(stream) = taken {
            self.deliver(stream, result);
        }
        lookup
    }

    fn deliver(&self, stream: Stream, result: TransportResult<Response>) {
        let stream_id = stream.id();
        if !stream.finish(result) {
            tracing::trace!(connection_id = %self.id, stream_id, "Stream waiter already gone");
        }
        self.stream_closed();
    }

    /// Bookkeeping after a stream left the registry.
    fn stream_closed(&self) {
        metrics::record_stream_closed(&self.destination);
        let drained = {
            let registry = self.registry();
            if !registry.is_empty() {
                return;
            }
            match self.state.get() {
                ConnectionState::Draining => true,
                ConnectionState::Active => {
                    self.state.set(ConnectionState::Idle);
                    false
                }
                _ => false,
            }
        };
        if drained {
            self.close();
        }
    }

    /// Stop accepting streams; close once the live ones finish.
    fn begin_drain(&self, reason: &str) {
        let (empty, state) = {
            let mut registry = self.registry();
            registry.stop_accepting();
            (registry.is_empty(), self.state.set(ConnectionState::Draining))
        };
        if state == ConnectionState::Draining {
            tracing::debug!(connection_id = %self.id, reason, "Connection draining");
        }
        if empty {
            self.close();
        }
    }

    /// Fail every live stream with `err` and close.
    fn fail(&self, err: TransportError) {
        let snapshot = {
            let mut registry = self.registry();
            registry.drain_all()
        };
        self.state.set(ConnectionState::Closed);
        if !snapshot.is_empty() {
            tracing::warn!(
                connection_id = %self.id,
                destination = %self.destination,
                streams = snapshot.len(),
                error = %err,
                "Connection failed with streams in flight"
            );
        }
        for stream in snapshot {
            self.deliver(stream, Err(err.clone()));
        }
        self.close();
    }

    fn close(&self) {
        self.registry().stop_accepting();
        self.state.set(ConnectionState::Closed);
        if !self.closed.send_replace(true) {
            tracing::debug!(connection_id = %self.id, destination = %self.destination, "Connection closed");
        }
    }

    fn on_frame(&self, frame: Frame) {
        match frame {
            Frame::Response {
                stream_id,
                response,
            } => self.route(stream_id, "response", Ok(response)),
            Frame::Reset { stream_id, reason } => {
                let err = TransportError::StreamReset { stream_id, reason };
                self.route(stream_id, "reset", Err(err))
            }
            Frame::GoAway { last_stream_id } => {
                let refused = {
                    let mut registry = self.registry();
                    registry.stop_accepting();
                    registry.take_above(last_stream_id)
                };
                for stream in refused {
                    self.deliver(
                        stream,
                        Err(TransportError::ConnectionLost(
                            "stream refused by peer goaway".into(),
                        )),
                    );
                }
                self.begin_drain("peer sent goaway");
            }
            other => {
                let stream_id = other.stream_id();
                self.violation(stream_id, format!("unexpected {} frame from peer", other.kind()));
            }
        }
    }

    fn route(&self, stream_id: u32, kind: &str, result: TransportResult<Response>) {
        match self.complete(stream_id, result) {
            Lookup::Live => {}
            Lookup::Stale => {
                tracing::trace!(connection_id = %self.id, stream_id, kind, "Ignoring frame for finished stream");
            }
            Lookup::Unknown => {
                self.violation(stream_id, format!("{} frame for unknown stream {}", kind, stream_id));
            }
        }
    }

    /// Fail the offending stream (if any) and stop using the connection.
    /// Sibling streams keep running to completion.
    fn violation(&self, stream_id: u32, reason: String) {
        tracing::warn!(
            connection_id = %self.id,
            destination = %self.destination,
            stream_id,
            reason = %reason,
            "Protocol violation"
        );
        self.complete(stream_id, Err(TransportError::ProtocolViolation(reason.clone())));
        self.begin_drain(&reason);
    }

    fn on_codec_error(&self, err: CodecError) {
        match err {
            CodecError::InvalidFrame { stream_id, .. } => self.violation(stream_id, err.to_string()),
            other => self.fail(TransportError::ProtocolViolation(other.to_string())),
        }
    }
}

/// Resets the stream if the dispatching future ends without a delivered result.
struct StreamGuard<'a> {
    conn: &'a Multiplexer,
    stream_id: u32,
    settled: bool,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let taken = self.conn.shared.registry().take(self.stream_id);
        if let Some(stream) = taken {
            drop(stream);
            self.conn.shared.stream_closed();
        }
        let reset = Frame::Reset {
            stream_id: self.stream_id,
            reason: "canceled".into(),
        };
        if let Ok(bytes) = self.conn.codec.encode_to_bytes(&reset) {
            // Best effort: a full queue or a dead writer means the peer learns
            // about it from the connection closing instead.
            let _ = self.conn.writer.try_send(bytes);
        }
        tracing::debug!(
            connection_id = %self.conn.shared.id,
            stream_id = self.stream_id,
            "Stream abandoned"
        );
    }
}

/// A connection shared by concurrent requests.
pub struct Multiplexer {
    shared: Arc<Shared>,
    codec: Arc<dyn FrameCodec>,
    writer: mpsc::Sender<Bytes>,
    tasks: [AbortHandle; 2],
    _guard: ConnectionGuard,
}

impl Multiplexer {
    /// Take over `io` and start its reader and writer tasks.
    pub fn start(
        io: BoxedIo,
        destination: Destination,
        codec: Arc<dyn FrameCodec>,
        guard: ConnectionGuard,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(io);
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: guard.id(),
            destination,
            registry: Mutex::new(StreamRegistry::new()),
            state: StateCell::new(ConnectionState::Idle),
            closed,
        });
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let reader = tokio::spawn(read_loop(shared.clone(), codec.clone(), read_half));
        let writer = tokio::spawn(write_loop(shared.clone(), write_half, rx));

        tracing::debug!(
            connection_id = %shared.id,
            destination = %shared.destination,
            "Multiplexed connection started"
        );

        Arc::new(Self {
            shared,
            codec,
            writer: tx,
            tasks: [reader.abort_handle(), writer.abort_handle()],
            _guard: guard,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn destination(&self) -> &Destination {
        &self.shared.destination
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// True while new streams may be opened.
    pub fn is_accepting(&self) -> bool {
        matches!(self.state(), ConnectionState::Idle | ConnectionState::Active)
            && self.shared.registry().is_accepting()
    }

    pub fn live_streams(&self) -> usize {
        self.shared.registry().len()
    }

    /// State of a live stream, if registered.
    pub fn stream_state(&self, stream_id: u32) -> Option<StreamState> {
        self.shared.registry().state(stream_id)
    }

    /// Stop accepting new streams and close after the live ones finish.
    pub fn drain(&self) {
        self.shared.begin_drain("drain requested");
    }

    /// Send one request on a new stream and wait for its response.
    ///
    /// The body is read on the calling task with no lock held. The body is
    /// not closed here.
    pub async fn dispatch(
        &self,
        head: &RequestHead,
        body: &mut dyn RequestBody,
    ) -> TransportResult<Response> {
        let (stream_id, mut rx) = self.shared.open_stream()?;
        let mut guard = StreamGuard {
            conn: self,
            stream_id,
            settled: false,
        };

        tracing::debug!(
            connection_id = %self.shared.id,
            stream_id,
            method = %head.method,
            target = %head.target,
            "Stream opened"
        );

        let empty_body = head.content_length == Some(0);
        self.send_frame(&Frame::Headers {
            stream_id,
            head: head.clone(),
            end_stream: empty_body,
        })
        .await?;

        if empty_body {
            self.shared.half_close(stream_id);
        } else {
            tokio::select! {
                biased;
                received = &mut rx => {
                    // Response arrived before the body finished; the rest of
                    // the body is not needed.
                    guard.settled = true;
                    return slot_outcome(received);
                }
                sent = self.send_body(stream_id, head.content_length, body) => sent?,
            }
        }

        let outcome = slot_outcome((&mut rx).await);
        guard.settled = true;
        outcome
    }

    async fn send_body(
        &self,
        stream_id: u32,
        declared: Option<u64>,
        body: &mut dyn RequestBody,
    ) -> TransportResult<()> {
        let mut sent: u64 = 0;
        loop {
            let chunk = match body.read_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return Err(TransportError::Body(e.to_string())),
            };
            if chunk.is_empty() {
                continue;
            }
            sent += chunk.len() as u64;
            if let Some(declared) = declared {
                if sent > declared {
                    return Err(TransportError::InvalidRequest(format!(
                        "body longer than declared content length {}",
                        declared
                    )));
                }
            }
            self.send_frame(&Frame::Data {
                stream_id,
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

        self.send_frame(&Frame::Data {
            stream_id,
            payload: Bytes::new(),
            end_stream: true,
        })
        .await?;
        self.shared.half_close(stream_id);
        Ok(())
    }

    /// Encode outside any lock and queue for the writer task.
    async fn send_frame(&self, frame: &Frame) -> TransportResult<()> {
        let bytes = self
            .codec
            .encode_to_bytes(frame)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        self.writer
            .send(bytes)
            .await
            .map_err(|_| TransportError::ConnectionLost(format!("{} writer stopped", self.shared.id)))
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("id", &self.shared.id)
            .field("destination", &self.shared.destination)
            .field("state", &self.state())
            .finish()
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn read_loop(shared: Arc<Shared>, codec: Arc<dyn FrameCodec>, mut io: ReadHalf<BoxedIo>) {
    let mut closed = shared.closed.subscribe();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => shared.on_frame(frame),
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    shared.on_codec_error(e);
                    return;
                }
                Err(e) => shared.on_codec_error(e),
            }
        }
        if shared.state.get() == ConnectionState::Closed {
            return;
        }

        let read = tokio::select! {
            read = io.read_buf(&mut buf) => read,
            _ = wait_closed(&mut closed) => return,
        };
        match read {
            Ok(0) => {
                shared.fail(TransportError::ConnectionLost("peer closed the connection".into()));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                shared.fail(TransportError::ConnectionLost(format!("read failed: {}", e)));
                return;
            }
        }
    }
}

async fn write_loop(shared: Arc<Shared>, mut io: WriteHalf<BoxedIo>, mut rx: mpsc::Receiver<Bytes>) {
    let mut closed = shared.closed.subscribe();
    loop {
        let bytes = tokio::select! {
            bytes = rx.recv() => bytes,
            _ = wait_closed(&mut closed) => None,
        };
        let Some(bytes) = bytes else {
            break;
        };
        let written = async {
            io.write_all(&bytes).await?;
            io.flush().await
        }
        .await;
        if let Err(e) = written {
            shared.fail(TransportError::ConnectionLost(format!("write failed: {}", e)));
            return;
        }
    }
    let _ = io.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireCodec;
    use crate::http::{Empty, Headers};
    use crate::net::connection::ConnectionTracker;
    use bytes::BufMut;
    use futures_util::future::BoxFuture;
    use std::io;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Yields nothing and never finishes.
    struct StalledBody;

    impl RequestBody for StalledBody {
        fn read_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
            Box::pin(std::future::pending())
        }

        fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn connect() -> (Arc<Multiplexer>, DuplexStream, ConnectionTracker) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let tracker = ConnectionTracker::new();
        let mux = Multiplexer::start(
            Box::new(client),
            "example.com:80".parse().unwrap(),
            Arc::new(WireCodec::default()),
            tracker.track(),
        );
        (mux, server, tracker)
    }

    fn head(target: &str, content_length: Option<u64>) -> RequestHead {
        RequestHead {
            method: "GET".into(),
            authority: "example.com".into(),
            target: target.into(),
            headers: Headers::new(),
            content_length,
        }
    }

    struct Peer {
        io: DuplexStream,
        buf: BytesMut,
        codec: WireCodec,
    }

    impl Peer {
        fn new(io: DuplexStream) -> Self {
            Self {
                io,
                buf: BytesMut::new(),
                codec: WireCodec::default(),
            }
        }

        async fn next_frame(&mut self) -> Option<Frame> {
            loop {
                if let Some(frame) = self.codec.decode(&mut self.buf).unwrap() {
                    return Some(frame);
                }
                if self.io.read_buf(&mut self.buf).await.unwrap() == 0 {
                    return None;
                }
            }
        }

        /// Collect `n` header frames as (stream id, target).
        async fn headers(&mut self, n: usize) -> Vec<(u32, String)> {
            let mut seen = Vec::new();
            while seen.len() < n {
                if let Some(Frame::Headers { stream_id, head, .. }) = self.next_frame().await {
                    seen.push((stream_id, head.target));
                }
            }
            seen
        }

        async fn respond(&mut self, stream_id: u32, body: &str) {
            let frame = Frame::Response {
                stream_id,
                response: Response::new(200, Headers::new(), body.to_string()),
            };
            let bytes = self.codec.encode_to_bytes(&frame).unwrap();
            self.io.write_all(&bytes).await.unwrap();
        }
    }

    #[tokio::test]
    async fn responses_are_routed_by_stream_id() {
        let (mux, server, _tracker) = connect();
        let mut peer = Peer::new(server);

        let a = tokio::spawn({
            let mux = mux.clone();
            async move { mux.dispatch(&head("/a", Some(0)), &mut Empty).await }
        });
        let b = tokio::spawn({
            let mux = mux.clone();
            async move { mux.dispatch(&head("/b", Some(0)), &mut Empty).await }
        });

        let seen = peer.headers(2).await;
        for (stream_id, target) in seen.iter().rev() {
            peer.respond(*stream_id, target).await;
        }

        assert_eq!(a.await.unwrap().unwrap().text(), "/a");
        assert_eq!(b.await.unwrap().unwrap().text(), "/b");
        assert_eq!(mux.live_streams(), 0);
        assert!(mux.is_accepting());
    }

    #[tokio::test]
    async fn stalled_body_does_not_block_sibling_stream() {
        let (mux, server, _tracker) = connect();
        let mut peer = Peer::new(server);

        let stalled = tokio::spawn({
            let mux = mux.clone();
            async move { mux.dispatch(&head("/upload", None), &mut StalledBody).await }
        });
        let first = peer.headers(1).await;
        assert_eq!(first[0].1, "/upload");
        assert_eq!(mux.stream_state(first[0].0), Some(StreamState::Open));

        let quick = tokio::spawn({
            let mux = mux.clone();
            async move { mux.dispatch(&head("/quick", Some(0)), &mut Empty).await }
        });
        let second = peer.headers(1).await;
        peer.respond(second[0].0, "fast").await;

        let response = tokio::time::timeout(Duration::from_secs(2), quick)
            .await
            .expect("sibling stream starved")
            .unwrap()
            .unwrap();
        assert_eq!(response.text(), "fast");

        // Abandoning the stalled request resets its stream on the wire.
        stalled.abort();
        let reset = loop {
            match peer.next_frame().await {
                Some(Frame::Reset { stream_id, .. }) => break stream_id,
                Some(_) => continue,
                None => panic!("connection closed before reset"),
            }
        };
        assert_eq!(reset, first[0].0);
        assert_eq!(mux.live_streams(), 0);
        assert!(mux.is_accepting());
    }

    #[tokio::test]
    async fn peer_hangup_fails_every_live_stream() {
        let (mux, server, tracker) = connect();
        let mut peer = Peer::new(server);

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let mux = mux.clone();
                tokio::spawn(async move {
                    mux.dispatch(&head(&format!("/{}", i), Some(0)), &mut Empty)
                        .await
                })
            })
            .collect();
        peer.headers(3).await;
        drop(peer);

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, TransportError::ConnectionLost(_)), "{:?}", err);
        }
        assert_eq!(mux.state(), ConnectionState::Closed);
        assert!(!mux.is_accepting());

        let err = mux.dispatch(&head("/late", Some(0)), &mut Empty).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost(_)));

        drop(mux);
        assert_eq!(tracker.open_count(), 0);
    }

    #[tokio::test]
    async fn malformed_frame_fails_only_its_stream() {
        let (mux, server, _tracker) = connect();
        let mut peer = Peer::new(server);

        let a = tokio::spawn({
            let mux = mux.clone();
            async move { mux.dispatch(&head("/a", Some(0)), &mut Empty).await }
        });
        let b = tokio::spawn({
            let mux = mux.clone();
            async move { mux.dispatch(&head("/b", Some(0)), &mut Empty).await }
        });
        let seen = peer.headers(2).await;
        let (bad, good) = (seen[0].0, seen[1].0);

        // Response frame whose head is not valid JSON.
        let mut garbage = BytesMut::new();
        garbage.put_u32(4 + 3);
        garbage.put_u8(3);
        garbage.put_u32(bad);
        garbage.put_u32(3);
        garbage.put_slice(b"{{{");
        peer.io.write_all(&garbage).await.unwrap();
        peer.respond(good, "fine").await;

        let (bad_result, good_result) = if seen[0].1 == "/a" {
            (a.await.unwrap(), b.await.unwrap())
        } else {
            (b.await.unwrap(), a.await.unwrap())
        };
        assert!(matches!(bad_result, Err(TransportError::ProtocolViolation(_))));
        assert_eq!(good_result.unwrap().text(), "fine");
        assert!(!mux.is_accepting());
    }

    #[tokio::test]
    async fn goaway_refuses_streams_above_last_id() {
        let (mux, server, _tracker) = connect();
        let mut peer = Peer::new(server);

        let calls: Vec<_> = (0..2)
            .map(|i| {
                let mux = mux.clone();
                tokio::spawn(async move {
                    mux.dispatch(&head(&format!("/{}", i), Some(0)), &mut Empty)
                        .await
                })
            })
            .collect();
        let mut seen = peer.headers(2).await;
        seen.sort();
        let (kept, refused) = (seen[0].0, seen[1].0);

        let goaway = peer
            .codec
            .encode_to_bytes(&Frame::GoAway {
                last_stream_id: kept,
            })
            .unwrap();
        peer.io.write_all(&goaway).await.unwrap();
        peer.respond(kept, "kept").await;

        let mut ok = 0;
        let mut lost = 0;
        for call in calls {
            match call.await.unwrap() {
                Ok(response) => {
                    assert_eq!(response.text(), "kept");
                    ok += 1;
                }
                Err(TransportError::ConnectionLost(_)) => lost += 1,
                Err(other) => panic!("unexpected error for stream {}: {:?}", refused, other),
            }
        }
        assert_eq!((ok, lost), (1, 1));
        assert!(!mux.is_accepting());
    }
}
