//! Shared utilities for integration tests: an in-memory peer speaking the
//! wire codec, a dialer that connects to it, and request bodies with
//! controllable behavior.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

use muxpool::codec::{Frame, FrameCodec, WireCodec};
use muxpool::config::TransportConfig;
use muxpool::http::{Headers, RequestBody, RequestHead, Response};
use muxpool::net::{BoxedIo, Destination, Dialer, Mode};
use muxpool::Transport;

pub const BASE_URL: &str = "http://mock.test";

/// Counters observed by the peer.
#[derive(Debug, Default)]
pub struct PeerStats {
    pub connections: AtomicUsize,
    pub requests: AtomicUsize,
    pub resets: AtomicUsize,
}

/// Dialer that connects to an in-memory peer.
#[derive(Debug)]
pub struct MockDialer {
    pub stats: Arc<PeerStats>,
    dial_delay: Duration,
    refuse: AtomicBool,
    dials: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockDialer {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(PeerStats::default()),
            dial_delay: Duration::ZERO,
            refuse: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = delay;
        self
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Highest number of dials that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Dialer for MockDialer {
    fn open<'a>(&'a self, _destination: &'a Destination) -> BoxFuture<'a, io::Result<BoxedIo>> {
        Box::pin(async move {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _in_flight = InFlight(&self.in_flight);
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.dial_delay.is_zero() {
                tokio::time::sleep(self.dial_delay).await;
            }
            if self.refuse.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
            }

            let (client, server) = tokio::io::duplex(256 * 1024);
            self.stats.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(server, self.stats.clone()));
            Ok(Box::new(client) as BoxedIo)
        })
    }
}

enum Outbound {
    Bytes(Bytes),
    Hangup,
}

/// Serve one connection.
///
/// Routes by request target:
/// - `/delay/<ms>`: respond after `ms` milliseconds
/// - `/echo`: respond with the request body
/// - `/hang`: never respond
/// - `/hangup`: close the connection
/// - `/malformed`: send an undecodable response frame
/// - `/reset`: reset the stream
/// - `/trailing`: respond, then send stray bytes
/// - anything else: respond with the target as body
async fn serve(io: DuplexStream, stats: Arc<PeerStats>) {
    let codec = WireCodec::default();
    let (mut reader, mut writer) = tokio::io::split(io);
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Bytes(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Outbound::Hangup => break,
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut buf = BytesMut::new();
    let mut pending: HashMap<u32, (RequestHead, BytesMut)> = HashMap::new();
    loop {
        let frame = loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => break Some(frame),
                Ok(None) => {}
                Err(_) => return,
            }
            match reader.read_buf(&mut buf).await {
                Ok(0) | Err(_) => break None,
                Ok(_) => {}
            }
        };
        let Some(frame) = frame else {
            return;
        };

        let finished = match frame {
            Frame::Headers {
                stream_id,
                head,
                end_stream,
            } => {
                pending.insert(stream_id, (head, BytesMut::new()));
                end_stream.then_some(stream_id)
            }
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => {
                if let Some((_, body)) = pending.get_mut(&stream_id) {
                    body.extend_from_slice(&payload);
                }
                end_stream.then_some(stream_id)
            }
            Frame::Reset { stream_id, .. } => {
                stats.resets.fetch_add(1, Ordering::SeqCst);
                pending.remove(&stream_id);
                None
            }
            _ => None,
        };

        let Some(stream_id) = finished else {
            continue;
        };
        let Some((head, body)) = pending.remove(&stream_id) else {
            continue;
        };
        stats.requests.fetch_add(1, Ordering::SeqCst);
        if head.target == "/hangup" {
            let _ = tx.send(Outbound::Hangup);
            return;
        }
        respond(&codec, &tx, stream_id, head, body.freeze());
    }
}

fn respond(codec: &WireCodec, tx: &mpsc::UnboundedSender<Outbound>, stream_id: u32, head: RequestHead, body: Bytes) {
    let ok = |body: Bytes| {
        let frame = Frame::Response {
            stream_id,
            response: Response::new(200, Headers::new(), body),
        };
        codec.encode_to_bytes(&frame).unwrap()
    };
    let target = head.target.as_str();

    if let Some(ms) = target.strip_prefix("/delay/") {
        let delay = Duration::from_millis(ms.parse().unwrap_or(0));
        let bytes = ok(Bytes::from_static(b"delayed"));
        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Outbound::Bytes(bytes));
        });
        return;
    }

    let out = match target {
        "/hang" => return,
        "/echo" => ok(body),
        "/reset" => codec
            .encode_to_bytes(&Frame::Reset {
                stream_id,
                reason: "refused by peer".into(),
            })
            .unwrap(),
        "/malformed" => {
            let mut raw = BytesMut::new();
            raw.put_u32(4 + 3);
            raw.put_u8(3);
            raw.put_u32(stream_id);
            raw.put_u32(3);
            raw.put_slice(b"{{{");
            raw.freeze()
        }
        "/trailing" => {
            let mut raw = BytesMut::from(&ok(Bytes::from_static(b"trailing"))[..]);
            raw.put_slice(b"junk");
            raw.freeze()
        }
        other => ok(Bytes::copy_from_slice(other.as_bytes())),
    };
    let _ = tx.send(Outbound::Bytes(out));
}

/// Manually opened gate for body operations.
#[derive(Debug)]
pub struct Gate(watch::Sender<bool>);

impl Gate {
    pub fn new() -> Self {
        Self(watch::channel(false).0)
    }

    pub fn open(&self) {
        self.0.send_replace(true);
    }

    fn waiter(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

async fn pass(gate: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = gate {
        if rx.wait_for(|open| *open).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Observes a [`TestBody`] after it has been handed to the transport.
#[derive(Debug, Clone, Default)]
pub struct BodyProbe {
    pub close_started: Arc<AtomicBool>,
    pub closed: Arc<AtomicBool>,
}

impl BodyProbe {
    pub fn close_started(&self) -> bool {
        self.close_started.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Request body whose reads and close can be held back.
pub struct TestBody {
    chunks: VecDeque<Bytes>,
    read_gate: Option<watch::Receiver<bool>>,
    close_gate: Option<watch::Receiver<bool>>,
    probe: BodyProbe,
}

impl TestBody {
    pub fn new(data: &'static str) -> Self {
        Self {
            chunks: VecDeque::from([Bytes::from_static(data.as_bytes())]),
            read_gate: None,
            close_gate: None,
            probe: BodyProbe::default(),
        }
    }

    /// Close never returns.
    pub fn close_never(mut self) -> Self {
        self.close_gate = Some(watch::channel(false).1);
        self
    }

    /// Close returns once `gate` opens.
    pub fn close_after(mut self, gate: &Gate) -> Self {
        self.close_gate = Some(gate.waiter());
        self
    }

    /// Reads never return.
    pub fn stall_reads(mut self) -> Self {
        self.read_gate = Some(watch::channel(false).1);
        self
    }

    pub fn probe(&self) -> BodyProbe {
        self.probe.clone()
    }
}

impl RequestBody for TestBody {
    fn read_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async move {
            pass(&mut self.read_gate).await;
            Ok(self.chunks.pop_front())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.probe.close_started.store(true, Ordering::SeqCst);
            pass(&mut self.close_gate).await;
            self.probe.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

pub fn config(mode: Mode) -> TransportConfig {
    let mut config = TransportConfig::default();
    config.default_mode = mode;
    config.pool.dial_timeout_ms = 1000;
    config.observability.metrics_enabled = false;
    config
}

pub fn transport_with(config: TransportConfig, dialer: MockDialer) -> (Arc<Transport>, Arc<MockDialer>) {
    let dialer = Arc::new(dialer);
    let transport = Transport::new(config, dialer.clone(), Arc::new(WireCodec::default()));
    (Arc::new(transport), dialer)
}

pub fn transport(mode: Mode) -> (Arc<Transport>, Arc<MockDialer>) {
    transport_with(config(mode), MockDialer::new())
}

pub fn url(path: &str) -> String {
    format!("{}{}", BASE_URL, path)
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, check: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < limit {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
