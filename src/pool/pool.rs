//! Connection pool management.
//!
//! # Responsibilities
//! - Keep idle exclusive connections and one shared multiplexer per destination
//! - Collapse concurrent dials to the same destination
//! - Hand out exclusive connections only once their previous body is closed
//!   and nothing arrived on them while idle
//! - Tear everything down on shutdown

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

use crate::codec::FrameCodec;
use crate::config::PoolConfig;
use crate::conn::{Connection, ExclusiveConn, Multiplexer};
use crate::error::{TransportError, TransportResult};
use crate::net::connection::ConnectionTracker;
use crate::net::{Destination, Dialer, Mode};
use crate::observability::metrics;
use crate::resilience::timeouts;

/// What to do with a connection handed back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The exchange finished cleanly; the connection may serve others.
    Reusable,
    /// The connection must not be handed out again.
    Discard,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Parked exclusive connections, reusable or waiting on a body close.
    pub idle_exclusive: usize,
    /// Destinations with a pooled multiplexed connection.
    pub multiplexed: usize,
    /// Dials started since the pool was created.
    pub dials_started: u64,
    /// Connections still open, pooled or in use.
    pub open_connections: u64,
}

/// `None` while the dial runs, then its outcome.
type DialState = Option<Result<(), TransportError>>;

#[derive(Default)]
struct Entry {
    idle: Vec<ExclusiveConn>,
    mux: Option<Arc<Multiplexer>>,
    dialing: Option<watch::Receiver<DialState>>,
}

impl Entry {
    /// Take a reusable idle connection. Expired or broken ones are moved to
    /// `evicted` so they are dropped after the lock is released.
    fn take_idle(&mut self, idle_timeout: Duration, evicted: &mut Vec<ExclusiveConn>) -> Option<ExclusiveConn> {
        let mut found = None;
        let mut i = self.idle.len();
        while i > 0 {
            i -= 1;
            let conn = &self.idle[i];
            if conn.is_broken() || conn.is_expired(idle_timeout) {
                evicted.push(self.idle.swap_remove(i));
            } else if found.is_none() && conn.is_reusable() {
                found = Some(self.idle.swap_remove(i));
            }
        }
        found
    }

    fn is_empty(&self) -> bool {
        self.idle.is_empty() && self.mux.is_none() && self.dialing.is_none()
    }
}

struct PoolInner {
    entries: Mutex<HashMap<Destination, Entry>>,
    closed: AtomicBool,
    dialer: Arc<dyn Dialer>,
    codec: Arc<dyn FrameCodec>,
    config: PoolConfig,
    tracker: ConnectionTracker,
    dials: AtomicU64,
}

impl PoolInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<Destination, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.idle_timeout_secs)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Pool of connections keyed by destination.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, dialer: Arc<dyn Dialer>, codec: Arc<dyn FrameCodec>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                entries: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                dialer,
                codec,
                config,
                tracker: ConnectionTracker::new(),
                dials: AtomicU64::new(0),
            }),
        }
    }

    /// Get a connection to `destination` in `mode`, dialing if needed.
    pub async fn acquire(&self, destination: &Destination, mode: Mode) -> TransportResult<Connection> {
        loop {
            let mut evicted = Vec::new();
            let mut stale_mux = None;
            let hit = {
                let mut entries = self.inner.entries();
                if self.inner.is_closed() {
                    return Err(TransportError::PoolClosed);
                }
                let entry = entries.entry(destination.clone()).or_default();
                let hit = match mode {
                    Mode::Exclusive => entry
                        .take_idle(self.inner.idle_timeout(), &mut evicted)
                        .map(Connection::Exclusive),
                    Mode::Multiplexed => {
                        if entry.mux.as_ref().is_some_and(|mux| !mux.is_accepting()) {
                            stale_mux = entry.mux.take();
                        }
                        entry.mux.clone().map(Connection::Multiplexed)
                    }
                };
                match hit {
                    Some(conn) => {
                        let idle = entry.idle.len();
                        Ok((conn, idle))
                    }
                    None => Err(match entry.dialing.clone() {
                        Some(rx) => rx,
                        None => self.start_dial(entry, destination, mode),
                    }),
                }
            };
            drop(evicted);
            drop(stale_mux);

            let mut dial = match hit {
                Ok((mut conn, idle)) => {
                    if let Connection::Exclusive(exclusive) = &mut conn {
                        metrics::record_idle_connections(destination, idle);
                        if !exclusive.check_idle_input() {
                            continue;
                        }
                    }
                    tracing::trace!(
                        connection_id = %conn.id(),
                        destination = %destination,
                        mode = %mode,
                        "Pooled connection reused"
                    );
                    return Ok(conn);
                }
                Err(dial) => dial,
            };

            let outcome = dial.wait_for(Option::is_some).await.map(|state| (*state).clone());
            match outcome {
                Ok(Some(Err(e))) => return Err(e),
                Ok(_) => continue,
                Err(_) => {
                    return Err(TransportError::DialFailure {
                        destination: destination.to_string(),
                        reason: "dial abandoned".into(),
                    })
                }
            }
        }
    }

    /// Mark a dial in flight and run it on its own task.
    fn start_dial(&self, entry: &mut Entry, destination: &Destination, mode: Mode) -> watch::Receiver<DialState> {
        let (tx, rx) = watch::channel(None);
        entry.dialing = Some(rx.clone());
        self.inner.dials.fetch_add(1, Ordering::Relaxed);

        let dial = DialInFlight {
            inner: self.inner.clone(),
            destination: destination.clone(),
            mode,
            tx,
            settled: false,
        };
        tokio::spawn(dial.run());
        rx
    }

    /// Hand a connection back after a request.
    pub fn release(&self, conn: Connection, outcome: ReleaseOutcome) {
        match conn {
            Connection::Exclusive(mut conn) => {
                if outcome == ReleaseOutcome::Discard {
                    conn.mark_broken();
                }
                if conn.is_broken() || self.inner.is_closed() {
                    tracing::debug!(
                        connection_id = %conn.id(),
                        destination = %conn.destination(),
                        "Dropping exclusive connection"
                    );
                    return;
                }
                let destination = conn.destination().clone();
                let mut overflow = None;
                let idle = {
                    let mut entries = self.inner.entries();
                    let entry = entries.entry(destination.clone()).or_default();
                    if entry.idle.len() < self.inner.config.max_idle_per_destination {
                        entry.idle.push(conn);
                    } else {
                        overflow = Some(conn);
                    }
                    entry.idle.len()
                };
                if let Some(conn) = overflow {
                    tracing::debug!(
                        connection_id = %conn.id(),
                        destination = %destination,
                        "Idle limit reached, dropping exclusive connection"
                    );
                }
                metrics::record_idle_connections(&destination, idle);
            }
            Connection::Multiplexed(mux) => {
                if outcome == ReleaseOutcome::Reusable && mux.is_accepting() {
                    return;
                }
                let evicted = {
                    let mut entries = self.inner.entries();
                    match entries.get_mut(mux.destination()) {
                        Some(entry) if entry.mux.as_ref().is_some_and(|m| Arc::ptr_eq(m, &mux)) => entry.mux.take(),
                        _ => None,
                    }
                };
                if evicted.is_some() {
                    tracing::debug!(
                        connection_id = %mux.id(),
                        destination = %mux.destination(),
                        live_streams = mux.live_streams(),
                        "Evicting multiplexed connection"
                    );
                }
                mux.drain();
            }
        }
    }

    /// Close the pool. Idle connections are dropped, multiplexed ones drain,
    /// later acquires fail with `PoolClosed`.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries: Vec<(Destination, Entry)> = self.inner.entries().drain().collect();
        let mut idle = 0;
        let mut multiplexed = 0;
        for (destination, entry) in entries {
            idle += entry.idle.len();
            if let Some(mux) = entry.mux {
                multiplexed += 1;
                mux.drain();
            }
            metrics::record_idle_connections(&destination, 0);
        }
        tracing::info!(idle, multiplexed, "Connection pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn stats(&self) -> PoolStats {
        let (idle_exclusive, multiplexed) = {
            let entries = self.inner.entries();
            entries.values().fold((0, 0), |(idle, mux), entry| {
                (idle + entry.idle.len(), mux + usize::from(entry.mux.is_some()))
            })
        };
        PoolStats {
            idle_exclusive,
            multiplexed,
            dials_started: self.inner.dials.load(Ordering::Relaxed),
            open_connections: self.inner.tracker.open_count(),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("closed", &self.inner.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

/// One dial in flight. Always clears the destination's dial marker, even if
/// the task is torn down before the dial finishes.
struct DialInFlight {
    inner: Arc<PoolInner>,
    destination: Destination,
    mode: Mode,
    tx: watch::Sender<DialState>,
    settled: bool,
}

impl DialInFlight {
    async fn run(mut self) {
        let started = Instant::now();
        let limit = Duration::from_millis(self.inner.config.dial_timeout_ms);
        let opened = timeouts::bounded(limit, self.inner.dialer.open(&self.destination)).await;

        let (conn, result) = match opened {
            Ok(Ok(io)) => {
                let guard = self.inner.tracker.track();
                let codec = self.inner.codec.clone();
                let conn = match self.mode {
                    Mode::Exclusive => {
                        Connection::Exclusive(ExclusiveConn::new(io, self.destination.clone(), codec, guard))
                    }
                    Mode::Multiplexed => {
                        Connection::Multiplexed(Multiplexer::start(io, self.destination.clone(), codec, guard))
                    }
                };
                metrics::record_dial(&self.destination, "ok");
                tracing::info!(
                    connection_id = %conn.id(),
                    destination = %self.destination,
                    mode = %self.mode,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Connection established"
                );
                (Some(conn), Ok(()))
            }
            Ok(Err(e)) => {
                metrics::record_dial(&self.destination, "error");
                (None, Err(e.to_string()))
            }
            Err(elapsed) => {
                metrics::record_dial(&self.destination, "timeout");
                (None, Err(format!("dial {}", elapsed)))
            }
        };

        let result = result.map_err(|reason| {
            tracing::warn!(destination = %self.destination, reason = %reason, "Dial failed");
            TransportError::DialFailure {
                destination: self.destination.to_string(),
                reason,
            }
        });
        self.settle(conn, result);
    }

    /// Install the new connection, clear the marker, wake the waiters.
    fn settle(&mut self, conn: Option<Connection>, mut result: Result<(), TransportError>) {
        let leftover = {
            let mut entries = self.inner.entries();
            let closed = self.inner.is_closed();
            let entry = entries.entry(self.destination.clone()).or_default();
            entry.dialing = None;
            let leftover = if closed {
                if conn.is_some() {
                    result = Err(TransportError::PoolClosed);
                }
                conn
            } else {
                match conn {
                    Some(Connection::Exclusive(conn)) => {
                        entry.idle.push(conn);
                        None
                    }
                    Some(Connection::Multiplexed(mux)) => entry.mux.replace(mux).map(Connection::Multiplexed),
                    None => None,
                }
            };
            if closed && entry.is_empty() {
                entries.remove(&self.destination);
            }
            leftover
        };
        drop(leftover);
        self.settled = true;
        self.tx.send_replace(Some(result));
    }
}

impl Drop for DialInFlight {
    fn drop(&mut self) {
        if !self.settled {
            let err = TransportError::DialFailure {
                destination: self.destination.to_string(),
                reason: "dial task stopped".into(),
            };
            self.settle(None, Err(err));
        }
    }
}
