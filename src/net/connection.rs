//! Connection identity, mode and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track connection state (Idle ↔ Active → Draining → Closed)
//! - Count open connections per pool

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One request owns the connection for its whole exchange.
    Exclusive,
    /// Many requests share the connection, one stream each.
    Multiplexed,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Exclusive => "exclusive",
            Mode::Multiplexed => "multiplexed",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state for lifecycle tracking.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Established, no request in flight.
    Idle = 0,
    /// At least one request in flight.
    Active = 1,
    /// No new requests, finishing in-flight ones.
    Draining = 2,
    /// Closed; must be discarded.
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Active,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// Lock-free cell holding a [`ConnectionState`].
///
/// Draining and Closed are sticky: once reached, `set` never moves the state
/// back to Idle or Active.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` unless the connection is already winding down further.
    /// Returns the state actually stored.
    pub fn set(&self, next: ConnectionState) -> ConnectionState {
        let mut prev = self.0.load(Ordering::Acquire);
        loop {
            let current = ConnectionState::from(prev);
            let allowed = match (current, next) {
                (ConnectionState::Closed, _) => false,
                (ConnectionState::Draining, ConnectionState::Idle | ConnectionState::Active) => false,
                _ => true,
            };
            if !allowed {
                return current;
            }
            match self.0.compare_exchange_weak(
                prev,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(x) => prev = x,
            }
        }
    }
}

/// Counts open connections of one pool.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    /// Current count of open connections.
    open_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new open connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            open_count: Arc::clone(&self.open_count),
            id: ConnectionId::new(),
        }
    }

    /// Get current open connection count.
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime and carries its ID.
/// Decrements the open count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    open_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.open_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection dropped");
    }
}
