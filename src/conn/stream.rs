//! Stream bookkeeping for multiplexed connections.
//!
//! # Responsibilities
//! - Allocate stream ids (odd, increasing, never reused on a connection)
//! - Track per-stream state: Open → HalfClosed → Closed
//! - Hold each stream's write-once result slot
//!
//! # Design Decisions
//! - The registry is plain data: every method is O(1) or a single sweep and
//!   never awaits, so the lock around it is held only for bookkeeping
//! - A stream is delivered by first removing it from the registry under the
//!   lock, then sending on its slot after the lock is released; whoever
//!   removes it owns the single delivery

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::{TransportError, TransportResult};
use crate::http::Response;

/// Outcome carried by a result slot.
pub type StreamResult = TransportResult<Response>;

/// Per-stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Request head sent, body may still be flowing.
    Open,
    /// Body fully sent, awaiting the response.
    HalfClosed,
    /// Result delivered or stream abandoned. Terminal.
    Closed,
}

impl StreamState {
    fn can_become(self, next: StreamState) -> bool {
        matches!(
            (self, next),
            (StreamState::Open, StreamState::HalfClosed)
                | (StreamState::Open, StreamState::Closed)
                | (StreamState::HalfClosed, StreamState::Closed)
        )
    }
}

/// Write-once delivery of a stream's outcome.
#[derive(Debug)]
pub struct ResultSlot {
    tx: oneshot::Sender<StreamResult>,
}

impl ResultSlot {
    pub fn channel() -> (ResultSlot, oneshot::Receiver<StreamResult>) {
        let (tx, rx) = oneshot::channel();
        (ResultSlot { tx }, rx)
    }

    /// Deliver the outcome. Consumes the slot, so it can only happen once.
    /// Returns false if the waiter already went away.
    pub fn deliver(self, result: StreamResult) -> bool {
        self.tx.send(result).is_ok()
    }
}

/// One request's bookkeeping inside a multiplexed connection.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    state: StreamState,
    slot: ResultSlot,
}

impl Stream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Apply a state transition. Closed is terminal.
    pub fn transition(&mut self, next: StreamState) -> Result<(), (StreamState, StreamState)> {
        if !self.state.can_become(next) {
            return Err((self.state, next));
        }
        self.state = next;
        Ok(())
    }

    /// Close the stream and deliver its outcome. Call without holding the
    /// registry lock.
    pub fn finish(mut self, result: StreamResult) -> bool {
        self.state = StreamState::Closed;
        self.slot.deliver(result)
    }
}

/// What the registry knows about a stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Currently registered.
    Live,
    /// Allocated earlier and already closed or abandoned.
    Stale,
    /// Never allocated on this connection.
    Unknown,
}

/// Why a new stream could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// The connection stopped accepting streams (draining or closed).
    NotAccepting,
    /// The stream id space is used up.
    Exhausted,
}

/// Stream id → stream map for one connection.
#[derive(Debug)]
pub struct StreamRegistry {
    next_id: u32,
    streams: HashMap<u32, Stream>,
    accepting: bool,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            streams: HashMap::new(),
            accepting: true,
        }
    }

    /// Allocate and register a new Open stream.
    pub fn open(&mut self) -> Result<(u32, oneshot::Receiver<StreamResult>), OpenError> {
        if !self.accepting {
            return Err(OpenError::NotAccepting);
        }
        let id = self.next_id;
        if id > i32::MAX as u32 {
            self.accepting = false;
            return Err(OpenError::Exhausted);
        }
        self.next_id = id + 2;
        let (slot, rx) = ResultSlot::channel();
        self.streams.insert(
            id,
            Stream {
                id,
                state: StreamState::Open,
                slot,
            },
        );
        Ok((id, rx))
    }

    pub fn lookup(&self, id: u32) -> Lookup {
        if self.streams.contains_key(&id) {
            Lookup::Live
        } else if id % 2 == 1 && id < self.next_id {
            Lookup::Stale
        } else {
            Lookup::Unknown
        }
    }

    pub fn state(&self, id: u32) -> Option<StreamState> {
        self.streams.get(&id).map(Stream::state)
    }

    /// Mark the request body as fully sent.
    pub fn half_close(&mut self, id: u32) -> bool {
        self.streams
            .get_mut(&id)
            .is_some_and(|s| s.transition(StreamState::HalfClosed).is_ok())
    }

    /// Remove a stream so the caller can deliver to it.
    pub fn take(&mut self, id: u32) -> Option<Stream> {
        self.streams.remove(&id)
    }

    /// Remove every stream with an id above `last_id`.
    pub fn take_above(&mut self, last_id: u32) -> Vec<Stream> {
        let ids: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|id| *id > last_id)
            .collect();
        ids.into_iter().filter_map(|id| self.streams.remove(&id)).collect()
    }

    /// Snapshot and clear the registry, refusing new streams from now on.
    pub fn drain_all(&mut self) -> Vec<Stream> {
        self.accepting = false;
        self.streams.drain().map(|(_, stream)| stream).collect()
    }

    pub fn stop_accepting(&mut self) {
        self.accepting = false;
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a slot receive outcome to the stream result.
pub fn slot_outcome(received: Result<StreamResult, oneshot::error::RecvError>) -> StreamResult {
    received.unwrap_or_else(|_| {
        Err(TransportError::ConnectionLost(
            "stream dropped without a result".into(),
        ))
    })
}
