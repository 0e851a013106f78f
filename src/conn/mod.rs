//! Connection subsystem.
//!
//! # Data Flow
//! ```text
//! Exclusive:
//!     request task owns ExclusiveConn
//!     → write headers + body frames → read response frame
//!
//! Multiplexed:
//!     request task → registry lock (allocate stream) → unlock
//!     → frames queued to the writer task → await result slot
//!     reader task → decode → registry lock (take stream) → unlock → deliver
//! ```
//!
//! # Design Decisions
//! - Mode dispatch is a tagged variant; the pool releases the two modes
//!   differently
//! - No lock in this module is ever held while a request body is read or
//!   closed, or while bytes move on the wire

pub mod exclusive;
pub mod multiplexed;
pub mod stream;

use std::sync::Arc;

use crate::error::TransportResult;
use crate::http::{RequestBody, RequestHead, Response};
use crate::net::{ConnectionId, Destination, Mode};

pub use exclusive::ExclusiveConn;
pub use multiplexed::Multiplexer;
pub use stream::{StreamRegistry, StreamState};

/// A connection handed out by the pool.
#[derive(Debug)]
pub enum Connection {
    /// Owned by the holder until released.
    Exclusive(ExclusiveConn),
    /// Shared with every other holder of the same destination.
    Multiplexed(Arc<Multiplexer>),
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        match self {
            Connection::Exclusive(conn) => conn.id(),
            Connection::Multiplexed(mux) => mux.id(),
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            Connection::Exclusive(_) => Mode::Exclusive,
            Connection::Multiplexed(_) => Mode::Multiplexed,
        }
    }

    pub fn destination(&self) -> &Destination {
        match self {
            Connection::Exclusive(conn) => conn.destination(),
            Connection::Multiplexed(mux) => mux.destination(),
        }
    }

    /// Send one request and wait for its response. The body is read, never
    /// closed.
    pub async fn dispatch(
        &mut self,
        head: &RequestHead,
        body: &mut dyn RequestBody,
    ) -> TransportResult<Response> {
        match self {
            Connection::Exclusive(conn) => conn.dispatch(head, body).await,
            Connection::Multiplexed(mux) => mux.dispatch(head, body).await,
        }
    }
}
