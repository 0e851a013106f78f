//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Pool cache miss
//!     → dialer.rs (open raw duplex stream to destination)
//!     → connection.rs (assign ID, start lifecycle tracking)
//!     → Hand off to conn layer (exclusive or multiplexed)
//!
//! Connection States:
//!     Idle ⇄ Active → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - Dialing is pluggable; TCP is the default
//! - Each connection tracked so pools can report open counts

pub mod connection;
pub mod dialer;

pub use connection::{ConnectionId, ConnectionState, Mode};
pub use dialer::{BoxedIo, Destination, Dialer, Io, TcpDialer};
