//! Request transport over pooled connections.
//!
//! Requests travel either on an exclusive connection (one request at a time)
//! or as a stream on a shared multiplexed connection. A caller-supplied body
//! is read and closed only on its own request's task, never under a lock
//! another request needs, so a body that stalls hurts nobody else.

// Wire level
pub mod codec;
pub mod net;

// Requests and connections
pub mod conn;
pub mod http;
pub mod pool;
pub mod transport;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod observability;
pub mod resilience;

pub use codec::{Frame, FrameCodec, WireCodec};
pub use config::TransportConfig;
pub use error::{TransportError, TransportResult};
pub use http::{Request, RequestBody, Response};
pub use net::{Destination, Dialer, Mode, TcpDialer};
pub use pool::{ConnectionPool, PoolStats};
pub use resilience::{CancelHandle, CancelSignal};
pub use transport::Transport;
