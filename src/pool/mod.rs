//! Connection pool subsystem.
//!
//! # Data Flow
//! ```text
//! acquire(destination, mode)
//!     → pool lock: idle exclusive connection / shared multiplexer?
//!         hit  → hand out
//!         miss → join the in-flight dial, or start one (spawned task)
//!     → unlock, wait on the dial's watch channel, retry
//!
//! release(connection, outcome)
//!     → exclusive: park idle (clean exchange, below cap) or drop
//!     → multiplexed: keep pooled, or evict and drain
//! ```
//!
//! # Design Decisions
//! - One mutex around the destination map, held for map bookkeeping only
//! - Dials run outside the lock and outlive the caller that triggered them
//! - At most one dial in flight per destination

pub mod pool;

pub use pool::{ConnectionPool, PoolStats, ReleaseOutcome};
