//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Transport::send:
//!     → cancellation.rs (guard acquire / dispatch / body-close wait)
//! Pool dial:
//!     → timeouts.rs (enforce dial timeout)
//! ```
//!
//! # Design Decisions
//! - Every external wait has a bound the caller controls
//! - Dial failures are reported, never retried automatically
//! - A caller-supplied body is never bounded by us: its close may run forever
//!   on its own task without holding anything shared

pub mod cancellation;
pub mod timeouts;

pub use cancellation::{CancelHandle, CancelSignal, CancellationController};
