//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms via the metrics facade)
//!
//! Consumers:
//!     → Log output (stdout through tracing-subscriber)
//!     → Whatever metrics recorder the embedding application installs
//! ```
//!
//! # Design Decisions
//! - Connection and stream ids flow through every log event
//! - Metrics are cheap (atomic increments) and a no-op without a recorder
//! - No exporter is bundled; the embedding process owns exposition

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
