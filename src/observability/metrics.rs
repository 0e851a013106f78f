//! Metrics collection.
//!
//! # Responsibilities
//! - Define transport metrics (requests, latency, dials, streams, idle pool)
//! - Label everything by destination
//!
//! # Metrics
//! - `transport_requests_total` (counter): requests by destination, mode, outcome
//! - `transport_request_duration_seconds` (histogram): send latency
//! - `transport_dials_total` (counter): dials by destination, result
//! - `transport_open_streams` (gauge): live multiplexed streams
//! - `transport_idle_connections` (gauge): parked exclusive connections
//!
//! # Design Decisions
//! - Thin wrappers over the `metrics` macros so call sites stay one line
//! - Recording can be switched off process-wide from config

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::net::{Destination, Mode};

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Turn metric recording on or off.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn record_request(destination: &Destination, mode: Mode, outcome: &'static str, elapsed: Duration) {
    if !enabled() {
        return;
    }
    let destination = destination.to_string();
    metrics::counter!(
        "transport_requests_total",
        "destination" => destination.clone(),
        "mode" => mode.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(
        "transport_request_duration_seconds",
        "destination" => destination,
        "mode" => mode.as_str()
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_dial(destination: &Destination, result: &'static str) {
    if !enabled() {
        return;
    }
    metrics::counter!(
        "transport_dials_total",
        "destination" => destination.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_stream_opened(destination: &Destination) {
    if !enabled() {
        return;
    }
    metrics::gauge!("transport_open_streams", "destination" => destination.to_string()).increment(1.0);
}

pub fn record_stream_closed(destination: &Destination) {
    if !enabled() {
        return;
    }
    metrics::gauge!("transport_open_streams", "destination" => destination.to_string()).decrement(1.0);
}

pub fn record_idle_connections(destination: &Destination, count: usize) {
    if !enabled() {
        return;
    }
    metrics::gauge!("transport_idle_connections", "destination" => destination.to_string())
        .set(count as f64);
}
