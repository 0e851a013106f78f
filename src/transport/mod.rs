//! Request transport: the public entry point.
//!
//! # Data Flow
//! ```text
//! send(request)
//!     → resolve destination + mode
//!     → guard(pool.acquire)
//!     → guard(connection.dispatch)      body read on this task, no lock
//!     → pool.release(connection, outcome)
//!     → BodyCloser (own task)           body close, never under a lock
//!     → guard(close wait)
//!     → response or error
//! ```
//!
//! # Design Decisions
//! - The body is closed exactly once per request on every path, on a task
//!   owned by that request
//! - A fired deadline or cancel returns immediately; a close that never
//!   returns stays on its own task and blocks nobody else
//! - An exclusive connection is reusable only after the close confirmed,
//!   which the closer reports through the connection's reuse flag

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::codec::FrameCodec;
use crate::config::TransportConfig;
use crate::conn::Connection;
use crate::error::TransportResult;
use crate::http::{BodyCloser, BoxBody, Request, RequestHead, Response};
use crate::net::{Destination, Dialer, Mode};
use crate::observability::metrics;
use crate::pool::{ConnectionPool, ReleaseOutcome};
use crate::resilience::CancellationController;

/// Sends requests over pooled connections.
#[derive(Debug)]
pub struct Transport {
    config: TransportConfig,
    pool: ConnectionPool,
}

impl Transport {
    pub fn new(config: TransportConfig, dialer: Arc<dyn Dialer>, codec: Arc<dyn FrameCodec>) -> Self {
        metrics::set_enabled(config.observability.metrics_enabled);
        let pool = ConnectionPool::new(config.pool.clone(), dialer, codec);
        tracing::debug!(
            default_mode = %config.default_mode,
            overrides = config.destinations.len(),
            "Transport created"
        );
        Self { config, pool }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Send `request` and wait for its response.
    ///
    /// Returns as soon as the request's deadline or cancel fires, whatever
    /// the body is doing.
    pub async fn send(&self, request: Request) -> TransportResult<Response> {
        let destination = request.destination();
        let (head, body, signal) = request.into_parts();
        let controller = CancellationController::new(signal);
        let destination = match destination {
            Ok(destination) => destination,
            Err(e) => {
                tracing::debug!(error = %e, target = %head.target, "Request rejected");
                let _ = close_body(body, None, &controller).await;
                return Err(e);
            }
        };
        let mode = self.config.mode_for(&destination);

        let result = self.exchange(&destination, mode, &head, body, &controller).await;

        let elapsed = controller.elapsed();
        match &result {
            Ok(response) => {
                metrics::record_request(&destination, mode, "ok", elapsed);
                tracing::debug!(
                    destination = %destination,
                    mode = %mode,
                    method = %head.method,
                    target = %head.target,
                    status = response.status(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Request completed"
                );
            }
            Err(e) => {
                metrics::record_request(&destination, mode, e.kind(), elapsed);
                if e.is_connection_fatal() {
                    tracing::warn!(
                        destination = %destination,
                        mode = %mode,
                        error = %e,
                        "Request failed, connection discarded"
                    );
                } else {
                    tracing::debug!(
                        destination = %destination,
                        mode = %mode,
                        error = %e,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Request failed"
                    );
                }
            }
        }
        result
    }

    async fn exchange(
        &self,
        destination: &Destination,
        mode: Mode,
        head: &RequestHead,
        mut body: BoxBody,
        controller: &CancellationController,
    ) -> TransportResult<Response> {
        let (result, reuse_flag) = match controller.guard(self.pool.acquire(destination, mode)).await {
            Ok(mut conn) => {
                let result = controller.guard(conn.dispatch(head, body.as_mut())).await;
                let reuse_flag = match &conn {
                    Connection::Exclusive(conn) => Some(conn.reuse_flag()),
                    Connection::Multiplexed(_) => None,
                };
                let outcome = release_outcome(&conn, &result);
                self.pool.release(conn, outcome);
                (result, reuse_flag)
            }
            Err(e) => (Err(e), None),
        };

        let closed = close_body(body, reuse_flag, controller).await;

        match (result, closed) {
            (Ok(_), Err(interrupted)) => {
                tracing::debug!(
                    destination = %destination,
                    error = %interrupted,
                    "Returning before the request body finished closing"
                );
                Err(interrupted)
            }
            (result, _) => result,
        }
    }

    /// Close the pool. In-flight requests finish; new ones fail with
    /// `PoolClosed`.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

/// Close `body` on its own task and wait for it while `controller` allows.
/// `reuse_flag` is set once the close returned.
async fn close_body(
    body: BoxBody,
    reuse_flag: Option<Arc<AtomicBool>>,
    controller: &CancellationController,
) -> TransportResult<()> {
    let mut closer = BodyCloser::spawn(body, move || {
        if let Some(flag) = reuse_flag {
            flag.store(true, Ordering::Release);
        }
    });
    controller
        .guard(async {
            closer.wait().await;
            Ok(())
        })
        .await
}

/// How a connection goes back to the pool after an exchange.
fn release_outcome(conn: &Connection, result: &TransportResult<Response>) -> ReleaseOutcome {
    match (conn, result) {
        (_, Ok(_)) => ReleaseOutcome::Reusable,
        (_, Err(e)) if e.is_connection_fatal() => ReleaseOutcome::Discard,
        (Connection::Exclusive(_), Err(_)) => ReleaseOutcome::Discard,
        (Connection::Multiplexed(_), Err(_)) => ReleaseOutcome::Reusable,
    }
}
