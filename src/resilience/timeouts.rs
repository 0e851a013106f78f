//! Timeout enforcement.
//!
//! # Responsibilities
//! - Bound connection establishment by the configured dial timeout
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - A zero duration means "no bound"
//! - Timeout errors are distinct from the wrapped operation's errors

use std::future::Future;
use std::time::Duration;

/// The bound elapsed before the operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out after {}ms", .0.as_millis())]
pub struct Elapsed(pub Duration);

/// Run `fut` for at most `limit`. `Duration::ZERO` disables the bound.
pub async fn bounded<F>(limit: Duration, fut: F) -> Result<F::Output, Elapsed>
where
    F: Future,
{
    if limit.is_zero() {
        return Ok(fut.await);
    }
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Elapsed(limit))
}
