//! Request cancellation.
//!
//! # Responsibilities
//! - Combine a request deadline and an explicit cancel handle into one signal
//! - Unblock every waiting point of a request as soon as the signal fires
//!
//! # Design Decisions
//! - Cancellation is cooperative: the guarded future is dropped, nothing is
//!   forcibly interrupted inside a body call
//! - The caller gets its error immediately; body close progress is irrelevant
//! - A handle dropped without canceling never fires

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::{TransportError, TransportResult};

/// Explicit cancel trigger shared with any number of requests.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel every request bound to this handle.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// The cancellation state attached to a request.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    deadline: Option<Instant>,
    canceled: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn none() -> Self {
        Self::default()
    }

    /// Add a deadline. The earliest deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Bind to an explicit cancel handle.
    pub fn with_handle(mut self, handle: &CancelHandle) -> Self {
        self.canceled = Some(handle.subscribe());
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True if the signal can fire at all.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some() || self.canceled.is_some()
    }

    /// Non-blocking check: the error the signal would produce right now.
    pub fn check(&self) -> TransportResult<()> {
        if let Some(rx) = &self.canceled {
            if *rx.borrow() {
                return Err(TransportError::Canceled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(TransportError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Resolve once the signal fires. Pending forever for an unarmed signal.
    pub async fn fired(&self) -> TransportError {
        let deadline = async {
            match self.deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending().await,
            }
        };
        let canceled = async {
            match self.canceled.clone() {
                Some(mut rx) => {
                    let sender_gone = rx.wait_for(|canceled| *canceled).await.is_err();
                    if sender_gone {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = canceled => TransportError::Canceled,
            _ = deadline => TransportError::DeadlineExceeded,
        }
    }
}

/// Binds one request's [`CancelSignal`] to its waiting points.
#[derive(Debug)]
pub struct CancellationController {
    signal: CancelSignal,
    started: Instant,
}

impl CancellationController {
    pub fn new(signal: CancelSignal) -> Self {
        Self {
            signal,
            started: Instant::now(),
        }
    }

    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }

    /// Time since the request was submitted.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Run `fut` until it completes or the signal fires, whichever is first.
    /// On firing, `fut` is dropped and the cancellation error returned.
    pub async fn guard<T, F>(&self, fut: F) -> TransportResult<T>
    where
        F: Future<Output = TransportResult<T>>,
    {
        if !self.signal.is_armed() {
            return fut.await;
        }
        self.signal.check()?;

        tokio::select! {
            biased;
            result = fut => result,
            err = self.signal.fired() => {
                tracing::debug!(
                    error = %err,
                    elapsed_ms = self.elapsed().as_millis() as u64,
                    "Request cancellation fired"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unarmed_signal_never_interrupts() {
        let controller = CancellationController::new(CancelSignal::none());
        let result = controller
            .guard(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, TransportError>(7)
            })
            .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn deadline_fires_promptly() {
        let controller =
            CancellationController::new(CancelSignal::none().with_timeout(Duration::from_millis(100)));
        let started = Instant::now();
        let result: TransportResult<()> = controller.guard(std::future::pending()).await;
        let elapsed = started.elapsed();

        assert_eq!(result, Err(TransportError::DeadlineExceeded));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn explicit_cancel_fires() {
        let handle = CancelHandle::new();
        let controller = CancellationController::new(CancelSignal::none().with_handle(&handle));

        let trigger = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: TransportResult<()> = controller.guard(std::future::pending()).await;
        assert_eq!(result, Err(TransportError::Canceled));
        assert!(handle.is_canceled());
    }

    #[tokio::test]
    async fn already_expired_deadline_fails_fast() {
        let signal = CancelSignal::none().with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(signal.check(), Err(TransportError::DeadlineExceeded));

        let controller = CancellationController::new(signal);
        let result = controller.guard(async { Ok::<_, TransportError>(()) }).await;
        assert_eq!(result, Err(TransportError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel() {
        let handle = CancelHandle::new();
        let signal = CancelSignal::none().with_handle(&handle);
        drop(handle);

        let fired = tokio::time::timeout(Duration::from_millis(30), signal.fired()).await;
        assert!(fired.is_err());
    }

    #[test]
    fn earliest_deadline_wins() {
        let now = Instant::now();
        let signal = CancelSignal::none()
            .with_deadline(now + Duration::from_secs(5))
            .with_deadline(now + Duration::from_secs(1));
        assert_eq!(signal.deadline(), Some(now + Duration::from_secs(1)));
    }
}
