//! Request bodies.
//!
//! # Responsibilities
//! - Define the caller-supplied body capability ({read chunk, close})
//! - Provide empty and in-memory bodies
//! - Run a body's close on a task owned by its request
//!
//! # Design Decisions
//! - Bodies are opaque: any call may never return and cannot be interrupted
//!   from the outside, so no shared lock or shared task ever awaits one
//! - Close runs on its own task so a caller whose deadline fires can walk
//!   away while the close keeps going

use std::io;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;

/// Default chunk size for in-memory bodies.
const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// A caller-supplied request body.
pub trait RequestBody: Send + 'static {
    /// Produce the next chunk, or `None` at end of body.
    fn read_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>>;

    /// Release caller-side resources. May take arbitrarily long.
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// Owned, type-erased body.
pub type BoxBody = Box<dyn RequestBody>;

/// A body with no content.
#[derive(Debug, Default, Clone, Copy)]
pub struct Empty;

impl RequestBody for Empty {
    fn read_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async { Ok(None) })
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// A body backed by bytes already in memory, yielded in bounded chunks.
#[derive(Debug, Clone)]
pub struct Full {
    remaining: Bytes,
    chunk_size: usize,
}

impl Full {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            remaining: data.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the chunk size (minimum 1 byte).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Bytes not yet handed out.
    pub fn len(&self) -> usize {
        self.remaining.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }
}

impl RequestBody for Full {
    fn read_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async move {
            if self.remaining.is_empty() {
                return Ok(None);
            }
            let n = self.chunk_size.min(self.remaining.len());
            Ok(Some(self.remaining.split_to(n)))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.remaining.clear();
            Ok(())
        })
    }
}

/// Handle to a body close running on its own task.
///
/// Dropping the handle detaches the task; the close still runs to completion
/// (or forever, if the body never returns).
#[derive(Debug)]
pub struct BodyCloser {
    handle: Option<JoinHandle<()>>,
}

impl BodyCloser {
    /// Start closing `body`. `on_closed` runs once the close returned,
    /// whatever its result.
    pub fn spawn<F>(mut body: BoxBody, on_closed: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(e) = body.close().await {
                tracing::debug!(error = %e, "Request body close returned an error");
            }
            drop(body);
            on_closed();
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Wait for the close to return. Cancel-safe: dropping this future leaves
    /// the close running.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Request body close task failed");
            }
            self.handle = None;
        }
    }

    /// True once the close has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}
