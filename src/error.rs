//! Transport error definitions.

use thiserror::Error;

/// Errors surfaced by [`Transport::send`](crate::transport::Transport::send).
///
/// `Clone` so that a single dial outcome can be handed to every caller
/// waiting on the same destination.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established (refused, unreachable, timed out).
    #[error("dial to {destination} failed: {reason}")]
    DialFailure { destination: String, reason: String },

    /// The request deadline fired before completion.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The request was canceled explicitly by its caller.
    #[error("request canceled")]
    Canceled,

    /// The underlying byte stream failed while the request was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The peer sent a malformed frame or referenced an unknown stream.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer reset this request's stream.
    #[error("stream {stream_id} reset by peer: {reason}")]
    StreamReset { stream_id: u32, reason: String },

    /// The request body failed to produce its next chunk.
    #[error("request body error: {0}")]
    Body(String),

    /// The request itself is unusable (bad URL, method, content length).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The pool was shut down.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl TransportError {
    /// True when the error means the connection itself can no longer be trusted.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost(_) | TransportError::ProtocolViolation(_)
        )
    }

    /// True for errors raised by the request's cancellation signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransportError::DeadlineExceeded | TransportError::Canceled)
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::DialFailure { .. } => "dial_failure",
            TransportError::DeadlineExceeded => "deadline_exceeded",
            TransportError::Canceled => "canceled",
            TransportError::ConnectionLost(_) => "connection_lost",
            TransportError::ProtocolViolation(_) => "protocol_violation",
            TransportError::StreamReset { .. } => "stream_reset",
            TransportError::Body(_) => "body",
            TransportError::InvalidRequest(_) => "invalid_request",
            TransportError::PoolClosed => "pool_closed",
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::DeadlineExceeded;
        assert_eq!(err.to_string(), "context deadline exceeded");

        let err = TransportError::DialFailure {
            destination: "127.0.0.1:9".into(),
            reason: "connection refused".into(),
        };
        assert!(err.to_string().contains("127.0.0.1:9"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TransportError::ConnectionLost("eof".into()).is_connection_fatal());
        assert!(TransportError::ProtocolViolation("bad".into()).is_connection_fatal());
        assert!(!TransportError::DeadlineExceeded.is_connection_fatal());
        assert!(TransportError::Canceled.is_cancellation());
        assert!(!TransportError::PoolClosed.is_cancellation());
    }
}
