//! Error types for rpcmux.

use std::sync::Arc;

use thiserror::Error;

/// Whether a failed request may be retried on another connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// The request was never processed by the peer; retrying is safe.
    Retryable,
    /// The request may have been processed; do not retry.
    NoRetry,
}

/// Main error type for all rpcmux operations.
///
/// Errors are `Clone` because the outcome of a shared connection attempt or
/// locator request is handed to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Malformed header or frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A compressed frame arrived but no compression codec is installed.
    #[error("Compressed frame received but no compression codec is available")]
    UnsupportedCompression,

    /// The connection is closed or closing and no longer accepts the operation.
    #[error("Connection closed (closed by peer: {closed_by_peer}, retry: {retry:?})")]
    ConnectionClosed {
        /// True when the peer initiated the shutdown.
        closed_by_peer: bool,
        /// Whether the affected request may be retried.
        retry: RetryPolicy,
    },

    /// The connection was aborted.
    #[error("Connection aborted: {0}")]
    ConnectionAborted(String),

    /// The connection factory has been disposed.
    #[error("Connection factory disposed")]
    FactoryDisposed,

    /// Operation not supported by the protocol or transport.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Underlying transport failure.
    #[error("Transport error ({context}): {source}")]
    Transport {
        /// Endpoint or transport description.
        context: String,
        /// The I/O error reported by the transport.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Locator lookup produced no usable reference.
    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    /// A frame of the wrong type was delivered to a stream.
    #[error("Unexpected frame type: expected {expected}, received {received}")]
    UnexpectedFrameType {
        /// Frame type expected at this phase.
        expected: &'static str,
        /// Frame type actually received.
        received: &'static str,
    },

    /// Frame exceeds the configured or peer-advertised maximum.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Frame size in bytes.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// The stream was reset by the peer or locally.
    #[error("Stream aborted with error code {error_code}")]
    StreamAborted {
        /// Application error code carried by the reset.
        error_code: u64,
    },

    /// Operation cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RpcError {
    /// Build a transport error with context.
    pub fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        RpcError::Transport {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Connection closed locally; requests never sent may be retried.
    pub fn closed_locally() -> Self {
        RpcError::ConnectionClosed {
            closed_by_peer: false,
            retry: RetryPolicy::Retryable,
        }
    }

    /// Connection closed by the peer.
    pub fn closed_by_peer(retry: RetryPolicy) -> Self {
        RpcError::ConnectionClosed {
            closed_by_peer: true,
            retry,
        }
    }

    /// Check if this error ends the whole connection rather than one stream.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Protocol(_)
                | RpcError::UnsupportedCompression
                | RpcError::FrameTooLarge { .. }
                | RpcError::ConnectionAborted(_)
                | RpcError::Transport { .. }
                | RpcError::NotSupported(_)
        )
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::transport("io", err)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Config(err.to_string())
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
