//! Dispatch limiting for incoming streams.
//!
//! When `serialize_dispatch` or a stream limit is configured, each incoming
//! non-control stream must hold a [`DispatchPermit`] before it is handed to
//! [`Connection::accept_stream`](crate::Connection::accept_stream). The permit
//! lives inside the stream and is released when the stream is dropped.
//! Bidirectional and unidirectional streams draw from separate semaphores.
//!
//! While every permit is taken the connection's receive loop waits, which
//! stops reading from the transport and pushes back on the peer.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ConnectionOptions;
use crate::error::{Result, RpcError};

/// A dispatch slot held by an incoming stream.
#[derive(Debug)]
pub struct DispatchPermit {
    _permit: OwnedSemaphorePermit,
}

/// Per-connection dispatch limits.
#[derive(Debug, Clone, Default)]
pub struct DispatchLimiter {
    bidirectional: Option<Arc<Semaphore>>,
    unidirectional: Option<Arc<Semaphore>>,
}

impl DispatchLimiter {
    /// Build the limiter described by the connection options.
    pub fn from_options(options: &ConnectionOptions) -> Self {
        Self {
            bidirectional: options.dispatch_limit(true).map(|n| Arc::new(Semaphore::new(n))),
            unidirectional: options.dispatch_limit(false).map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    fn semaphore(&self, bidirectional: bool) -> Option<&Arc<Semaphore>> {
        if bidirectional {
            self.bidirectional.as_ref()
        } else {
            self.unidirectional.as_ref()
        }
    }

    /// Wait for a dispatch slot. Returns `None` when the kind is unlimited.
    ///
    /// Fails once the limiter is closed.
    pub async fn acquire(&self, bidirectional: bool) -> Result<Option<DispatchPermit>> {
        let Some(semaphore) = self.semaphore(bidirectional) else {
            return Ok(None);
        };
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RpcError::closed_locally())?;
        Ok(Some(DispatchPermit { _permit: permit }))
    }

    /// Free slots for a stream kind, or `None` when unlimited.
    pub fn available(&self, bidirectional: bool) -> Option<usize> {
        self.semaphore(bidirectional).map(|s| s.available_permits())
    }

    /// Wake every waiter with an error.
    pub fn close(&self) {
        for semaphore in [&self.bidirectional, &self.unidirectional].into_iter().flatten() {
            semaphore.close();
        }
    }
}
