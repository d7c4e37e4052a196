//! The remote submission seam.
//!
//! The engine sees the remote service only as a capability that turns a
//! slice of items into per-item outcomes. Wire format, auth, and transport
//! live behind this trait; error classification is the contract.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ErrorKind, Outcome, WorkItem};

/// Classified failure from the remote service.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Timeout, connection reset, server unavailable. Retried.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The server signalled throttling. Retried on a separate budget with
    /// extended backoff.
    #[error("remote rate limit: {0}")]
    RateLimited(String),

    /// Permanently malformed or rejected. Never retried.
    #[error("fatal remote failure: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RemoteError::Fatal(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Transient(_) => ErrorKind::Transient,
            RemoteError::RateLimited(_) => ErrorKind::RateLimited,
            RemoteError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

/// Submission capability of the remote service.
///
/// Implementations must return one outcome per submitted item, in order.
/// The engine works the same whether the service truly batches or only
/// accepts one item per call (`chunk_size = 1`).
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn submit(&self, items: &[WorkItem]) -> Result<Vec<Outcome>, RemoteError>;
}
