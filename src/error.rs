//! Error types for submitq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid item state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::model::ItemState,
        to: crate::model::ItemState,
    },

    #[error("result store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("checkpoint i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("job {job_id} aborted: {reason}; committed batches are checkpointed, rerun to resume")]
    Aborted { job_id: String, reason: String },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
