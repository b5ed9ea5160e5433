//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("query bounds: {0}")]
    QueryBounds(String),

    #[error("writer stopped")]
    WriterStopped,

    #[error("blocking read task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

pub type StoreResult<T> = Result<T, StoreError>;
