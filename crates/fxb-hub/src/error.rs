//! Hub error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("authentication failed")]
    AuthFailed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type HubResult<T> = Result<T, HubError>;
