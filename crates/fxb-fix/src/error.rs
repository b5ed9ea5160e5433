//! FIX gateway error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FixError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("checksum mismatch: declared {declared}, computed {computed}")]
    Checksum { declared: String, computed: u32 },

    #[error("missing tag {0}")]
    MissingTag(u32),

    #[error("invalid value for tag {tag}: {value}")]
    InvalidValue { tag: u32, value: String },

    #[error("session halted: {0}")]
    Halted(String),

    #[error("session channel closed")]
    ChannelClosed,

    #[error("unknown session: {0}")]
    UnknownSession(String),
}

pub type FixResult<T> = Result<T, FixError>;
