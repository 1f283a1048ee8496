use thiserror::Error;

/// Errors raised while decoding shared payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid snapshot payload: {0}")]
    InvalidSnapshot(#[from] serde_json::Error),

    #[error("Snapshot payload is not UTF-8")]
    NotUtf8,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
