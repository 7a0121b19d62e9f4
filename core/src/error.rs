/// Error types for the sync engine
use thiserror::Error;

/// All variants carry owned strings so the error is `Clone`: single-flight
/// guards hand the same outcome to every collapsed caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
