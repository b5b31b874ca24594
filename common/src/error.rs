use thiserror::Error;

/// Error kinds shared across crates; each component maps its own failures
/// onto one of these before the error crosses a crate or API boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("cancelled")]
    Cancelled,
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("storage read failed: {0}")]
    StorageRead(String),
    #[error("storage write failed: {0}")]
    StorageWrite(String),
    #[error("malformed key: {0}")]
    MalformedKey(String),
    #[error("malformed value: {0}")]
    MalformedValue(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;