use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("invalid offset: {0}")]
    InvalidOffset(String),
    #[error("seek out of range: {0}")]
    SeekOutOfRange(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid tree: {0}")]
    InvalidTree(String),
    #[error("directory collision: {0}")]
    DirectoryCollision(String),
    #[error("access revoked: {0}")]
    AccessRevoked(String),
    #[error("stream is closed")]
    Closed,
}

pub type CoreResult<T> = Result<T, CoreError>;
