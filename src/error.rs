use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for the sync engine.
///
/// Everything except [`SyncError::Cancelled`] is considered retryable by the
/// baseline retry policy; permanent failures (bad credentials, bad config)
/// surface quickly because the retry budget is short.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("authentication rejected by remote: {0}")]
    Auth(String),

    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("storage operation failed: {0}")]
    Storage(String),

    #[error("archive integrity check failed: {0}")]
    Integrity(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("vaultwarden data path does not exist: {}", .0.display())]
    DataPathMissing(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("job {0} is already in a terminal state")]
    JobTransition(i64),

    #[error("{failed} of {total} sync workers failed: {details}")]
    Fanout {
        failed: usize,
        total: usize,
        details: String,
    },
}

impl From<tokio_rusqlite::Error> for SyncError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        SyncError::Database(err.to_string())
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
