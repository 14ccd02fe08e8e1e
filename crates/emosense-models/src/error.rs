use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VersionStoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt value for key {key}: {value}")]
    Corrupt { key: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to move {from} into {to}: {source}")]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,
    #[error("downloaded artifact is empty")]
    EmptyArtifact,
    #[error("transport: {0}")]
    Transport(String),
    #[error("install failed: {0}")]
    StoreFailure(#[from] StoreError),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("install journal: {0}")]
    Journal(#[from] VersionStoreError),
}

impl DownloadError {
    /// Whether the scheduler should retry the unit of work with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, DownloadError::Transport(_))
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        DownloadError::Transport(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// Network hiccup, timeout or backend 5xx; retried by the scheduler.
    #[error("transient update-check failure: {0}")]
    Transient(String),
    /// Malformed payload or a response that retrying will not fix.
    #[error("update check failed: {0}")]
    Permanent(String),
}

impl CheckError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CheckError::Transient(_))
    }
}

impl From<VersionStoreError> for CheckError {
    fn from(e: VersionStoreError) -> Self {
        CheckError::Permanent(format!("version store: {e}"))
    }
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("model store: {0}")]
    Store(#[from] StoreError),
    #[error("version store: {0}")]
    Versions(#[from] VersionStoreError),
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("background task failed: {0}")]
    Task(String),
}
