use std::path::PathBuf;

use thiserror::Error;

use crate::types::PaperId;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("cannot open PDF {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("PDF library unavailable: {0}")]
    Library(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("malformed stored JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot prepare database location: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity violation: {0}")]
    Integrity(String),
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("PDF not accessible: {path}: {reason}")]
    FileAccess { path: PathBuf, reason: String },
    #[error("paper {0} not found")]
    PaperNotFound(PaperId),
    #[error("paper {0} has no PDF attached")]
    MissingPdf(PaperId),
    #[error("extraction already running for paper {0}")]
    Busy(PaperId),
    #[error("extraction cancelled")]
    Cancelled,
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl From<BackendError> for ExtractError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Open { path, reason } => ExtractError::FileAccess { path, reason },
            BackendError::Library(reason) => ExtractError::FileAccess {
                path: PathBuf::new(),
                reason,
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("cannot read signal file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed signal JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid signal: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
