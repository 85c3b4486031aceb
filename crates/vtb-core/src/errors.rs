use std::path::PathBuf;

/// Core error type for the quota/access/metrics subsystem.
///
/// Only `Config` ever reaches the process boundary. Everything else is logged
/// inside the stores and degraded to a safe default so an in-flight chat
/// request is never aborted by bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported {document} document version: {version}")]
    UnsupportedSchema { document: &'static str, version: u32 },

    #[error("persistence error: {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
