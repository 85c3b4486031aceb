use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;

/// Hexagonal port for whole-document persistence.
///
/// Each store owns one document and always replaces it wholesale; readers
/// never observe a partially written document.
#[async_trait]
pub trait DocumentStore<T>: Send + Sync
where
    T: Send + Sync,
{
    /// Human-readable location, used in log lines.
    fn describe(&self) -> String;

    /// Load the current document. `Ok(None)` means nothing has been written yet.
    async fn load(&self) -> Result<Option<T>>;

    /// Replace the whole document.
    async fn replace(&self, doc: &T) -> Result<()>;

    /// Keep a copy of the current document before it gets overwritten
    /// (used when a document is corrupt or of an unknown version).
    async fn set_aside(&self, reason: &str) -> Result<()>;
}

/// Source of evaluation instants.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
