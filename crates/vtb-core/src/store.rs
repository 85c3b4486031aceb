//! Whole-document JSON persistence.
//!
//! `JsonFileStore` implements the [`DocumentStore`] port with write-to-temp +
//! rename, so a crash mid-write leaves either the old or the new document on
//! disk. The helpers at the bottom implement the fail-open policy shared by all
//! stores: load errors degrade to "no document", write errors are retried once
//! and then dropped with a log line.

use std::{
    io::ErrorKind,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{errors::Error, ports::DocumentStore, Result};

pub const PERSIST_ATTEMPTS: usize = 2;

pub struct JsonFileStore<T> {
    path: PathBuf,
    _doc: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<T> DocumentStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<Option<T>> {
        let txt = match tokio::fs::read_to_string(&self.path).await {
            Ok(txt) => txt,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if txt.trim().is_empty() {
            return Ok(None);
        }

        let doc = serde_json::from_str(&txt).map_err(|e| Error::Persistence {
            path: self.path.clone(),
            reason: format!("corrupt document: {e}"),
        })?;
        Ok(Some(doc))
    }

    async fn replace(&self, doc: &T) -> Result<()> {
        let txt = serde_json::to_string_pretty(doc)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = sibling(&self.path, ".tmp");
        tokio::fs::write(&tmp, txt).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn set_aside(&self, reason: &str) -> Result<()> {
        let dst = sibling(&self.path, ".rejected");
        match tokio::fs::copy(&self.path, &dst).await {
            Ok(_) => {
                tracing::warn!(
                    from = %self.path.display(),
                    to = %dst.display(),
                    reason,
                    "kept a copy of rejected document"
                );
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Load a document, treating any failure as "nothing persisted".
///
/// A document that exists but cannot be read is set aside first so the next
/// write does not destroy it.
pub(crate) async fn load_or_warn<T>(store: &dyn DocumentStore<T>) -> Option<T>
where
    T: Send + Sync,
{
    match store.load().await {
        Ok(doc) => doc,
        Err(e) => {
            tracing::error!(store = %store.describe(), error = %e, "failed to load document; starting empty");
            if let Err(e) = store.set_aside("unreadable").await {
                tracing::warn!(store = %store.describe(), error = %e, "failed to keep a copy of unreadable document");
            }
            None
        }
    }
}

/// Replace a document, retrying once. Returns whether the write landed.
pub(crate) async fn replace_or_warn<T>(store: &dyn DocumentStore<T>, doc: &T) -> bool
where
    T: Send + Sync,
{
    for attempt in 1..=PERSIST_ATTEMPTS {
        match store.replace(doc).await {
            Ok(()) => return true,
            Err(e) if attempt < PERSIST_ATTEMPTS => {
                tracing::warn!(store = %store.describe(), attempt, error = %e, "document write failed; retrying");
            }
            Err(e) => {
                tracing::error!(store = %store.describe(), error = %e, "document write dropped; keeping in-memory state");
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, TmpDir};

    #[tokio::test]
    async fn missing_or_blank_file_loads_as_none() {
        let tmp = TmpDir::new("store-missing");
        let path = tmp.join("doc.json");
        let store: JsonFileStore<Vec<String>> = JsonFileStore::new(&path);
        assert!(store.load().await.unwrap().is_none());

        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, "  \n").await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replace_creates_parent_dirs_and_leaves_no_temp_file() {
        let tmp = TmpDir::new("store-replace");
        let dir = tmp.path();
        let path = dir.join("nested/doc.json");
        let store: JsonFileStore<Vec<String>> = JsonFileStore::new(&path);

        store.replace(&vec!["a".to_string()]).await.unwrap();
        store
            .replace(&vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        assert_eq!(
            store.load().await.unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert!(!sibling(&path, ".tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_and_set_aside() {
        let tmp = TmpDir::new("store-corrupt");
        let dir = tmp.path();
        tokio::fs::create_dir_all(dir).await.unwrap();
        let path = dir.join("doc.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let store: JsonFileStore<Vec<String>> = JsonFileStore::new(&path);
        assert!(matches!(
            store.load().await,
            Err(Error::Persistence { .. })
        ));

        assert!(load_or_warn::<Vec<String>>(&store).await.is_none());
        let kept = tokio::fs::read_to_string(sibling(&path, ".rejected"))
            .await
            .unwrap();
        assert_eq!(kept, "{not json");
    }

    #[tokio::test]
    async fn failed_writes_are_retried_then_dropped() {
        let store = MemoryStore::<u32>::new();
        store.fail_writes(true);

        assert!(!replace_or_warn::<u32>(&store, &1).await);
        assert_eq!(store.write_attempts(), PERSIST_ATTEMPTS);
        assert_eq!(store.snapshot(), None);

        store.fail_writes(false);
        assert!(replace_or_warn::<u32>(&store, &2).await);
        assert_eq!(store.snapshot(), Some(2));
    }
}
