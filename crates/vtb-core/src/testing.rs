//! Test doubles shared by the store tests and, behind `test-util`, by the
//! binary's tests.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    errors::Error,
    ports::{Clock, DocumentStore},
    Result,
};

static TMP_COUNTER: AtomicUsize = AtomicUsize::new(1);

pub fn tmp_path(prefix: &str) -> PathBuf {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_nanos();
    let pid = std::process::id();
    let n = TMP_COUNTER.fetch_add(1, Ordering::SeqCst);
    PathBuf::from(format!("/tmp/vtb-{prefix}-{pid}-{ts}-{n}"))
}

/// Scratch directory under `/tmp`, removed on drop.
pub struct TmpDir(PathBuf);

impl TmpDir {
    pub fn new(prefix: &str) -> Self {
        Self(tmp_path(prefix))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.0.join(rel)
    }
}

impl Drop for TmpDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// In-memory document store that records every write.
pub struct MemoryStore<T> {
    doc: Mutex<Option<T>>,
    write_attempts: AtomicUsize,
    set_asides: AtomicUsize,
    fail_writes: AtomicBool,
}

impl<T: Clone> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            doc: Mutex::new(None),
            write_attempts: AtomicUsize::new(0),
            set_asides: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn with_doc(doc: T) -> Self {
        let store = Self::new();
        *store.doc.lock().unwrap() = Some(doc);
        store
    }

    pub fn snapshot(&self) -> Option<T> {
        self.doc.lock().unwrap().clone()
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn set_asides(&self) -> usize {
        self.set_asides.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl<T> DocumentStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync,
{
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn load(&self) -> Result<Option<T>> {
        Ok(self.snapshot())
    }

    async fn replace(&self, doc: &T) -> Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("disk full")));
        }
        *self.doc.lock().unwrap() = Some(doc.clone());
        Ok(())
    }

    async fn set_aside(&self, _reason: &str) -> Result<()> {
        self.set_asides.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
