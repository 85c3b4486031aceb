//! Per-user sliding-window request quota.
//!
//! Each non-exempt user has an ascending list of admitted request instants.
//! At evaluation instant `now` only entries in `(now - 1h, now]` count; older
//! entries are pruned lazily on the next write for that user.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    access::AccessRegistry,
    domain::UserId,
    errors::Error,
    ports::DocumentStore,
    store::{load_or_warn, replace_or_warn},
    Result,
};

pub const QUOTA_SCHEMA_VERSION: u32 = 1;

/// Length of the sliding window.
pub const WINDOW: Duration = Duration::from_secs(60 * 60);

/// On-disk quota windows: user id -> RFC3339 timestamps.
///
/// The unversioned legacy shape is a bare map with naive local timestamps;
/// those are read as UTC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuotaDocument {
    Versioned {
        version: u32,
        windows: BTreeMap<String, Vec<String>>,
    },
    Legacy(BTreeMap<String, Vec<String>>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Remaining {
    Unlimited,
    Limited(u32),
}

/// Snapshot of a user's standing, taken under one read lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaStatus {
    pub remaining: Remaining,
    /// Time until the next request would be admitted (zero if one would be now).
    pub wait: Duration,
}

type Windows = BTreeMap<UserId, Vec<DateTime<Utc>>>;

pub struct QuotaStore {
    limit: u32,
    access: Arc<AccessRegistry>,
    windows: RwLock<Windows>,
    store: Arc<dyn DocumentStore<QuotaDocument>>,
}

impl QuotaStore {
    pub async fn open(
        limit: u32,
        access: Arc<AccessRegistry>,
        store: Arc<dyn DocumentStore<QuotaDocument>>,
    ) -> Self {
        let windows = match load_or_warn(store.as_ref()).await {
            None => Windows::new(),
            Some(doc) => match windows_from_document(doc) {
                Ok(w) => w,
                Err(e) => {
                    tracing::error!(store = %store.describe(), error = %e, "rejecting quota document");
                    if let Err(e) = store.set_aside("unsupported version").await {
                        tracing::warn!(error = %e, "failed to keep a copy of quota document");
                    }
                    Windows::new()
                }
            },
        };

        Self {
            limit,
            access,
            windows: RwLock::new(windows),
            store,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub async fn can_request(&self, id: &UserId, now: DateTime<Utc>) -> bool {
        if self.access.is_exempt(id).await {
            tracing::debug!(user = %id, "exempt user bypassing quota");
            return true;
        }
        let windows = self.windows.read().await;
        let used = windows.get(id).map_or(0, |w| live_count(w, now));
        used < self.limit as usize
    }

    /// Record an admitted request. Exempt users are never recorded.
    pub async fn record_request(&self, id: &UserId, now: DateTime<Utc>) {
        if self.access.is_exempt(id).await {
            return;
        }

        let mut windows = self.windows.write().await;
        let entries = windows.entry(id.clone()).or_default();
        prune(entries, now);
        insert_sorted(entries, now);
        let used = live_count(entries, now);
        tracing::debug!(user = %id, used, limit = self.limit, "recorded request");

        replace_or_warn(self.store.as_ref(), &to_document(&windows)).await;
    }

    /// Check and record as one critical section.
    ///
    /// Two concurrent callers for the same user cannot both observe the last
    /// free slot: the second one waits for the write lock and sees the first
    /// one's entry.
    pub async fn try_admit(&self, id: &UserId, now: DateTime<Utc>) -> bool {
        if self.access.is_exempt(id).await {
            tracing::debug!(user = %id, "exempt user bypassing quota");
            return true;
        }

        let mut windows = self.windows.write().await;
        let used = windows.get(id).map_or(0, |w| live_count(w, now));
        if used >= self.limit as usize {
            tracing::debug!(user = %id, used, limit = self.limit, "request denied by quota");
            return false;
        }

        let entries = windows.entry(id.clone()).or_default();
        prune(entries, now);
        insert_sorted(entries, now);
        tracing::debug!(user = %id, used = used + 1, limit = self.limit, "request admitted");

        replace_or_warn(self.store.as_ref(), &to_document(&windows)).await;
        true
    }

    pub async fn remaining_requests(&self, id: &UserId, now: DateTime<Utc>) -> Remaining {
        self.status(id, now).await.remaining
    }

    pub async fn time_until_next_slot(&self, id: &UserId, now: DateTime<Utc>) -> Duration {
        self.status(id, now).await.wait
    }

    pub async fn status(&self, id: &UserId, now: DateTime<Utc>) -> QuotaStatus {
        if self.access.is_exempt(id).await {
            return QuotaStatus {
                remaining: Remaining::Unlimited,
                wait: Duration::ZERO,
            };
        }

        let windows = self.windows.read().await;
        let entries = windows.get(id).map(Vec::as_slice).unwrap_or_default();
        let used = live_count(entries, now);
        let remaining = (self.limit as usize).saturating_sub(used) as u32;

        QuotaStatus {
            remaining: Remaining::Limited(remaining),
            wait: wait_for_slot(entries, self.limit, now),
        }
    }
}

fn window_delta() -> TimeDelta {
    TimeDelta::hours(1)
}

fn is_live(ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    ts > now - window_delta() && ts <= now
}

fn live_count(entries: &[DateTime<Utc>], now: DateTime<Utc>) -> usize {
    entries.iter().filter(|ts| is_live(**ts, now)).count()
}

/// Drop entries that can never become live again.
fn prune(entries: &mut Vec<DateTime<Utc>>, now: DateTime<Utc>) {
    let cutoff = now - window_delta();
    let expired = entries.partition_point(|ts| *ts <= cutoff);
    entries.drain(..expired);
}

fn insert_sorted(entries: &mut Vec<DateTime<Utc>>, ts: DateTime<Utc>) {
    let idx = entries.partition_point(|e| *e <= ts);
    entries.insert(idx, ts);
}

/// Time until the live count drops below `limit`.
///
/// With `limit` live entries this is when the oldest one expires. A zero limit
/// never frees a slot; the full window length is reported.
fn wait_for_slot(entries: &[DateTime<Utc>], limit: u32, now: DateTime<Utc>) -> Duration {
    let live: Vec<DateTime<Utc>> = entries
        .iter()
        .copied()
        .filter(|ts| is_live(*ts, now))
        .collect();
    let limit = limit as usize;
    if live.len() < limit {
        return Duration::ZERO;
    }
    if limit == 0 {
        return WINDOW;
    }

    // `live` is ascending; this entry has to expire before a slot opens.
    let blocking = live[live.len() - limit];
    (blocking + window_delta() - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn to_document(windows: &Windows) -> QuotaDocument {
    QuotaDocument::Versioned {
        version: QUOTA_SCHEMA_VERSION,
        windows: windows
            .iter()
            .map(|(id, entries)| (id.to_string(), entries.iter().map(format_ts).collect()))
            .collect(),
    }
}

fn windows_from_document(doc: QuotaDocument) -> Result<Windows> {
    let raw = match doc {
        QuotaDocument::Versioned { version, windows } => {
            if version != QUOTA_SCHEMA_VERSION {
                return Err(Error::UnsupportedSchema {
                    document: "quota",
                    version,
                });
            }
            windows
        }
        QuotaDocument::Legacy(windows) => windows,
    };

    let mut out = Windows::new();
    for (key, stamps) in raw {
        let Ok(id) = UserId::parse(&key) else {
            tracing::warn!(key = %key, "dropping quota window with blank user id");
            continue;
        };

        let mut entries: Vec<DateTime<Utc>> = Vec::with_capacity(stamps.len());
        for s in &stamps {
            match parse_ts(s) {
                Some(ts) => entries.push(ts),
                None => tracing::warn!(user = %id, value = %s, "dropping unparseable quota timestamp"),
            }
        }
        out.entry(id).or_default().extend(entries);
    }
    // Keys that differ only by whitespace collapse onto one user.
    for entries in out.values_mut() {
        entries.sort();
    }
    Ok(out)
}
