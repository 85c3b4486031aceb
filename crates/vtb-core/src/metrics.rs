//! Monthly usage statistics.
//!
//! Events are folded into `YYYY-MM` buckets (UTC). Every field of a bucket is a
//! set union or a counter, so replaying the same events in any order produces
//! identical buckets. The all-time view is derived from the buckets on demand
//! and never stored.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    domain::{MonthKey, UserId},
    errors::Error,
    ports::DocumentStore,
    store::{load_or_warn, replace_or_warn},
    Result,
};

pub const METRICS_SCHEMA_VERSION: u32 = 1;

/// Text-rewrite variant requested after a transcription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StyleTag {
    Proofread,
    /// Persisted as `my` for compatibility with existing documents.
    Informal,
    Business,
    Brief,
}

impl StyleTag {
    pub const ALL: [StyleTag; 4] = [
        StyleTag::Proofread,
        StyleTag::Informal,
        StyleTag::Business,
        StyleTag::Brief,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StyleTag::Proofread => "proofread",
            StyleTag::Informal => "my",
            StyleTag::Business => "business",
            StyleTag::Brief => "brief",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "proofread" => Some(StyleTag::Proofread),
            "my" | "informal" => Some(StyleTag::Informal),
            "business" => Some(StyleTag::Business),
            "brief" => Some(StyleTag::Brief),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsageKind {
    Transcription,
    /// Raw style tag as received; unrecognized tags are ignored when applied.
    Style(String),
}

impl UsageKind {
    pub fn style(tag: StyleTag) -> Self {
        UsageKind::Style(tag.as_str().to_string())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleCounts {
    #[serde(default)]
    pub proofread: u64,
    #[serde(default, rename = "my")]
    pub informal: u64,
    #[serde(default)]
    pub business: u64,
    #[serde(default)]
    pub brief: u64,
}

impl StyleCounts {
    pub fn get(&self, tag: StyleTag) -> u64 {
        match tag {
            StyleTag::Proofread => self.proofread,
            StyleTag::Informal => self.informal,
            StyleTag::Business => self.business,
            StyleTag::Brief => self.brief,
        }
    }

    fn slot(&mut self, tag: StyleTag) -> &mut u64 {
        match tag {
            StyleTag::Proofread => &mut self.proofread,
            StyleTag::Informal => &mut self.informal,
            StyleTag::Business => &mut self.business,
            StyleTag::Brief => &mut self.brief,
        }
    }

    pub fn increment(&mut self, tag: StyleTag) {
        *self.slot(tag) += 1;
    }

    pub fn total(&self) -> u64 {
        StyleTag::ALL.iter().map(|t| self.get(*t)).sum()
    }

    fn absorb(&mut self, other: &StyleCounts) {
        for tag in StyleTag::ALL {
            *self.slot(tag) += other.get(tag);
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyAggregate {
    #[serde(default)]
    pub unique_users: BTreeSet<UserId>,
    #[serde(default)]
    pub transcriptions: u64,
    #[serde(default)]
    pub llm_calls: StyleCounts,
}

impl MonthlyAggregate {
    pub fn total_style_calls(&self) -> u64 {
        self.llm_calls.total()
    }

    fn apply(&mut self, id: &UserId, kind: &UsageKind) {
        self.unique_users.insert(id.clone());
        match kind {
            UsageKind::Transcription => self.transcriptions += 1,
            UsageKind::Style(raw) => match StyleTag::parse(raw) {
                Some(tag) => self.llm_calls.increment(tag),
                None => tracing::debug!(tag = %raw, "ignoring unrecognized style tag"),
            },
        }
    }
}

/// All-time totals, computed from the monthly buckets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AllTimeRollup {
    pub unique_users: BTreeSet<UserId>,
    pub transcriptions: u64,
    pub llm_calls: StyleCounts,
    pub months_with_data: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsReport {
    pub months: BTreeMap<MonthKey, MonthlyAggregate>,
    pub all_time: AllTimeRollup,
}

impl MetricsReport {
    fn from_ledger(months: BTreeMap<MonthKey, MonthlyAggregate>) -> Self {
        let mut all_time = AllTimeRollup {
            months_with_data: months.len(),
            ..AllTimeRollup::default()
        };
        for agg in months.values() {
            all_time
                .unique_users
                .extend(agg.unique_users.iter().cloned());
            all_time.transcriptions += agg.transcriptions;
            all_time.llm_calls.absorb(&agg.llm_calls);
        }
        Self { months, all_time }
    }
}

/// On-disk metrics ledger.
///
/// Buckets are kept as raw JSON so one damaged bucket does not take the rest
/// of the history down with it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricsDocument {
    Versioned {
        version: u32,
        months: BTreeMap<String, serde_json::Value>,
    },
    Legacy(BTreeMap<String, serde_json::Value>),
}

type Ledger = BTreeMap<MonthKey, MonthlyAggregate>;

pub struct MetricsAggregator {
    ledger: RwLock<Ledger>,
    store: Arc<dyn DocumentStore<MetricsDocument>>,
}

impl MetricsAggregator {
    pub async fn open(store: Arc<dyn DocumentStore<MetricsDocument>>) -> Self {
        let ledger = match load_or_warn(store.as_ref()).await {
            None => Ledger::new(),
            Some(doc) => match ledger_from_document(doc) {
                Ok(ledger) => ledger,
                Err(e) => {
                    tracing::error!(store = %store.describe(), error = %e, "rejecting metrics document");
                    if let Err(e) = store.set_aside("unsupported document").await {
                        tracing::warn!(error = %e, "failed to keep a copy of metrics document");
                    }
                    Ledger::new()
                }
            },
        };

        Self {
            ledger: RwLock::new(ledger),
            store,
        }
    }

    pub async fn apply_event(&self, id: &UserId, kind: &UsageKind, at: DateTime<Utc>) {
        let key = match MonthKey::from_datetime(at) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(user = %id, at = %at, error = %e, "dropping usage event outside bucket range");
                return;
            }
        };

        let mut ledger = self.ledger.write().await;
        ledger.entry(key).or_default().apply(id, kind);
        tracing::debug!(user = %id, month = %key, kind = ?kind, "tracked usage event");

        match to_document(&ledger) {
            Ok(doc) => {
                replace_or_warn(self.store.as_ref(), &doc).await;
            }
            Err(e) => tracing::error!(error = %e, "failed to encode metrics document"),
        }
    }

    pub async fn month_report(&self, key: MonthKey) -> Option<MonthlyAggregate> {
        self.ledger.read().await.get(&key).cloned()
    }

    pub async fn all_months_report(&self) -> MetricsReport {
        let months = self.ledger.read().await.clone();
        MetricsReport::from_ledger(months)
    }

    /// Buckets with data, newest first.
    pub async fn month_keys_desc(&self) -> Vec<MonthKey> {
        self.ledger.read().await.keys().rev().copied().collect()
    }
}

fn to_document(ledger: &Ledger) -> Result<MetricsDocument> {
    let mut months = BTreeMap::new();
    for (key, agg) in ledger {
        months.insert(key.to_string(), serde_json::to_value(agg)?);
    }
    Ok(MetricsDocument::Versioned {
        version: METRICS_SCHEMA_VERSION,
        months,
    })
}

fn ledger_from_document(doc: MetricsDocument) -> Result<Ledger> {
    let raw = match doc {
        MetricsDocument::Versioned { version, months } => {
            if version != METRICS_SCHEMA_VERSION {
                return Err(Error::UnsupportedSchema {
                    document: "metrics",
                    version,
                });
            }
            months
        }
        // Legacy ledgers are keyed by month only. A `version` key means a
        // versioned document whose shape this build does not know.
        MetricsDocument::Legacy(months) => match months.get("version") {
            None => months,
            Some(v) => {
                return Err(match v.as_u64().and_then(|v| u32::try_from(v).ok()) {
                    Some(version) => Error::UnsupportedSchema {
                        document: "metrics",
                        version,
                    },
                    None => Error::Validation(format!("metrics document has invalid version {v}")),
                })
            }
        },
    };

    let mut ledger = Ledger::new();
    for (raw_key, value) in raw {
        let key: MonthKey = match raw_key.parse() {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(key = %raw_key, error = %e, "dropping metrics bucket with invalid key");
                continue;
            }
        };
        let agg = match serde_json::from_value::<MonthlyAggregate>(value) {
            Ok(agg) => agg,
            Err(e) => {
                tracing::warn!(month = %key, error = %e, "corrupt metrics bucket; starting fresh");
                MonthlyAggregate::default()
            }
        };
        ledger.insert(key, agg);
    }
    Ok(ledger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::JsonFileStore,
        testing::{MemoryStore, TmpDir},
    };
    use chrono::TimeZone;
    use serde_json::json;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn month(s: &str) -> MonthKey {
        s.parse().unwrap()
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
    }

    async fn aggregator() -> (MetricsAggregator, Arc<MemoryStore<MetricsDocument>>) {
        let store = Arc::new(MemoryStore::<MetricsDocument>::new());
        (MetricsAggregator::open(store.clone()).await, store)
    }

    fn event_log() -> Vec<(UserId, UsageKind, DateTime<Utc>)> {
        vec![
            (uid("2"), UsageKind::Transcription, at(2024, 3, 1)),
            (uid("3"), UsageKind::style(StyleTag::Brief), at(2024, 3, 2)),
            (uid("2"), UsageKind::Transcription, at(2024, 3, 5)),
            (uid("2"), UsageKind::style(StyleTag::Informal), at(2024, 4, 1)),
            (uid("4"), UsageKind::Style("poetry".into()), at(2024, 4, 2)),
            (uid("3"), UsageKind::Transcription, at(2024, 4, 3)),
        ]
    }

    #[tokio::test]
    async fn march_scenario_report() {
        let (m, _) = aggregator().await;
        m.apply_event(&uid("2"), &UsageKind::Transcription, at(2024, 3, 4))
            .await;
        m.apply_event(&uid("3"), &UsageKind::Style("brief".into()), at(2024, 3, 20))
            .await;

        let report = m.month_report(month("2024-03")).await.unwrap();
        assert_eq!(
            report.unique_users,
            [uid("2"), uid("3")].into_iter().collect::<BTreeSet<_>>()
        );
        assert_eq!(report.transcriptions, 1);
        assert_eq!(
            report.llm_calls,
            StyleCounts {
                proofread: 0,
                informal: 0,
                business: 0,
                brief: 1
            }
        );
        assert!(m.month_report(month("2024-04")).await.is_none());
    }

    #[tokio::test]
    async fn replay_in_any_order_is_identical() {
        let (forward, forward_store) = aggregator().await;
        let (backward, backward_store) = aggregator().await;

        let log = event_log();
        for (id, kind, ts) in &log {
            forward.apply_event(id, kind, *ts).await;
        }
        for (id, kind, ts) in log.iter().rev() {
            backward.apply_event(id, kind, *ts).await;
        }

        assert_eq!(
            forward.all_months_report().await,
            backward.all_months_report().await
        );
        assert_eq!(forward_store.snapshot(), backward_store.snapshot());

        let april = forward.month_report(month("2024-04")).await.unwrap();
        // Unknown tag still marks the user active, but counts nothing.
        assert_eq!(april.unique_users.len(), 3);
        assert_eq!(april.total_style_calls(), 1);
    }

    #[tokio::test]
    async fn repeat_users_do_not_inflate_unique_count() {
        let (m, _) = aggregator().await;
        for _ in 0..5 {
            m.apply_event(&uid("2"), &UsageKind::Transcription, at(2024, 3, 1))
                .await;
        }
        let march = m.month_report(month("2024-03")).await.unwrap();
        assert_eq!(march.unique_users.len(), 1);
        assert_eq!(march.transcriptions, 5);
    }

    #[tokio::test]
    async fn all_time_rollup_unions_users_and_sums_counters() {
        let (m, _) = aggregator().await;
        for (id, kind, ts) in event_log() {
            m.apply_event(&id, &kind, ts).await;
        }

        let report = m.all_months_report().await;
        let per_month_sum: usize = report.months.values().map(|a| a.unique_users.len()).sum();
        assert_eq!(per_month_sum, 5);
        assert_eq!(report.all_time.unique_users.len(), 3);
        assert_eq!(report.all_time.transcriptions, 3);
        assert_eq!(report.all_time.llm_calls.brief, 1);
        assert_eq!(report.all_time.llm_calls.informal, 1);
        assert_eq!(report.all_time.months_with_data, 2);

        assert_eq!(
            m.month_keys_desc().await,
            vec![month("2024-04"), month("2024-03")]
        );
    }

    #[tokio::test]
    async fn persisted_document_uses_wire_names() {
        let (m, store) = aggregator().await;
        m.apply_event(&uid("2"), &UsageKind::style(StyleTag::Informal), at(2024, 3, 1))
            .await;

        let doc = serde_json::to_value(store.snapshot().unwrap()).unwrap();
        assert_eq!(
            doc,
            json!({
                "version": 1,
                "months": {
                    "2024-03": {
                        "unique_users": ["2"],
                        "transcriptions": 0,
                        "llm_calls": {"proofread": 0, "my": 1, "business": 0, "brief": 0}
                    }
                }
            })
        );
    }

    #[tokio::test]
    async fn legacy_document_with_a_corrupt_bucket_keeps_the_rest() {
        let legacy: MetricsDocument = serde_json::from_value(json!({
            "2024-01": {
                "unique_users": ["5", "6"],
                "transcriptions": 4,
                "llm_calls": {"proofread": 1, "my": 0, "business": 2, "brief": 0, "poetry": 9}
            },
            "2024-02": "garbage",
            "not-a-month": {"transcriptions": 1}
        }))
        .unwrap();
        assert!(matches!(legacy, MetricsDocument::Legacy(_)));

        let store = Arc::new(MemoryStore::with_doc(legacy));
        let m = MetricsAggregator::open(store).await;

        let jan = m.month_report(month("2024-01")).await.unwrap();
        assert_eq!(jan.unique_users.len(), 2);
        assert_eq!(jan.llm_calls.total(), 3);

        assert_eq!(
            m.month_report(month("2024-02")).await,
            Some(MonthlyAggregate::default())
        );
        assert_eq!(m.month_keys_desc().await.len(), 2);
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let store = Arc::new(MemoryStore::with_doc(MetricsDocument::Versioned {
            version: 3,
            months: BTreeMap::new(),
        }));
        let m = MetricsAggregator::open(store.clone()).await;
        assert!(m.all_months_report().await.months.is_empty());
        assert_eq!(store.set_asides(), 1);
    }

    #[tokio::test]
    async fn newer_document_of_another_shape_is_kept_aside() {
        let tmp = TmpDir::new("metrics-newer");
        tokio::fs::create_dir_all(tmp.path()).await.unwrap();
        let path = tmp.join("metrics.json");
        let original = r#"{"version": 2, "months": [{"key": "2024-01", "transcriptions": 40}]}"#;
        tokio::fs::write(&path, original).await.unwrap();

        let store = Arc::new(JsonFileStore::<MetricsDocument>::new(&path));
        let m = MetricsAggregator::open(store).await;
        assert!(m.all_months_report().await.months.is_empty());

        m.apply_event(&uid("2"), &UsageKind::Transcription, at(2024, 3, 1))
            .await;

        let kept = tokio::fs::read_to_string(tmp.join("metrics.json.rejected"))
            .await
            .unwrap();
        assert_eq!(kept, original);
    }

    #[tokio::test]
    async fn legacy_shaped_document_with_version_key_is_rejected() {
        let doc: MetricsDocument = serde_json::from_value(json!({
            "version": 2,
            "months": []
        }))
        .unwrap();
        assert!(matches!(doc, MetricsDocument::Legacy(_)));
        assert!(matches!(
            ledger_from_document(doc),
            Err(Error::UnsupportedSchema { version: 2, .. })
        ));

        let store = Arc::new(MemoryStore::with_doc(MetricsDocument::Legacy(
            [("version".to_string(), json!("next"))].into_iter().collect(),
        )));
        let m = MetricsAggregator::open(store.clone()).await;
        assert!(m.all_months_report().await.months.is_empty());
        assert_eq!(store.set_asides(), 1);
    }

    #[tokio::test]
    async fn event_outside_bucket_range_is_dropped() {
        let (m, store) = aggregator().await;
        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        m.apply_event(&uid("2"), &UsageKind::Transcription, far).await;

        assert!(m.all_months_report().await.months.is_empty());
        assert_eq!(store.write_attempts(), 0);
    }

    #[test]
    fn style_tags_parse_with_aliases() {
        assert_eq!(StyleTag::parse(" Brief "), Some(StyleTag::Brief));
        assert_eq!(StyleTag::parse("informal"), Some(StyleTag::Informal));
        assert_eq!(StyleTag::parse("my"), Some(StyleTag::Informal));
        assert_eq!(StyleTag::parse("haiku"), None);
    }
}
