//! Single entry point for the bot command/handler layer.
//!
//! Handlers receive raw identifiers from chat updates; this facade normalizes
//! them, supplies the evaluation instant, and delegates to the three stores.
//! Invalid input degrades to a denial or a no-op and shows up only in the
//! logs; only `current_month` can fail, for clocks outside `0000..=9999`.

use std::{str::FromStr, sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    access::{AccessRegistry, WhitelistDocument},
    config::Config,
    domain::{MonthKey, UserId},
    errors::Error,
    metrics::{MetricsAggregator, MetricsDocument, MetricsReport, MonthlyAggregate, UsageKind},
    ports::{Clock, DocumentStore, SystemClock},
    quota::{QuotaDocument, QuotaStatus, QuotaStore, Remaining},
    store::JsonFileStore,
    Result,
};

/// Persistence backends for the three documents.
#[derive(Clone)]
pub struct PolicyStores {
    pub whitelist: Arc<dyn DocumentStore<WhitelistDocument>>,
    pub quota: Arc<dyn DocumentStore<QuotaDocument>>,
    pub metrics: Arc<dyn DocumentStore<MetricsDocument>>,
}

impl PolicyStores {
    pub fn json_files(cfg: &Config) -> Self {
        Self {
            whitelist: Arc::new(JsonFileStore::new(&cfg.unlimited_users_file)),
            quota: Arc::new(JsonFileStore::new(&cfg.rate_limit_file)),
            metrics: Arc::new(JsonFileStore::new(&cfg.metrics_file)),
        }
    }
}

/// Which statistics a report covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportSelector {
    All,
    Month(MonthKey),
}

impl FromStr for ReportSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(ReportSelector::All);
        }
        Ok(ReportSelector::Month(s.parse()?))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Report {
    Month {
        month: MonthKey,
        stats: Option<MonthlyAggregate>,
    },
    All(MetricsReport),
}

pub struct UsagePolicy {
    access: Arc<AccessRegistry>,
    quota: QuotaStore,
    metrics: MetricsAggregator,
    clock: Arc<dyn Clock>,
}

impl UsagePolicy {
    /// Open the policy over the JSON documents named in `cfg`.
    pub async fn open(cfg: &Config) -> Self {
        Self::with_stores(cfg, PolicyStores::json_files(cfg), Arc::new(SystemClock)).await
    }

    pub async fn with_stores(cfg: &Config, stores: PolicyStores, clock: Arc<dyn Clock>) -> Self {
        let access = Arc::new(
            AccessRegistry::open(
                cfg.admin_user_id.clone(),
                &cfg.unlimited_users,
                stores.whitelist,
            )
            .await,
        );
        let quota = QuotaStore::open(cfg.rate_limit_per_hour, access.clone(), stores.quota).await;
        let metrics = MetricsAggregator::open(stores.metrics).await;

        tracing::info!(
            admin = %cfg.admin_user_id,
            limit = cfg.rate_limit_per_hour,
            granted = access.list().await.len(),
            "usage policy ready"
        );

        Self {
            access,
            quota,
            metrics,
            clock,
        }
    }

    pub fn is_admin(&self, raw: &str) -> bool {
        parse_id(raw, "is_admin").is_some_and(|id| self.access.is_admin(&id))
    }

    /// Whether a request from `raw` would be admitted right now.
    pub async fn is_allowed(&self, raw: &str) -> bool {
        let Some(id) = parse_id(raw, "is_allowed") else {
            return false;
        };
        self.quota.can_request(&id, self.clock.now()).await
    }

    /// Check and record in one step. Prefer this over `is_allowed` + `admit`.
    pub async fn try_admit(&self, raw: &str) -> bool {
        let Some(id) = parse_id(raw, "try_admit") else {
            return false;
        };
        self.quota.try_admit(&id, self.clock.now()).await
    }

    /// Record a request that already completed.
    pub async fn admit(&self, raw: &str) {
        if let Some(id) = parse_id(raw, "admit") {
            self.quota.record_request(&id, self.clock.now()).await;
        }
    }

    pub async fn remaining_and_wait(&self, raw: &str) -> QuotaStatus {
        let Some(id) = parse_id(raw, "remaining_and_wait") else {
            return QuotaStatus {
                remaining: Remaining::Limited(0),
                wait: Duration::ZERO,
            };
        };
        self.quota.status(&id, self.clock.now()).await
    }

    pub async fn grant(&self, raw: &str) -> bool {
        self.access.add(raw).await
    }

    pub async fn revoke(&self, raw: &str) -> bool {
        self.access.remove(raw).await
    }

    pub async fn list_granted(&self) -> Vec<UserId> {
        self.access.list().await
    }

    pub async fn track(&self, raw: &str, kind: UsageKind) {
        if let Some(id) = parse_id(raw, "track") {
            self.metrics.apply_event(&id, &kind, self.clock.now()).await;
        }
    }

    pub async fn month_report(&self, month: MonthKey) -> Option<MonthlyAggregate> {
        self.metrics.month_report(month).await
    }

    pub async fn all_months_report(&self) -> MetricsReport {
        self.metrics.all_months_report().await
    }

    pub async fn report(&self, selector: ReportSelector) -> Report {
        match selector {
            ReportSelector::All => Report::All(self.all_months_report().await),
            ReportSelector::Month(month) => Report::Month {
                month,
                stats: self.month_report(month).await,
            },
        }
    }

    /// Bucket the current instant falls into.
    pub fn current_month(&self) -> Result<MonthKey> {
        MonthKey::from_datetime(self.clock.now())
    }

    /// Months with data, newest first.
    pub async fn months_with_data(&self) -> Vec<MonthKey> {
        self.metrics.month_keys_desc().await
    }
}

fn parse_id(raw: &str, op: &'static str) -> Option<UserId> {
    match UserId::parse(raw) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(op, error = %e, "rejected user id");
            None
        }
    }
}
