//! Exemption registry ("VIP" list) plus the configured admin.
//!
//! Exempt users bypass quota checks entirely and are never recorded in the
//! quota document. The admin is implicitly exempt and is never stored in the
//! persisted set.

use std::{collections::BTreeSet, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    domain::UserId,
    errors::Error,
    ports::DocumentStore,
    store::{load_or_warn, replace_or_warn},
    Result,
};

pub const WHITELIST_SCHEMA_VERSION: u32 = 1;

/// On-disk whitelist.
///
/// Older deployments wrote a bare JSON array; it is accepted on load and
/// replaced with the versioned form at the next write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WhitelistDocument {
    Versioned { version: u32, users: Vec<String> },
    Legacy(Vec<serde_json::Value>),
}

impl WhitelistDocument {
    fn from_members(members: &BTreeSet<UserId>) -> Self {
        Self::Versioned {
            version: WHITELIST_SCHEMA_VERSION,
            users: members.iter().map(|u| u.to_string()).collect(),
        }
    }

    fn into_members(self) -> Result<BTreeSet<UserId>> {
        let raw: Vec<String> = match self {
            Self::Versioned { version, users } => {
                if version != WHITELIST_SCHEMA_VERSION {
                    return Err(Error::UnsupportedSchema {
                        document: "whitelist",
                        version,
                    });
                }
                users
            }
            Self::Legacy(values) => values
                .into_iter()
                .filter_map(|v| match v {
                    serde_json::Value::String(s) => Some(s),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
        };

        Ok(raw.iter().filter_map(|s| UserId::parse(s).ok()).collect())
    }
}

pub struct AccessRegistry {
    admin: UserId,
    members: RwLock<BTreeSet<UserId>>,
    store: Arc<dyn DocumentStore<WhitelistDocument>>,
}

impl AccessRegistry {
    /// Load the persisted set and merge `initial` into it (additive only).
    ///
    /// The document is written when the merge changed membership, and also when
    /// nothing was persisted yet so the file exists from the first run.
    pub async fn open(
        admin: UserId,
        initial: &[String],
        store: Arc<dyn DocumentStore<WhitelistDocument>>,
    ) -> Self {
        let loaded = match load_or_warn(store.as_ref()).await {
            None => None,
            Some(doc) => match doc.into_members() {
                Ok(members) => Some(members),
                Err(e) => {
                    tracing::error!(store = %store.describe(), error = %e, "rejecting whitelist document");
                    if let Err(e) = store.set_aside("unsupported version").await {
                        tracing::warn!(error = %e, "failed to keep a copy of whitelist document");
                    }
                    None
                }
            },
        };

        let nothing_persisted = loaded.is_none();
        let mut members = loaded.unwrap_or_default();

        let mut added = 0usize;
        for raw in initial {
            let Ok(id) = UserId::parse(raw) else {
                continue;
            };
            if id == admin {
                continue;
            }
            if members.insert(id) {
                added += 1;
            }
        }

        if added > 0 || nothing_persisted {
            replace_or_warn(store.as_ref(), &WhitelistDocument::from_members(&members)).await;
        }
        if added > 0 {
            tracing::info!(added, total = members.len(), "merged configured whitelist");
        }

        Self {
            admin,
            members: RwLock::new(members),
            store,
        }
    }

    pub fn admin(&self) -> &UserId {
        &self.admin
    }

    pub fn is_admin(&self, id: &UserId) -> bool {
        *id == self.admin
    }

    pub async fn contains(&self, id: &UserId) -> bool {
        self.members.read().await.contains(id)
    }

    pub async fn is_exempt(&self, id: &UserId) -> bool {
        self.is_admin(id) || self.contains(id).await
    }

    /// Grant an exemption. True only if the id was newly inserted.
    pub async fn add(&self, raw: &str) -> bool {
        let id = match UserId::parse(raw) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring whitelist add");
                return false;
            }
        };
        if self.is_admin(&id) {
            tracing::info!(user = %id, "admin is always exempt; not adding to whitelist");
            return false;
        }

        let mut members = self.members.write().await;
        if !members.insert(id.clone()) {
            return false;
        }
        replace_or_warn(
            self.store.as_ref(),
            &WhitelistDocument::from_members(&members),
        )
        .await;
        tracing::info!(user = %id, "added unlimited user");
        true
    }

    /// Revoke an exemption. True only if the id was present.
    pub async fn remove(&self, raw: &str) -> bool {
        let id = match UserId::parse(raw) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring whitelist remove");
                return false;
            }
        };

        let mut members = self.members.write().await;
        if !members.remove(&id) {
            return false;
        }
        replace_or_warn(
            self.store.as_ref(),
            &WhitelistDocument::from_members(&members),
        )
        .await;
        tracing::info!(user = %id, "removed unlimited user");
        true
    }

    /// Granted ids, sorted and duplicate-free. The admin is not listed.
    pub async fn list(&self) -> Vec<UserId> {
        self.members.read().await.iter().cloned().collect()
    }
}
