//! Before/after captures of a document at a point of change
use super::context::Context;
use super::error::StoreError;
use super::store::{DocumentStore, FindOptions, Update, UpdateOutcome};
use super::target::{Target, TargetKey, build_target_key};
use super::utils::{Clock, SystemClock, new_record_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;

pub const SNAPSHOTS: &str = "doc_snapshots";
pub const SNAPSHOT_HEADS: &str = "doc_snapshot_heads";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotContent {
    pub before: Value,
    pub after: Value,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub reason: String,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub snapshot_id: String,
    pub prev_snapshot_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub target_key: TargetKey,
    pub identity: Target,
    pub content: SnapshotContent,
    pub meta: SnapshotMeta,
    pub version: u64,
    pub content_hash: String,
    pub prev_snapshot_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub context: Context,
}

/// Whatever keeps document snapshots. The transition path calls `capture`
/// synchronously and threads the returned ids into the event refs.
pub trait SnapshotCapture: Send + Sync {
    fn capture(
        &self,
        identity: &Target,
        content: SnapshotContent,
        meta: SnapshotMeta,
        ctx: &Context,
    ) -> Result<SnapshotRef, StoreError>;

    /// Identity stored with a snapshot, used to back-fill event targets.
    fn identity(&self, _snapshot_id: &str) -> Result<Option<Target>, StoreError> {
        Ok(None)
    }
}

/// Top level keys whose values differ between two JSON objects.
pub fn changed_fields(before: &Value, after: &Value) -> Vec<String> {
    let empty = serde_json::Map::new();
    let before = before.as_object().unwrap_or(&empty);
    let after = after.as_object().unwrap_or(&empty);

    before
        .keys()
        .chain(after.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|key| before.get(*key) != after.get(*key))
        .cloned()
        .collect()
}

/// Snapshots kept in the document store itself. A head record per target key
/// tracks the latest snapshot and a version counter.
pub struct StoreSnapshots {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl StoreSnapshots {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn get(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        self.store
            .find_by_id(SNAPSHOTS, snapshot_id)?
            .map(|value| {
                serde_json::from_value(value).map_err(|source| StoreError::Codec {
                    collection: SNAPSHOTS.to_string(),
                    source,
                })
            })
            .transpose()
    }

    /// All snapshots of one target, oldest first.
    pub fn history(&self, target_key: &TargetKey) -> Result<Vec<SnapshotRecord>, StoreError> {
        let mut records = self
            .store
            .find_by_field(SNAPSHOTS, "target_key", target_key.as_str())?
            .into_iter()
            .map(|value| {
                serde_json::from_value::<SnapshotRecord>(value).map_err(|source| {
                    StoreError::Codec {
                        collection: SNAPSHOTS.to_string(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| r.version);
        Ok(records)
    }
}

impl SnapshotCapture for StoreSnapshots {
    fn capture(
        &self,
        identity: &Target,
        content: SnapshotContent,
        mut meta: SnapshotMeta,
        ctx: &Context,
    ) -> Result<SnapshotRef, StoreError> {
        let ctx = ctx.normalized();
        let target_key = build_target_key(identity, &ctx);
        let snapshot_id = new_record_id("snap_");

        // the head moves first so the version and predecessor are claimed atomically
        let head = self.store.find_one_and_update(
            SNAPSHOT_HEADS,
            target_key.as_str(),
            &Update::new()
                .set("head", json!(snapshot_id))
                .set("target_key", json!(target_key))
                .inc("version", 1),
            FindOptions { upsert: true },
        )?;
        let (prev_snapshot_id, version) = match &head {
            UpdateOutcome::Updated { before, after } => (
                before
                    .as_ref()
                    .and_then(|b| b.get("head"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                after.get("version").and_then(Value::as_u64).unwrap_or(1),
            ),
            _ => (None, 1),
        };

        if meta.changed_fields.is_empty() {
            meta.changed_fields = changed_fields(&content.before, &content.after);
        }
        let encoded = serde_json::to_vec(&content).map_err(|source| StoreError::Codec {
            collection: SNAPSHOTS.to_string(),
            source,
        })?;
        let record = SnapshotRecord {
            id: snapshot_id.clone(),
            target_key,
            identity: identity.clone(),
            content_hash: sha256::digest(&encoded),
            content,
            meta,
            version,
            prev_snapshot_id: prev_snapshot_id.clone(),
            created_at: self.clock.now(),
            context: ctx,
        };
        let value = serde_json::to_value(&record).map_err(|source| StoreError::Codec {
            collection: SNAPSHOTS.to_string(),
            source,
        })?;
        self.store.insert(SNAPSHOTS, value)?;

        tracing::debug!(snapshot_id = %snapshot_id, version, "snapshot captured");
        Ok(SnapshotRef {
            snapshot_id,
            prev_snapshot_id,
        })
    }

    fn identity(&self, snapshot_id: &str) -> Result<Option<Target>, StoreError> {
        Ok(self.get(snapshot_id)?.map(|record| record.identity))
    }
}
