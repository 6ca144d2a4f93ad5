//! Append-only audit and timeline records
//!
//! Every action writes one audit record (the compliance copy) and, where it
//! matters to a user, one timeline event pointing back at it through
//! `refs.log_id`. The audit write is the hard guarantee: if it fails the caller
//! hears about it. The event write is soft: a failure is logged and swallowed
//! and never touches the audit record that preceded it.
use super::context::{Context, RequestMeta};
use super::error::{BestEffort, DegradedStep, StoreError, TrailError};
use super::snapshot::SnapshotCapture;
use super::store::DocumentStore;
use super::target::{Target, TargetKey, build_target_key};
use super::utils::{Clock, SystemClock, new_record_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

pub const AUDIT_LOGS: &str = "audit_logs";
pub const DOC_EVENTS: &str = "doc_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Fail,
    Deny,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub action_code: String,
    pub result: AuditResult,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub context: Context,
    pub target: Target,
    pub meta: RequestMeta,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRefs {
    #[serde(default)]
    pub log_id: Option<String>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub prev_snapshot_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub summary: Value,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub event_code: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub context: Context,
    pub target: Target,
    pub target_key: TargetKey,
    pub refs: EventRefs,
    pub data: EventData,
}

/// Returned by `emit_event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventEmitted {
    pub ok: bool,
    pub event_id: String,
    pub target_key: TargetKey,
}

/// One audit write, assembled builder style.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub action_code: String,
    pub payload: Value,
    pub target: Option<Target>,
    pub result: AuditResult,
    pub meta: Option<RequestMeta>,
}

impl AuditEntry {
    pub fn new(action_code: &str) -> Self {
        Self {
            action_code: action_code.to_string(),
            payload: Value::Null,
            target: None,
            result: AuditResult::Success,
            meta: None,
        }
    }
    pub fn set_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
    pub fn set_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }
    pub fn set_result(mut self, result: AuditResult) -> Self {
        self.result = result;
        self
    }
    pub fn set_meta(mut self, meta: RequestMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

#[derive(Debug, Clone)]
pub struct EventEntry {
    pub event_code: String,
    pub summary: Option<Value>,
    pub payload: Value,
    pub target: Target,
    pub refs: EventRefs,
}

impl EventEntry {
    pub fn new(event_code: &str, target: Target) -> Self {
        Self {
            event_code: event_code.to_string(),
            summary: None,
            payload: Value::Null,
            target,
            refs: EventRefs::default(),
        }
    }
    pub fn set_summary(mut self, summary: Value) -> Self {
        self.summary = Some(summary);
        self
    }
    pub fn set_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
    pub fn set_refs(mut self, refs: EventRefs) -> Self {
        self.refs = refs;
        self
    }
}

/// What `log` wrote. The event half may have degraded.
#[derive(Debug)]
pub struct LogOutcome {
    pub log_id: String,
    pub event: BestEffort<EventEmitted>,
}

fn default_summary(action_code: &str, result: AuditResult, target: &Target) -> Value {
    json!({
        "action": action_code,
        "result": result,
        "doc_no": target.doc_no,
        "status": target.status,
    })
}

fn parse<T: serde::de::DeserializeOwned>(collection: &str, value: Value) -> Result<T, TrailError> {
    serde_json::from_value(value).map_err(|source| TrailError::Malformed {
        collection: collection.to_string(),
        source,
    })
}

pub struct TrailWriter {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    snapshots: Option<Arc<dyn SnapshotCapture>>,
    default_module: Option<String>,
}

impl TrailWriter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            snapshots: None,
            default_module: None,
        }
    }
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
    /// Lets events back-fill their target from the snapshot they reference.
    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotCapture>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }
    pub fn with_default_module(mut self, module: Option<String>) -> Self {
        self.default_module = module;
        self
    }

    fn normalize_target(&self, target: Option<Target>) -> Target {
        let mut target = target.unwrap_or_default();
        if target.module.is_none() {
            target.module.clone_from(&self.default_module);
        }
        target
    }

    /// Writes the audit record only. Used where the caller emits its own
    /// richer event afterwards.
    pub fn write_audit(&self, ctx: &Context, entry: AuditEntry) -> Result<AuditRecord, TrailError> {
        let mut meta = entry.meta.unwrap_or_default();
        meta.ensure_request_id();

        let record = AuditRecord {
            id: new_record_id("log_"),
            action_code: entry.action_code,
            result: entry.result,
            created_at: self.clock.now(),
            context: ctx.normalized(),
            target: self.normalize_target(entry.target),
            meta,
            payload: entry.payload,
        };

        let write = serde_json::to_value(&record)
            .map_err(|source| StoreError::Codec {
                collection: AUDIT_LOGS.to_string(),
                source,
            })
            .and_then(|value| self.store.insert(AUDIT_LOGS, value));
        if let Err(source) = write {
            tracing::error!(action_code = %record.action_code, error = %source, "audit write failed");
            return Err(TrailError::AuditWrite {
                action_code: record.action_code,
                source,
            });
        }

        tracing::debug!(log_id = %record.id, action_code = %record.action_code, "audit record written");
        Ok(record)
    }

    /// Audit record first, then a matching timeline event on a best-effort
    /// basis. A non-null `payload.summary` of any JSON type overrides the
    /// derived summary.
    pub fn log_detailed(&self, ctx: &Context, entry: AuditEntry) -> Result<LogOutcome, TrailError> {
        let record = self.write_audit(ctx, entry)?;

        let summary = match record.payload.get("summary") {
            Some(summary) if !summary.is_null() => summary.clone(),
            _ => default_summary(&record.action_code, record.result, &record.target),
        };
        let event = EventEntry::new(&record.action_code, record.target.clone())
            .set_summary(summary)
            .set_payload(record.payload.clone())
            .set_refs(EventRefs {
                log_id: Some(record.id.clone()),
                request_id: record.meta.request_id.clone(),
                ..EventRefs::default()
            });

        Ok(LogOutcome {
            log_id: record.id,
            event: BestEffort::from_result(DegradedStep::Event, self.emit_event(event, ctx)),
        })
    }

    /// General purpose audit entry point. Returns the audit log id whether or
    /// not the timeline event made it.
    pub fn log(&self, ctx: &Context, entry: AuditEntry) -> Result<String, TrailError> {
        Ok(self.log_detailed(ctx, entry)?.log_id)
    }

    // missing display fields come from the referenced snapshot, lookups that fail are ignored
    fn enrich_from_snapshot(&self, target: &mut Target, refs: &EventRefs) {
        let (Some(snapshots), Some(snapshot_id)) = (&self.snapshots, &refs.snapshot_id) else {
            return;
        };
        match snapshots.identity(snapshot_id) {
            Ok(Some(identity)) => target.enrich_from(&identity),
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(snapshot_id = %snapshot_id, error = %err, "snapshot identity lookup failed")
            }
        }
    }

    pub fn emit_event(&self, entry: EventEntry, ctx: &Context) -> Result<EventEmitted, TrailError> {
        let ctx = ctx.normalized();
        let summary = entry.summary.unwrap_or_else(|| json!({}));

        let mut target = self.normalize_target(Some(entry.target));
        target.enrich_from_summary(&summary);
        if target.is_missing_display_fields() {
            self.enrich_from_snapshot(&mut target, &entry.refs);
        }
        let target_key = build_target_key(&target, &ctx);

        let record = EventRecord {
            id: new_record_id("evt_"),
            event_code: entry.event_code,
            created_at: self.clock.now(),
            context: ctx,
            target,
            target_key: target_key.clone(),
            refs: entry.refs,
            data: EventData {
                summary,
                payload: entry.payload,
            },
        };
        let value = serde_json::to_value(&record).map_err(|source| StoreError::Codec {
            collection: DOC_EVENTS.to_string(),
            source,
        })?;
        let event_id = self.store.insert(DOC_EVENTS, value)?;

        tracing::debug!(event_id = %event_id, target_key = %target_key, "event emitted");
        Ok(EventEmitted {
            ok: true,
            event_id,
            target_key,
        })
    }

    pub fn audit_record(&self, log_id: &str) -> Result<Option<AuditRecord>, TrailError> {
        self.store
            .find_by_id(AUDIT_LOGS, log_id)?
            .map(|value| parse(AUDIT_LOGS, value))
            .transpose()
    }

    pub fn event_record(&self, event_id: &str) -> Result<Option<EventRecord>, TrailError> {
        self.store
            .find_by_id(DOC_EVENTS, event_id)?
            .map(|value| parse(DOC_EVENTS, value))
            .transpose()
    }

    /// Events for one target, oldest first.
    pub fn timeline(&self, target_key: &TargetKey) -> Result<Vec<EventRecord>, TrailError> {
        let mut events = self
            .store
            .find_by_field(DOC_EVENTS, "target_key", target_key.as_str())?
            .into_iter()
            .map(|value| parse::<EventRecord>(DOC_EVENTS, value))
            .collect::<Result<Vec<_>, _>>()?;
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }
}
