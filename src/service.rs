//! Service layer API for document state transitions
use super::config::EngineConfig;
use super::context::{Context, RequestMeta};
use super::error::{BestEffort, ConfigError, DegradedStep, TrailError};
use super::graph::{INITIAL_STATE, StateGraph, fold_name};
use super::policy::{ActionDescriptor, Policy};
use super::snapshot::{SnapshotCapture, SnapshotContent, SnapshotMeta, SnapshotRef, StoreSnapshots};
use super::store::{Document, DocumentStore, FindOptions, Update, UpdateOutcome};
use super::target::{Target, TargetKey, build_target_key};
use super::trail::{AuditEntry, AuditResult, EventEntry, EventRefs, TrailWriter};
use super::utils::{Clock, SystemClock};
use super::webhook::{DispatchReport, WebhookDispatcher};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const TRANSITION_CODE: &str = "DOC.STATE.TRANSITION";
pub const DOC_WORKFLOW: &str = "doc_workflow";

/// Stable reasons a transition was refused. Callers map these to messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    DocNotFound,
    TransitionNotAllowed,
    TransitionMapMissing,
    Forbidden,
    StateConflict,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::DocNotFound => "doc_not_found",
            RejectCode::TransitionNotAllowed => "transition_not_allowed",
            RejectCode::TransitionMapMissing => "transition_map_missing",
            RejectCode::Forbidden => "forbidden",
            RejectCode::StateConflict => "state_conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RejectCode>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// Best-effort steps that did not complete
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<DegradedStep>,
}

impl TransitionResult {
    fn rejected(error: RejectCode, from: Option<String>, action: &str) -> Self {
        Self {
            ok: false,
            from,
            to: None,
            error: Some(error),
            action: action.to_string(),
            log_id: None,
            event_id: None,
            snapshot_id: None,
            degraded: vec![],
        }
    }

    pub fn error_code(&self) -> Option<&'static str> {
        self.error.as_ref().map(RejectCode::as_str)
    }
}

pub struct TransitionService {
    store: Arc<dyn DocumentStore>,
    graph: StateGraph,
    trail: TrailWriter,
    clock: Arc<dyn Clock>,
    snapshots: Option<Arc<dyn SnapshotCapture>>,
    policy: Option<Arc<dyn Policy>>,
    webhooks: Option<WebhookDispatcher>,
    collections: BTreeMap<String, String>,
    module: Option<String>,
    audit_rejections: bool,
    detached_webhooks: bool,
}

impl TransitionService {
    pub fn new(store: Arc<dyn DocumentStore>, graph: StateGraph) -> Self {
        Self {
            trail: TrailWriter::new(store.clone()),
            store,
            graph,
            clock: Arc::new(SystemClock),
            snapshots: None,
            policy: None,
            webhooks: None,
            collections: BTreeMap::new(),
            module: None,
            audit_rejections: false,
            detached_webhooks: true,
        }
    }

    /// Wires snapshots, role policy and webhooks as the configuration asks.
    pub fn from_config(config: &EngineConfig, store: Arc<dyn DocumentStore>) -> Result<Self, ConfigError> {
        let mut service = Self::new(store.clone(), config.state_graph()?)
            .with_snapshots(Arc::new(StoreSnapshots::new(store.clone())))
            .with_module(config.trail.module.clone())
            .with_audit_rejections(config.trail.audit_rejections);
        for (doc_type, collection) in &config.collections {
            service = service.with_collection(doc_type, collection);
        }

        if let Some(policy) = config.roles_policy() {
            service = service.with_policy(Arc::new(policy));
        }
        if !config.webhooks.subscriptions.is_empty() {
            let dispatcher = WebhookDispatcher::new(
                config.webhooks.subscriptions.clone(),
                config.webhooks.settings(),
            )
            .with_job_store(store);
            service = service.with_webhooks(dispatcher, config.webhooks.detached);
        }
        Ok(service)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.trail = self.trail.with_clock(clock.clone());
        self.clock = clock;
        self
    }
    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotCapture>) -> Self {
        self.trail = self.trail.with_snapshots(snapshots.clone());
        self.snapshots = Some(snapshots);
        self
    }
    pub fn with_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }
    /// With `detached` set, every committed transition starts its own delivery
    /// thread. There is no pool or queue bound, so a burst of transitions
    /// against slow receivers means as many threads as transitions in flight.
    pub fn with_webhooks(mut self, dispatcher: WebhookDispatcher, detached: bool) -> Self {
        self.webhooks = Some(dispatcher);
        self.detached_webhooks = detached;
        self
    }
    pub fn with_module(mut self, module: Option<String>) -> Self {
        self.trail = self.trail.with_default_module(module.clone());
        self.module = module;
        self
    }
    pub fn with_audit_rejections(mut self, enabled: bool) -> Self {
        self.audit_rejections = enabled;
        self
    }
    pub fn with_collection(mut self, doc_type: &str, collection: &str) -> Self {
        self.collections
            .insert(fold_name(doc_type), collection.to_string());
        self
    }

    /// General purpose `log` and `emit_event` live on the trail writer.
    pub fn trail(&self) -> &TrailWriter {
        &self.trail
    }

    pub fn graph(&self) -> &StateGraph {
        &self.graph
    }

    pub fn collection_for<'a>(&'a self, doc_type: &'a str) -> &'a str {
        self.collections
            .get(&fold_name(doc_type))
            .map(String::as_str)
            .unwrap_or(doc_type)
    }

    fn load(&self, collection: &str, doc_id: &str) -> Result<Option<Document>, TrailError> {
        self.store
            .find_by_id(collection, doc_id)?
            .map(|value| {
                Document::from_stored(doc_id, value).map_err(|source| TrailError::Malformed {
                    collection: collection.to_string(),
                    source,
                })
            })
            .transpose()
    }

    fn target_for(&self, doc_type: &str, doc_id: &str, doc: &Document, status: &str) -> Target {
        let field = |name: &str| doc.field_str(name).map(str::to_string);
        Target {
            module: self.module.clone(),
            doc_type: Some(doc_type.to_string()),
            doc_id: Some(doc_id.to_string()),
            doc_no: field("doc_no"),
            doc_date: field("doc_date"),
            doc_title: field("doc_title").or_else(|| field("title")),
            status: Some(status.to_string()),
        }
    }

    /// Actions the graph allows from the document's current state.
    pub fn available_actions(&self, doc_type: &str, doc_id: &str) -> Result<Option<Vec<String>>, TrailError> {
        let collection = self.collection_for(doc_type);
        Ok(self.load(collection, doc_id)?.map(|doc| {
            self.graph
                .actions_from(doc_type, doc.state())
                .into_iter()
                .map(str::to_string)
                .collect()
        }))
    }

    /// Blocking delivery to subscribers of `event_key`. Failures stay inside
    /// the report.
    pub fn dispatch_webhooks(&self, event_key: &str, payload: &Value, ctx: &Context) -> DispatchReport {
        match &self.webhooks {
            Some(dispatcher) => dispatcher.dispatch(event_key, payload, ctx),
            None => DispatchReport::default(),
        }
    }

    pub fn transition(
        &self,
        doc_type: &str,
        doc_id: &str,
        action: &str,
        payload: Value,
        ctx: &Context,
    ) -> Result<TransitionResult, TrailError> {
        self.transition_with_meta(doc_type, doc_id, action, payload, ctx, RequestMeta::default())
    }

    fn reject(
        &self,
        ctx: &Context,
        target: Target,
        meta: &RequestMeta,
        code: RejectCode,
        from: &str,
        action: &str,
    ) -> Result<TransitionResult, TrailError> {
        tracing::info!(error = code.as_str(), from, action, "transition rejected");
        if self.audit_rejections {
            self.trail.write_audit(
                ctx,
                AuditEntry::new(TRANSITION_CODE)
                    .set_result(AuditResult::Deny)
                    .set_payload(json!({ "error": code, "from": from, "action": action }))
                    .set_target(target)
                    .set_meta(meta.clone()),
            )?;
        }
        Ok(TransitionResult::rejected(code, Some(from.to_string()), action))
    }

    /// Load, check the graph, authorise, apply, then write the trail. Only the
    /// load, the state write and the audit record can fail the call; snapshot,
    /// event, workflow status and webhooks degrade silently.
    #[tracing::instrument(skip(self, payload, ctx, meta))]
    pub fn transition_with_meta(
        &self,
        doc_type: &str,
        doc_id: &str,
        action: &str,
        payload: Value,
        ctx: &Context,
        mut meta: RequestMeta,
    ) -> Result<TransitionResult, TrailError> {
        let ctx = ctx.normalized();
        let collection = self.collection_for(doc_type);
        meta.ensure_request_id();

        let Some(doc) = self.load(collection, doc_id)? else {
            tracing::info!("document not found");
            return Ok(TransitionResult::rejected(RejectCode::DocNotFound, None, action));
        };
        let from = doc.state().to_string();

        if !self.graph.can_transition(doc_type, &from, action) {
            let target = self.target_for(doc_type, doc_id, &doc, &from);
            return self.reject(&ctx, target, &meta, RejectCode::TransitionNotAllowed, &from, action);
        }
        let Some(to) = self.graph.next_state(doc_type, &from, action).map(str::to_string) else {
            tracing::error!(from = %from, "state graph allows the action but has no next state");
            return Ok(TransitionResult::rejected(
                RejectCode::TransitionMapMissing,
                Some(from),
                action,
            ));
        };

        if let Some(policy) = &self.policy {
            let descriptor = ActionDescriptor::transition(doc_type, doc_id, &from, &to);
            if !policy.allow(&ctx, &descriptor, &doc) {
                let target = self.target_for(doc_type, doc_id, &doc, &from);
                return self.reject(&ctx, target, &meta, RejectCode::Forbidden, &from, action);
            }
        }

        // compare-and-swap on the state we validated against
        let update = Update::new()
            .guard("state", json!(from), from == INITIAL_STATE)
            .set("state", json!(to))
            .set("state_updated_at", json!(self.clock.now().timestamp_millis()))
            .inc("version", 1);
        match self.store.update_by_id(collection, doc_id, &update)? {
            UpdateOutcome::Updated { .. } => {}
            UpdateOutcome::Missing => {
                return Ok(TransitionResult::rejected(RejectCode::DocNotFound, None, action));
            }
            UpdateOutcome::GuardMismatch { current } => {
                let current_state = current.get("state").cloned().unwrap_or_default();
                tracing::warn!(from = %from, current = %current_state, "state moved underneath transition");
                let target = self.target_for(doc_type, doc_id, &doc, &from);
                return self.reject(&ctx, target, &meta, RejectCode::StateConflict, &from, action);
            }
        }

        let target = self.target_for(doc_type, doc_id, &doc, &to);
        let target_key = build_target_key(&target, &ctx);
        let audit = self.trail.write_audit(
            &ctx,
            AuditEntry::new(TRANSITION_CODE)
                .set_payload(json!({ "from": from, "to": to, "action": action, "payload": payload }))
                .set_target(target.clone())
                .set_meta(meta.clone()),
        )?;

        let mut degraded = vec![];

        let snapshot = match &self.snapshots {
            Some(snapshots) => BestEffort::from_result(
                DegradedStep::Snapshot,
                snapshots.capture(
                    &target,
                    SnapshotContent {
                        before: json!({ "state": from, "doc": serde_json::to_value(&doc).unwrap_or_default() }),
                        after: json!({ "state": to }),
                        payload: payload.clone(),
                    },
                    SnapshotMeta {
                        reason: TRANSITION_CODE.to_string(),
                        changed_fields: vec!["state".to_string()],
                        from: Some(from.clone()),
                        to: Some(to.clone()),
                        action: Some(action.to_string()),
                    },
                    &ctx,
                ),
            ),
            None => BestEffort::Degraded {
                step: DegradedStep::Snapshot,
                reason: "no snapshot capture configured".to_string(),
            },
        };
        degraded.extend(snapshot.degraded_step());
        let snapshot = snapshot.ok();

        let event = BestEffort::from_result(
            DegradedStep::Event,
            self.trail.emit_event(
                EventEntry::new(TRANSITION_CODE, target)
                    .set_summary(json!({ "action": action, "from": from, "to": to }))
                    .set_payload(payload)
                    .set_refs(EventRefs {
                        log_id: Some(audit.id.clone()),
                        snapshot_id: snapshot.as_ref().map(|s| s.snapshot_id.clone()),
                        prev_snapshot_id: snapshot.as_ref().and_then(|s| s.prev_snapshot_id.clone()),
                        request_id: meta.request_id.clone(),
                    }),
                &ctx,
            ),
        );
        degraded.extend(event.degraded_step());
        let event_id = event.ok().map(|e| e.event_id);

        let workflow = BestEffort::from_result(
            DegradedStep::Workflow,
            self.record_workflow_status(&target_key, doc_type, doc_id, &to, action, &audit.id),
        );
        degraded.extend(workflow.degraded_step());

        if let Some(dispatcher) = &self.webhooks {
            let notice = json!({
                "doc_type": doc_type,
                "doc_id": doc_id,
                "action": action,
                "from": from,
                "to": to,
                "log_id": audit.id,
                "event_id": event_id,
                "target_key": target_key,
            });
            if self.detached_webhooks {
                // the handle is dropped on purpose, delivery outcome is not awaited
                let _ = dispatcher.spawn_dispatch(TRANSITION_CODE, notice, &ctx);
            } else if dispatcher
                .dispatch(TRANSITION_CODE, &notice, &ctx)
                .attempts
                .iter()
                .any(|a| a.error.is_some())
            {
                degraded.push(DegradedStep::Webhook);
            }
        }

        tracing::info!(from = %from, to = %to, log_id = %audit.id, target_key = %target_key, "transition applied");
        Ok(TransitionResult {
            ok: true,
            from: Some(from),
            to: Some(to),
            error: None,
            action: action.to_string(),
            log_id: Some(audit.id),
            event_id,
            snapshot_id: snapshot.map(|SnapshotRef { snapshot_id, .. }| snapshot_id),
            degraded,
        })
    }

    // status record other modules can look up by the same target key
    fn record_workflow_status(
        &self,
        target_key: &TargetKey,
        doc_type: &str,
        doc_id: &str,
        state: &str,
        action: &str,
        log_id: &str,
    ) -> Result<(), TrailError> {
        let update = Update::new()
            .set("target_key", json!(target_key))
            .set("doc_type", json!(doc_type))
            .set("doc_id", json!(doc_id))
            .set("state", json!(state))
            .set("last_action", json!(action))
            .set("last_log_id", json!(log_id))
            .set("updated_at", json!(self.clock.now().timestamp_millis()))
            .inc("transitions", 1);
        self.store.find_one_and_update(
            DOC_WORKFLOW,
            target_key.as_str(),
            &update,
            FindOptions { upsert: true },
        )?;
        Ok(())
    }
}
