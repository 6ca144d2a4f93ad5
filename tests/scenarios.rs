use anyhow::Context as _;
use doc_trail::{
    Context, DocumentStore, RejectCode, SledStore, TransitionService,
    error::DegradedStep,
    graph::StateGraph,
    policy::RequiredRolesPolicy,
    service::{DOC_WORKFLOW, TRANSITION_CODE},
    snapshot::StoreSnapshots,
    store::Document,
    trail::{AUDIT_LOGS, AuditEntry, AuditResult},
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use tempfile::tempdir; // Use for test db cleanup.

// Sled locks its directory, so every test opens its own database under a
// temp dir that is removed when the guard drops.
fn open_store(dir: &tempfile::TempDir, name: &str) -> anyhow::Result<Arc<SledStore>> {
    Ok(Arc::new(SledStore::open(dir.path().join(name))?))
}

fn full_service(store: &Arc<SledStore>) -> TransitionService {
    TransitionService::new(store.clone(), StateGraph::default())
        .with_snapshots(Arc::new(StoreSnapshots::new(store.clone())))
        .with_module(Some("sales".to_string()))
}

fn clerk() -> Context {
    Context::new()
        .set_user("u-1", "alice")
        .set_tenant("t1")
        .set_period("2026")
        .set_role("clerk")
}

fn load(store: &SledStore, collection: &str, id: &str) -> anyhow::Result<Document> {
    let value = store
        .find_by_id(collection, id)?
        .context("document should exist")?;
    Ok(Document::from_value(value)?)
}

/// Test the whole happy path from draft to locked, and that every step leaves
/// an audit record, a timeline event and a chained snapshot behind
#[test]
fn sales_order_runs_through_its_lifecycle() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "lifecycle.db")?;
    let service = full_service(&store);
    let ctx = clerk();

    let id = store.insert(
        "sales_order",
        json!({"doc_no": "SO-00001", "customer": "Acme"}),
    )?;

    let steps = [
        ("save", "draft", "saved"),
        ("submit", "saved", "waiting_approval"),
        ("approve", "waiting_approval", "approved"),
        ("lock", "approved", "locked"),
    ];
    let mut results = vec![];
    for (action, from, to) in steps {
        let result = service
            .transition("sales_order", &id, action, json!({"note": action}), &ctx)
            .with_context(|| format!("transition '{action}' failed"))?;

        assert!(result.ok, "{action} should be applied");
        assert_eq!(result.from.as_deref(), Some(from));
        assert_eq!(result.to.as_deref(), Some(to));
        assert!(result.degraded.is_empty());
        assert!(result.log_id.is_some());
        assert!(result.event_id.is_some());
        assert!(result.snapshot_id.is_some());
        results.push(result);
    }

    let doc = load(&store, "sales_order", &id)?;
    assert_eq!(doc.state(), "locked");
    assert_eq!(doc.version, 4);
    assert!(doc.fields.contains_key("state_updated_at"));

    // audit record carries the transition and the actor
    let log_id = results[0].log_id.as_deref().context("log id")?;
    let audit = service
        .trail()
        .audit_record(log_id)?
        .context("audit record should exist")?;
    assert_eq!(audit.action_code, TRANSITION_CODE);
    assert_eq!(audit.result, AuditResult::Success);
    assert_eq!(audit.payload["from"], "draft");
    assert_eq!(audit.payload["to"], "saved");
    assert_eq!(audit.payload["action"], "save");
    assert_eq!(audit.context.username.as_deref(), Some("alice"));
    assert_eq!(audit.target.doc_no.as_deref(), Some("SO-00001"));
    assert!(audit.meta.request_id.is_some());

    // every event points back at its audit record and snapshot
    let first_event_id = results[0].event_id.as_deref().context("event id")?;
    let first_event = service
        .trail()
        .event_record(first_event_id)?
        .context("event should exist")?;
    assert_eq!(
        first_event.target_key.as_str(),
        format!("sales|sales_order|{id}|t1|2026|null")
    );
    assert_eq!(first_event.refs.request_id, audit.meta.request_id);

    let timeline = service.trail().timeline(&first_event.target_key)?;
    assert_eq!(timeline.len(), 4);
    for (event, result) in timeline.iter().zip(&results) {
        assert_eq!(event.event_code, TRANSITION_CODE);
        assert_eq!(event.refs.log_id, result.log_id);
        assert_eq!(event.refs.snapshot_id, result.snapshot_id);
        assert_eq!(event.data.summary["to"], json!(result.to));
    }
    assert_eq!(timeline[0].refs.prev_snapshot_id, None);
    assert_eq!(timeline[1].refs.prev_snapshot_id, results[0].snapshot_id);
    assert_eq!(timeline[3].target.status.as_deref(), Some("locked"));

    // one workflow status record per target key
    let workflow = store
        .find_by_id(DOC_WORKFLOW, first_event.target_key.as_str())?
        .context("workflow status should exist")?;
    assert_eq!(workflow["state"], "locked");
    assert_eq!(workflow["transitions"], 4);
    assert_eq!(workflow["last_action"], "lock");

    Ok(())
}

/// Test that snapshots of one document form a chain with increasing versions
#[test]
fn snapshots_chain_per_document() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "snapshots.db")?;
    let snapshots = StoreSnapshots::new(store.clone());
    let service = full_service(&store);
    let ctx = clerk();

    let id = store.insert("sales_order", json!({"customer": "Acme"}))?;
    let saved = service.transition("sales_order", &id, "save", json!({}), &ctx)?;
    let submitted = service.transition("sales_order", &id, "submit", json!({}), &ctx)?;

    let event_id = submitted.event_id.as_deref().context("event id")?;
    let event = service.trail().event_record(event_id)?.context("event")?;
    let history = snapshots.history(&event.target_key)?;

    assert_eq!(history.len(), 2);
    assert_eq!(history[0].version, 1);
    assert_eq!(history[1].version, 2);
    assert_eq!(Some(&history[0].id), saved.snapshot_id.as_ref());
    assert_eq!(history[1].prev_snapshot_id.as_ref(), Some(&history[0].id));
    assert_eq!(history[1].content.before["state"], "saved");
    assert_eq!(history[1].content.after["state"], "waiting_approval");
    assert_eq!(history[1].meta.action.as_deref(), Some("submit"));
    assert_eq!(history[1].content_hash.len(), 64);

    Ok(())
}

/// Test that saving an already saved document is refused without touching it
#[test]
fn double_save_is_not_allowed() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "double_save.db")?;
    let service = full_service(&store);
    let ctx = clerk();

    let id = store.insert("sales_order", json!({"customer": "Acme"}))?;
    let first = service.transition("sales_order", &id, "save", json!({}), &ctx)?;
    assert!(first.ok);

    let second = service.transition("sales_order", &id, "save", json!({}), &ctx)?;
    assert!(!second.ok);
    assert_eq!(second.error, Some(RejectCode::TransitionNotAllowed));
    assert_eq!(second.error_code(), Some("transition_not_allowed"));
    assert_eq!(second.from.as_deref(), Some("saved"));
    assert!(second.log_id.is_none());

    let doc = load(&store, "sales_order", &id)?;
    assert_eq!(doc.state(), "saved");
    assert_eq!(doc.version, 1);

    // rejections are not audited by default
    let audits = store.find_by_field(AUDIT_LOGS, "action_code", TRANSITION_CODE)?;
    assert_eq!(audits.len(), 1);

    Ok(())
}

/// Test that a missing document is reported as such
#[test]
fn unknown_document_is_not_found() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "not_found.db")?;
    let service = full_service(&store);

    let result = service.transition("sales_order", "nope", "save", json!({}), &clerk())?;

    assert!(!result.ok);
    assert_eq!(result.error_code(), Some("doc_not_found"));
    assert_eq!(result.from, None);
    assert_eq!(service.available_actions("sales_order", "nope")?, None);

    Ok(())
}

/// Test that the role policy blocks approval and, when asked, audits the denial
#[test]
fn approval_requires_manager_role() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "forbidden.db")?;
    let service = full_service(&store)
        .with_policy(Arc::new(
            RequiredRolesPolicy::default().require("approved", &["manager"]),
        ))
        .with_audit_rejections(true);

    let id = store.insert("sales_order", json!({"state": "waiting_approval"}))?;

    let denied = service.transition("sales_order", &id, "approve", json!({}), &clerk())?;
    assert!(!denied.ok);
    assert_eq!(denied.error, Some(RejectCode::Forbidden));
    assert_eq!(load(&store, "sales_order", &id)?.state(), "waiting_approval");

    let audits = store.find_by_field(AUDIT_LOGS, "result", "deny")?;
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0]["payload"]["error"], "forbidden");

    let manager = clerk().set_role("manager");
    let approved = service.transition("sales_order", &id, "approve", json!({}), &manager)?;
    assert!(approved.ok);
    assert_eq!(approved.to.as_deref(), Some("approved"));

    Ok(())
}

/// Test that a cancelled document has nowhere left to go
#[test]
fn cancelled_is_terminal() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "cancelled.db")?;
    let service = full_service(&store);
    let ctx = clerk();

    let id = store.insert("sales_order", json!({}))?;
    assert_eq!(
        service.available_actions("sales_order", &id)?,
        Some(vec!["cancel".to_string(), "save".to_string()])
    );

    let result = service.transition("sales_order", &id, "cancel", json!({"reason": "dup"}), &ctx)?;
    assert!(result.ok);
    assert_eq!(service.available_actions("sales_order", &id)?, Some(vec![]));

    for action in ["save", "unlock", "approve"] {
        let result = service.transition("sales_order", &id, action, json!({}), &ctx)?;
        assert_eq!(result.error, Some(RejectCode::TransitionNotAllowed));
    }

    Ok(())
}

/// Test that a doc type with its own graph and collection uses both
#[test]
fn custom_graph_and_collection() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "custom_graph.db")?;

    let mut stock_move = BTreeMap::new();
    stock_move.insert(
        "draft".to_string(),
        BTreeMap::from([("post".to_string(), "posted".to_string())]),
    );
    let graph = StateGraph::new(BTreeMap::from([("stock_move".to_string(), stock_move)]))?;
    let service = TransitionService::new(store.clone(), graph).with_collection("stock_move", "stock_moves");

    let id = store.insert("stock_moves", json!({"qty": 5}))?;

    let save = service.transition("stock_move", &id, "save", json!({}), &clerk())?;
    assert_eq!(save.error, Some(RejectCode::TransitionNotAllowed));

    let post = service.transition("stock_move", &id, "post", json!({}), &clerk())?;
    assert!(post.ok);
    assert_eq!(post.to.as_deref(), Some("posted"));
    // no snapshot capture configured
    assert_eq!(post.degraded, vec![DegradedStep::Snapshot]);
    assert_eq!(load(&store, "stock_moves", &id)?.state(), "posted");

    Ok(())
}

/// Test the general purpose log entry point: audit first, then an event that
/// links back to it and uses the caller's summary
#[test]
fn log_writes_audit_and_linked_event() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "log.db")?;
    let service = full_service(&store);
    let ctx = clerk();

    let target = doc_trail::Target::new("sales", "sales_order", "so-9").set_doc_no("SO-00009");
    let outcome = service.trail().log_detailed(
        &ctx,
        AuditEntry::new("DOC.PRINT")
            .set_target(target.clone())
            .set_payload(json!({"copies": 2, "summary": {"printed": true}})),
    )?;

    let audit = service
        .trail()
        .audit_record(&outcome.log_id)?
        .context("audit record")?;
    assert_eq!(audit.action_code, "DOC.PRINT");
    assert_eq!(audit.payload["copies"], 2);

    let emitted = outcome.event.ok().context("event should be written")?;
    assert_eq!(emitted.target_key, doc_trail::build_target_key(&target, &ctx));

    let event = service
        .trail()
        .event_record(&emitted.event_id)?
        .context("event")?;
    assert_eq!(event.refs.log_id.as_deref(), Some(outcome.log_id.as_str()));
    assert_eq!(event.data.summary, json!({"printed": true}));
    assert_eq!(event.target.doc_no.as_deref(), Some("SO-00009"));

    Ok(())
}

/// Test that a stored audit record reads back with the normalized context and
/// target, every key present even when empty
#[test]
fn audit_record_round_trips_normalized() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "round_trip.db")?;
    let service = full_service(&store);

    let ctx = Context {
        username: Some("  bob ".to_string()),
        tenant_id: Some(String::new()),
        period_id: Some("2026".to_string()),
        ..Context::default()
    };
    let target = doc_trail::Target::from_value(&json!({
        "doc_type": "sales_order",
        "doc_id": "so-7",
        "doc_no": 7,
        "colour": "blue",
    }));

    let log_id = service
        .trail()
        .log(&ctx, AuditEntry::new("DOC.VIEW").set_target(target))?;
    let audit = service.trail().audit_record(&log_id)?.context("audit record")?;

    assert_eq!(audit.context, ctx.normalized());
    assert_eq!(audit.context.username.as_deref(), Some("bob"));
    assert_eq!(audit.context.tenant_id, None);
    assert_eq!(audit.target.module.as_deref(), Some("sales"));
    assert_eq!(audit.target.doc_no.as_deref(), Some("7"));

    let raw = store.find_by_id(AUDIT_LOGS, &log_id)?.context("raw record")?;
    let context = raw["context"].as_object().context("context object")?;
    let target = raw["target"].as_object().context("target object")?;
    assert_eq!(context.len(), 7);
    assert!(context["tenant_id"].is_null());
    assert_eq!(target.len(), 7);
    assert!(target.get("colour").is_none());
    assert!(target["doc_title"].is_null());

    Ok(())
}

/// Test that records written in the same millisecond still come back in the
/// order they were written
#[test]
fn timeline_orders_equal_timestamps_by_id() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "fixed_clock.db")?;
    let at = 1_760_000_000_000;
    let service = full_service(&store).with_clock(Arc::new(doc_trail::utils::FixedClock::at_millis(at)));
    let ctx = clerk();

    let id = store.insert("sales_order", json!({}))?;
    let mut log_ids = vec![];
    for action in ["save", "submit", "reject", "submit"] {
        let result = service.transition("sales_order", &id, action, json!({}), &ctx)?;
        assert!(result.ok, "{action} should be applied");
        log_ids.push(result.log_id);
    }

    assert_eq!(load(&store, "sales_order", &id)?.fields["state_updated_at"], at);

    let log_id = log_ids[0].as_deref().context("log id")?;
    let audit = service.trail().audit_record(log_id)?.context("audit record")?;
    assert_eq!(audit.created_at.timestamp_millis(), at);

    let key = doc_trail::build_target_key(
        &doc_trail::Target::new("sales", "sales_order", &id),
        &ctx,
    );
    let timeline = service.trail().timeline(&key)?;
    let order: Vec<_> = timeline.iter().map(|e| e.refs.log_id.clone()).collect();
    assert_eq!(order, log_ids);
    assert_eq!(timeline[2].data.summary["to"], "saved");

    Ok(())
}

/// Test that documents written by other tools with a null or text version
/// still transition, and the counter carries on from what was there
#[test]
fn loosely_typed_version_still_transitions() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "loose_version.db")?;
    let service = full_service(&store);
    let ctx = clerk();

    let nulled = store.insert("sales_order", json!({"version": null, "customer": "Acme"}))?;
    let result = service.transition("sales_order", &nulled, "save", json!({}), &ctx)?;
    assert!(result.ok, "{:?}", result.error);
    assert_eq!(load(&store, "sales_order", &nulled)?.version, 1);

    let texted = store.insert("sales_order", json!({"version": "3", "state": "saved"}))?;
    let result = service.transition("sales_order", &texted, "submit", json!({}), &ctx)?;
    assert!(result.ok, "{:?}", result.error);
    let doc = load(&store, "sales_order", &texted)?;
    assert_eq!(doc.state(), "waiting_approval");
    assert_eq!(doc.version, 4);

    Ok(())
}

/// Test that doc type names are matched regardless of case, for both the
/// collection mapping and the graph
#[test]
fn doc_type_names_ignore_case() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "doc_type_case.db")?;

    let mut purchase = BTreeMap::new();
    purchase.insert(
        "Draft".to_string(),
        BTreeMap::from([("Submit".to_string(), "Pending".to_string())]),
    );
    let graph = StateGraph::new(BTreeMap::from([("PurchaseOrder".to_string(), purchase)]))?;
    let service =
        TransitionService::new(store.clone(), graph).with_collection("PurchaseOrder", "purchase_orders");

    let id = store.insert("purchase_orders", json!({"supplier": "Initech"}))?;
    let result = service.transition("purchaseorder", &id, "SUBMIT", json!({}), &clerk())?;
    assert!(result.ok, "{:?}", result.error);
    assert_eq!(result.to.as_deref(), Some("pending"));
    assert_eq!(load(&store, "purchase_orders", &id)?.state(), "pending");

    Ok(())
}

/// Test that a caller's summary is used as-is even when it is not an object
#[test]
fn log_keeps_a_plain_text_summary() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let store = open_store(&temp_dir, "text_summary.db")?;
    let service = full_service(&store);

    let outcome = service.trail().log_detailed(
        &clerk(),
        AuditEntry::new("DOC.NOTE")
            .set_target(doc_trail::Target::new("sales", "sales_order", "so-3"))
            .set_payload(json!({"summary": "Customer called about delivery"})),
    )?;

    let emitted = outcome.event.ok().context("event should be written")?;
    let event = service
        .trail()
        .event_record(&emitted.event_id)?
        .context("event")?;
    assert_eq!(event.data.summary, json!("Customer called about delivery"));

    Ok(())
}
