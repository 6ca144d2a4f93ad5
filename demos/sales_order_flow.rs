//! Walks one sales order from draft to locked and prints its timeline.
//!
//! cargo run --example sales_order_flow [config.toml]

use anyhow::Context as _;
use doc_trail::{
    Context, DocumentStore, SledStore, TransitionService,
    config::EngineConfig,
    numbering::{format_doc_no, next_doc_no},
    telemetry::init_tracing,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    init_tracing("info,doc_trail=debug", false)?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref())?;

    let store = Arc::new(SledStore::open(&config.store.path).context("Could not open store")?);
    let service = TransitionService::from_config(&config, store.clone())?;

    let ctx = Context::new()
        .set_user("u-100", "alice")
        .set_tenant("acme")
        .set_period("2026")
        .set_role("manager");

    let seq = next_doc_no(store.as_ref(), "sales_order", &ctx)?;
    let doc_no = format_doc_no("SO-", seq, 5);
    let collection = config.collection_for("sales_order");
    let id = store.insert(
        &collection,
        json!({"doc_no": doc_no, "doc_title": "Widgets for Acme", "customer": "Acme"}),
    )?;

    let mut last = None;
    for action in ["save", "submit", "approve", "lock"] {
        let result = service.transition("sales_order", &id, action, json!({}), &ctx)?;
        println!("{action:>8}: {}", serde_json::to_string(&result)?);
        if result.ok {
            last = result.event_id;
        }
    }

    let event_id = last.context("no transition was applied")?;
    let event = service
        .trail()
        .event_record(&event_id)?
        .context("event not found")?;

    println!("\ntimeline for {}", event.target_key);
    for entry in service.trail().timeline(&event.target_key)? {
        println!(
            "  {} {} {}",
            entry.created_at.to_rfc3339(),
            entry.event_code,
            entry.data.summary
        );
    }

    store.flush()?;
    Ok(())
}
