//! Per-scope document numbering
use super::context::Context;
use super::error::StoreError;
use super::store::{DocumentStore, FindOptions, Update};
use super::target::NULL_COMPONENT;
use serde_json::Value;

pub const SEQUENCES: &str = "doc_sequences";

fn scope_key(key: &str, ctx: &Context) -> String {
    let part = |v: &Option<String>| v.clone().unwrap_or_else(|| NULL_COMPONENT.to_string());
    format!(
        "{key}|{}|{}|{}",
        part(&ctx.tenant_id),
        part(&ctx.period_id),
        part(&ctx.facility_id)
    )
}

/// Next number for `key` within the tenant/period/facility of `ctx`, starting
/// at 1. Read-and-increment happens in one atomic upsert, so concurrent
/// callers never share a number.
pub fn next_doc_no(store: &dyn DocumentStore, key: &str, ctx: &Context) -> Result<u64, StoreError> {
    let id = scope_key(key, &ctx.normalized());
    let outcome = store.find_one_and_update(
        SEQUENCES,
        &id,
        &Update::new().inc("seq", 1),
        FindOptions { upsert: true },
    )?;

    outcome
        .after()
        .and_then(|doc| doc.get("seq"))
        .and_then(Value::as_u64)
        .ok_or(StoreError::Corrupt {
            collection: SEQUENCES.to_string(),
            id,
            reason: "sequence counter missing after increment".to_string(),
        })
}

/// `format_doc_no("SO-", 42, 5)` gives `SO-00042`.
pub fn format_doc_no(prefix: &str, seq: u64, width: usize) -> String {
    format!("{prefix}{seq:0width$}")
}
