//! What a trail record is about, and the key that correlates every record
//! written for it
use super::context::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const NULL_COMPONENT: &str = "null";

/// The business document an action touched. Only these fields are ever
/// persisted; anything else a caller supplies is dropped on normalisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub doc_no: Option<String>,
    #[serde(default)]
    pub doc_date: Option<String>,
    #[serde(default)]
    pub doc_title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

// strings pass through, numbers are rendered, everything else counts as absent
fn scalar(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Target {
    pub fn new(module: &str, doc_type: &str, doc_id: &str) -> Self {
        Self {
            module: Some(module.to_string()),
            doc_type: Some(doc_type.to_string()),
            doc_id: Some(doc_id.to_string()),
            ..Self::default()
        }
    }
    pub fn set_doc_no(mut self, doc_no: &str) -> Self {
        self.doc_no = Some(doc_no.to_string());
        self
    }
    pub fn set_doc_title(mut self, doc_title: &str) -> Self {
        self.doc_title = Some(doc_title.to_string());
        self
    }
    pub fn set_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    /// Builds a target from a loosely shaped JSON object.
    pub fn from_value(value: &Value) -> Self {
        let field = |name: &str| scalar(value.get(name));
        Self {
            module: field("module"),
            doc_type: field("doc_type"),
            doc_id: field("doc_id"),
            doc_no: field("doc_no"),
            doc_date: field("doc_date"),
            doc_title: field("doc_title"),
            status: field("status"),
        }
    }

    /// Back-fills doc_no, doc_title and status from an event summary. Never
    /// overwrites a value the caller already set.
    pub fn enrich_from_summary(&mut self, summary: &Value) {
        if self.doc_no.is_none() {
            self.doc_no = scalar(summary.get("doc_no"));
        }
        if self.doc_title.is_none() {
            self.doc_title =
                scalar(summary.get("doc_title")).or_else(|| scalar(summary.get("title")));
        }
        if self.status.is_none() {
            self.status = scalar(summary.get("status")).or_else(|| scalar(summary.get("to")));
        }
    }

    /// Back-fills from another target, typically the identity stored on a snapshot.
    pub fn enrich_from(&mut self, other: &Target) {
        let fill = |mine: &mut Option<String>, theirs: &Option<String>| {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        };
        fill(&mut self.module, &other.module);
        fill(&mut self.doc_type, &other.doc_type);
        fill(&mut self.doc_id, &other.doc_id);
        fill(&mut self.doc_no, &other.doc_no);
        fill(&mut self.doc_date, &other.doc_date);
        fill(&mut self.doc_title, &other.doc_title);
        fill(&mut self.status, &other.status);
    }

    pub fn is_missing_display_fields(&self) -> bool {
        self.doc_no.is_none() || self.doc_title.is_none() || self.status.is_none()
    }
}

/// `module|doc_type|doc_id|tenant_id|period_id|facility_id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetKey(String);

impl TargetKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn component(value: &Option<String>) -> &str {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => NULL_COMPONENT,
    }
}

/// The one place a target key is derived. Audit, event, snapshot and workflow
/// records all call this so their keys agree.
pub fn build_target_key(target: &Target, ctx: &Context) -> TargetKey {
    let parts = [
        component(&target.module),
        component(&target.doc_type),
        component(&target.doc_id),
        component(&ctx.tenant_id),
        component(&ctx.period_id),
        component(&ctx.facility_id),
    ];
    TargetKey(parts.join("|"))
}
