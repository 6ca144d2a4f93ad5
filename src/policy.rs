//! Authorization hook consulted before a transition is applied
use super::context::Context;
use super::graph::fold_name;
use super::store::Document;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub const TRANSITION_ACTION: &str = "doc.transition";

/// What the caller is trying to do, handed to the policy as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionDescriptor {
    pub action: String,
    pub doc_type: String,
    pub doc_id: String,
    pub from_state: String,
    pub to_state: String,
}

impl ActionDescriptor {
    pub fn transition(doc_type: &str, doc_id: &str, from_state: &str, to_state: &str) -> Self {
        Self {
            action: TRANSITION_ACTION.to_string(),
            doc_type: doc_type.to_string(),
            doc_id: doc_id.to_string(),
            from_state: from_state.to_string(),
            to_state: to_state.to_string(),
        }
    }
}

pub trait Policy: Send + Sync {
    fn allow(&self, ctx: &Context, action: &ActionDescriptor, doc: &Document) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Policy for AllowAll {
    fn allow(&self, _ctx: &Context, _action: &ActionDescriptor, _doc: &Document) -> bool {
        true
    }
}

/// Moving a document into one of the listed states needs one of the listed
/// roles. States without an entry are open to everyone.
#[derive(Debug, Default, Clone)]
pub struct RequiredRolesPolicy {
    required: BTreeMap<String, BTreeSet<String>>,
}

impl RequiredRolesPolicy {
    pub fn new(required: BTreeMap<String, BTreeSet<String>>) -> Self {
        let mut policy = Self::default();
        for (to_state, roles) in required {
            policy
                .required
                .entry(fold_name(&to_state))
                .or_default()
                .extend(roles);
        }
        policy
    }

    pub fn require(mut self, to_state: &str, roles: &[&str]) -> Self {
        self.required
            .entry(fold_name(to_state))
            .or_default()
            .extend(roles.iter().map(|r| r.to_string()));
        self
    }
}

impl Policy for RequiredRolesPolicy {
    fn allow(&self, ctx: &Context, action: &ActionDescriptor, _doc: &Document) -> bool {
        match self.required.get(&fold_name(&action.to_state)) {
            None => true,
            Some(roles) => ctx.role.as_ref().is_some_and(|role| roles.contains(role)),
        }
    }
}
