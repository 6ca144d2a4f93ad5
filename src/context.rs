//! Acting principal, scope, and per-request metadata
use super::utils::new_request_id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identity and scope of whoever is acting. Every field is always serialised,
/// absent values as `null`, so stored records never drop keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub period_id: Option<String>,
    #[serde(default)]
    pub facility_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn blank_to_none(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_user(mut self, user_id: &str, username: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self.username = Some(username.to_string());
        self
    }
    pub fn set_tenant(mut self, tenant_id: &str) -> Self {
        self.tenant_id = Some(tenant_id.to_string());
        self
    }
    pub fn set_period(mut self, period_id: &str) -> Self {
        self.period_id = Some(period_id.to_string());
        self
    }
    pub fn set_facility(mut self, facility_id: &str) -> Self {
        self.facility_id = Some(facility_id.to_string());
        self
    }
    pub fn set_role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }
    pub fn set_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Blank or whitespace-only fields become `None`.
    pub fn normalized(&self) -> Self {
        Self {
            user_id: blank_to_none(&self.user_id),
            username: blank_to_none(&self.username),
            tenant_id: blank_to_none(&self.tenant_id),
            period_id: blank_to_none(&self.period_id),
            facility_id: blank_to_none(&self.facility_id),
            role: blank_to_none(&self.role),
            session_id: blank_to_none(&self.session_id),
        }
    }

    // fills every empty field of self from other
    fn or(self, other: &Context) -> Self {
        let pick = |mine: Option<String>, theirs: &Option<String>| {
            mine.or_else(|| blank_to_none(theirs))
        };
        Self {
            user_id: pick(self.user_id, &other.user_id),
            username: pick(self.username, &other.username),
            tenant_id: pick(self.tenant_id, &other.tenant_id),
            period_id: pick(self.period_id, &other.period_id),
            facility_id: pick(self.facility_id, &other.facility_id),
            role: pick(self.role, &other.role),
            session_id: pick(self.session_id, &other.session_id),
        }
    }
}

/// Produces the context for the current request. Resolved once at the edge,
/// the result is then passed explicitly to every trail call.
pub trait ContextProvider {
    fn resolve(&self) -> Context;
}

impl ContextProvider for Context {
    fn resolve(&self) -> Context {
        self.normalized()
    }
}

/// Request-scoped values win, then the session, then configured defaults,
/// decided field by field.
#[derive(Debug, Clone, Default)]
pub struct FallbackContext {
    pub request: Option<Context>,
    pub session: Option<Context>,
    pub defaults: Context,
}

impl ContextProvider for FallbackContext {
    fn resolve(&self) -> Context {
        let mut resolved = Context::default();
        for layer in [self.request.as_ref(), self.session.as_ref(), Some(&self.defaults)]
            .into_iter()
            .flatten()
        {
            resolved = resolved.or(layer);
        }
        resolved
    }
}

/// Transport metadata attached to every audit record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

pub const REQUEST_ID_HEADERS: [&str; 2] = ["x-request-id", "x-correlation-id"];

impl RequestMeta {
    /// Header names are matched case-insensitively.
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let lookup = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            ip: lookup("x-forwarded-for")
                .and_then(|v| v.split(',').next().map(|s| s.trim().to_string())),
            user_agent: lookup("user-agent"),
            request_id: REQUEST_ID_HEADERS.into_iter().find_map(lookup),
        }
    }

    /// Returns the request id, minting one the first time it is needed.
    pub fn ensure_request_id(&mut self) -> &str {
        self.request_id.get_or_insert_with(new_request_id)
    }
}
