//! Engine configuration, read once at start-up and injected into constructors
use super::error::ConfigError;
use super::graph::{DEFAULT_GRAPH, StateGraph, Transitions, default_transitions, fold_name};
use super::policy::RequiredRolesPolicy;
use super::webhook::{WebhookSettings, WebhookSubscription};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "DOCTRAIL";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    /// doc type -> state -> action -> next state
    pub graphs: BTreeMap<String, Transitions>,
    /// doc type -> collection holding its documents
    pub collections: BTreeMap<String, String>,
    pub trail: TrailConfig,
    pub webhooks: WebhookConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sled database directory
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TrailConfig {
    /// Write a `deny` audit record for refused transitions
    pub audit_rejections: bool,
    /// Module recorded on targets that don't name one
    pub module: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub subscriptions: Vec<WebhookSubscription>,
    pub connect_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub signature_header: String,
    /// Deliver on a detached thread instead of inline
    pub detached: bool,
    /// Keep a job record per delivery attempt
    pub record_deliveries: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// target state -> roles allowed to move a document into it
    pub required_roles: BTreeMap<String, BTreeSet<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut graphs = BTreeMap::new();
        graphs.insert(DEFAULT_GRAPH.to_string(), default_transitions());
        Self {
            store: StoreConfig::default(),
            graphs,
            collections: BTreeMap::new(),
            trail: TrailConfig::default(),
            webhooks: WebhookConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "doc_trail.db".to_string(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        let settings = WebhookSettings::default();
        Self {
            subscriptions: vec![],
            connect_timeout_ms: settings.connect_timeout.as_millis() as u64,
            total_timeout_ms: settings.total_timeout.as_millis() as u64,
            signature_header: settings.signature_header,
            detached: true,
            record_deliveries: settings.record_deliveries,
        }
    }
}

impl WebhookConfig {
    pub fn settings(&self) -> WebhookSettings {
        WebhookSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            total_timeout: Duration::from_millis(self.total_timeout_ms),
            signature_header: self.signature_header.clone(),
            record_deliveries: self.record_deliveries,
        }
    }
}

impl EngineConfig {
    /// Layers an optional config file and `DOCTRAIL__*` environment variables
    /// over the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn state_graph(&self) -> Result<StateGraph, ConfigError> {
        StateGraph::new(self.graphs.clone())
    }

    /// Doc type names match case-insensitively, as they do in `graphs`.
    pub fn collection_for(&self, doc_type: &str) -> String {
        let wanted = fold_name(doc_type);
        self.collections
            .iter()
            .find(|(name, _)| fold_name(name) == wanted)
            .map(|(_, collection)| collection.clone())
            .unwrap_or_else(|| doc_type.to_string())
    }

    pub fn roles_policy(&self) -> Option<RequiredRolesPolicy> {
        if self.policy.required_roles.is_empty() {
            return None;
        }
        Some(RequiredRolesPolicy::new(self.policy.required_roles.clone()))
    }
}
