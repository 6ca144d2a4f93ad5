//! Error types and the best-effort outcome used around the trail writes
use serde::Serialize;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Storage backend failed: {0}")]
    Backend(#[from] sled::Error),
    #[error("Record in collection '{collection}' could not be (de)serialised: {source}")]
    Codec {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Collection '{0}' only accepts JSON objects")]
    NotAnObject(String),
    #[error("Collection '{0}' is unavailable")]
    Unavailable(String),
    #[error("Record '{id}' already exists in collection '{collection}'")]
    Duplicate { collection: String, id: String },
    #[error("Record '{id}' in collection '{collection}' is corrupt: {reason}")]
    Corrupt {
        collection: String,
        id: String,
        reason: String,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum TrailError {
    #[error("Document store failed: {0}")]
    Store(#[from] StoreError),
    #[error("Audit record for '{action_code}' could not be written: {source}")]
    AuditWrite {
        action_code: String,
        #[source]
        source: StoreError,
    },
    #[error("Stored record in '{collection}' is malformed: {source}")]
    Malformed {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("State graph '{doc_type}' maps '{state}' --{action}--> an empty state")]
    EmptyTarget {
        doc_type: String,
        state: String,
        action: String,
    },
}

/// Steps of a transition that are allowed to fail without failing the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedStep {
    Event,
    Snapshot,
    Workflow,
    Webhook,
}

impl DegradedStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradedStep::Event => "event",
            DegradedStep::Snapshot => "snapshot",
            DegradedStep::Workflow => "workflow",
            DegradedStep::Webhook => "webhook",
        }
    }
}

/// Result of an isolated step. Building one from a `Result` swallows the error
/// after logging it, so a failure here can never reach the caller.
#[derive(Debug)]
pub enum BestEffort<T> {
    Done(T),
    Degraded { step: DegradedStep, reason: String },
}

impl<T> BestEffort<T> {
    pub fn from_result<E: std::fmt::Display>(step: DegradedStep, result: Result<T, E>) -> Self {
        match result {
            Ok(value) => BestEffort::Done(value),
            Err(err) => {
                tracing::warn!(step = step.as_str(), error = %err, "best-effort step degraded");
                BestEffort::Degraded {
                    step,
                    reason: err.to_string(),
                }
            }
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            BestEffort::Done(value) => Some(value),
            BestEffort::Degraded { .. } => None,
        }
    }

    pub fn degraded_step(&self) -> Option<DegradedStep> {
        match self {
            BestEffort::Done(_) => None,
            BestEffort::Degraded { step, .. } => Some(*step),
        }
    }
}
