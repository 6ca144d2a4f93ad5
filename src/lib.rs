pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod numbering;
pub mod policy;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod target;
pub mod telemetry;
pub mod trail;
pub mod utils;
pub mod webhook;

pub use context::{Context, RequestMeta};
pub use error::{ConfigError, StoreError, TrailError};
pub use service::{RejectCode, TransitionResult, TransitionService};
pub use store::{DocumentStore, SledStore};
pub use target::{Target, TargetKey, build_target_key};
