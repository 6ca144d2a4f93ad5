//! Document store interface and its sled implementation
use super::error::StoreError;
use super::graph::INITIAL_STATE;
use super::utils::new_record_id;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// The operations the trail engine needs from whatever holds the documents.
/// Each call is atomic for the single record it touches, nothing more.
pub trait DocumentStore: Send + Sync {
    fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Stores a new JSON object and returns its id. An `id` field on the
    /// object is used as-is, otherwise one is minted.
    fn insert(&self, collection: &str, doc: Value) -> Result<String, StoreError>;

    fn find_one_and_update(
        &self,
        collection: &str,
        id: &str,
        update: &Update,
        options: FindOptions,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Equality match on a top level string field.
    fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<Value>, StoreError>;

    fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        update: &Update,
    ) -> Result<UpdateOutcome, StoreError> {
        self.find_one_and_update(collection, id, update, FindOptions::default())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    pub upsert: bool,
}

/// Precondition on the stored record. `or_missing` lets an absent field
/// satisfy the guard, which is how a document without `state` counts as draft.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    pub field: String,
    pub equals: Value,
    pub or_missing: bool,
}

impl Guard {
    fn holds(&self, doc: &Value) -> bool {
        match doc.get(&self.field) {
            None | Some(Value::Null) => self.or_missing,
            Some(Value::String(s)) if s.is_empty() => self.or_missing,
            Some(current) => *current == self.equals,
        }
    }
}

/// A single-record patch: optional guard, then `set`, then `inc`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub guard: Option<Guard>,
    pub set: Map<String, Value>,
    pub inc: BTreeMap<String, i64>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn guard(mut self, field: &str, equals: Value, or_missing: bool) -> Self {
        self.guard = Some(Guard {
            field: field.to_string(),
            equals,
            or_missing,
        });
        self
    }
    pub fn set(mut self, field: &str, value: Value) -> Self {
        self.set.insert(field.to_string(), value);
        self
    }
    pub fn inc(mut self, field: &str, by: i64) -> Self {
        *self.inc.entry(field.to_string()).or_default() += by;
        self
    }

    fn apply(&self, collection: &str, mut doc: Value) -> Result<Value, StoreError> {
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| StoreError::NotAnObject(collection.to_string()))?;
        for (field, value) in &self.set {
            obj.insert(field.clone(), value.clone());
        }
        for (field, by) in &self.inc {
            let current = obj.get(field).and_then(counter).unwrap_or(0);
            obj.insert(field.clone(), Value::from(current + by));
        }
        Ok(doc)
    }
}

// counters written by other tools may be strings or floats
fn counter(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// `before` is `None` when the record was created by an upsert.
    Updated { before: Option<Value>, after: Value },
    Missing,
    GuardMismatch { current: Value },
}

impl UpdateOutcome {
    pub fn after(&self) -> Option<&Value> {
        match self {
            UpdateOutcome::Updated { after, .. } => Some(after),
            _ => None,
        }
    }
}

/// Typed view of a business document. Only `state` and `version` are read by
/// the engine, the rest stays an open bag. Both are read leniently: a value of
/// the wrong type counts as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(
        default,
        deserialize_with = "lenient_state",
        skip_serializing_if = "Option::is_none"
    )]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient_version")]
    pub version: u64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

fn lenient_state<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn lenient_version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let version = counter(&Value::deserialize(deserializer)?).unwrap_or(0);
    Ok(u64::try_from(version).unwrap_or(0))
}

impl Document {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// The id the record was fetched by wins over whatever the body carries.
    pub fn from_stored(id: &str, value: Value) -> Result<Self, serde_json::Error> {
        let mut doc = Self::from_value(value)?;
        doc.id = id.to_string();
        Ok(doc)
    }

    /// Current lifecycle state, `draft` when never set.
    pub fn state(&self) -> &str {
        self.state
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(INITIAL_STATE)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Each collection is its own sled tree, records are JSON encoded.
#[derive(Clone)]
pub struct SledStore {
    instance: Arc<sled::Db>,
}

fn decode(collection: &str, bytes: &[u8]) -> Result<Value, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Codec {
        collection: collection.to_string(),
        source,
    })
}

fn encode(collection: &str, doc: &Value) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(doc).map_err(|source| StoreError::Codec {
        collection: collection.to_string(),
        source,
    })
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(sled::open(path)?)))
    }

    fn tree(&self, collection: &str) -> Result<sled::Tree, StoreError> {
        Ok(self.instance.open_tree(collection)?)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.instance.flush()?;
        Ok(())
    }
}

impl DocumentStore for SledStore {
    fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.tree(collection)?
            .get(id.as_bytes())?
            .map(|bytes| decode(collection, &bytes))
            .transpose()
    }

    fn insert(&self, collection: &str, mut doc: Value) -> Result<String, StoreError> {
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| StoreError::NotAnObject(collection.to_string()))?;
        let id = match obj.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => new_record_id("doc_"),
        };
        obj.insert("id".to_string(), Value::String(id.clone()));

        // records are append-only, an existing id is never overwritten
        let swapped = self.tree(collection)?.compare_and_swap(
            id.as_bytes(),
            None as Option<&[u8]>,
            Some(encode(collection, &doc)?),
        )?;
        if swapped.is_err() {
            return Err(StoreError::Duplicate {
                collection: collection.to_string(),
                id,
            });
        }
        Ok(id)
    }

    fn find_one_and_update(
        &self,
        collection: &str,
        id: &str,
        update: &Update,
        options: FindOptions,
    ) -> Result<UpdateOutcome, StoreError> {
        let tree = self.tree(collection)?;

        // compare-and-swap until no concurrent writer slipped in between
        loop {
            let current = tree.get(id.as_bytes())?;
            let before = match &current {
                Some(bytes) => Some(decode(collection, bytes)?),
                None => None,
            };
            let base = match (&before, options.upsert) {
                (Some(doc), _) => doc.clone(),
                (None, true) => serde_json::json!({ "id": id }),
                (None, false) => return Ok(UpdateOutcome::Missing),
            };

            if let Some(guard) = &update.guard {
                if !guard.holds(&base) {
                    return Ok(UpdateOutcome::GuardMismatch { current: base });
                }
            }

            let after = update.apply(collection, base)?;
            let swapped =
                tree.compare_and_swap(id.as_bytes(), current, Some(encode(collection, &after)?))?;
            if swapped.is_ok() {
                return Ok(UpdateOutcome::Updated { before, after });
            }
        }
    }

    fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let mut found = vec![];
        for entry in self.tree(collection)?.iter() {
            let (_, bytes) = entry?;
            let doc = decode(collection, &bytes)?;
            if doc.get(field).and_then(Value::as_str) == Some(value) {
                found.push(doc);
            }
        }
        Ok(found)
    }
}
