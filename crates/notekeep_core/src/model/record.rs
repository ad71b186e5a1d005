//! Record domain model.
//!
//! # Responsibility
//! - Represent one stored JSON object with a mandatory string `id`.
//! - Keep every other caller-defined field opaque to the core.
//!
//! # Invariants
//! - `id` is serialized exactly once; `fields` never carries an `id` key.
//! - A collection handed to the store never repeats an `id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Stable record identifier. Format is chosen by the caller.
pub type RecordId = String;

/// Ordered set of records persisted as one JSON array.
pub type Collection = Vec<Record>;

/// Name of the identifying field inside every record object.
pub const ID_FIELD: &str = "id";

/// One JSON object in the collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: RecordId,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Record {
    /// Creates a record with no fields besides `id`.
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Adds or replaces one field, builder style. `id` keys are ignored.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        if key == ID_FIELD {
            return None;
        }
        self.fields.get(key)
    }

    /// Returns a string field, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Sets one field and returns the previous value. Writes to `id` are
    /// rejected with `None` and leave the record unchanged.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        if key == ID_FIELD {
            return None;
        }
        self.fields.insert(key, value.into())
    }

    /// Non-id fields in key order.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// Returns the first id that appears more than once, if any.
pub fn find_duplicate_id(records: &[Record]) -> Option<&str> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .iter()
        .map(Record::id)
        .find(|id| !seen.insert(*id))
}

/// Returns whether a raw JSON value is an object whose `id` equals `id`.
pub fn value_has_id(value: &Value, id: &str) -> bool {
    value
        .get(ID_FIELD)
        .and_then(Value::as_str)
        .is_some_and(|current| current == id)
}
