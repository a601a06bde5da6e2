//! Process State Envelope
//!
//! The versioned value threaded through every step of a process. A state
//! is a schema version tag plus an ordered map of named fields, each holding
//! a tagged [`FieldValue`].
//!
//! # Example
//!
//! ```
//! use procflow::workflow::{FieldValue, StateEnvelope};
//!
//! let state = StateEnvelope::new(1)
//!     .with("node_name", "edge-ams-01")
//!     .with("port_count", 48)
//!     .with("node", FieldValue::entity("node", "b7c1"));
//!
//! assert_eq!(state.get_str("node_name"), Some("edge-ams-01"));
//! assert_eq!(state.schema_version(), 1);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named fields of a state or of a user/initial input.
pub type Fields = BTreeMap<String, FieldValue>;

/// A single domain value stored in a state field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<FieldValue>),
    /// Nested record of named values
    Record(Fields),
    /// Reference to an entity persisted outside the process state
    EntityRef { entity_type: String, id: String },
}

impl FieldValue {
    /// Creates a reference to a persisted entity.
    pub fn entity(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::EntityRef {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Short name of the variant, used in validation messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Record(_) => "record",
            Self::EntityRef { .. } => "entity_ref",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Fields> {
        match self {
            Self::Record(fields) => Some(fields),
            _ => None,
        }
    }

    /// Converts an arbitrary JSON value. Objects become records; entity
    /// references are never inferred.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Text(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Record(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts into plain JSON, as handed to external collaborators.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::Text(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Record(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::EntityRef { entity_type, id } => serde_json::json!({
                "entity_type": entity_type,
                "id": id,
            }),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(value: Vec<FieldValue>) -> Self {
        Self::List(value)
    }
}

impl From<Fields> for FieldValue {
    fn from(value: Fields) -> Self {
        Self::Record(value)
    }
}

/// Builds a [`Fields`] map from key/value pairs.
///
/// ```
/// use procflow::workflow::state::fields;
///
/// let input = fields([("confirmed", true.into())]);
/// assert_eq!(input.len(), 1);
/// ```
pub fn fields<K, I>(pairs: I) -> Fields
where
    K: Into<String>,
    I: IntoIterator<Item = (K, FieldValue)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Versioned process state passed between steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StateEnvelope {
    schema_version: u32,
    #[serde(default)]
    fields: Fields,
}

impl StateEnvelope {
    /// Creates an empty state tagged with `schema_version`.
    pub fn new(schema_version: u32) -> Self {
        Self {
            schema_version,
            fields: Fields::new(),
        }
    }

    /// Creates a state from existing fields.
    pub fn from_fields(schema_version: u32, fields: Fields) -> Self {
        Self {
            schema_version,
            fields,
        }
    }

    /// Sets a field, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Returns a copy of this state tagged with a different version.
    ///
    /// Only migration steps should change the version of a state.
    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(FieldValue::as_bool)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(FieldValue::as_int)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.fields.remove(key)
    }

    /// Overlays `other` onto this state. Keys in `other` win.
    pub fn merge(mut self, other: Fields) -> Self {
        self.fields.extend(other);
        self
    }

    /// Names of fields that were added, changed or removed in `next`.
    pub fn changed_keys(&self, next: &StateEnvelope) -> Vec<String> {
        let mut changed: Vec<String> = next
            .fields
            .iter()
            .filter(|(k, v)| self.fields.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();

        changed.extend(
            self.fields
                .keys()
                .filter(|k| !next.fields.contains_key(*k))
                .cloned(),
        );
        changed.sort();
        changed
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_getters() {
        let state = StateEnvelope::new(2)
            .with("name", "core-router")
            .with("ports", 24)
            .with("active", true);

        assert_eq!(state.schema_version(), 2);
        assert_eq!(state.get_str("name"), Some("core-router"));
        assert_eq!(state.get_int("ports"), Some(24));
        assert_eq!(state.get_bool("active"), Some(true));
        assert_eq!(state.get_str("ports"), None);
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn test_merge_overrides_existing_keys() {
        let state = StateEnvelope::new(1).with("a", 1).with("b", 2);
        let merged = state.merge(fields([("b", 3.into()), ("c", 4.into())]));

        assert_eq!(merged.get_int("a"), Some(1));
        assert_eq!(merged.get_int("b"), Some(3));
        assert_eq!(merged.get_int("c"), Some(4));
    }

    #[test]
    fn test_changed_keys() {
        let before = StateEnvelope::new(1).with("a", 1).with("b", 2).with("gone", 0);
        let after = StateEnvelope::new(1).with("a", 1).with("b", 5).with("new", true);

        assert_eq!(before.changed_keys(&after), vec!["b", "gone", "new"]);
        assert!(before.changed_keys(&before).is_empty());
    }

    #[test]
    fn test_serialized_form_is_tagged() {
        let state = StateEnvelope::new(1)
            .with("confirmed", true)
            .with("node", FieldValue::entity("node", "n-1"));

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["schema_version"], 1);
        assert_eq!(json["fields"]["confirmed"]["type"], "bool");
        assert_eq!(json["fields"]["node"]["type"], "entity_ref");
        assert_eq!(json["fields"]["node"]["value"]["id"], "n-1");

        let back: StateEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_from_json_conversion() {
        let value = serde_json::json!({
            "name": "pe-1",
            "vlan": 120,
            "bandwidth": 2.5,
            "tags": ["a", "b"],
            "site": {"city": "Utrecht"},
            "note": null
        });

        let converted = FieldValue::from_json(value);
        let record = converted.as_record().unwrap();
        assert_eq!(record["name"], FieldValue::Text("pe-1".into()));
        assert_eq!(record["vlan"], FieldValue::Int(120));
        assert_eq!(record["bandwidth"], FieldValue::Float(2.5));
        assert_eq!(record["tags"].kind_name(), "list");
        assert_eq!(record["site"].kind_name(), "record");
        assert_eq!(record["note"], FieldValue::Null);
    }

    #[test]
    fn test_entity_ref_to_json() {
        let value = FieldValue::entity("subscription", "42");
        let json = value.to_json();
        assert_eq!(json["entity_type"], "subscription");
        assert_eq!(json["id"], "42");
    }

    #[test]
    fn test_remove_and_contains() {
        let mut state = StateEnvelope::new(1).with("token", "abc");
        assert!(state.contains("token"));
        assert_eq!(state.remove("token"), Some(FieldValue::Text("abc".into())));
        assert!(!state.contains("token"));
        assert!(state.is_empty());
    }
}
