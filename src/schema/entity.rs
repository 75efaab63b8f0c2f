//! Entity - a uniquely keyed scientific record, raw or derived

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// Named field values of an entity.
pub type Fields = BTreeMap<String, Value>;

/// One component of a composite identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    /// Integer key part (epoch number, electrode id, ...)
    Int(i64),
    /// String key part (subject, date, file name, ...)
    Str(String),
}

impl KeyValue {
    /// JSON form of this key part.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(i) => Value::from(*i),
            Self::Str(s) => Value::from(s.as_str()),
        }
    }

    /// Convert a scalar JSON value into a key part.
    ///
    /// Returns `None` for anything but strings and integers.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Int),
            _ => None,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for KeyValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for KeyValue {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for KeyValue {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

/// Composite identity key: field name to key part, ordered by field name.
///
/// Keys of different entity types combine by natural join: shared field
/// names must carry equal values (see [`EntityKey::merge`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(BTreeMap<String, KeyValue>);

impl EntityKey {
    /// Create an empty key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) one key field.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Get one key field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&KeyValue> {
        self.0.get(name)
    }

    /// Number of key fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the key has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(field, value)` pairs in field-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &KeyValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Natural join of two keys.
    ///
    /// Returns `None` if a shared field carries different values.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Option<Self> {
        let mut merged = self.0.clone();
        for (name, value) in &other.0 {
            match merged.get(name) {
                Some(existing) if existing != value => return None,
                Some(_) => {}
                None => {
                    merged.insert(name.clone(), value.clone());
                }
            }
        }
        Some(Self(merged))
    }

    /// Restrict the key to the given field names.
    ///
    /// Returns `None` if any of the names is missing.
    #[must_use]
    pub fn project<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut projected = BTreeMap::new();
        for name in names {
            let value = self.0.get(name)?;
            projected.insert(name.to_string(), value.clone());
        }
        Some(Self(projected))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}

impl<K: Into<String>, V: Into<KeyValue>> FromIterator<(K, V)> for EntityKey {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Entity represents one stored record of an entity type.
///
/// The identity key is immutable. A changed payload under the same key is
/// stored as a new `revision` rather than mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    entity_type: String,
    key: EntityKey,
    fields: Fields,
    revision: u32,
    created_at: DateTime<Utc>,
}

impl Entity {
    /// Create an entity with no value fields and the current timestamp.
    #[must_use]
    pub fn new(entity_type: impl Into<String>, key: EntityKey) -> Self {
        Self {
            entity_type: entity_type.into(),
            key,
            fields: Fields::new(),
            revision: 0,
            created_at: Utc::now(),
        }
    }

    /// Create a builder for constructing an entity field by field.
    #[must_use]
    pub fn builder(entity_type: impl Into<String>) -> EntityBuilder {
        EntityBuilder::new(entity_type)
    }

    /// Get the entity type name.
    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Get the identity key.
    #[must_use]
    pub const fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Get all value fields.
    #[must_use]
    pub const fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Get one value field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Get the revision number (0 for the first stored payload).
    #[must_use]
    pub const fn revision(&self) -> u32 {
        self.revision
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Canonical payload bytes: key and fields as JSON with sorted maps.
    ///
    /// Revision and timestamp are not part of the payload.
    ///
    /// # Errors
    ///
    /// Returns error if a field value cannot be serialized.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&(&self.key, &self.fields))?)
    }

    /// Whether both entities carry the same key and field values.
    #[must_use]
    pub fn same_payload(&self, other: &Self) -> bool {
        self.entity_type == other.entity_type && self.key == other.key && self.fields == other.fields
    }

    pub(crate) fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }
}

/// Builder for `Entity`.
#[derive(Debug)]
pub struct EntityBuilder {
    entity_type: String,
    key: EntityKey,
    fields: Fields,
    created_at: DateTime<Utc>,
}

impl EntityBuilder {
    /// Create a new builder for the given entity type.
    #[must_use]
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            key: EntityKey::new(),
            fields: Fields::new(),
            created_at: Utc::now(),
        }
    }

    /// Add one key field.
    #[must_use]
    pub fn key(mut self, name: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        self.key = self.key.with(name, value);
        self
    }

    /// Replace the whole key.
    #[must_use]
    pub fn with_key(mut self, key: EntityKey) -> Self {
        self.key = key;
        self
    }

    /// Add one value field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Replace all value fields.
    #[must_use]
    pub fn fields(mut self, fields: Fields) -> Self {
        self.fields = fields;
        self
    }

    /// Set a custom creation timestamp (useful for deserialization/testing).
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Build the `Entity`.
    #[must_use]
    pub fn build(self) -> Entity {
        Entity {
            entity_type: self.entity_type,
            key: self.key,
            fields: self.fields,
            revision: 0,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_is_sorted() {
        let key = EntityKey::new().with("subject", "A").with("date", "2024-01-01");
        assert_eq!(key.to_string(), "{date=2024-01-01, subject=A}");
    }

    #[test]
    fn test_key_merge_conflict() {
        let a = EntityKey::new().with("subject", "A").with("epoch", 1);
        let b = EntityKey::new().with("subject", "A").with("probe", "tetrode");
        let c = EntityKey::new().with("subject", "B");

        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.len(), 3);
        assert!(a.merge(&c).is_none());
    }

    #[test]
    fn test_key_project() {
        let key = EntityKey::new().with("subject", "A").with("epoch", 2);
        assert_eq!(key.project(["epoch"]), Some(EntityKey::new().with("epoch", 2)));
        assert_eq!(key.project(["session"]), None);
    }

    #[test]
    fn test_key_value_json_roundtrip() {
        assert_eq!(KeyValue::from_json(&Value::from(3)), Some(KeyValue::Int(3)));
        assert_eq!(KeyValue::from_json(&Value::from("x")), Some(KeyValue::from("x")));
        assert_eq!(KeyValue::from_json(&Value::from(1.5)), None);
        assert_eq!(KeyValue::Int(7).to_json(), Value::from(7));
    }

    #[test]
    fn test_payload_ignores_revision_and_timestamp() {
        let e = Entity::builder("Recording")
            .key("subject", "A")
            .field("sampling_rate", 30000)
            .build();
        let revised = e.clone().with_revision(3);
        assert!(e.same_payload(&revised));
        assert_eq!(e.payload_bytes().unwrap(), revised.payload_bytes().unwrap());
    }
}
