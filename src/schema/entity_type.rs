//! Entity type definitions and record validation

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Entity, KeyValue};
use crate::{Error, Result};

/// Type of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// UTF-8 string
    String,
    /// Signed integer
    Integer,
    /// Floating point number (integers are accepted)
    Float,
    /// Boolean flag
    Bool,
    /// Arbitrary JSON (arrays, objects, blobs)
    Json,
}

impl FieldType {
    /// Check whether a JSON value is acceptable for this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Json => true,
        }
    }

    /// Check whether a key part is acceptable for this type.
    #[must_use]
    pub fn accepts_key(self, value: &KeyValue) -> bool {
        matches!(
            (self, value),
            (Self::String, KeyValue::Str(_)) | (Self::Integer, KeyValue::Int(_))
        )
    }

    const fn is_key_type(self) -> bool {
        matches!(self, Self::String | Self::Integer)
    }
}

/// Declaration of one field of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    name: String,
    field_type: FieldType,
    required: bool,
}

impl FieldSpec {
    /// A field that must be present and non-null.
    #[must_use]
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// A field that may be absent or null.
    #[must_use]
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Get the field name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the field type.
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Whether the field is required.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.required
    }
}

/// Definition of an entity type: its key shape and value fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityType {
    name: String,
    key_fields: Vec<FieldSpec>,
    value_fields: Vec<FieldSpec>,
}

impl EntityType {
    /// Create a definition.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if a key field is not a string or integer,
    /// or if a field name is declared twice.
    pub fn new(
        name: impl Into<String>,
        key_fields: Vec<FieldSpec>,
        value_fields: Vec<FieldSpec>,
    ) -> Result<Self> {
        let name = name.into();
        if key_fields.is_empty() {
            return Err(Error::validation(&name, "an entity type needs at least one key field"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for spec in key_fields.iter().chain(&value_fields) {
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::validation(
                    &name,
                    format!("field '{}' declared twice", spec.name),
                ));
            }
        }
        if let Some(bad) = key_fields.iter().find(|f| !f.field_type.is_key_type()) {
            return Err(Error::validation(
                &name,
                format!("key field '{}' must be String or Integer, got {:?}", bad.name, bad.field_type),
            ));
        }
        // Key fields are always required.
        let key_fields = key_fields
            .into_iter()
            .map(|f| FieldSpec { required: true, ..f })
            .collect();
        Ok(Self {
            name,
            key_fields,
            value_fields,
        })
    }

    /// Get the type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the key field declarations.
    #[must_use]
    pub fn key_fields(&self) -> &[FieldSpec] {
        &self.key_fields
    }

    /// Get the value field declarations.
    #[must_use]
    pub fn value_fields(&self) -> &[FieldSpec] {
        &self.value_fields
    }

    /// Key field names in declaration order.
    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        self.key_fields.iter().map(FieldSpec::name)
    }

    /// Whether two definitions have identical key shapes (names, types, order).
    #[must_use]
    pub fn same_key_shape(&self, other: &Self) -> bool {
        self.key_fields.len() == other.key_fields.len()
            && self
                .key_fields
                .iter()
                .zip(&other.key_fields)
                .all(|(a, b)| a.name == b.name && a.field_type == b.field_type)
    }

    /// Validate a record against this definition.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` naming the first violation: a missing,
    /// extra or mistyped key field, a missing required value field, a
    /// mistyped value field, or an undeclared value field.
    pub fn validate(&self, entity: &Entity) -> Result<()> {
        let key = entity.key();
        for spec in &self.key_fields {
            match key.get(&spec.name) {
                None => {
                    return Err(Error::validation(
                        &self.name,
                        format!("missing key field '{}'", spec.name),
                    ))
                }
                Some(v) if !spec.field_type.accepts_key(v) => {
                    return Err(Error::validation(
                        &self.name,
                        format!("key field '{}' expects {:?}, got '{v}'", spec.name, spec.field_type),
                    ))
                }
                Some(_) => {}
            }
        }
        if let Some(extra) = key
            .field_names()
            .find(|n| !self.key_fields.iter().any(|f| f.name == *n))
        {
            return Err(Error::validation(&self.name, format!("unexpected key field '{extra}'")));
        }

        for spec in &self.value_fields {
            match entity.field(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(Error::validation(
                        &self.name,
                        format!("missing required field '{}'", spec.name),
                    ))
                }
                None | Some(Value::Null) => {}
                Some(v) if !spec.field_type.accepts(v) => {
                    return Err(Error::validation(
                        &self.name,
                        format!("field '{}' expects {:?}, got {v}", spec.name, spec.field_type),
                    ))
                }
                Some(_) => {}
            }
        }
        if let Some(unknown) = entity
            .fields()
            .keys()
            .find(|n| !self.value_fields.iter().any(|f| &f.name == *n))
        {
            return Err(Error::validation(&self.name, format!("unknown field '{unknown}'")));
        }
        Ok(())
    }
}
