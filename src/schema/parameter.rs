//! Parameter Set - named, versioned configuration consumed by a node

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hash::ContentHasher;
use crate::Result;

/// Name of the parameter set used when a request selects none for a kind.
pub const DEFAULT_PARAMETER_NAME: &str = "default";

/// Parameter Set represents one immutable version of a named configuration.
///
/// `kind` is the parameter type a computation node declares it consumes
/// (e.g. `"filter"`); `name` identifies the set within that kind (e.g.
/// `"filter_v1"`). A different payload under an existing name is stored as
/// the next version, never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParameterSet {
    kind: String,
    name: String,
    version: u32,
    payload: Value,
    created_at: DateTime<Utc>,
}

impl ParameterSet {
    /// Create a parameter set version with the current timestamp.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>, version: u32, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            version,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Get the parameter kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Get the set name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the version number (starting at 1).
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Get the payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Look up one payload entry, if the payload is an object.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Human-readable reference, `name@vN`.
    ///
    /// This is the value derived entities carry in their `<kind>_params`
    /// key field.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}@v{}", self.name, self.version)
    }

    /// Fingerprint over kind, name, version and payload.
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized.
    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = ContentHasher::new();
        hasher.update(self.kind.as_bytes());
        hasher.update(self.name.as_bytes());
        hasher.update(&self.version.to_le_bytes());
        hasher.update_json(&self.payload)?;
        Ok(hasher.finish())
    }
}

/// Name of the key field derived entities use to record their parameter set.
#[must_use]
pub fn params_key_field(kind: &str) -> String {
    format!("{kind}_params")
}
