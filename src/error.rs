//! Error types for spyglass-core
//!
//! Schema and resolver errors abort a request before any computation runs.
//! Computation errors are caught per node and surface as
//! [`Error::ComputationFailed`].

use thiserror::Error;

use crate::schema::EntityKey;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// spyglass-core error types
#[derive(Error, Debug)]
pub enum Error {
    /// A definition clashes with an existing one of the same name
    #[error("Schema conflict on '{name}': {reason}")]
    SchemaConflict {
        /// Entity type, parameter set or node name
        name: String,
        /// What differs from the existing definition
        reason: String,
    },

    /// Key already present with a different payload
    #[error("Duplicate key in '{entity_type}': {key}\nA stored record with this key has a different payload; use revise() to create a new revision.")]
    DuplicateKey {
        /// Entity type holding the key
        entity_type: String,
        /// Conflicting identity key
        key: EntityKey,
    },

    /// Record does not match its entity type definition
    #[error("Validation failed for '{entity_type}': {reason}")]
    ValidationError {
        /// Entity type the record was validated against
        entity_type: String,
        /// First violation found
        reason: String,
    },

    /// Lookup found nothing
    #[error("Not found in '{entity_type}': {key}")]
    NotFound {
        /// Entity type (or parameter kind) searched
        entity_type: String,
        /// Rendered key that was looked up
        key: String,
    },

    /// Entity type was never defined
    #[error("Unknown entity type '{0}'\nDefine it with define_entity_type() before use.")]
    UnknownEntityType(String),

    /// No computation node produces the requested type
    #[error("Unknown derivation: no computation node produces '{0}'")]
    UnknownDerivation(String),

    /// Derivation graph would contain (or contains) a cycle
    #[error("Cycle detected in derivation graph: {}", .path.join(" -> "))]
    CycleDetected {
        /// Types along the cycle, first and last equal
        path: Vec<String>,
    },

    /// A root entity or parameter set required by the plan is missing
    #[error("Unsatisfied dependency on '{entity_type}': {detail}")]
    UnsatisfiedDependency {
        /// Missing entity type or parameter kind
        entity_type: String,
        /// What exactly is missing
        detail: String,
    },

    /// A compute function returned an error (or panicked)
    #[error("Computation failed at node '{node}' for {key}: {reason}{}", blocked_suffix(.blocked))]
    ComputationFailed {
        /// First failing node in the plan
        node: String,
        /// Output key the failing node was computing
        key: EntityKey,
        /// Captured failure reason
        reason: String,
        /// Downstream nodes directly blocked by the failure
        blocked: Vec<String>,
    },

    /// Request was cancelled before a computation started running
    #[error("Request cancelled before node '{node}' started")]
    Cancelled {
        /// Node that would have run next
        node: String,
    },

    /// Store backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn blocked_suffix(blocked: &[String]) -> String {
    if blocked.is_empty() {
        String::new()
    } else {
        format!("\nBlocked downstream nodes: {}", blocked.join(", "))
    }
}

impl Error {
    /// Build a `NotFound` for an entity key.
    pub(crate) fn not_found(entity_type: impl Into<String>, key: &EntityKey) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            key: key.to_string(),
        }
    }

    /// Build a `ValidationError`.
    pub(crate) fn validation(entity_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationError {
            entity_type: entity_type.into(),
            reason: reason.into(),
        }
    }

    /// Build a `SchemaConflict`.
    pub(crate) fn conflict(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaConflict {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error came from a compute function rather than from
    /// schema, resolver or storage checks.
    #[must_use]
    pub const fn is_computation_failure(&self) -> bool {
        matches!(self, Self::ComputationFailed { .. })
    }
}
