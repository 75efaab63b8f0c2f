//! JSON snapshot of a store's tables.
//!
//! Compute functions are code, not data: a restored pipeline must register
//! its nodes again before requesting anything.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::Store;
use crate::engine::ComputationRecord;
use crate::resolver::Request;
use crate::schema::{Entity, EntityType, ParameterSet};
use crate::Result;

/// Format version written into every snapshot.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Serializable copy of every table of a [`Store`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    format_version: u32,
    entity_types: Vec<EntityType>,
    // Every revision of every entity, oldest first per key
    entities: Vec<Entity>,
    parameter_sets: Vec<ParameterSet>,
    computations: Vec<ComputationRecord>,
    superseded: Vec<ComputationRecord>,
    #[serde(default)]
    selections: Vec<Request>,
}

impl Snapshot {
    /// Capture the contents of a store.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn capture(store: &dyn Store) -> Result<Self> {
        let entity_types = store.entity_types()?;
        let mut entities = Vec::new();
        for ty in &entity_types {
            for latest in store.entities(ty.name())? {
                entities.extend(store.entity_revisions(ty.name(), latest.key())?);
            }
        }
        Ok(Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            entity_types,
            entities,
            parameter_sets: store.parameter_sets()?,
            computations: store.computations()?,
            superseded: store.superseded_computations()?,
            selections: store.selections()?,
        })
    }

    /// Write every row into a store, overwriting rows with equal keys.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects a write.
    pub fn restore_into(self, store: &dyn Store) -> Result<()> {
        for ty in self.entity_types {
            store.put_entity_type(ty)?;
        }
        for entity in self.entities {
            store.put_entity(entity)?;
        }
        for params in self.parameter_sets {
            store.insert_parameter_set_if_absent(params)?;
        }
        for record in self.computations {
            store.put_computation(record)?;
        }
        for record in self.superseded {
            store.archive_computation(record)?;
        }
        for selection in self.selections {
            store.insert_selection(selection)?;
        }
        Ok(())
    }

    /// Number of entity rows in the snapshot, counting every revision.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of current computation records in the snapshot.
    #[must_use]
    pub fn computation_count(&self) -> usize {
        self.computations.len()
    }

    /// Serialize to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse from JSON.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` on malformed input and `Storage` on an
    /// unsupported format version.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(json)?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(crate::Error::Storage(format!(
                "unsupported snapshot format version {} (expected {SNAPSHOT_FORMAT_VERSION})",
                snapshot.format_version
            )));
        }
        Ok(snapshot)
    }

    /// Write to a file.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read from a file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
