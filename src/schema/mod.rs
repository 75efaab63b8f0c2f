//! Entity Schema Layer
//!
//! Typed records (sessions, recordings, derived results) and versioned
//! parameter sets, persisted through a [`Store`].
//!
//! ## Schema Overview
//!
//! ```text
//! EntityType (1) ──< Entity (N)          keyed by EntityKey, revisioned
//! ParameterSet kind (1) ──< name (N) ──< version (N)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use spyglass_core::schema::{Entity, FieldSpec, FieldType, Schema};
//! use spyglass_core::store::MemoryStore;
//!
//! # fn main() -> spyglass_core::Result<()> {
//! let schema = Schema::new(Arc::new(MemoryStore::new()));
//! schema.define_entity_type(
//!     "Recording",
//!     vec![FieldSpec::required("subject", FieldType::String)],
//!     vec![FieldSpec::required("sampling_rate", FieldType::Float)],
//! )?;
//!
//! let rec = Entity::builder("Recording")
//!     .key("subject", "A")
//!     .field("sampling_rate", 30000.0)
//!     .build();
//! schema.insert(rec.clone())?;
//! assert_eq!(schema.get("Recording", rec.key())?, rec);
//! # Ok(())
//! # }
//! ```

mod entity;
mod entity_type;
mod parameter;

pub use entity::{Entity, EntityBuilder, EntityKey, Fields, KeyValue};
pub use entity_type::{EntityType, FieldSpec, FieldType};
pub use parameter::{params_key_field, ParameterSet, DEFAULT_PARAMETER_NAME};

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::store::Store;
use crate::{Error, Result};

/// Outcome of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was stored.
    Inserted,
    /// An identical record was already stored; nothing changed.
    Unchanged,
}

/// Entity Schema Layer: type catalog plus typed access to the store.
pub struct Schema {
    types: DashMap<String, EntityType>,
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("types", &self.types.len())
            .finish_non_exhaustive()
    }
}

impl Schema {
    /// Create a schema layer over a store with no entity types defined.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            types: DashMap::new(),
            store,
        }
    }

    /// Create a schema layer and load the entity types already in the store.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn open(store: Arc<dyn Store>) -> Result<Self> {
        let schema = Self::new(store);
        schema.refresh()?;
        Ok(schema)
    }

    /// Reload entity type definitions from the store, replacing the cached
    /// catalog. Returns the number of types loaded.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn refresh(&self) -> Result<usize> {
        let stored = self.store.entity_types()?;
        self.types.clear();
        for ty in &stored {
            self.types.insert(ty.name().to_string(), ty.clone());
        }
        Ok(stored.len())
    }

    /// Get the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Define an entity type.
    ///
    /// Redefining a type with the same key shape succeeds (value fields are
    /// replaced by the new declaration).
    ///
    /// # Errors
    ///
    /// Returns `SchemaConflict` if the name is taken by a type with a
    /// different key shape, and `ValidationError` if the declaration is
    /// malformed.
    pub fn define_entity_type(
        &self,
        name: &str,
        key_fields: Vec<FieldSpec>,
        value_fields: Vec<FieldSpec>,
    ) -> Result<EntityType> {
        let requested = EntityType::new(name, key_fields, value_fields)?;
        match self.types.entry(name.to_string()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().same_key_shape(&requested) {
                    return Err(Error::conflict(
                        name,
                        format!(
                            "already defined with key ({}), requested ({})",
                            existing.get().key_names().collect::<Vec<_>>().join(", "),
                            requested.key_names().collect::<Vec<_>>().join(", "),
                        ),
                    ));
                }
                if existing.get() != &requested {
                    debug!(entity_type = name, "replacing value fields of entity type");
                    self.store.put_entity_type(requested.clone())?;
                    existing.insert(requested.clone());
                }
                Ok(requested)
            }
            Entry::Vacant(slot) => {
                self.store.put_entity_type(requested.clone())?;
                slot.insert(requested.clone());
                debug!(entity_type = name, "defined entity type");
                Ok(requested)
            }
        }
    }

    /// Get an entity type definition.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` if the type was never defined.
    pub fn entity_type(&self, name: &str) -> Result<EntityType> {
        self.types
            .get(name)
            .map(|t| t.value().clone())
            .ok_or_else(|| Error::UnknownEntityType(name.to_string()))
    }

    /// Names of all defined entity types, sorted.
    #[must_use]
    pub fn entity_type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Validate and insert a record.
    ///
    /// Inserting a record whose payload is byte-identical to the stored one
    /// succeeds without writing. This layer does not know which types are
    /// computed; [`Pipeline::insert`](crate::Pipeline::insert) additionally
    /// refuses types owned by a registered node.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType`, `ValidationError`, or `DuplicateKey` if
    /// the key is stored with a different payload.
    pub fn insert(&self, entity: Entity) -> Result<InsertOutcome> {
        self.entity_type(entity.entity_type())?.validate(&entity)?;
        self.insert_validated(entity)
    }

    /// Insert a record without field validation (ingestion adapters hand
    /// over already-validated entities). The type must still be defined.
    pub(crate) fn insert_trusted(&self, entity: Entity) -> Result<InsertOutcome> {
        self.entity_type(entity.entity_type())?;
        self.insert_validated(entity)
    }

    fn insert_validated(&self, entity: Entity) -> Result<InsertOutcome> {
        match self.store.insert_entity_if_absent(entity.clone())? {
            None => Ok(InsertOutcome::Inserted),
            Some(existing) if existing.payload_bytes()? == entity.payload_bytes()? => {
                Ok(InsertOutcome::Unchanged)
            }
            Some(existing) => Err(Error::DuplicateKey {
                entity_type: existing.entity_type().to_string(),
                key: existing.key().clone(),
            }),
        }
    }

    /// Get a record by key.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` or `NotFound`.
    pub fn get(&self, entity_type: &str, key: &EntityKey) -> Result<Entity> {
        self.entity_type(entity_type)?;
        self.store
            .get_entity(entity_type, key)?
            .ok_or_else(|| Error::not_found(entity_type, key))
    }

    /// Get one specific revision of a record.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` or `NotFound`.
    pub fn get_revision(&self, entity_type: &str, key: &EntityKey, revision: u32) -> Result<Entity> {
        self.entity_type(entity_type)?;
        self.store
            .get_entity_revision(entity_type, key, revision)?
            .ok_or_else(|| Error::NotFound {
                entity_type: entity_type.to_string(),
                key: format!("{key} revision {revision}"),
            })
    }

    /// Every stored revision of a record, oldest first. Empty if the key was
    /// never inserted.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` if the type was never defined.
    pub fn revisions(&self, entity_type: &str, key: &EntityKey) -> Result<Vec<Entity>> {
        self.entity_type(entity_type)?;
        self.store.entity_revisions(entity_type, key)
    }

    /// Store a changed payload under an existing key as a new revision.
    ///
    /// Earlier revisions stay readable through [`Schema::get_revision`].
    /// Returns the stored entity; an identical payload leaves the current
    /// revision in place. Concurrent revisions of one key each get their own
    /// revision number.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType`, `ValidationError`, or `NotFound` if no
    /// record with this key exists yet.
    pub fn revise(&self, entity: Entity) -> Result<Entity> {
        self.entity_type(entity.entity_type())?.validate(&entity)?;
        let (entity_type, key) = (entity.entity_type().to_string(), entity.key().clone());
        let revised = self
            .store
            .revise_entity(entity)?
            .ok_or_else(|| Error::not_found(&entity_type, &key))?;
        debug!(
            entity_type = %entity_type,
            key = %key,
            revision = revised.revision(),
            "revised entity"
        );
        Ok(revised)
    }

    /// All records of a type, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` if the type was never defined.
    pub fn entities(&self, entity_type: &str) -> Result<Vec<Entity>> {
        self.entity_type(entity_type)?;
        self.store.entities(entity_type)
    }

    /// Register a parameter set payload under `(kind, name)`.
    ///
    /// If the latest version already carries this payload it is returned
    /// unchanged; otherwise the next version is stored.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the write.
    pub fn register_parameter_set(&self, kind: &str, name: &str, payload: Value) -> Result<ParameterSet> {
        loop {
            let versions = self.store.parameter_versions(kind, name)?;
            if let Some(latest) = versions.last() {
                if latest.payload() == &payload {
                    return Ok(latest.clone());
                }
            }
            let next = versions.last().map_or(1, |p| p.version() + 1);
            let candidate = ParameterSet::new(kind, name, next, payload.clone());
            // Lost a race for this version number: re-read and retry.
            if self.store.insert_parameter_set_if_absent(candidate.clone())?.is_none() {
                debug!(kind, name, version = next, "registered parameter set");
                return Ok(candidate);
            }
        }
    }

    /// Register the `default` parameter set of a kind, unless one exists.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the write.
    pub fn insert_default_parameters(&self, kind: &str, payload: Value) -> Result<ParameterSet> {
        let candidate = ParameterSet::new(kind, DEFAULT_PARAMETER_NAME, 1, payload);
        // Version 1 is inserted at most once, so concurrent callers cannot
        // both register a default.
        match self.store.insert_parameter_set_if_absent(candidate.clone())? {
            None => {
                debug!(kind, "registered default parameter set");
                Ok(candidate)
            }
            Some(_) => self.parameter_set(kind, DEFAULT_PARAMETER_NAME, None),
        }
    }

    /// Get one version of a parameter set (latest if `version` is `None`).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such set or version exists.
    pub fn parameter_set(&self, kind: &str, name: &str, version: Option<u32>) -> Result<ParameterSet> {
        let versions = self.store.parameter_versions(kind, name)?;
        let found = match version {
            Some(v) => versions.into_iter().find(|p| p.version() == v),
            None => versions.into_iter().last(),
        };
        found.ok_or_else(|| Error::NotFound {
            entity_type: format!("parameter kind '{kind}'"),
            key: match version {
                Some(v) => format!("{name}@v{v}"),
                None => name.to_string(),
            },
        })
    }

    /// Kinds that have a parameter set called `name`.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn parameter_kinds_named(&self, name: &str) -> Result<Vec<String>> {
        let mut kinds: Vec<String> = self
            .store
            .parameter_sets()?
            .into_iter()
            .filter(|p| p.name() == name)
            .map(|p| p.kind().to_string())
            .collect();
        kinds.dedup();
        Ok(kinds)
    }
}
