//! Persisted state: entities, parameter sets and computation records.
//!
//! The core reaches storage only through the [`Store`] trait. Every
//! operation works on one row of one logical table, so disjoint cache keys
//! never contend on anything but the backend's own concurrency control.
//!
//! ```text
//! Entities(type, key, revision, payload, created_at)
//! ParameterSets(kind, name, version, payload)
//! ComputationRecords(node, input_key_set, parameter_fingerprint, status,
//!                    output_key, output_revision, content_hash, error_reason)
//! Selections(target, root_key, parameters)
//! ```
//!
//! Entity rows are append-only per key: a revision adds a row and leaves
//! the earlier ones readable.
//!
//! # Example
//!
//! ```rust
//! use spyglass_core::schema::{Entity, EntityKey};
//! use spyglass_core::store::{MemoryStore, Store};
//!
//! # fn main() -> spyglass_core::Result<()> {
//! let store = MemoryStore::new();
//! let key = EntityKey::new().with("subject", "A");
//! let entity = Entity::new("Session", key.clone());
//!
//! assert!(store.insert_entity_if_absent(entity.clone())?.is_none());
//! // Second insert reports the stored row instead of overwriting it
//! assert_eq!(store.insert_entity_if_absent(entity.clone())?, Some(entity));
//! assert!(store.get_entity("Session", &key)?.is_some());
//! # Ok(())
//! # }
//! ```

mod memory;
mod snapshot;

pub use memory::MemoryStore;
pub use snapshot::Snapshot;

use crate::engine::{CacheKey, ComputationRecord};
use crate::resolver::Request;
use crate::schema::{Entity, EntityKey, EntityType, ParameterSet};
use crate::Result;

/// Storage backend for the three logical tables plus entity type
/// definitions.
pub trait Store: Send + Sync {
    /// Store an entity type definition, replacing any previous one.
    fn put_entity_type(&self, entity_type: EntityType) -> Result<()>;

    /// All stored entity type definitions, ordered by name.
    fn entity_types(&self) -> Result<Vec<EntityType>>;

    /// Insert an entity unless one with the same type and key exists.
    ///
    /// Returns the latest stored revision on conflict (nothing is written).
    fn insert_entity_if_absent(&self, entity: Entity) -> Result<Option<Entity>>;

    /// Atomically append the next revision of an existing entity.
    ///
    /// Returns `None` when no entity has that type and key. When the latest
    /// revision already carries the same payload nothing is written and that
    /// revision is returned; otherwise the new revision is returned.
    fn revise_entity(&self, entity: Entity) -> Result<Option<Entity>>;

    /// Atomically insert revision 0 or append the next revision, returning
    /// the revision that is now latest.
    fn upsert_entity(&self, entity: Entity) -> Result<Entity>;

    /// Write one entity row at exactly its own revision, replacing a row with
    /// the same revision. Used to restore saved history.
    fn put_entity(&self, entity: Entity) -> Result<Option<Entity>>;

    /// Remove one revision of an entity, returning it if it existed.
    fn remove_entity_revision(
        &self,
        entity_type: &str,
        key: &EntityKey,
        revision: u32,
    ) -> Result<Option<Entity>>;

    /// Get the latest revision of one entity.
    fn get_entity(&self, entity_type: &str, key: &EntityKey) -> Result<Option<Entity>>;

    /// Get one specific revision of an entity.
    fn get_entity_revision(
        &self,
        entity_type: &str,
        key: &EntityKey,
        revision: u32,
    ) -> Result<Option<Entity>>;

    /// Every stored revision of one entity, oldest first.
    fn entity_revisions(&self, entity_type: &str, key: &EntityKey) -> Result<Vec<Entity>>;

    /// The latest revision of every entity of a type, ordered by key.
    fn entities(&self, entity_type: &str) -> Result<Vec<Entity>>;

    /// Insert a parameter set version unless `(kind, name, version)` exists.
    ///
    /// Returns the already-stored version on conflict.
    fn insert_parameter_set_if_absent(&self, params: ParameterSet) -> Result<Option<ParameterSet>>;

    /// All versions of a named parameter set, ordered by version.
    fn parameter_versions(&self, kind: &str, name: &str) -> Result<Vec<ParameterSet>>;

    /// All parameter sets, ordered by kind, name and version.
    fn parameter_sets(&self) -> Result<Vec<ParameterSet>>;

    /// Insert or replace the current computation record for its cache key,
    /// returning the previous record.
    fn put_computation(&self, record: ComputationRecord) -> Result<Option<ComputationRecord>>;

    /// Get the current computation record for a cache key.
    fn get_computation(&self, key: &CacheKey) -> Result<Option<ComputationRecord>>;

    /// All current computation records, ordered by cache key.
    fn computations(&self) -> Result<Vec<ComputationRecord>>;

    /// Keep a superseded record as history.
    fn archive_computation(&self, record: ComputationRecord) -> Result<()>;

    /// All superseded records in archival order.
    fn superseded_computations(&self) -> Result<Vec<ComputationRecord>>;

    /// Drop all superseded records, returning how many were removed.
    fn clear_superseded(&self) -> Result<usize>;

    /// Persist a selection. Returns `false` when it was already stored.
    fn insert_selection(&self, selection: Request) -> Result<bool>;

    /// All persisted selections in order.
    fn selections(&self) -> Result<Vec<Request>>;
}

/// Append `entity` to a revision history, returning the revision that is now
/// latest.
///
/// An unchanged payload keeps the latest revision. Histories are kept in
/// ascending revision order.
pub(crate) fn append_revision(history: &mut Vec<Entity>, entity: Entity) -> Entity {
    let next = match history.last() {
        Some(latest) if latest.same_payload(&entity) => return latest.clone(),
        Some(latest) => latest.revision() + 1,
        None => 0,
    };
    let stored = entity.with_revision(next);
    history.push(stored.clone());
    stored
}
