//! In-memory store implementation using `DashMap`.
//!
//! This is the default backend - data is lost on process restart unless a
//! [`Snapshot`](super::Snapshot) is saved.

use std::sync::{Mutex, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use rustc_hash::FxBuildHasher;

use super::{append_revision, Store};
use crate::engine::{CacheKey, ComputationRecord};
use crate::resolver::Request;
use crate::schema::{Entity, EntityKey, EntityType, ParameterSet};
use crate::Result;

type EntityRow = (String, EntityKey);
type ParameterRow = (String, String, u32);

/// In-memory store using lock-free concurrent hashmaps.
///
/// Thread-safe; every read-modify-write on an entity goes through the map's
/// entry API, which holds the shard lock, so two concurrent inserts or
/// revisions of the same key cannot interleave.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entity_types: DashMap<String, EntityType, FxBuildHasher>,
    // Revisions of one entity in ascending order, never empty
    entities: DashMap<EntityRow, Vec<Entity>, FxBuildHasher>,
    parameters: DashMap<ParameterRow, ParameterSet, FxBuildHasher>,
    computations: DashMap<CacheKey, ComputationRecord, FxBuildHasher>,
    superseded: Mutex<Vec<ComputationRecord>>,
    selections: DashSet<Request, FxBuildHasher>,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities across all types, counting each key once.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of stored entity rows, counting every revision.
    #[must_use]
    pub fn revision_count(&self) -> usize {
        self.entities.iter().map(|row| row.value().len()).sum()
    }

    /// Number of current computation records.
    #[must_use]
    pub fn computation_count(&self) -> usize {
        self.computations.len()
    }

    /// Check if the store holds no entities, parameter sets or records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.parameters.is_empty() && self.computations.is_empty()
    }

    fn row(entity_type: &str, key: &EntityKey) -> EntityRow {
        (entity_type.to_string(), key.clone())
    }
}

impl Store for MemoryStore {
    fn put_entity_type(&self, entity_type: EntityType) -> Result<()> {
        self.entity_types
            .insert(entity_type.name().to_string(), entity_type);
        Ok(())
    }

    fn entity_types(&self) -> Result<Vec<EntityType>> {
        let mut types: Vec<EntityType> = self.entity_types.iter().map(|t| t.value().clone()).collect();
        types.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(types)
    }

    fn insert_entity_if_absent(&self, entity: Entity) -> Result<Option<Entity>> {
        let row = Self::row(entity.entity_type(), entity.key());
        match self.entities.entry(row) {
            Entry::Occupied(existing) => Ok(existing.get().last().cloned()),
            Entry::Vacant(slot) => {
                slot.insert(vec![entity.with_revision(0)]);
                Ok(None)
            }
        }
    }

    fn revise_entity(&self, entity: Entity) -> Result<Option<Entity>> {
        let row = Self::row(entity.entity_type(), entity.key());
        match self.entities.entry(row) {
            Entry::Occupied(mut history) => Ok(Some(append_revision(history.get_mut(), entity))),
            Entry::Vacant(_) => Ok(None),
        }
    }

    fn upsert_entity(&self, entity: Entity) -> Result<Entity> {
        let row = Self::row(entity.entity_type(), entity.key());
        let mut history = self.entities.entry(row).or_default();
        Ok(append_revision(history.value_mut(), entity))
    }

    fn put_entity(&self, entity: Entity) -> Result<Option<Entity>> {
        let row = Self::row(entity.entity_type(), entity.key());
        let mut history = self.entities.entry(row).or_default();
        let history = history.value_mut();
        match history.binary_search_by_key(&entity.revision(), Entity::revision) {
            Ok(at) => Ok(Some(std::mem::replace(&mut history[at], entity))),
            Err(at) => {
                history.insert(at, entity);
                Ok(None)
            }
        }
    }

    fn remove_entity_revision(
        &self,
        entity_type: &str,
        key: &EntityKey,
        revision: u32,
    ) -> Result<Option<Entity>> {
        match self.entities.entry(Self::row(entity_type, key)) {
            Entry::Occupied(mut history) => {
                let removed = match history
                    .get()
                    .binary_search_by_key(&revision, Entity::revision)
                {
                    Ok(at) => Some(history.get_mut().remove(at)),
                    Err(_) => None,
                };
                if history.get().is_empty() {
                    history.remove();
                }
                Ok(removed)
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    fn get_entity(&self, entity_type: &str, key: &EntityKey) -> Result<Option<Entity>> {
        Ok(self
            .entities
            .get(&Self::row(entity_type, key))
            .and_then(|history| history.last().cloned()))
    }

    fn get_entity_revision(
        &self,
        entity_type: &str,
        key: &EntityKey,
        revision: u32,
    ) -> Result<Option<Entity>> {
        Ok(self.entities.get(&Self::row(entity_type, key)).and_then(|history| {
            history
                .binary_search_by_key(&revision, Entity::revision)
                .ok()
                .map(|at| history[at].clone())
        }))
    }

    fn entity_revisions(&self, entity_type: &str, key: &EntityKey) -> Result<Vec<Entity>> {
        Ok(self
            .entities
            .get(&Self::row(entity_type, key))
            .map(|history| history.value().clone())
            .unwrap_or_default())
    }

    fn entities(&self, entity_type: &str) -> Result<Vec<Entity>> {
        let mut found: Vec<Entity> = self
            .entities
            .iter()
            .filter(|row| row.key().0 == entity_type)
            .filter_map(|row| row.value().last().cloned())
            .collect();
        found.sort_by(|a, b| a.key().cmp(b.key()));
        Ok(found)
    }

    fn insert_parameter_set_if_absent(&self, params: ParameterSet) -> Result<Option<ParameterSet>> {
        let row = (params.kind().to_string(), params.name().to_string(), params.version());
        match self.parameters.entry(row) {
            Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(params);
                Ok(None)
            }
        }
    }

    fn parameter_versions(&self, kind: &str, name: &str) -> Result<Vec<ParameterSet>> {
        let mut versions: Vec<ParameterSet> = self
            .parameters
            .iter()
            .filter(|p| p.kind() == kind && p.name() == name)
            .map(|p| p.value().clone())
            .collect();
        versions.sort_by_key(ParameterSet::version);
        Ok(versions)
    }

    fn parameter_sets(&self) -> Result<Vec<ParameterSet>> {
        let mut all: Vec<ParameterSet> = self.parameters.iter().map(|p| p.value().clone()).collect();
        all.sort_by(|a, b| {
            (a.kind(), a.name(), a.version()).cmp(&(b.kind(), b.name(), b.version()))
        });
        Ok(all)
    }

    fn put_computation(&self, record: ComputationRecord) -> Result<Option<ComputationRecord>> {
        Ok(self.computations.insert(record.cache_key().clone(), record))
    }

    fn get_computation(&self, key: &CacheKey) -> Result<Option<ComputationRecord>> {
        Ok(self.computations.get(key).map(|r| r.value().clone()))
    }

    fn computations(&self) -> Result<Vec<ComputationRecord>> {
        let mut all: Vec<ComputationRecord> =
            self.computations.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.cache_key().cmp(b.cache_key()));
        Ok(all)
    }

    fn archive_computation(&self, record: ComputationRecord) -> Result<()> {
        self.superseded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }

    fn superseded_computations(&self) -> Result<Vec<ComputationRecord>> {
        Ok(self
            .superseded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn clear_superseded(&self) -> Result<usize> {
        let mut archived = self.superseded.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = archived.len();
        archived.clear();
        Ok(removed)
    }

    fn insert_selection(&self, selection: Request) -> Result<bool> {
        Ok(self.selections.insert(selection))
    }

    fn selections(&self) -> Result<Vec<Request>> {
        let mut all: Vec<Request> = self.selections.iter().map(|s| s.key().clone()).collect();
        all.sort();
        Ok(all)
    }
}
