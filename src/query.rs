//! Query/Export interface.
//!
//! Read-only views over stored entities and computation history for
//! downstream export and visualization tools.
//!
//! A complete record is *stale* when the stored inputs no longer hash to the
//! digest it ran on, or when any upstream output it read is itself stale or
//! no longer backed by a complete record. Staleness is computed at query
//! time; nothing is recomputed until the result is requested again.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::engine::{content_hash, CacheKey, ComputationRecord, ComputationStatus};
use crate::schema::{Entity, EntityKey, Schema};
use crate::store::Store;
use crate::{Error, Result};

/// One computation attempt as seen by export tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationSummary {
    /// Node (output entity type)
    pub node: String,
    /// Output entity key
    pub output_key: EntityKey,
    /// Revision of the output entity this attempt produced
    #[serde(default)]
    pub output_revision: Option<u32>,
    /// Final or current status
    pub status: ComputationStatus,
    /// Attempt number for this cache key, starting at 1
    pub attempt: u32,
    /// Content hash of the inputs the attempt ran on
    pub content_hash: String,
    /// Failure reason, for failed attempts
    pub error_reason: Option<String>,
    /// When the compute function started
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt finished
    pub ended_at: Option<DateTime<Utc>>,
    /// Set once a newer attempt replaced this one
    pub superseded_at: Option<DateTime<Utc>>,
    /// Whether the inputs changed since this attempt completed. Always
    /// `false` for superseded and unfinished attempts.
    #[serde(default)]
    pub stale: bool,
}

impl ComputationSummary {
    /// Whether this is historical (replaced by a newer attempt).
    #[must_use]
    pub const fn is_superseded(&self) -> bool {
        self.superseded_at.is_some()
    }
}

impl From<&ComputationRecord> for ComputationSummary {
    fn from(record: &ComputationRecord) -> Self {
        Self {
            node: record.node().to_string(),
            output_key: record.output_key().clone(),
            output_revision: record.output_revision(),
            status: record.status(),
            attempt: record.attempt(),
            content_hash: record.content_hash().to_string(),
            error_reason: record.error_reason().map(str::to_string),
            started_at: record.started_at(),
            ended_at: record.ended_at(),
            superseded_at: record.superseded_at(),
            stale: false,
        }
    }
}

/// Decides whether complete records still match the stored inputs.
///
/// Walks upstream through the records that produced each input, remembering
/// every verdict, so one pass over a store is linear in its records.
pub(crate) struct StalenessCheck<'a> {
    store: &'a dyn Store,
    producers: FxHashMap<(String, EntityKey), ComputationRecord>,
    verdicts: FxHashMap<CacheKey, bool>,
}

impl<'a> StalenessCheck<'a> {
    pub(crate) fn new(store: &'a dyn Store) -> Result<Self> {
        let producers = store
            .computations()?
            .into_iter()
            .map(|r| ((r.node().to_string(), r.output_key().clone()), r))
            .collect();
        Ok(Self {
            store,
            producers,
            verdicts: FxHashMap::default(),
        })
    }

    /// Current record that produced `(entity_type, key)`, if it is derived.
    pub(crate) fn producer(&self, entity_type: &str, key: &EntityKey) -> Option<&ComputationRecord> {
        self.producers.get(&(entity_type.to_string(), key.clone()))
    }

    /// Whether a complete record no longer reflects its inputs.
    pub(crate) fn is_stale(&mut self, record: &ComputationRecord) -> Result<bool> {
        if record.status() != ComputationStatus::Complete {
            return Ok(false);
        }
        if let Some(&verdict) = self.verdicts.get(record.cache_key()) {
            return Ok(verdict);
        }
        let verdict = self.check(record)?;
        self.verdicts.insert(record.cache_key().clone(), verdict);
        Ok(verdict)
    }

    fn check(&mut self, record: &ComputationRecord) -> Result<bool> {
        let cache_key = record.cache_key();
        let mut inputs = Vec::with_capacity(cache_key.input_keys().len());
        for (entity_type, key) in cache_key.input_keys() {
            match self.store.get_entity(entity_type, key)? {
                Some(input) => inputs.push(input),
                None => return Ok(true),
            }
        }
        if content_hash(&inputs, cache_key.parameter_fingerprint())? != record.content_hash() {
            return Ok(true);
        }
        for (entity_type, key) in cache_key.input_keys() {
            let Some(upstream) = self.producer(entity_type, key).cloned() else {
                continue;
            };
            if upstream.status() != ComputationStatus::Complete || self.is_stale(&upstream)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Whether a stored entity is out of date with respect to its inputs.
///
/// Raw entities are never stale. A derived entity is stale when its current
/// record is not complete or its inputs changed since it completed.
///
/// # Errors
///
/// Returns `UnknownEntityType` or `NotFound`.
pub fn is_stale(schema: &Schema, entity_type: &str, key: &EntityKey) -> Result<bool> {
    schema.get(entity_type, key)?;
    let mut check = StalenessCheck::new(schema.store().as_ref())?;
    match check.producer(entity_type, key).cloned() {
        None => Ok(false),
        Some(record) if record.status() != ComputationStatus::Complete => Ok(true),
        Some(record) => check.is_stale(&record),
    }
}

/// Get one entity.
///
/// # Errors
///
/// Returns `UnknownEntityType` or `NotFound`.
pub fn fetch(schema: &Schema, entity_type: &str, key: &EntityKey) -> Result<Entity> {
    schema.get(entity_type, key)
}

/// Get the exact output an attempt produced, even if it was superseded and
/// the entity has been revised since.
///
/// # Errors
///
/// Returns `NotFound` if the attempt did not complete or its output revision
/// is no longer stored.
pub fn fetch_output(schema: &Schema, summary: &ComputationSummary) -> Result<Entity> {
    if summary.status != ComputationStatus::Complete {
        return Err(Error::NotFound {
            entity_type: summary.node.clone(),
            key: format!(
                "{} (attempt {} is {:?} and produced no output)",
                summary.output_key, summary.attempt, summary.status
            ),
        });
    }
    match summary.output_revision {
        Some(revision) => schema.get_revision(&summary.node, &summary.output_key, revision),
        None => schema.get(&summary.node, &summary.output_key),
    }
}

/// All computation attempts that produced (or tried to produce) entities of
/// `entity_type`, current and superseded, ordered by output key then
/// attempt. Current complete attempts carry their staleness.
///
/// # Errors
///
/// Returns `UnknownEntityType` if the type was never defined.
pub fn list_computations(schema: &Schema, entity_type: &str) -> Result<Vec<ComputationSummary>> {
    schema.entity_type(entity_type)?;
    let store = schema.store();
    let mut check = StalenessCheck::new(store.as_ref())?;
    let current = store.computations()?;
    let history = store.superseded_computations()?;

    let mut summaries = Vec::new();
    for record in current.iter().filter(|r| r.node() == entity_type) {
        let mut summary = ComputationSummary::from(record);
        summary.stale = check.is_stale(record)?;
        summaries.push(summary);
    }
    summaries.extend(
        history
            .iter()
            .filter(|r| r.node() == entity_type)
            .map(ComputationSummary::from),
    );
    summaries.sort_by(|a, b| {
        a.output_key
            .cmp(&b.output_key)
            .then(a.attempt.cmp(&b.attempt))
            .then(a.superseded_at.is_none().cmp(&b.superseded_at.is_none()))
    });
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CacheKey;
    use crate::schema::{FieldSpec, FieldType};
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[test]
    fn test_list_includes_superseded_history() {
        let schema = Schema::new(Arc::new(MemoryStore::new()));
        schema
            .define_entity_type("LFP", vec![FieldSpec::required("subject", FieldType::String)], vec![])
            .unwrap();
        let key = EntityKey::new().with("subject", "A");
        let cache_key = CacheKey::new("LFP", BTreeMap::new(), "sha256:ab");

        let mut first = ComputationRecord::new(cache_key.clone(), key.clone(), "sha256:01");
        first.start();
        first.fail("boom");
        first.supersede();
        schema.store().archive_computation(first).unwrap();

        let hash = content_hash(&[], "sha256:ab").unwrap();
        let mut second = ComputationRecord::new(cache_key, key, hash).with_attempt(2);
        second.start();
        second.complete(0);
        schema.store().put_computation(second).unwrap();

        let listed = list_computations(&schema, "LFP").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].attempt, 1);
        assert!(listed[0].is_superseded());
        assert_eq!(listed[0].error_reason.as_deref(), Some("boom"));
        assert_eq!(listed[1].status, ComputationStatus::Complete);
        assert_eq!(listed[1].output_revision, Some(0));
        assert!(!listed[1].is_superseded());
        assert!(!listed[1].stale);

        assert!(matches!(
            fetch_output(&schema, &listed[0]),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_staleness_follows_input_hash() {
        let schema = Schema::new(Arc::new(MemoryStore::new()));
        schema
            .define_entity_type("Recording", vec![FieldSpec::required("subject", FieldType::String)], vec![])
            .unwrap();
        schema
            .define_entity_type("LFP", vec![FieldSpec::required("subject", FieldType::String)], vec![])
            .unwrap();
        let key = EntityKey::new().with("subject", "A");
        let input = Entity::builder("Recording").with_key(key.clone()).field("rate", 1).build();
        schema.store().insert_entity_if_absent(input.clone()).unwrap();
        schema
            .store()
            .upsert_entity(Entity::builder("LFP").with_key(key.clone()).build())
            .unwrap();

        let inputs = BTreeMap::from([("Recording".to_string(), key.clone())]);
        let cache_key = CacheKey::new("LFP", inputs, "sha256:ab");
        let hash = content_hash(std::slice::from_ref(&input), "sha256:ab").unwrap();
        let mut record = ComputationRecord::new(cache_key, key.clone(), hash);
        record.start();
        record.complete(0);
        schema.store().put_computation(record).unwrap();

        assert!(!is_stale(&schema, "LFP", &key).unwrap());
        assert!(!is_stale(&schema, "Recording", &key).unwrap());

        schema
            .store()
            .revise_entity(Entity::builder("Recording").with_key(key.clone()).field("rate", 2).build())
            .unwrap();
        assert!(is_stale(&schema, "LFP", &key).unwrap());
        assert!(list_computations(&schema, "LFP").unwrap()[0].stale);
    }

    #[test]
    fn test_list_unknown_type() {
        let schema = Schema::new(Arc::new(MemoryStore::new()));
        assert!(list_computations(&schema, "Nope").is_err());
    }
}
