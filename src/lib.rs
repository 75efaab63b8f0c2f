//! # spyglass-core: Reproducible Neuroscience Pipeline Core
//!
//! **Version**: 0.1.0
//!
//! spyglass-core keeps typed scientific records (sessions, recordings,
//! parameter sets), a graph of computation nodes deriving new records from
//! them, and an execution engine that computes each derived record once per
//! (inputs, parameters) combination and reuses it until its inputs change.
//!
//! ## Design Principles
//!
//! - **Determinism**: identical requests yield identical execution plans
//! - **Reuse**: a complete computation is never repeated for unchanged inputs
//! - **Provenance**: every attempt leaves a computation record; superseded
//!   attempts are archived, not deleted, and entity revisions are appended,
//!   so every archived attempt can still reach the exact output it produced
//! - **Isolation**: a failing node blocks only what depends on it
//!
//! ## Example Usage
//!
//! ```rust
//! use spyglass_core::resolver::Request;
//! use spyglass_core::schema::{Entity, EntityKey, FieldSpec, FieldType, Fields};
//! use spyglass_core::Pipeline;
//!
//! # fn main() -> spyglass_core::Result<()> {
//! let pipeline = Pipeline::new()?;
//! pipeline.define_entity_type(
//!     "Recording",
//!     vec![FieldSpec::required("subject", FieldType::String)],
//!     vec![FieldSpec::required("sampling_rate", FieldType::Float)],
//! )?;
//! pipeline.define_derived_type(
//!     "LFP",
//!     &["Recording"],
//!     "filter",
//!     vec![FieldSpec::required("cutoff", FieldType::Float)],
//! )?;
//! pipeline.register_parameter_set("filter", "lfp_400hz", serde_json::json!({"cutoff": 400.0}))?;
//! pipeline.register_node("LFP", &["Recording"], "filter", |ctx| {
//!     let mut out = Fields::new();
//!     out.insert("cutoff".into(), ctx.parameters.get("cutoff").cloned().unwrap_or_default());
//!     Ok(out)
//! })?;
//!
//! pipeline.insert(
//!     Entity::builder("Recording")
//!         .key("subject", "A")
//!         .field("sampling_rate", 30000.0)
//!         .build(),
//! )?;
//!
//! let request = Request::new("LFP", EntityKey::new().with("subject", "A"))
//!     .with_parameters("lfp_400hz");
//! let lfp = pipeline.request(&request)?;
//! assert_eq!(lfp.field("cutoff"), Some(&serde_json::json!(400.0)));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod engine;
pub mod error;
pub mod hash;
pub mod ingest;
pub mod query;
pub mod registry;
pub mod resolver;
#[cfg(feature = "tokio")]
pub mod runtime;
pub mod schema;
pub mod store;

pub use config::PipelineConfig;
pub use error::{Error, Result};

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::engine::{CancelToken, ComputationStatus, Engine, ExecutionReport};
use crate::ingest::{IngestReport, IngestionAdapter};
use crate::query::{ComputationSummary, StalenessCheck};
use crate::registry::{compute_fn, ComputationNode, ComputeContext, Registry};
use crate::resolver::{ExecutionPlan, Request};
use crate::schema::{
    params_key_field, Entity, EntityKey, EntityType, FieldSpec, FieldType, Fields, InsertOutcome,
    ParameterSet, Schema,
};
use crate::store::{MemoryStore, Snapshot, Store};

/// Pipeline context: schema layer, node registry and execution engine over
/// one store. Several pipelines can coexist in one process.
pub struct Pipeline {
    schema: Schema,
    registry: RwLock<Registry>,
    engine: Engine,
    config: PipelineConfig,
    #[cfg(feature = "rayon")]
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("schema", &self.schema)
            .field("engine", &self.engine)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`Pipeline::populate`] and
/// [`Pipeline::populate_selections`].
#[derive(Debug, Default)]
pub struct PopulateReport {
    /// Target entities computed or served from cache
    pub completed: Vec<Entity>,
    /// Requests that failed, with the error
    pub failed: Vec<(Request, Error)>,
}

impl PopulateReport {
    /// Check if every root key combination succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Pipeline {
    /// Create a pipeline builder
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Create a pipeline over an empty in-memory store with default
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the worker pool cannot be created.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Get the configuration the pipeline was built with.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Get the schema layer.
    #[must_use]
    pub const fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Get the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        self.schema.store()
    }

    /// Get the execution engine.
    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- Entity Schema Layer ----

    /// Define a root entity type.
    ///
    /// # Errors
    ///
    /// See [`Schema::define_entity_type`].
    pub fn define_entity_type(
        &self,
        name: &str,
        key_fields: Vec<FieldSpec>,
        value_fields: Vec<FieldSpec>,
    ) -> Result<EntityType> {
        self.schema.define_entity_type(name, key_fields, value_fields)
    }

    /// Define the output type of a derivation: its key is the union of the
    /// input types' key fields plus a `<parameter_kind>_params` string field.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` if an input type is undefined, and
    /// `SchemaConflict` if inputs disagree on the type of a shared key field
    /// or `name` exists with another key shape.
    pub fn define_derived_type(
        &self,
        name: &str,
        input_types: &[&str],
        parameter_kind: &str,
        value_fields: Vec<FieldSpec>,
    ) -> Result<EntityType> {
        let key_fields = self.derived_key_fields(name, input_types, parameter_kind)?;
        self.schema.define_entity_type(name, key_fields, value_fields)
    }

    fn derived_key_fields(
        &self,
        name: &str,
        input_types: &[&str],
        parameter_kind: &str,
    ) -> Result<Vec<FieldSpec>> {
        let mut fields: Vec<FieldSpec> = Vec::new();
        for input in input_types {
            for field in self.schema.entity_type(input)?.key_fields() {
                match fields.iter().find(|f| f.name() == field.name()) {
                    Some(seen) if seen.field_type() != field.field_type() => {
                        return Err(Error::conflict(
                            name,
                            format!(
                                "inputs disagree on the type of key field '{}'",
                                field.name()
                            ),
                        ));
                    }
                    Some(_) => {}
                    None => fields.push(field.clone()),
                }
            }
        }
        let params_field = params_key_field(parameter_kind);
        if !fields.iter().any(|f| f.name() == params_field) {
            fields.push(FieldSpec::required(params_field, FieldType::String));
        }
        Ok(fields)
    }

    /// Validate and insert a record.
    ///
    /// # Errors
    ///
    /// Returns `SchemaConflict` if a registered node produces this type;
    /// otherwise see [`Schema::insert`].
    pub fn insert(&self, entity: Entity) -> Result<InsertOutcome> {
        self.ensure_not_computed(entity.entity_type())?;
        self.schema.insert(entity)
    }

    /// Derived entities are only written by their node, with a computation
    /// record alongside.
    fn ensure_not_computed(&self, entity_type: &str) -> Result<()> {
        if self.registry().is_derived(entity_type) {
            return Err(Error::conflict(
                entity_type,
                "entities of this type are written only by its computation node",
            ));
        }
        Ok(())
    }

    /// Get a record by key.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` or `NotFound`.
    pub fn get(&self, entity_type: &str, key: &EntityKey) -> Result<Entity> {
        self.schema.get(entity_type, key)
    }

    /// Get one specific revision of a record.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` or `NotFound`.
    pub fn get_revision(&self, entity_type: &str, key: &EntityKey, revision: u32) -> Result<Entity> {
        self.schema.get_revision(entity_type, key, revision)
    }

    /// Every stored revision of a record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` if the type was never defined.
    pub fn revisions(&self, entity_type: &str, key: &EntityKey) -> Result<Vec<Entity>> {
        self.schema.revisions(entity_type, key)
    }

    /// Store a changed payload as a new revision. Derived records computed
    /// from the old revision become stale and are recomputed on request.
    ///
    /// # Errors
    ///
    /// Returns `SchemaConflict` if a registered node produces this type;
    /// otherwise see [`Schema::revise`].
    pub fn revise(&self, entity: Entity) -> Result<Entity> {
        self.ensure_not_computed(entity.entity_type())?;
        self.schema.revise(entity)
    }

    /// All records of a type, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` if the type was never defined.
    pub fn entities(&self, entity_type: &str) -> Result<Vec<Entity>> {
        self.schema.entities(entity_type)
    }

    /// Register a (versioned) parameter set.
    ///
    /// # Errors
    ///
    /// See [`Schema::register_parameter_set`].
    pub fn register_parameter_set(&self, kind: &str, name: &str, payload: Value) -> Result<ParameterSet> {
        self.schema.register_parameter_set(kind, name, payload)
    }

    /// Register the `default` parameter set of a kind, unless one exists.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the write.
    pub fn insert_default_parameters(&self, kind: &str, payload: Value) -> Result<ParameterSet> {
        self.schema.insert_default_parameters(kind, payload)
    }

    /// Get a parameter set (latest version if `version` is `None`).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such set or version exists.
    pub fn parameter_set(&self, kind: &str, name: &str, version: Option<u32>) -> Result<ParameterSet> {
        self.schema.parameter_set(kind, name, version)
    }

    // ---- Computation Node Registry ----

    /// Declare a computation node producing `output_type`.
    ///
    /// # Errors
    ///
    /// - `UnknownEntityType` if the output or an input type is undefined
    /// - `SchemaConflict` if the output type's key is not the derived key
    ///   shape (see [`define_derived_type`](Self::define_derived_type)) or a
    ///   node already produces it
    /// - `CycleDetected` if the node would close a cycle
    pub fn register_node<F>(
        &self,
        output_type: &str,
        input_types: &[&str],
        parameter_type: &str,
        compute: F,
    ) -> Result<()>
    where
        F: Fn(&ComputeContext<'_>) -> anyhow::Result<Fields> + Send + Sync + 'static,
    {
        let output = self.schema.entity_type(output_type)?;
        let expected: BTreeSet<String> = self
            .derived_key_fields(output_type, input_types, parameter_type)?
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        let actual: BTreeSet<String> = output.key_names().map(str::to_string).collect();
        if expected != actual {
            return Err(Error::conflict(
                output_type,
                format!(
                    "output key ({}) must be the inputs' key fields plus {} ({})",
                    actual.into_iter().collect::<Vec<_>>().join(", "),
                    params_key_field(parameter_type),
                    expected.into_iter().collect::<Vec<_>>().join(", "),
                ),
            ));
        }

        self.registry_mut()
            .register_node(output_type, input_types, parameter_type, compute_fn(compute))?;
        info!(
            node = output_type,
            inputs = ?input_types,
            parameter_type,
            "registered computation node"
        );
        Ok(())
    }

    /// Remove a computation node. Stored outputs and records stay.
    ///
    /// # Errors
    ///
    /// Returns `UnknownDerivation`, or `SchemaConflict` while other nodes
    /// consume its output.
    pub fn unregister_node(&self, output_type: &str) -> Result<()> {
        self.registry_mut().unregister_node(output_type)?;
        info!(node = output_type, "unregistered computation node");
        Ok(())
    }

    /// Look up the node producing `output_type`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownDerivation` if no node produces it.
    pub fn resolve_node(&self, output_type: &str) -> Result<ComputationNode> {
        self.registry().resolve_node(output_type).cloned()
    }

    /// Output types of all registered nodes, in declaration order.
    #[must_use]
    pub fn node_names(&self) -> Vec<String> {
        self.registry()
            .nodes()
            .into_iter()
            .map(|n| n.output_type().to_string())
            .collect()
    }

    // ---- Resolver + Engine ----

    /// Build the execution plan for a request without running it.
    ///
    /// # Errors
    ///
    /// See [`resolver::resolve`].
    pub fn plan(&self, request: &Request) -> Result<ExecutionPlan> {
        resolver::resolve(&self.registry(), &self.schema, request)
    }

    /// Compute (or fetch from cache) the requested entity.
    ///
    /// # Errors
    ///
    /// Resolver errors abort before anything runs; a failing node yields
    /// `ComputationFailed`.
    pub fn request(&self, request: &Request) -> Result<Entity> {
        self.execute(request, None).map(ExecutionReport::into_output)
    }

    /// Like [`request`](Self::request), honoring `cancel` before each step
    /// starts running.
    ///
    /// # Errors
    ///
    /// Additionally returns `Cancelled` if the token fired before a step
    /// started.
    pub fn request_with_cancel(&self, request: &Request, cancel: &CancelToken) -> Result<Entity> {
        self.execute(request, Some(cancel)).map(ExecutionReport::into_output)
    }

    /// Run a request and return the per-step report.
    ///
    /// # Errors
    ///
    /// As [`request_with_cancel`](Self::request_with_cancel).
    pub fn execute(&self, request: &Request, cancel: Option<&CancelToken>) -> Result<ExecutionReport> {
        let (plan, nodes) = {
            let registry = self.registry();
            let plan = resolver::resolve(&registry, &self.schema, request)?;
            let nodes = plan
                .steps()
                .iter()
                .map(|step| registry.resolve_node(step.node()).cloned())
                .collect::<Result<Vec<_>>>()?;
            (plan, nodes)
        };
        debug!(target_type = plan.target(), order = ?plan.node_order(), "executing plan");
        let report = self.engine.execute(&self.schema, &plan, &nodes, cancel)?;
        info!(
            target_type = plan.target(),
            key = %report.output().key(),
            computed = report.computed_count(),
            cached = report.cached_count(),
            "request complete"
        );
        Ok(report)
    }

    /// Compute `template.target()` for every combination of root entities
    /// agreeing with `template.root_key()` (an empty key selects all).
    ///
    /// Combinations are the natural join of the root types' stored keys.
    /// They run in parallel when the `rayon` feature is enabled.
    ///
    /// # Errors
    ///
    /// Returns error only if the combinations cannot be enumerated;
    /// per-combination failures are collected in the report.
    pub fn populate(&self, template: &Request) -> Result<PopulateReport> {
        let roots = resolver::root_types(&self.registry(), template.target())?;
        let mut combos = vec![template.root_key().clone()];
        for root in &roots {
            let keys: Vec<EntityKey> = self
                .schema
                .entities(root)?
                .into_iter()
                .map(|e| e.key().clone())
                .collect();
            combos = combos
                .iter()
                .flat_map(|combo| keys.iter().filter_map(move |key| combo.merge(key)))
                .collect();
        }
        info!(
            target_type = template.target(),
            combinations = combos.len(),
            "populating"
        );

        let requests: Vec<Request> = combos.into_iter().map(|key| template.for_key(key)).collect();
        Ok(self.run_all(requests))
    }

    fn run_all(&self, requests: Vec<Request>) -> PopulateReport {
        let results = self.run_each(&requests);
        let mut report = PopulateReport::default();
        for (request, result) in requests.into_iter().zip(results) {
            match result {
                Ok(entity) => report.completed.push(entity),
                Err(err) => {
                    warn!(
                        target_type = request.target(),
                        key = %request.root_key(),
                        error = %err,
                        "populate entry failed"
                    );
                    report.failed.push((request, err));
                }
            }
        }
        report
    }

    #[cfg(feature = "rayon")]
    fn run_each(&self, requests: &[Request]) -> Vec<Result<Entity>> {
        let run = || requests.par_iter().map(|r| self.request(r)).collect();
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }

    #[cfg(not(feature = "rayon"))]
    fn run_each(&self, requests: &[Request]) -> Vec<Result<Entity>> {
        requests.iter().map(|r| self.request(r)).collect()
    }

    // ---- Selections ----

    /// Persist a request as a selection, to be (re)computed by
    /// [`populate_selections`](Self::populate_selections).
    ///
    /// Returns `false` if the same selection was already stored.
    ///
    /// # Errors
    ///
    /// Returns `UnknownDerivation` if no node produces the target and
    /// `NotFound` for a parameter set that does not exist.
    pub fn select(&self, request: &Request) -> Result<bool> {
        self.registry().resolve_node(request.target())?;
        for parameter in request.parameters() {
            let kinds = self.schema.parameter_kinds_named(parameter.name())?;
            let known = kinds
                .iter()
                .any(|kind| self.schema.parameter_set(kind, parameter.name(), parameter.version()).is_ok());
            if !known {
                return Err(Error::NotFound {
                    entity_type: "parameter set".to_string(),
                    key: match parameter.version() {
                        Some(v) => format!("{}@v{v}", parameter.name()),
                        None => parameter.name().to_string(),
                    },
                });
            }
        }
        let inserted = self.store().insert_selection(request.clone())?;
        if inserted {
            info!(target_type = request.target(), key = %request.root_key(), "stored selection");
        }
        Ok(inserted)
    }

    /// Stored selections for `target`, in order.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn selections(&self, target: &str) -> Result<Vec<Request>> {
        Ok(self
            .store()
            .selections()?
            .into_iter()
            .filter(|s| s.target() == target)
            .collect())
    }

    /// Selections for `target` whose result is missing, failed or stale.
    ///
    /// A selection that cannot be planned right now (for example because a
    /// root entity is missing) is pending too.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn pending_selections(&self, target: &str) -> Result<Vec<Request>> {
        let selections = self.selections(target)?;
        let store = self.store();
        let mut check = StalenessCheck::new(store.as_ref())?;
        let mut pending = Vec::new();
        for selection in selections {
            let record = match self.plan(&selection) {
                Ok(plan) => match plan.steps().last() {
                    Some(step) => store.get_computation(&step.cache_key())?,
                    None => None,
                },
                Err(err) => {
                    debug!(target_type = target, key = %selection.root_key(), error = %err, "selection cannot be planned");
                    None
                }
            };
            let done = match record {
                Some(record) if record.status() == ComputationStatus::Complete => !check.is_stale(&record)?,
                _ => false,
            };
            if !done {
                pending.push(selection);
            }
        }
        Ok(pending)
    }

    /// Run every pending selection for `target`.
    ///
    /// # Errors
    ///
    /// Returns error only if the selections cannot be read; per-selection
    /// failures are collected in the report.
    pub fn populate_selections(&self, target: &str) -> Result<PopulateReport> {
        let pending = self.pending_selections(target)?;
        info!(target_type = target, pending = pending.len(), "populating selections");
        Ok(self.run_all(pending))
    }

    // ---- Ingestion / Query ----

    /// Store every entity an adapter produces, all or nothing. Entities
    /// already stored with an identical payload are counted as unchanged.
    ///
    /// The whole batch is checked before anything is written. If a write
    /// still fails (a concurrent insert of a conflicting payload), the
    /// entities this call inserted are removed again.
    ///
    /// # Errors
    ///
    /// Returns the adapter's error, `UnknownEntityType`, `ValidationError`
    /// if a pair's type disagrees with its entity or the payload is invalid,
    /// `SchemaConflict` for a type a node produces, or `DuplicateKey`.
    pub fn ingest<A: IngestionAdapter>(&self, adapter: &A, source: &A::Source) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut batch: BTreeMap<(String, EntityKey), Entity> = BTreeMap::new();
        for (entity_type, entity) in adapter.produce_entities(source)? {
            if entity.entity_type() != entity_type {
                return Err(Error::validation(
                    entity_type,
                    format!("adapter produced an entity of type '{}'", entity.entity_type()),
                ));
            }
            self.schema.entity_type(&entity_type)?.validate(&entity)?;
            self.ensure_not_computed(&entity_type)?;
            match batch.entry((entity_type, entity.key().clone())) {
                Entry::Occupied(seen) if seen.get().same_payload(&entity) => report.unchanged += 1,
                Entry::Occupied(seen) => {
                    return Err(Error::DuplicateKey {
                        entity_type: seen.key().0.clone(),
                        key: seen.key().1.clone(),
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(entity);
                }
            }
        }

        let mut fresh = Vec::with_capacity(batch.len());
        for ((entity_type, key), entity) in batch {
            match self.store().get_entity(&entity_type, &key)? {
                Some(stored) if stored.same_payload(&entity) => report.unchanged += 1,
                Some(_) => return Err(Error::DuplicateKey { entity_type, key }),
                None => fresh.push(entity),
            }
        }

        let mut written: Vec<(String, EntityKey)> = Vec::with_capacity(fresh.len());
        for entity in fresh {
            let row = (entity.entity_type().to_string(), entity.key().clone());
            match self.schema.insert_trusted(entity) {
                Ok(InsertOutcome::Inserted) => {
                    written.push(row);
                    report.inserted += 1;
                }
                Ok(InsertOutcome::Unchanged) => report.unchanged += 1,
                Err(err) => {
                    self.undo_ingest(&written);
                    return Err(err);
                }
            }
        }
        info!(inserted = report.inserted, unchanged = report.unchanged, "ingested entities");
        Ok(report)
    }

    fn undo_ingest(&self, written: &[(String, EntityKey)]) {
        for (entity_type, key) in written {
            if let Err(err) = self.store().remove_entity_revision(entity_type, key, 0) {
                error!(entity_type = %entity_type, key = %key, error = %err, "undo of ingested entity failed");
            }
        }
        warn!(removed = written.len(), "ingest rolled back");
    }

    /// Get one entity for export.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` or `NotFound`.
    pub fn fetch(&self, entity_type: &str, key: &EntityKey) -> Result<Entity> {
        query::fetch(&self.schema, entity_type, key)
    }

    /// Get the exact output entity revision an attempt produced.
    ///
    /// # Errors
    ///
    /// See [`query::fetch_output`].
    pub fn fetch_output(&self, summary: &ComputationSummary) -> Result<Entity> {
        query::fetch_output(&self.schema, summary)
    }

    /// Whether a stored entity is out of date with respect to its inputs.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` or `NotFound`.
    pub fn is_stale(&self, entity_type: &str, key: &EntityKey) -> Result<bool> {
        query::is_stale(&self.schema, entity_type, key)
    }

    /// Computation history of one entity type, superseded attempts included.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` if the type was never defined.
    pub fn list_computations(&self, entity_type: &str) -> Result<Vec<ComputationSummary>> {
        query::list_computations(&self.schema, entity_type)
    }

    /// Drop archived superseded computation records.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the delete.
    pub fn prune_superseded(&self) -> Result<usize> {
        let removed = self.store().clear_superseded()?;
        info!(removed, "pruned superseded computation records");
        Ok(removed)
    }

    // ---- Persistence ----

    /// Capture all tables.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn export_snapshot(&self) -> Result<Snapshot> {
        Snapshot::capture(self.store().as_ref())
    }

    /// Write a snapshot of all tables to `path`.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `Serialization` errors.
    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.export_snapshot()?.save(path.as_ref())?;
        info!(path = %path.as_ref().display(), "saved snapshot");
        Ok(())
    }

    /// Load a snapshot from `path` into the store and refresh the entity
    /// type catalog. Nodes are code and must be registered again.
    ///
    /// # Errors
    ///
    /// Returns `Io`, `Serialization`, or `Storage` for an unknown format.
    pub fn load_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = Snapshot::load(path.as_ref())?;
        let entities = snapshot.entity_count();
        snapshot.restore_into(self.store().as_ref())?;
        let types = self.schema.refresh()?;
        info!(path = %path.as_ref().display(), entities, types, "loaded snapshot");
        Ok(())
    }
}

/// Pipeline builder
#[derive(Default)]
pub struct PipelineBuilder {
    store: Option<Arc<dyn Store>>,
    config: PipelineConfig,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("custom_store", &self.store.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineBuilder {
    /// Use a specific store (default: a fresh [`MemoryStore`]).
    #[must_use]
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a configuration (default: [`PipelineConfig::default`]).
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the pipeline. If the configuration names a snapshot file that
    /// exists, it is loaded into the store first.
    ///
    /// # Errors
    ///
    /// Returns `Config` for invalid configuration or worker pool failure,
    /// and snapshot loading errors.
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        if let Some(path) = self.config.snapshot_path.as_deref().filter(|p| p.exists()) {
            Snapshot::load(path)?.restore_into(store.as_ref())?;
            info!(path = %path.display(), "restored snapshot");
        }
        let schema = Schema::open(store)?;

        #[cfg(feature = "rayon")]
        let pool = match self.config.worker_threads {
            Some(threads) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("spyglass-worker-{i}"))
                    .build()
                    .map_err(|e| Error::Config(format!("worker pool: {e}")))?,
            ),
            None => None,
        };

        Ok(Pipeline {
            schema,
            registry: RwLock::new(Registry::new()),
            engine: Engine::new(self.config.catch_panics),
            config: self.config,
            #[cfg(feature = "rayon")]
            pool,
        })
    }
}
