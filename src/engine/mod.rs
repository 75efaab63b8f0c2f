//! Execution Engine
//!
//! Runs an [`ExecutionPlan`](crate::resolver::ExecutionPlan) step by step.
//! Each step is one computation instance identified by its [`CacheKey`]:
//!
//! ```text
//! pending ──> running ──> complete
//!                    └──> failed
//! ```
//!
//! - At most one execution per cache key is in flight; later callers block
//!   on the key's lock and then see the finished record.
//! - A `complete` record whose content hash matches the current inputs is a
//!   cache hit: the compute function is not invoked.
//! - Output entity and record are committed together; if the record write
//!   fails the appended output revision is rolled back. Each complete record
//!   names the output revision it produced.
//! - A failed step blocks the steps that read its output in this request
//!   only. Independent branches still run. A later request re-executes it.

mod cancel;
mod lock;
mod record;

pub use cancel::CancelToken;
pub use lock::KeyedLocks;
pub use record::{CacheKey, ComputationRecord, ComputationStatus};

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use dashmap::DashSet;
use rustc_hash::FxBuildHasher;
use tracing::{debug, error, info, info_span, warn};

use crate::hash::ContentHasher;
use crate::registry::{ComputationNode, ComputeContext};
use crate::resolver::{ExecutionPlan, PlanStep};
use crate::schema::{Entity, Fields, Schema};
use crate::store::Store;
use crate::{Error, Result};

/// How one step of a plan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The compute function ran and its output was committed.
    Computed,
    /// A valid complete record existed; nothing ran.
    Cached,
    /// The compute function failed; the record is `failed`.
    Failed,
    /// Skipped because an input's step failed or was blocked.
    Blocked,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Node that ran (or would have run)
    pub node: String,
    /// Output key of the step
    pub output_key: crate::schema::EntityKey,
    /// How the step ended
    pub outcome: StepOutcome,
}

/// Result of a fully successful plan execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    output: Entity,
    steps: Vec<StepReport>,
}

impl ExecutionReport {
    /// The target entity.
    #[must_use]
    pub const fn output(&self) -> &Entity {
        &self.output
    }

    /// Consume the report, keeping the target entity.
    #[must_use]
    pub fn into_output(self) -> Entity {
        self.output
    }

    /// Per-step outcomes in plan order.
    #[must_use]
    pub fn steps(&self) -> &[StepReport] {
        &self.steps
    }

    /// Number of steps whose compute function ran.
    #[must_use]
    pub fn computed_count(&self) -> usize {
        self.count(StepOutcome::Computed)
    }

    /// Number of steps served from cache.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.count(StepOutcome::Cached)
    }

    fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }
}

/// Executes plans against a schema layer and its store.
#[derive(Debug)]
pub struct Engine {
    locks: KeyedLocks,
    running: DashSet<CacheKey, FxBuildHasher>,
    catch_panics: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Removes a cache key from the running set when the attempt ends, however
/// it ends.
struct RunningGuard<'a> {
    running: &'a DashSet<CacheKey, FxBuildHasher>,
    key: CacheKey,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.key);
    }
}

struct FirstFailure {
    node: String,
    key: crate::schema::EntityKey,
    reason: String,
    blocked: Vec<String>,
}

impl Engine {
    /// Create an engine. With `catch_panics`, a panicking compute function
    /// is recorded as a failure instead of unwinding into the caller.
    #[must_use]
    pub fn new(catch_panics: bool) -> Self {
        Self {
            locks: KeyedLocks::new(),
            running: DashSet::default(),
            catch_panics,
        }
    }

    /// Whether a computation for this cache key is executing right now.
    #[must_use]
    pub fn is_running(&self, key: &CacheKey) -> bool {
        self.running.contains(key)
    }

    /// Number of computations executing right now.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Number of cache-key lock slots currently allocated.
    #[must_use]
    pub fn lock_slots(&self) -> usize {
        self.locks.len()
    }

    /// Execute a plan. `nodes[i]` must be the node of `plan.steps()[i]`.
    ///
    /// # Errors
    ///
    /// - `ComputationFailed` naming the first failing node and the nodes it
    ///   directly blocked; independent steps still ran
    /// - `Cancelled` if `cancel` fired before a step started running
    /// - storage and dependency errors abort immediately
    pub fn execute(
        &self,
        schema: &Schema,
        plan: &ExecutionPlan,
        nodes: &[ComputationNode],
        cancel: Option<&CancelToken>,
    ) -> Result<ExecutionReport> {
        let _span = info_span!("execute", target = plan.target(), steps = plan.len()).entered();
        if nodes.len() != plan.len() {
            return Err(Error::UnknownDerivation(format!(
                "{}: plan has {} steps but {} nodes were supplied",
                plan.target(),
                plan.len(),
                nodes.len()
            )));
        }

        let mut unavailable: BTreeSet<&str> = BTreeSet::new();
        let mut first_failure: Option<FirstFailure> = None;
        let mut reports = Vec::with_capacity(plan.len());
        let mut output = None;

        for (step, node) in plan.steps().iter().zip(nodes) {
            if let Some((blocked_by, _)) = step.inputs().iter().find(|(t, _)| unavailable.contains(t.as_str())) {
                warn!(node = step.node(), blocked_by = %blocked_by, "step blocked by failed upstream");
                if let Some(first) = first_failure.as_mut() {
                    if step.reads(&first.node) {
                        first.blocked.push(step.node().to_string());
                    }
                }
                unavailable.insert(step.node());
                reports.push(StepReport {
                    node: step.node().to_string(),
                    output_key: step.output_key().clone(),
                    outcome: StepOutcome::Blocked,
                });
                continue;
            }

            let outcome = match self.run_step(schema, step, node, cancel) {
                Ok((entity, outcome)) => {
                    output = Some(entity);
                    outcome
                }
                Err(Error::ComputationFailed { node, key, reason, .. }) => {
                    unavailable.insert(step.node());
                    if first_failure.is_none() {
                        first_failure = Some(FirstFailure {
                            node,
                            key,
                            reason,
                            blocked: Vec::new(),
                        });
                    }
                    output = None;
                    StepOutcome::Failed
                }
                Err(other) => return Err(other),
            };
            reports.push(StepReport {
                node: step.node().to_string(),
                output_key: step.output_key().clone(),
                outcome,
            });
        }

        if let Some(first) = first_failure {
            return Err(Error::ComputationFailed {
                node: first.node,
                key: first.key,
                reason: first.reason,
                blocked: first.blocked,
            });
        }
        // The target is always the last step, so `output` holds its entity.
        let output = output.ok_or_else(|| Error::UnknownDerivation(plan.target().to_string()))?;
        Ok(ExecutionReport {
            output,
            steps: reports,
        })
    }

    fn run_step(
        &self,
        schema: &Schema,
        step: &PlanStep,
        node: &ComputationNode,
        cancel: Option<&CancelToken>,
    ) -> Result<(Entity, StepOutcome)> {
        let cache_key = step.cache_key();
        self.locks.with_lock(&cache_key, || {
            self.run_locked(schema, step, node, cache_key.clone(), cancel)
        })
    }

    fn run_locked(
        &self,
        schema: &Schema,
        step: &PlanStep,
        node: &ComputationNode,
        cache_key: CacheKey,
        cancel: Option<&CancelToken>,
    ) -> Result<(Entity, StepOutcome)> {
        let store = schema.store();
        let inputs = load_inputs(store.as_ref(), step)?;
        let content_hash = content_hash(&inputs, cache_key.parameter_fingerprint())?;
        let previous = store.get_computation(&cache_key)?;

        if let Some(prev) = previous.as_ref().filter(|p| p.is_valid_for(&content_hash)) {
            let cached = match prev.output_revision() {
                Some(revision) => store.get_entity_revision(step.node(), prev.output_key(), revision)?,
                None => store.get_entity(step.node(), prev.output_key())?,
            };
            if let Some(cached) = cached {
                debug!(node = step.node(), key = %step.output_key(), "cache hit");
                return Ok((cached, StepOutcome::Cached));
            }
        }

        if cancel.is_some_and(CancelToken::is_cancelled) {
            info!(node = step.node(), "request cancelled before running");
            return Err(Error::Cancelled {
                node: step.node().to_string(),
            });
        }

        let attempt = previous.as_ref().map_or(1, |p| p.attempt() + 1);
        let mut record =
            ComputationRecord::new(cache_key.clone(), step.output_key().clone(), &content_hash)
                .with_attempt(attempt);
        record.start();
        let newly_running = self.running.insert(cache_key.clone());
        debug_assert!(newly_running, "cache key lock must exclude concurrent runs");
        let _running = RunningGuard {
            running: &self.running,
            key: cache_key,
        };
        if let Some(mut superseded) = store.put_computation(record.clone())? {
            superseded.supersede();
            store.archive_computation(superseded)?;
        }

        let started = Instant::now();
        let result = self
            .invoke(node, step, &inputs)
            .and_then(|fields| build_output(schema, step, fields));
        let elapsed_ms = started.elapsed().as_millis();

        match result {
            Ok(candidate) => {
                let entity = commit(store.as_ref(), candidate, record)?;
                info!(
                    node = step.node(),
                    key = %step.output_key(),
                    revision = entity.revision(),
                    attempt,
                    elapsed_ms,
                    "computation complete"
                );
                Ok((entity, StepOutcome::Computed))
            }
            Err(reason) => {
                record.fail(reason.clone());
                store.put_computation(record)?;
                warn!(
                    node = step.node(),
                    key = %step.output_key(),
                    attempt,
                    elapsed_ms,
                    reason = %reason,
                    "computation failed"
                );
                Err(Error::ComputationFailed {
                    node: step.node().to_string(),
                    key: step.output_key().clone(),
                    reason,
                    blocked: Vec::new(),
                })
            }
        }
    }

    /// Call the compute function, turning errors and panics into a reason.
    fn invoke(&self, node: &ComputationNode, step: &PlanStep, inputs: &[Entity]) -> std::result::Result<Fields, String> {
        let ctx = ComputeContext {
            output_key: step.output_key(),
            inputs,
            parameters: step.parameters(),
        };
        let compute = node.compute();
        if !self.catch_panics {
            return compute(&ctx).map_err(|e| format!("{e:#}"));
        }
        match catch_unwind(AssertUnwindSafe(|| compute(&ctx))) {
            Ok(result) => result.map_err(|e| format!("{e:#}")),
            Err(panic) => Err(format!("compute function panicked: {}", panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn load_inputs(store: &dyn Store, step: &PlanStep) -> Result<Vec<Entity>> {
    step.inputs()
        .iter()
        .map(|(entity_type, key)| {
            store
                .get_entity(entity_type, key)?
                .ok_or_else(|| Error::UnsatisfiedDependency {
                    entity_type: entity_type.clone(),
                    detail: format!("input {key} of '{}' is missing", step.node()),
                })
        })
        .collect()
}

/// Digest over every input payload plus the parameter set fingerprint.
///
/// Inputs are hashed in entity type order, so the digest does not depend on
/// the order the caller loaded them in. Revisions are not hashed: a revision
/// that restores an earlier payload hashes like that payload.
pub(crate) fn content_hash(inputs: &[Entity], parameter_fingerprint: &str) -> Result<String> {
    let mut ordered: Vec<&Entity> = inputs.iter().collect();
    ordered.sort_by(|a, b| a.entity_type().cmp(b.entity_type()));
    let mut hasher = ContentHasher::new();
    for input in ordered {
        hasher.update(input.entity_type().as_bytes());
        hasher.update(&input.payload_bytes()?);
    }
    hasher.update(parameter_fingerprint.as_bytes());
    Ok(hasher.finish())
}

/// Turn compute output into a candidate entity, validated against the
/// output type. The store assigns its revision on commit.
fn build_output(schema: &Schema, step: &PlanStep, fields: Fields) -> std::result::Result<Entity, String> {
    let candidate = Entity::builder(step.node())
        .with_key(step.output_key().clone())
        .fields(fields)
        .build();
    schema
        .entity_type(step.node())
        .and_then(|ty| ty.validate(&candidate))
        .map_err(|e| format!("invalid output: {e}"))?;
    Ok(candidate)
}

/// Persist output entity and record together.
///
/// The output is appended as a new revision (or matched to the latest one
/// when unchanged). If the record write fails, a revision appended here is
/// removed again so the store never shows an output without its record.
fn commit(store: &dyn Store, candidate: Entity, mut record: ComputationRecord) -> Result<Entity> {
    let prior = store
        .get_entity(candidate.entity_type(), candidate.key())?
        .map(|e| e.revision());
    let stored = store.upsert_entity(candidate)?;
    record.complete(stored.revision());
    if let Err(err) = store.put_computation(record) {
        if prior != Some(stored.revision()) {
            if let Err(rollback_err) =
                store.remove_entity_revision(stored.entity_type(), stored.key(), stored.revision())
            {
                error!(
                    node = stored.entity_type(),
                    key = %stored.key(),
                    error = %rollback_err,
                    "rollback of output entity failed"
                );
            }
        }
        return Err(err);
    }
    Ok(stored)
}
