//! Dependency Resolver
//!
//! Turns a request (target type, root key, parameter selection) into a
//! linear execution plan:
//!
//! 1. reverse breadth-first walk from the target over upstream edges,
//!    collecting the nodes that must run and the root types they read;
//! 2. Kahn's topological sort over the collected nodes, ties broken by
//!    declaration order so identical requests always yield identical plans;
//! 3. key propagation: root keys are projected from the request key, each
//!    step's output key is the natural join of its input keys plus its
//!    `<kind>_params` field.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::CacheKey;
use crate::registry::Registry;
use crate::schema::{params_key_field, EntityKey, ParameterSet, Schema, DEFAULT_PARAMETER_NAME};
use crate::{Error, Result};

/// Reference to a parameter set by name, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterRef {
    name: String,
    version: Option<u32>,
}

impl ParameterRef {
    /// Latest version of the named set.
    #[must_use]
    pub fn latest(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// A specific version of the named set.
    #[must_use]
    pub fn pinned(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version: Some(version),
        }
    }

    /// Get the set name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the pinned version, if any.
    #[must_use]
    pub const fn version(&self) -> Option<u32> {
        self.version
    }
}

/// A request for one derived entity.
///
/// Requests are also the rows of the persisted selection table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Request {
    target: String,
    root_key: EntityKey,
    parameters: Vec<ParameterRef>,
}

impl Request {
    /// Request `target` for the root entities identified by `root_key`.
    ///
    /// `root_key` must cover the key fields of every root type the target
    /// depends on; each root type takes the fields it needs.
    #[must_use]
    pub fn new(target: impl Into<String>, root_key: EntityKey) -> Self {
        Self {
            target: target.into(),
            root_key,
            parameters: Vec::new(),
        }
    }

    /// Select the latest version of a parameter set by name.
    #[must_use]
    pub fn with_parameters(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(ParameterRef::latest(name));
        self
    }

    /// Select a specific version of a parameter set.
    #[must_use]
    pub fn with_parameter_version(mut self, name: impl Into<String>, version: u32) -> Self {
        self.parameters.push(ParameterRef::pinned(name, version));
        self
    }

    /// Same target and parameter selection for a different root key.
    #[must_use]
    pub fn for_key(&self, root_key: EntityKey) -> Self {
        Self {
            target: self.target.clone(),
            root_key,
            parameters: self.parameters.clone(),
        }
    }

    /// Get the target entity type.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Get the root key.
    #[must_use]
    pub const fn root_key(&self) -> &EntityKey {
        &self.root_key
    }

    /// Get the parameter selection.
    #[must_use]
    pub fn parameters(&self) -> &[ParameterRef] {
        &self.parameters
    }
}

/// One planned invocation: (node, input key set, parameter set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    node: String,
    inputs: Vec<(String, EntityKey)>,
    output_key: EntityKey,
    parameters: ParameterSet,
    parameter_fingerprint: String,
}

impl PlanStep {
    /// Get the node (output entity type).
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Input `(entity type, key)` pairs in the node's declared order.
    #[must_use]
    pub fn inputs(&self) -> &[(String, EntityKey)] {
        &self.inputs
    }

    /// Key the output entity is stored under.
    #[must_use]
    pub const fn output_key(&self) -> &EntityKey {
        &self.output_key
    }

    /// Parameter set used by this step.
    #[must_use]
    pub const fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    /// Whether this step reads the given entity type.
    #[must_use]
    pub fn reads(&self, entity_type: &str) -> bool {
        self.inputs.iter().any(|(t, _)| t == entity_type)
    }

    /// Cache key of this step.
    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(
            &self.node,
            self.inputs.iter().cloned().collect(),
            &self.parameter_fingerprint,
        )
    }
}

/// Topologically ordered steps satisfying every dependency of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    target: String,
    roots: Vec<(String, EntityKey)>,
    steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// Get the requested entity type.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Root `(entity type, key)` pairs the plan reads, sorted by type.
    #[must_use]
    pub fn roots(&self) -> &[(String, EntityKey)] {
        &self.roots
    }

    /// Steps in execution order; the last step produces the target.
    #[must_use]
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Node names in execution order.
    #[must_use]
    pub fn node_order(&self) -> Vec<&str> {
        self.steps.iter().map(PlanStep::node).collect()
    }

    /// Step producing the given node, if planned.
    #[must_use]
    pub fn step(&self, node: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.node == node)
    }
}

/// Build the execution plan for a request.
///
/// # Errors
///
/// - `UnknownDerivation` if no node produces the target
/// - `UnsatisfiedDependency` if a root entity is absent, the root key lacks
///   a root type's key fields, input keys disagree, or a parameter kind has
///   neither a selected nor a `default` set
/// - `NotFound` if a selected parameter set name (or version) does not exist
/// - `CycleDetected` if the graph contains a cycle despite registration checks
pub fn resolve(registry: &Registry, schema: &Schema, request: &Request) -> Result<ExecutionPlan> {
    let target = request.target();

    // 1. Reverse BFS from the target.
    let (collected, roots) = walk_upstream(registry, target)?;

    // 2. Kahn's algorithm, ready set ordered by declaration.
    let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
    let mut ready: BTreeSet<(usize, &str)> = BTreeSet::new();
    for &name in &collected {
        let node = registry.resolve_node(name)?;
        let in_degree = node
            .input_types()
            .iter()
            .filter(|t| collected.contains(t.as_str()))
            .count();
        if in_degree == 0 {
            ready.insert((node.declared(), name));
        } else {
            pending.insert(name, in_degree);
        }
    }
    let mut order: Vec<&str> = Vec::with_capacity(collected.len());
    while let Some((_, name)) = ready.pop_first() {
        order.push(name);
        for dependent in registry.dependents(name) {
            let Some(count) = pending.get_mut(dependent.as_str()) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                if let Some((key, _)) = pending.remove_entry(dependent.as_str()) {
                    ready.insert((registry.resolve_node(key)?.declared(), key));
                }
            }
        }
    }
    if !pending.is_empty() {
        let mut path: Vec<String> = pending.keys().map(|s| (*s).to_string()).collect();
        if let Some(first) = path.first().cloned() {
            path.push(first);
        }
        return Err(Error::CycleDetected { path });
    }

    // 3. Root keys.
    let mut known: BTreeMap<String, EntityKey> = BTreeMap::new();
    let mut root_pairs = Vec::with_capacity(roots.len());
    for &root in &roots {
        let ty = schema.entity_type(root)?;
        let key = request.root_key().project(ty.key_names()).ok_or_else(|| {
            let missing: Vec<&str> = ty
                .key_names()
                .filter(|n| request.root_key().get(n).is_none())
                .collect();
            Error::UnsatisfiedDependency {
                entity_type: root.to_string(),
                detail: format!("root key {} lacks field(s) {}", request.root_key(), missing.join(", ")),
            }
        })?;
        if schema.store().get_entity(root, &key)?.is_none() {
            return Err(Error::UnsatisfiedDependency {
                entity_type: root.to_string(),
                detail: format!("no entity with key {key}"),
            });
        }
        known.insert(root.to_string(), key.clone());
        root_pairs.push((root.to_string(), key));
    }

    // 4. Parameters and output keys, step by step.
    let selection = select_parameter_kinds(schema, request.parameters())?;
    let mut steps = Vec::with_capacity(order.len());
    for name in order {
        let node = registry.resolve_node(name)?;
        let kind = node.parameter_type();
        let parameters = match selection.get(kind) {
            Some(r) => schema.parameter_set(kind, r.name(), r.version())?,
            None => schema
                .parameter_set(kind, DEFAULT_PARAMETER_NAME, None)
                .map_err(|_| Error::UnsatisfiedDependency {
                    entity_type: kind.to_string(),
                    detail: format!(
                        "node '{name}' needs a '{kind}' parameter set; none selected and no default registered"
                    ),
                })?,
        };

        let mut inputs = Vec::with_capacity(node.input_types().len());
        let mut merged = EntityKey::new();
        for input in node.input_types() {
            let key = known.get(input).cloned().ok_or_else(|| Error::UnsatisfiedDependency {
                entity_type: input.clone(),
                detail: format!("no key available for input of '{name}'"),
            })?;
            merged = merged.merge(&key).ok_or_else(|| Error::UnsatisfiedDependency {
                entity_type: name.to_string(),
                detail: format!("input keys disagree on shared fields at {input}{key}"),
            })?;
            inputs.push((input.clone(), key));
        }
        let output_key = merged.with(params_key_field(kind), parameters.reference());
        known.insert(name.to_string(), output_key.clone());

        steps.push(PlanStep {
            node: name.to_string(),
            inputs,
            output_key,
            parameter_fingerprint: parameters.fingerprint()?,
            parameters,
        });
    }

    debug!(
        target_type = target,
        steps = steps.len(),
        roots = root_pairs.len(),
        "resolved execution plan"
    );
    Ok(ExecutionPlan {
        target: target.to_string(),
        roots: root_pairs,
        steps,
    })
}

/// Root (non-derived) entity types `target` ultimately reads, sorted.
///
/// # Errors
///
/// Returns `UnknownDerivation` if no node produces `target`.
pub fn root_types(registry: &Registry, target: &str) -> Result<Vec<String>> {
    let (_, roots) = walk_upstream(registry, target)?;
    Ok(roots.into_iter().map(str::to_string).collect())
}

/// Derived types needed for `target` (itself included) and the root types
/// they read.
fn walk_upstream<'r>(
    registry: &'r Registry,
    target: &'r str,
) -> Result<(BTreeSet<&'r str>, BTreeSet<&'r str>)> {
    registry.resolve_node(target)?;
    let mut collected: BTreeSet<&str> = BTreeSet::from([target]);
    let mut roots: BTreeSet<&str> = BTreeSet::new();
    let mut queue = VecDeque::from([target]);
    while let Some(current) = queue.pop_front() {
        let node = registry.resolve_node(current)?;
        for input in node.input_types() {
            if registry.is_derived(input) {
                if collected.insert(input.as_str()) {
                    queue.push_back(input.as_str());
                }
            } else {
                roots.insert(input.as_str());
            }
        }
    }
    Ok((collected, roots))
}

/// Map each parameter kind to the set the request selects for it.
fn select_parameter_kinds<'r>(
    schema: &Schema,
    refs: &'r [ParameterRef],
) -> Result<BTreeMap<String, &'r ParameterRef>> {
    let mut selection: BTreeMap<String, &ParameterRef> = BTreeMap::new();
    for r in refs {
        let kinds = schema.parameter_kinds_named(r.name())?;
        if kinds.is_empty() {
            return Err(Error::NotFound {
                entity_type: "parameter set".to_string(),
                key: r.name().to_string(),
            });
        }
        for kind in kinds {
            if let Some(previous) = selection.get(&kind) {
                if previous.name() != r.name() {
                    return Err(Error::validation(
                        "request",
                        format!(
                            "parameter sets '{}' and '{}' both select kind '{kind}'",
                            previous.name(),
                            r.name()
                        ),
                    ));
                }
            }
            selection.insert(kind, r);
        }
    }
    Ok(selection)
}
