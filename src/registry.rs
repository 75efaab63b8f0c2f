//! Computation Node Registry
//!
//! Maps each derived entity type to the function producing it and the
//! upstream types it depends on. The derivation graph is an explicit
//! adjacency map (`output type -> upstream types`), checked acyclic on every
//! registration by reachability, so it can be inspected and serialized
//! without chasing references.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::schema::{Entity, EntityKey, Fields, ParameterSet};
use crate::{Error, Result};

/// Everything a compute function receives for one invocation.
#[derive(Debug)]
pub struct ComputeContext<'a> {
    /// Key the output entity will be stored under
    pub output_key: &'a EntityKey,
    /// Input entities, in the node's declared input order
    pub inputs: &'a [Entity],
    /// Parameter set selected for this invocation
    pub parameters: &'a ParameterSet,
}

impl ComputeContext<'_> {
    /// First input entity of the given type.
    #[must_use]
    pub fn input(&self, entity_type: &str) -> Option<&Entity> {
        self.inputs.iter().find(|e| e.entity_type() == entity_type)
    }
}

/// A named computation: inputs and parameters in, output fields out.
///
/// Errors are captured by the engine and recorded on the computation
/// record; they never abort sibling branches of a plan.
pub type ComputeFn = Arc<dyn Fn(&ComputeContext<'_>) -> anyhow::Result<Fields> + Send + Sync>;

/// Wrap a closure as a [`ComputeFn`].
pub fn compute_fn<F>(f: F) -> ComputeFn
where
    F: Fn(&ComputeContext<'_>) -> anyhow::Result<Fields> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One registered derivation: `output_type <- input_types + parameter_type`.
#[derive(Clone)]
pub struct ComputationNode {
    output_type: String,
    input_types: Vec<String>,
    parameter_type: String,
    declared: usize,
    compute: ComputeFn,
}

impl fmt::Debug for ComputationNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationNode")
            .field("output_type", &self.output_type)
            .field("input_types", &self.input_types)
            .field("parameter_type", &self.parameter_type)
            .field("declared", &self.declared)
            .finish_non_exhaustive()
    }
}

impl ComputationNode {
    /// Get the output entity type (also the node's name).
    #[must_use]
    pub fn output_type(&self) -> &str {
        &self.output_type
    }

    /// Get the upstream entity types, in declared order.
    #[must_use]
    pub fn input_types(&self) -> &[String] {
        &self.input_types
    }

    /// Get the parameter kind this node consumes.
    #[must_use]
    pub fn parameter_type(&self) -> &str {
        &self.parameter_type
    }

    /// Declaration order; ties in execution plans break on this.
    #[must_use]
    pub const fn declared(&self) -> usize {
        self.declared
    }

    /// Get the compute function.
    #[must_use]
    pub fn compute(&self) -> &ComputeFn {
        &self.compute
    }
}

/// Registry of computation nodes and the derivation graph they form.
#[derive(Debug, Default)]
pub struct Registry {
    nodes: BTreeMap<String, ComputationNode>,
    upstream: BTreeMap<String, BTreeSet<String>>,
    next_declared: usize,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if no node is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Declare one derivation.
    ///
    /// # Errors
    ///
    /// Returns `CycleDetected` if the edge would close a cycle (the error
    /// carries the cycle path), and `SchemaConflict` if a node already
    /// produces `output_type` or an input type is listed twice.
    pub fn register_node(
        &mut self,
        output_type: &str,
        input_types: &[&str],
        parameter_type: &str,
        compute: ComputeFn,
    ) -> Result<()> {
        if self.nodes.contains_key(output_type) {
            return Err(Error::conflict(
                output_type,
                "a computation node already produces this type",
            ));
        }
        let unique: BTreeSet<&str> = input_types.iter().copied().collect();
        if unique.len() != input_types.len() {
            return Err(Error::conflict(output_type, "input type listed more than once"));
        }
        for input in input_types {
            if let Some(mut path) = self.find_path(input, output_type) {
                // input depends (transitively) on output: output -> input -> ... -> output
                path.insert(0, output_type.to_string());
                return Err(Error::CycleDetected { path });
            }
        }

        self.upstream.insert(
            output_type.to_string(),
            input_types.iter().map(|s| (*s).to_string()).collect(),
        );
        self.nodes.insert(
            output_type.to_string(),
            ComputationNode {
                output_type: output_type.to_string(),
                input_types: input_types.iter().map(|s| (*s).to_string()).collect(),
                parameter_type: parameter_type.to_string(),
                declared: self.next_declared,
                compute,
            },
        );
        self.next_declared += 1;
        Ok(())
    }

    /// Look up the node producing `output_type`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownDerivation` if no node produces it.
    pub fn resolve_node(&self, output_type: &str) -> Result<&ComputationNode> {
        self.nodes
            .get(output_type)
            .ok_or_else(|| Error::UnknownDerivation(output_type.to_string()))
    }

    /// Whether a node produces `entity_type`.
    #[must_use]
    pub fn is_derived(&self, entity_type: &str) -> bool {
        self.nodes.contains_key(entity_type)
    }

    /// Remove the node producing `output_type`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownDerivation` if there is no such node, and
    /// `SchemaConflict` while other nodes consume its output.
    pub fn unregister_node(&mut self, output_type: &str) -> Result<ComputationNode> {
        let dependents = self.dependents(output_type);
        if !dependents.is_empty() {
            return Err(Error::conflict(
                output_type,
                format!("still consumed by {}", dependents.join(", ")),
            ));
        }
        let node = self
            .nodes
            .remove(output_type)
            .ok_or_else(|| Error::UnknownDerivation(output_type.to_string()))?;
        self.upstream.remove(output_type);
        Ok(node)
    }

    /// Nodes that list `entity_type` as a direct input, in declaration order.
    #[must_use]
    pub fn dependents(&self, entity_type: &str) -> Vec<String> {
        let mut found: Vec<&ComputationNode> = self
            .nodes
            .values()
            .filter(|n| n.input_types.iter().any(|t| t == entity_type))
            .collect();
        found.sort_by_key(|n| n.declared);
        found.into_iter().map(|n| n.output_type.clone()).collect()
    }

    /// Upstream adjacency of one type (empty for root types).
    #[must_use]
    pub fn upstream(&self, entity_type: &str) -> Option<&BTreeSet<String>> {
        self.upstream.get(entity_type)
    }

    /// The full adjacency map, `output type -> upstream types`.
    #[must_use]
    pub const fn adjacency(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.upstream
    }

    /// Registered nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> Vec<&ComputationNode> {
        let mut nodes: Vec<&ComputationNode> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.declared);
        nodes
    }

    /// Shortest upstream path `from -> ... -> to`, following
    /// output-to-input edges. `None` if `to` is not upstream of `from`.
    #[must_use]
    pub fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if from == to {
            return Some(vec![from.to_string()]);
        }
        let mut parent: BTreeMap<&str, &str> = BTreeMap::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            let Some(ups) = self.upstream.get(current) else {
                continue;
            };
            for up in ups {
                if up == from || parent.contains_key(up.as_str()) {
                    continue;
                }
                parent.insert(up.as_str(), current);
                if up == to {
                    let mut path = vec![to.to_string()];
                    let mut cursor = to;
                    while let Some(&prev) = parent.get(cursor) {
                        path.push(prev.to_string());
                        cursor = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(up.as_str());
            }
        }
        None
    }
}
