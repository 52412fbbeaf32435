// Workflow Graph (DAG) Builder
// Nodes bound to step descriptors, edges derived from output references

use crate::step::descriptor::StepDescriptor;
use crate::step::models::{SlotType, Value};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Which side of a step a slot lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDirection {
    Input,
    Output,
}

impl fmt::Display for SlotDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotDirection::Input => write!(f, "input"),
            SlotDirection::Output => write!(f, "output"),
        }
    }
}

/// Error type for graph construction, validation and expansion
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("unknown node '{node}'")]
    UnknownNode { node: String },

    #[error("node '{node}' already exists")]
    DuplicateNode { node: String },

    #[error("step '{step}' is already registered")]
    DuplicateStep { step: String },

    #[error("step '{step}' (node '{node}') declares no {direction} slot '{slot}'")]
    UnknownSlot {
        node: String,
        step: String,
        slot: String,
        direction: SlotDirection,
    },

    #[error("type mismatch on '{node}.{slot}': expected {expected}, found {found}")]
    TypeMismatch {
        node: String,
        slot: String,
        expected: SlotType,
        found: String,
    },

    #[error("input '{node}.{slot}' is already bound")]
    DuplicateBinding { node: String, slot: String },

    #[error("circular dependency detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("input '{node}.{slot}' references missing output '{missing}'")]
    DanglingReference {
        node: String,
        slot: String,
        missing: OutputRef,
    },

    #[error("required input '{node}.{slot}' has no binding, default or sweep")]
    MissingInput { node: String, slot: String },

    #[error("iterable conflict on '{node}.{slot}': {reason}")]
    IterableConflict {
        node: String,
        slot: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    UnknownNode,
    DuplicateNode,
    DuplicateStep,
    UnknownSlot,
    TypeMismatch,
    DuplicateBinding,
    CycleDetected,
    DanglingReference,
    MissingInput,
    IterableConflict,
}

impl GraphError {
    pub fn kind(&self) -> GraphErrorKind {
        match self {
            GraphError::UnknownNode { .. } => GraphErrorKind::UnknownNode,
            GraphError::DuplicateNode { .. } => GraphErrorKind::DuplicateNode,
            GraphError::DuplicateStep { .. } => GraphErrorKind::DuplicateStep,
            GraphError::UnknownSlot { .. } => GraphErrorKind::UnknownSlot,
            GraphError::TypeMismatch { .. } => GraphErrorKind::TypeMismatch,
            GraphError::DuplicateBinding { .. } => GraphErrorKind::DuplicateBinding,
            GraphError::CycleDetected { .. } => GraphErrorKind::CycleDetected,
            GraphError::DanglingReference { .. } => GraphErrorKind::DanglingReference,
            GraphError::MissingInput { .. } => GraphErrorKind::MissingInput,
            GraphError::IterableConflict { .. } => GraphErrorKind::IterableConflict,
        }
    }

    pub(crate) fn iterable_conflict(node: &str, slot: &str, reason: impl Into<String>) -> Self {
        GraphError::IterableConflict {
            node: node.to_string(),
            slot: slot.to_string(),
            reason: reason.into(),
        }
    }
}

/// Reference to an output slot of another node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub node: String,
    pub slot: String,
}

impl OutputRef {
    pub fn new(node: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            slot: slot.into(),
        }
    }

    /// Parse `node.slot`
    pub fn parse(reference: &str) -> Option<Self> {
        let (node, slot) = reference.trim().split_once('.')?;
        if node.is_empty() || slot.is_empty() {
            return None;
        }
        Some(Self::new(node, slot))
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.slot)
    }
}

/// What an input slot is bound to
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Literal(Value),
    Output(OutputRef),
}

/// A parameter sweep over one input slot
#[derive(Debug, Clone, PartialEq)]
pub struct Sweep {
    pub slot: String,
    pub values: Vec<Value>,
}

/// A node: one step descriptor bound into the graph
#[derive(Debug, Clone)]
pub struct Node {
    id: String,
    step: Arc<StepDescriptor>,
    bindings: BTreeMap<String, Binding>,
    iterable: Option<Sweep>,
}

impl Node {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn step(&self) -> &Arc<StepDescriptor> {
        &self.step
    }

    pub fn bindings(&self) -> &BTreeMap<String, Binding> {
        &self.bindings
    }

    pub fn binding(&self, slot: &str) -> Option<&Binding> {
        self.bindings.get(slot)
    }

    pub fn iterable(&self) -> Option<&Sweep> {
        self.iterable.as_ref()
    }

    /// Output references this node consumes, with the consuming slot
    pub fn upstream_refs(&self) -> impl Iterator<Item = (&str, &OutputRef)> {
        self.bindings.iter().filter_map(|(slot, b)| match b {
            Binding::Output(r) => Some((slot.as_str(), r)),
            Binding::Literal(_) => None,
        })
    }

    pub(crate) fn substitute_sweep(&mut self, value: Value) {
        if let Some(sweep) = self.iterable.take() {
            self.bindings.insert(sweep.slot, Binding::Literal(value));
        }
    }
}

/// Workflow graph representing the DAG of nodes
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    name: String,
    /// Nodes in declaration order
    nodes: Vec<Node>,
    /// Quick lookup of node index by id
    node_indices: HashMap<String, usize>,
    /// Swept node ids in the order the sweeps were declared
    sweep_order: Vec<String>,
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            node_indices: HashMap::new(),
            sweep_order: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Get a node by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_indices.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.node_indices.get(id).copied()
    }

    /// Add a node bound to a step descriptor
    pub fn add_node(
        &mut self,
        id: impl Into<String>,
        step: Arc<StepDescriptor>,
    ) -> Result<(), GraphError> {
        let id = id.into();
        if self.node_indices.contains_key(&id) {
            return Err(GraphError::DuplicateNode { node: id });
        }
        self.node_indices.insert(id.clone(), self.nodes.len());
        self.nodes.push(Node {
            id,
            step,
            bindings: BTreeMap::new(),
            iterable: None,
        });
        Ok(())
    }

    /// Remove a node. Bindings that referenced it are left dangling and
    /// reported by `validate`.
    pub fn remove_node(&mut self, id: &str) -> Result<Node, GraphError> {
        let idx = self.index_of(id).ok_or_else(|| GraphError::UnknownNode {
            node: id.to_string(),
        })?;
        let node = self.nodes.remove(idx);
        self.sweep_order.retain(|n| n != id);
        self.node_indices = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        Ok(node)
    }

    /// Bind a literal value to an input slot
    pub fn set_input(
        &mut self,
        node_id: &str,
        slot: &str,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        let value = value.into();
        let node = self.node_mut(node_id)?;
        let spec = input_spec(node, slot)?;
        let coerced = value
            .coerce_to(&spec.ty)
            .ok_or_else(|| GraphError::TypeMismatch {
                node: node_id.to_string(),
                slot: slot.to_string(),
                expected: spec.ty.clone(),
                found: describe(&value),
            })?;
        ensure_unbound(node, slot)?;
        node.bindings
            .insert(slot.to_string(), Binding::Literal(coerced));
        Ok(())
    }

    /// Connect an output slot of `producer` to an input slot of `consumer`
    pub fn connect(
        &mut self,
        producer: &str,
        producer_slot: &str,
        consumer: &str,
        consumer_slot: &str,
    ) -> Result<(), GraphError> {
        let producer_node = self.node(producer).ok_or_else(|| GraphError::UnknownNode {
            node: producer.to_string(),
        })?;
        let out_ty = producer_node
            .step
            .output_spec(producer_slot)
            .map(|s| s.ty.clone())
            .ok_or_else(|| GraphError::UnknownSlot {
                node: producer.to_string(),
                step: producer_node.step.name().to_string(),
                slot: producer_slot.to_string(),
                direction: SlotDirection::Output,
            })?;

        let node = self.node_mut(consumer)?;
        let spec = input_spec(node, consumer_slot)?;
        if !out_ty.is_compatible_with(&spec.ty) {
            return Err(GraphError::TypeMismatch {
                node: consumer.to_string(),
                slot: consumer_slot.to_string(),
                expected: spec.ty.clone(),
                found: format!("{} from '{}.{}'", out_ty, producer, producer_slot),
            });
        }
        ensure_unbound(node, consumer_slot)?;
        node.bindings.insert(
            consumer_slot.to_string(),
            Binding::Output(OutputRef::new(producer, producer_slot)),
        );
        Ok(())
    }

    /// Mark an input slot as swept over `values`
    pub fn mark_iterable(
        &mut self,
        node_id: &str,
        slot: &str,
        values: Vec<Value>,
    ) -> Result<(), GraphError> {
        let node = self.node_mut(node_id)?;
        let spec = input_spec(node, slot)?;

        if values.is_empty() {
            return Err(GraphError::iterable_conflict(
                node_id,
                slot,
                "sweep values must not be empty",
            ));
        }
        if let Some(existing) = &node.iterable {
            return Err(GraphError::iterable_conflict(
                node_id,
                slot,
                format!("node is already swept over '{}'", existing.slot),
            ));
        }
        if node.bindings.contains_key(slot) {
            return Err(GraphError::iterable_conflict(
                node_id,
                slot,
                "slot already has an explicit binding",
            ));
        }

        let mut coerced = Vec::with_capacity(values.len());
        for value in &values {
            let v = value
                .coerce_to(&spec.ty)
                .ok_or_else(|| GraphError::TypeMismatch {
                    node: node_id.to_string(),
                    slot: slot.to_string(),
                    expected: spec.ty.clone(),
                    found: describe(value),
                })?;
            coerced.push(v);
        }

        node.iterable = Some(Sweep {
            slot: slot.to_string(),
            values: coerced,
        });
        self.sweep_order.push(node_id.to_string());
        Ok(())
    }

    /// Swept nodes in declaration order of their sweeps
    pub fn sweeps(&self) -> Vec<(&Node, &Sweep)> {
        self.sweep_order
            .iter()
            .filter_map(|id| self.node(id))
            .filter_map(|node| node.iterable.as_ref().map(|s| (node, s)))
            .collect()
    }

    pub(crate) fn node_at_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.nodes[idx]
    }

    pub(crate) fn clear_sweeps(&mut self) {
        self.sweep_order.clear();
    }

    fn node_mut(&mut self, id: &str) -> Result<&mut Node, GraphError> {
        let idx = self.index_of(id).ok_or_else(|| GraphError::UnknownNode {
            node: id.to_string(),
        })?;
        Ok(&mut self.nodes[idx])
    }

    /// Validate the graph: dangling references, cycles and unsatisfied inputs.
    ///
    /// Pure and re-runnable.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in &self.nodes {
            for (slot, reference) in node.upstream_refs() {
                let declared = self
                    .node(&reference.node)
                    .is_some_and(|p| p.step.output_spec(&reference.slot).is_some());
                if !declared {
                    return Err(GraphError::DanglingReference {
                        node: node.id.clone(),
                        slot: slot.to_string(),
                        missing: reference.clone(),
                    });
                }
            }
        }

        self.detect_cycles()?;

        for node in &self.nodes {
            for (slot, spec) in node.step.inputs() {
                let swept = node.iterable.as_ref().is_some_and(|s| &s.slot == slot);
                if spec.required
                    && spec.default.is_none()
                    && !swept
                    && !node.bindings.contains_key(slot)
                {
                    return Err(GraphError::MissingInput {
                        node: node.id.clone(),
                        slot: slot.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Detect cycles using DFS along data-flow edges
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let dependents = self.dependents_table();
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for idx in 0..self.nodes.len() {
            if !visited.contains(&idx) {
                if let Some(cycle) =
                    self.dfs_cycle(idx, &dependents, &mut visited, &mut rec_stack, &mut path)
                {
                    return Err(GraphError::CycleDetected { cycle });
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        idx: usize,
        dependents: &[Vec<usize>],
        visited: &mut HashSet<usize>,
        rec_stack: &mut HashSet<usize>,
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        visited.insert(idx);
        rec_stack.insert(idx);
        path.push(idx);

        for &next in &dependents[idx] {
            if !visited.contains(&next) {
                if let Some(cycle) = self.dfs_cycle(next, dependents, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(&next) {
                let start = path.iter().position(|&i| i == next).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&i| self.nodes[i].id.clone())
                    .collect();
                cycle.push(self.nodes[next].id.clone());
                return Some(cycle);
            }
        }

        rec_stack.remove(&idx);
        path.pop();
        None
    }

    /// Indices of the distinct producers each node consumes from, ascending
    pub(crate) fn dependencies_table(&self) -> Vec<Vec<usize>> {
        self.nodes
            .iter()
            .map(|node| {
                node.upstream_refs()
                    .filter_map(|(_, r)| self.index_of(&r.node))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .collect()
    }

    /// Indices of the distinct consumers of each node, ascending
    pub(crate) fn dependents_table(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.nodes.len()];
        for (idx, deps) in self.dependencies_table().into_iter().enumerate() {
            for dep in deps {
                dependents[dep].push(idx);
            }
        }
        dependents
    }

    /// Ids of the nodes `id` consumes from, in declaration order
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        match self.index_of(id) {
            Some(idx) => self.dependencies_table()[idx]
                .iter()
                .map(|&i| self.nodes[i].id.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Ids of the nodes consuming from `id`, in declaration order
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        match self.index_of(id) {
            Some(idx) => self.dependents_table()[idx]
                .iter()
                .map(|&i| self.nodes[i].id.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Get nodes in topological order, ties broken by declaration order
    pub fn topological_order(&self) -> Vec<&Node> {
        // Kahn's algorithm for topological sort
        let dependents = self.dependents_table();
        let mut in_degree: Vec<usize> = self
            .dependencies_table()
            .iter()
            .map(Vec::len)
            .collect();

        let mut queue: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(idx, _)| idx)
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(idx) = queue.pop_first() {
            result.push(&self.nodes[idx]);
            for &next in &dependents[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.insert(next);
                }
            }
        }

        result
    }
}

fn input_spec<'a>(
    node: &'a Node,
    slot: &str,
) -> Result<&'a crate::step::models::InputSpec, GraphError> {
    node.step
        .input_spec(slot)
        .ok_or_else(|| GraphError::UnknownSlot {
            node: node.id.clone(),
            step: node.step.name().to_string(),
            slot: slot.to_string(),
            direction: SlotDirection::Input,
        })
}

fn ensure_unbound(node: &Node, slot: &str) -> Result<(), GraphError> {
    if node.iterable.as_ref().is_some_and(|s| s.slot == slot) {
        return Err(GraphError::iterable_conflict(
            &node.id,
            slot,
            "slot is swept and cannot also be bound",
        ));
    }
    if node.bindings.contains_key(slot) {
        return Err(GraphError::DuplicateBinding {
            node: node.id.clone(),
            slot: slot.to_string(),
        });
    }
    Ok(())
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Path(_) => "path".to_string(),
        Value::List(_) => "list".to_string(),
        Value::Map(_) => "map".to_string(),
    }
}
