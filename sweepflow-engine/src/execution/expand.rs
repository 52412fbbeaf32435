// Iterable Expansion
// Expands a graph over the Cartesian product of its sweeps into concrete instances

use crate::execution::graph::{GraphError, WorkflowGraph};
use crate::step::models::Value;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Component, Path};

/// One substitution of a sweep value
#[derive(Debug, Clone, PartialEq)]
pub struct KeyEntry {
    pub node: String,
    pub slot: String,
    pub value: Value,
    /// Rendering of `value` in labels and output paths
    pub segment: String,
}

/// Ordered sweep substitutions identifying an expanded instance
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstanceKey {
    entries: Vec<KeyEntry>,
}

impl InstanceKey {
    pub fn entries(&self) -> &[KeyEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value substituted for `slot`, first sweep wins
    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|e| e.slot == slot)
            .map(|e| &e.value)
    }

    /// `slot=value` pairs joined with `,`, or `_` for the empty key
    pub fn label(&self) -> String {
        if self.entries.is_empty() {
            return "_".to_string();
        }
        self.entries
            .iter()
            .map(|e| format!("{}={}", e.slot, e.segment))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Template substitutions: `{instance}` plus one per swept slot.
    ///
    /// Path values contribute their file name, plus as many parent
    /// directories as it takes to tell the sweep's values apart.
    pub fn substitutions(&self) -> BTreeMap<String, String> {
        let mut subs = BTreeMap::new();
        for entry in self.entries.iter().rev() {
            subs.insert(entry.slot.clone(), entry.segment.clone());
        }
        subs.insert("instance".to_string(), self.label());
        subs
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Label segments for the values of one sweep.
///
/// Paths start from their file name and take in parent directories until
/// every value renders differently; values that still collide are rejected.
fn sweep_segments(node: &str, slot: &str, values: &[Value]) -> Result<Vec<String>, GraphError> {
    let limit = values.iter().map(path_depth).max().unwrap_or(1).max(1);
    let mut depth = 1;
    loop {
        let segments: Vec<String> = values.iter().map(|v| path_segment(v, depth)).collect();
        match first_duplicate(&segments) {
            None => return Ok(segments),
            Some(dup) if depth >= limit => {
                return Err(GraphError::iterable_conflict(
                    node,
                    slot,
                    format!("several values render to the same instance label '{}={}'", slot, dup),
                ))
            }
            Some(_) => depth += 1,
        }
    }
}

fn normal_components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

fn path_depth(value: &Value) -> usize {
    match value {
        Value::Path(p) => normal_components(p).len(),
        _ => 1,
    }
}

/// Last `depth` components of a path joined with `_`; other values as strings
fn path_segment(value: &Value, depth: usize) -> String {
    match value {
        Value::Path(p) => {
            let parts = normal_components(p);
            if parts.is_empty() {
                return p.display().to_string().replace(['/', '\\'], "_");
            }
            parts[parts.len().saturating_sub(depth)..].join("_")
        }
        other => other.as_string().replace(['/', '\\'], "_"),
    }
}

fn first_duplicate(segments: &[String]) -> Option<&str> {
    let mut seen = HashSet::new();
    segments
        .iter()
        .find(|s| !seen.insert(s.as_str()))
        .map(String::as_str)
}

/// A concrete graph with every sweep replaced by a literal binding
#[derive(Debug, Clone)]
pub struct ExpandedInstance {
    /// Position in product order
    pub index: usize,
    pub key: InstanceKey,
    pub graph: WorkflowGraph,
}

/// Lazy iterator over the expanded instances of a graph
#[derive(Debug)]
pub struct Expansion<'a> {
    graph: &'a WorkflowGraph,
    /// (node index, label segment of every value) per sweep, in declaration order
    dims: Vec<(usize, Vec<String>)>,
    next: usize,
    total: usize,
}

impl<'a> Expansion<'a> {
    fn instance_at(&self, index: usize) -> ExpandedInstance {
        let mut graph = self.graph.clone();
        let mut entries = Vec::with_capacity(self.dims.len());

        // Odometer digits: the last sweep varies fastest
        let mut choice = vec![0; self.dims.len()];
        let mut rest = index;
        for (d, (_, segments)) in self.dims.iter().enumerate().rev() {
            choice[d] = rest % segments.len();
            rest /= segments.len();
        }

        for (d, (node_idx, segments)) in self.dims.iter().enumerate() {
            let node = graph.node_at_mut(*node_idx);
            if let Some(sweep) = node.iterable() {
                let value = sweep.values[choice[d]].clone();
                entries.push(KeyEntry {
                    node: node.id().to_string(),
                    slot: sweep.slot.clone(),
                    value: value.clone(),
                    segment: segments[choice[d]].clone(),
                });
                node.substitute_sweep(value);
            }
        }
        graph.clear_sweeps();

        ExpandedInstance {
            index,
            key: InstanceKey { entries },
            graph,
        }
    }
}

impl Iterator for Expansion<'_> {
    type Item = ExpandedInstance;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let instance = self.instance_at(self.next);
        self.next += 1;
        Some(instance)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Expansion<'_> {}

/// Expander for graph sweeps
pub struct IterableExpander;

impl IterableExpander {
    /// Validate the graph and return its instances in product order.
    ///
    /// The first declared sweep varies slowest. A graph without sweeps
    /// yields exactly one instance with an empty key.
    pub fn expand(graph: &WorkflowGraph) -> Result<Expansion<'_>, GraphError> {
        graph.validate()?;

        let mut dims = Vec::new();
        for (node, sweep) in graph.sweeps() {
            if let Some(idx) = graph.index_of(node.id()) {
                dims.push((idx, sweep_segments(node.id(), &sweep.slot, &sweep.values)?));
            }
        }
        let total = dims.iter().map(|(_, segments)| segments.len()).product();

        Ok(Expansion {
            graph,
            dims,
            next: 0,
            total,
        })
    }

    /// Number of instances the graph expands to, without validating
    pub fn count(graph: &WorkflowGraph) -> usize {
        graph
            .sweeps()
            .iter()
            .map(|(_, sweep)| sweep.values.len())
            .product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::graph::tests::passthrough;
    use crate::execution::graph::{Binding, GraphErrorKind};
    use crate::step::descriptor::{FnAction, StepDescriptor};
    use crate::step::models::{InputSpec, OutputSpec, Outputs, SlotType};
    use std::sync::Arc;

    fn swept_step() -> Arc<StepDescriptor> {
        Arc::new(
            StepDescriptor::new("spec", FnAction::new(|_, _| Ok(Outputs::new())))
                .input("subject", InputSpec::required(SlotType::String))
                .input("run", InputSpec::with_default(SlotType::Number, 1i64))
                .output("onsets", OutputSpec::new(SlotType::Path)),
        )
    }

    #[test]
    fn test_no_sweeps_yields_single_instance() {
        let mut graph = WorkflowGraph::new("plain");
        graph.add_node("a", passthrough("pass")).unwrap();

        let instances: Vec<_> = IterableExpander::expand(&graph).unwrap().collect();
        assert_eq!(instances.len(), 1);
        assert!(instances[0].key.is_empty());
        assert_eq!(instances[0].key.label(), "_");
        assert_eq!(instances[0].graph.len(), 1);
    }

    #[test]
    fn test_product_order_first_sweep_slowest() {
        let mut graph = WorkflowGraph::new("sweep");
        graph.add_node("spec", swept_step()).unwrap();
        graph.add_node("other", swept_step()).unwrap();
        graph.set_input("other", "subject", "fixed").unwrap();
        graph
            .mark_iterable("spec", "subject", vec!["A".into(), "B".into()])
            .unwrap();
        graph
            .mark_iterable(
                "other",
                "run",
                vec![Value::from(1i64), Value::from(2i64), Value::from(3i64)],
            )
            .unwrap();

        let expansion = IterableExpander::expand(&graph).unwrap();
        assert_eq!(expansion.len(), 6);
        assert_eq!(IterableExpander::count(&graph), 6);

        let labels: Vec<_> = expansion.map(|i| i.key.label()).collect();
        assert_eq!(
            labels,
            vec![
                "subject=A,run=1",
                "subject=A,run=2",
                "subject=A,run=3",
                "subject=B,run=1",
                "subject=B,run=2",
                "subject=B,run=3",
            ]
        );
    }

    #[test]
    fn test_instances_have_literal_bindings() {
        let mut graph = WorkflowGraph::new("sweep");
        graph.add_node("spec", swept_step()).unwrap();
        graph
            .mark_iterable("spec", "subject", vec!["A".into(), "B".into()])
            .unwrap();

        let second = IterableExpander::expand(&graph).unwrap().nth(1).unwrap();
        assert_eq!(second.index, 1);
        let node = second.graph.node("spec").unwrap();
        assert!(node.iterable().is_none());
        assert_eq!(
            node.binding("subject"),
            Some(&Binding::Literal(Value::from("B")))
        );
        assert!(second.graph.sweeps().is_empty());
        assert_eq!(second.key.get("subject"), Some(&Value::from("B")));

        // the source graph is untouched
        assert!(graph.node("spec").unwrap().iterable().is_some());
    }

    #[test]
    fn test_substitutions_use_file_names_for_paths() {
        let step = Arc::new(
            StepDescriptor::new("load", FnAction::new(|_, _| Ok(Outputs::new())))
                .input("bold", InputSpec::required(SlotType::Path)),
        );
        let mut graph = WorkflowGraph::new("paths");
        graph.add_node("load", step).unwrap();
        graph
            .mark_iterable("load", "bold", vec![Value::path("/data/sub-01/bold.nii")])
            .unwrap();

        let instance = IterableExpander::expand(&graph).unwrap().next().unwrap();
        let subs = instance.key.substitutions();
        assert_eq!(subs.get("bold").map(String::as_str), Some("bold.nii"));
        assert_eq!(
            subs.get("instance").map(String::as_str),
            Some("bold=bold.nii")
        );
    }

    #[test]
    fn test_same_file_names_take_parent_directories() {
        let step = Arc::new(
            StepDescriptor::new("load", FnAction::new(|_, _| Ok(Outputs::new())))
                .input("bold", InputSpec::required(SlotType::Path)),
        );
        let mut graph = WorkflowGraph::new("paths");
        graph.add_node("load", step).unwrap();
        graph
            .mark_iterable(
                "load",
                "bold",
                vec![
                    Value::path("/data/a/bold.nii"),
                    Value::path("/data/b/bold.nii"),
                ],
            )
            .unwrap();

        let instances: Vec<_> = IterableExpander::expand(&graph).unwrap().collect();
        let labels: Vec<_> = instances.iter().map(|i| i.key.label()).collect();
        assert_eq!(labels, vec!["bold=a_bold.nii", "bold=b_bold.nii"]);
        assert_eq!(
            instances[1].key.substitutions().get("bold").map(String::as_str),
            Some("b_bold.nii")
        );
        // the bound value is still the full path
        assert_eq!(
            instances[1].key.get("bold"),
            Some(&Value::path("/data/b/bold.nii"))
        );
    }

    #[test]
    fn test_indistinguishable_values_are_rejected() {
        let mut graph = WorkflowGraph::new("dup");
        graph.add_node("spec", swept_step()).unwrap();
        graph
            .mark_iterable("spec", "subject", vec!["a/b".into(), "a_b".into()])
            .unwrap();

        let err = IterableExpander::expand(&graph).unwrap_err();
        assert_eq!(err.kind(), GraphErrorKind::IterableConflict);
    }

    #[test]
    fn test_expand_validates_first() {
        let mut graph = WorkflowGraph::new("bad");
        graph.add_node("spec", swept_step()).unwrap();

        let err = IterableExpander::expand(&graph).unwrap_err();
        assert_eq!(err.kind(), GraphErrorKind::MissingInput);
    }
}
