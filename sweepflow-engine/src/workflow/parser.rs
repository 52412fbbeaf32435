use crate::execution::graph::{OutputRef, WorkflowGraph};
use crate::runners::command::CommandAction;
use crate::sink::{DataSink, SinkMapping};
use crate::step::descriptor::StepDescriptor;
use crate::step::models::{InputSpec, OutputSpec, SlotType, Value};
use crate::step::registry::StepRegistry;
use crate::workflow::error::ParseError;
use crate::workflow::models::{NodeFile, StepFile, WorkflowFile};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parser for workflow YAML files.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a workflow from a file path. Relative paths inside the file
    /// resolve against the file's directory.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<WorkflowFile, ParseError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut workflow = Self::parse(&content)?;
        workflow.base_dir = path.parent().map(Path::to_path_buf);
        Ok(workflow)
    }

    /// Parse a workflow from a YAML string.
    pub fn parse(content: &str) -> Result<WorkflowFile, ParseError> {
        serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))
    }

    /// Parse a file and build its registry and graph.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<WorkflowDefinition, ParseError> {
        Self::from_file(path)?.build()
    }
}

/// Where and how a workflow's outputs are placed
#[derive(Debug, Clone)]
pub struct SinkPlan {
    pub sink: DataSink,
    pub mappings: Vec<SinkMapping>,
}

/// A workflow file turned into executable parts
#[derive(Debug)]
pub struct WorkflowDefinition {
    pub name: String,
    pub registry: StepRegistry,
    pub graph: WorkflowGraph,
    pub sink: Option<SinkPlan>,
}

impl WorkflowFile {
    /// Build the step registry, the graph and the sink plan.
    ///
    /// The graph is not validated here; expansion and execution do that.
    pub fn build(&self) -> Result<WorkflowDefinition, ParseError> {
        let mut registry = StepRegistry::new();
        for (name, step) in &self.steps {
            registry.register(build_step(name, step)?)?;
        }

        let mut graph = WorkflowGraph::new(&self.name);
        for node in &self.nodes {
            let step = registry
                .get(&node.step)
                .ok_or_else(|| ParseError::UnknownStep {
                    node: node.id.clone(),
                    step: node.step.clone(),
                })?;
            graph.add_node(&node.id, step)?;
        }

        // Bindings after every node exists, so connections may point forward
        for node in &self.nodes {
            self.bind_node(&mut graph, node)?;
        }

        let sink = self.sink.as_ref().map(|file| -> Result<SinkPlan, ParseError> {
            let mut sink = DataSink::new(self.resolve(&file.base_dir));
            for sub in &file.substitutions {
                sink = sink.with_substitution(&sub.from, &sub.to);
            }
            let mappings = file
                .outputs
                .iter()
                .map(|out| {
                    let source = OutputRef::parse(&out.from).ok_or_else(|| {
                        ParseError::InvalidReference {
                            node: "sink".to_string(),
                            slot: out.to.clone(),
                            reference: out.from.clone(),
                        }
                    })?;
                    Ok(SinkMapping::new(source, &out.to))
                })
                .collect::<Result<Vec<_>, ParseError>>()?;
            Ok(SinkPlan { sink, mappings })
        });

        Ok(WorkflowDefinition {
            name: self.name.clone(),
            registry,
            graph,
            sink: sink.transpose()?,
        })
    }

    fn bind_node(&self, graph: &mut WorkflowGraph, node: &NodeFile) -> Result<(), ParseError> {
        let step = graph
            .node(&node.id)
            .map(|n| n.step().clone())
            .ok_or_else(|| ParseError::UnknownStep {
                node: node.id.clone(),
                step: node.step.clone(),
            })?;
        let slot_type = |slot: &str| {
            step.input_spec(slot)
                .map(|s| s.ty.clone())
                .unwrap_or_default()
        };

        for (slot, yaml) in &node.inputs {
            let value = self.resolve_value(Value::from_yaml(yaml), &slot_type(slot));
            graph.set_input(&node.id, slot, value)?;
        }

        for (slot, reference) in &node.connect {
            let source =
                OutputRef::parse(reference).ok_or_else(|| ParseError::InvalidReference {
                    node: node.id.clone(),
                    slot: slot.clone(),
                    reference: reference.clone(),
                })?;
            graph.connect(&source.node, &source.slot, &node.id, slot)?;
        }

        if let Some(sweep) = &node.iterables {
            let ty = slot_type(&sweep.slot);
            let values = sweep
                .values
                .iter()
                .map(|v| self.resolve_value(Value::from_yaml(v), &ty))
                .collect();
            graph.mark_iterable(&node.id, &sweep.slot, values)?;
        }

        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Resolve relative paths for path-typed slots
    fn resolve_value(&self, value: Value, ty: &SlotType) -> Value {
        match (ty, value) {
            (SlotType::Path, Value::String(s)) => Value::Path(self.resolve(Path::new(&s))),
            (SlotType::Path, Value::Path(p)) => Value::Path(self.resolve(&p)),
            (SlotType::List(inner), Value::List(items)) => Value::List(
                items
                    .into_iter()
                    .map(|item| self.resolve_value(item, inner))
                    .collect(),
            ),
            (_, value) => value,
        }
    }
}

fn build_step(name: &str, file: &StepFile) -> Result<StepDescriptor, ParseError> {
    if file.command.is_empty() {
        return Err(ParseError::invalid_step(name, "command must not be empty"));
    }

    let mut action = CommandAction::new(file.command.iter().cloned());
    for (key, value) in &file.env {
        action = action.env(key, value);
    }
    if let Some(secs) = file.timeout_secs {
        action = action.timeout(Duration::from_secs(secs));
    }

    for (slot, output) in &file.outputs {
        action = match (&output.file, output.stdout) {
            (Some(relative), false) => action.output_file(slot, relative),
            (None, true) => action.output_stdout(slot),
            _ => {
                return Err(ParseError::invalid_step(
                    name,
                    format!("output '{}' needs exactly one of 'file' or 'stdout'", slot),
                ))
            }
        };
    }

    let mut step = StepDescriptor::new(name, action).version(&file.version);
    for (slot, input) in &file.inputs {
        let default = input.default.as_ref().map(Value::from_yaml);
        let spec = InputSpec {
            ty: input.ty.clone(),
            required: input.required.unwrap_or(default.is_none()),
            default,
        };
        step = step.input(slot, spec);
    }
    for (slot, output) in &file.outputs {
        step = step.output(slot, OutputSpec::new(output.ty.clone()));
    }

    Ok(step)
}
