// Data Sink
// Places selected outputs of a finished instance into a stable directory layout

use crate::execution::graph::OutputRef;
use crate::execution::report::InstanceReport;
use crate::step::models::Value;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while placing outputs
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Output '{source_ref}' is not available in instance '{instance}'")]
    MissingOutput {
        source_ref: OutputRef,
        instance: String,
    },

    #[error("Invalid destination '{destination}': {reason}")]
    InvalidDestination { destination: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One output routed to a destination template
#[derive(Debug, Clone, PartialEq)]
pub struct SinkMapping {
    pub source: OutputRef,
    /// Relative destination; `{instance}`, `{node}`, `{slot}` and sweep
    /// slot names are substituted
    pub template: String,
}

impl SinkMapping {
    pub fn new(source: OutputRef, template: impl Into<String>) -> Self {
        Self {
            source,
            template: template.into(),
        }
    }
}

/// Outcome of collecting one instance
#[derive(Debug, Default)]
pub struct SinkReport {
    pub placed: Vec<PathBuf>,
    pub failures: Vec<(SinkMapping, SinkError)>,
}

impl SinkReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Output placement rooted at a base directory
#[derive(Debug, Clone)]
pub struct DataSink {
    base_dir: PathBuf,
    substitutions: Vec<(String, String)>,
}

impl DataSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            substitutions: Vec::new(),
        }
    }

    /// Add a string replacement applied, in order, to rendered destinations
    pub fn with_substitution(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.substitutions.push((from.into(), to.into()));
        self
    }

    /// Same mappings and substitutions, placed under another directory
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Render a mapping's destination for one instance
    pub fn render_destination(
        &self,
        instance: &InstanceReport,
        mapping: &SinkMapping,
    ) -> Result<PathBuf, SinkError> {
        let mut vars = instance.key.substitutions();
        vars.insert("node".to_string(), mapping.source.node.clone());
        vars.insert("slot".to_string(), mapping.source.slot.clone());

        let mut rendered = render(&mapping.template, &vars)?;
        for (from, to) in &self.substitutions {
            rendered = rendered.replace(from.as_str(), to);
        }

        let relative = Path::new(&rendered);
        let invalid = |reason: &str| SinkError::InvalidDestination {
            destination: rendered.clone(),
            reason: reason.to_string(),
        };
        if rendered.trim().is_empty() {
            return Err(invalid("destination is empty"));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => return Err(invalid("'..' is not allowed")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("destination must be relative"))
                }
            }
        }

        Ok(self.base_dir.join(relative))
    }

    /// Place every mapped output of a finished instance.
    ///
    /// A failure on one mapping is recorded and does not stop the others.
    pub fn collect(&self, instance: &InstanceReport, mappings: &[SinkMapping]) -> SinkReport {
        let mut report = SinkReport::default();
        for mapping in mappings {
            match self.place_one(instance, mapping) {
                Ok(dest) => report.placed.push(dest),
                Err(e) => report.failures.push((mapping.clone(), e)),
            }
        }
        report
    }

    fn place_one(
        &self,
        instance: &InstanceReport,
        mapping: &SinkMapping,
    ) -> Result<PathBuf, SinkError> {
        let value = instance
            .record(&mapping.source.node)
            .filter(|r| r.is_done())
            .and_then(|r| r.outputs.as_ref())
            .and_then(|o| o.get(&mapping.source.slot))
            .ok_or_else(|| SinkError::MissingOutput {
                source_ref: mapping.source.clone(),
                instance: instance.label(),
            })?;

        let dest = self.render_destination(instance, mapping)?;
        place(value, &dest)?;
        debug!(source = %mapping.source, dest = %dest.display(), "placed output");
        Ok(dest)
    }
}

fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String, SinkError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| SinkError::InvalidDestination {
            destination: template.to_string(),
            reason: "unterminated placeholder".to_string(),
        })?;
        let name = after[..end].trim();
        let value = vars.get(name).ok_or_else(|| SinkError::InvalidDestination {
            destination: template.to_string(),
            reason: format!("unknown placeholder '{{{}}}'", name),
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Write `value` at `dest` through a temporary sibling, replacing what was there
fn place(value: &Value, dest: &Path) -> Result<(), SinkError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let staging = tempfile::Builder::new()
        .prefix(".sink-")
        .tempdir_in(parent)?;
    let staged = staging.path().join("entry");

    match value {
        Value::Path(src) => copy_path(src, &staged)?,
        Value::List(items) if !items.is_empty() && items.iter().all(|v| v.as_path().is_some()) => {
            fs::create_dir_all(&staged)?;
            for src in items.iter().filter_map(Value::as_path) {
                let name = src.file_name().ok_or_else(|| SinkError::InvalidDestination {
                    destination: src.display().to_string(),
                    reason: "source has no file name".to_string(),
                })?;
                copy_path(src, &staged.join(name))?;
            }
        }
        other => {
            let json = serde_json::to_string_pretty(&other.to_plain_json())?;
            fs::write(&staged, json)?;
        }
    }

    if dest.is_dir() {
        fs::remove_dir_all(dest)?;
    } else if dest.exists() {
        fs::remove_file(dest)?;
    }
    fs::rename(&staged, dest)?;
    Ok(())
}

fn copy_path(src: &Path, dest: &Path) -> io::Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_path(&entry.path(), &dest.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(src, dest).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::expand::IterableExpander;
    use crate::execution::graph::WorkflowGraph;
    use crate::execution::record::ExecutionRecord;
    use crate::step::descriptor::{FnAction, StepDescriptor};
    use crate::step::models::{InputSpec, OutputSpec, Outputs, SlotType};
    use std::sync::Arc;
    use std::time::Duration;

    /// Instance `subject=<subject>` whose `estimate` node produced `outputs`
    fn instance(subject: &str, outputs: Outputs) -> InstanceReport {
        let step = Arc::new(
            StepDescriptor::new("estimate", FnAction::new(|_, _| Ok(Outputs::new())))
                .input("subject", InputSpec::required(SlotType::String))
                .output("betas", OutputSpec::new(SlotType::Any)),
        );
        let mut graph = WorkflowGraph::new("glm");
        graph.add_node("estimate", step).unwrap();
        graph
            .mark_iterable("estimate", "subject", vec![subject.into()])
            .unwrap();
        let expanded = IterableExpander::expand(&graph).unwrap().next().unwrap();

        let mut record = ExecutionRecord::new("estimate", "estimate");
        record.complete(outputs, false, Duration::ZERO);
        InstanceReport {
            index: 0,
            key: expanded.key,
            records: vec![record],
        }
    }

    fn outputs(value: Value) -> Outputs {
        let mut out = Outputs::new();
        out.insert("betas".to_string(), value);
        out
    }

    fn mapping(template: &str) -> SinkMapping {
        SinkMapping::new(OutputRef::new("estimate", "betas"), template)
    }

    #[test]
    fn test_file_is_copied_and_idempotent() {
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("betas.nii");
        fs::write(&src, "beta").unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let sink = DataSink::new(out_dir.path());
        let inst = instance("A", outputs(Value::path(&src)));
        let mappings = [mapping("sub-{subject}/{node}_{slot}.nii")];

        for _ in 0..2 {
            let report = sink.collect(&inst, &mappings);
            assert!(report.success());
            assert_eq!(
                report.placed,
                vec![out_dir.path().join("sub-A/estimate_betas.nii")]
            );
        }
        let placed = out_dir.path().join("sub-A/estimate_betas.nii");
        assert_eq!(fs::read_to_string(placed).unwrap(), "beta");

        // no staging leftovers next to the destination
        let entries = fs::read_dir(out_dir.path().join("sub-A")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_directory_tree_is_copied() {
        let src_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(src_dir.path().join("nested")).unwrap();
        fs::write(src_dir.path().join("nested/a.txt"), "a").unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let sink = DataSink::new(out_dir.path());
        let inst = instance("A", outputs(Value::path(src_dir.path())));

        let report = sink.collect(&inst, &[mapping("{instance}")]);
        assert!(report.success());
        let copied = out_dir.path().join("subject=A/nested/a.txt");
        assert_eq!(fs::read_to_string(copied).unwrap(), "a");
    }

    #[test]
    fn test_non_path_values_become_json() {
        let out_dir = tempfile::tempdir().unwrap();
        let sink = DataSink::new(out_dir.path());
        let inst = instance("B", outputs(Value::from(vec![1i64, 2])));

        let report = sink.collect(&inst, &[mapping("{subject}.json")]);
        assert!(report.success());
        let text = fs::read_to_string(out_dir.path().join("B.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, serde_json::json!([1.0, 2.0]));
    }

    #[test]
    fn test_substitutions_apply_in_order() {
        let out_dir = tempfile::tempdir().unwrap();
        let sink = DataSink::new(out_dir.path())
            .with_substitution("_subject_", "sub-")
            .with_substitution("sub-A", "sub-01");
        let inst = instance("A", outputs(Value::from(1i64)));

        let dest = sink
            .render_destination(&inst, &mapping("_subject_{subject}/betas.json"))
            .unwrap();
        assert_eq!(dest, out_dir.path().join("sub-01/betas.json"));
    }

    #[test]
    fn test_invalid_destinations() {
        let sink = DataSink::new("/out");
        let inst = instance("A", outputs(Value::from(1i64)));

        for template in ["../escape", "/absolute", "{unknown}", "{subject", ""] {
            let err = sink.render_destination(&inst, &mapping(template)).unwrap_err();
            assert!(
                matches!(err, SinkError::InvalidDestination { .. }),
                "template {template:?}"
            );
        }
    }

    #[test]
    fn test_missing_output_does_not_block_others() {
        let out_dir = tempfile::tempdir().unwrap();
        let sink = DataSink::new(out_dir.path());
        let inst = instance("A", outputs(Value::from(1i64)));

        let missing = SinkMapping::new(OutputRef::new("design", "matrix"), "matrix.json");
        let report = sink.collect(&inst, &[missing, mapping("betas.json")]);

        assert_eq!(report.placed.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0].1,
            SinkError::MissingOutput { .. }
        ));
    }
}
