// Workflow file models
// Serde shapes of a workflow YAML document

use crate::step::models::SlotType;

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::path::PathBuf;

/// A workflow definition file.
///
/// ```yaml
/// name: glm
/// steps:
///   spec:
///     command: [make-onsets, "{subject}", onsets.tsv]
///     inputs:
///       subject: { type: string }
///     outputs:
///       onsets: { type: path, file: onsets.tsv }
/// nodes:
///   - id: spec
///     step: spec
///     iterables: { slot: subject, values: [A, B] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowFile {
    pub name: String,

    /// Command step descriptors, keyed by step name
    #[serde(default)]
    pub steps: BTreeMap<String, StepFile>,

    /// Nodes in declaration order
    #[serde(default)]
    pub nodes: Vec<NodeFile>,

    #[serde(default)]
    pub sink: Option<SinkFile>,

    /// Directory relative paths are resolved against (the file's directory)
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepFile {
    #[serde(default = "default_version")]
    pub version: String,

    /// argv template; `{slot}` and `{work_dir}` are substituted
    pub command: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub inputs: BTreeMap<String, InputFile>,

    #[serde(default)]
    pub outputs: BTreeMap<String, OutputFile>,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputFile {
    #[serde(rename = "type", default)]
    pub ty: SlotType,

    /// Defaults to true unless a default value is given
    #[serde(default)]
    pub required: Option<bool>,

    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputFile {
    #[serde(rename = "type", default)]
    pub ty: SlotType,

    /// File written inside the work dir
    #[serde(default)]
    pub file: Option<String>,

    /// Take the value from trimmed stdout
    #[serde(default)]
    pub stdout: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeFile {
    pub id: String,
    pub step: String,

    /// Literal input values
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_yaml::Value>,

    /// `slot: producer.slot`
    #[serde(default)]
    pub connect: BTreeMap<String, String>,

    #[serde(default, alias = "iterable")]
    pub iterables: Option<SweepFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepFile {
    pub slot: String,
    pub values: Vec<serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkFile {
    pub base_dir: PathBuf,

    #[serde(default)]
    pub substitutions: Vec<SubstitutionFile>,

    #[serde(default)]
    pub outputs: Vec<SinkOutputFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubstitutionFile {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkOutputFile {
    /// `node.slot`
    pub from: String,
    /// Destination template
    pub to: String,
}
