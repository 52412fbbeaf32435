// Step Models
// Values, slot types and failures shared by descriptors, graphs and the cache

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Realized inputs handed to a step action, keyed by slot name
pub type Inputs = BTreeMap<String, Value>;

/// Realized outputs returned by a step action, keyed by slot name
pub type Outputs = BTreeMap<String, Value>;

// =============================================================================
// Value
// =============================================================================

/// Runtime value flowing along graph edges.
///
/// Maps are key-ordered so that serializing a value is deterministic, which the
/// content cache relies on when digesting inputs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Path(PathBuf),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Value::Path(path.into())
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Value::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Render the value the way it is substituted into command lines and paths
    pub fn as_string(&self) -> String {
        match self {
            Value::Null => "".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 {
                    (*n as i64).to_string()
                } else {
                    n.to_string()
                }
            }
            Value::String(s) => s.clone(),
            Value::Path(p) => p.display().to_string(),
            Value::List(items) => items
                .iter()
                .map(Value::as_string)
                .collect::<Vec<_>>()
                .join(" "),
            Value::Map(_) => self.to_json(),
        }
    }

    /// Plain JSON rendering (paths become strings)
    pub fn to_json(&self) -> String {
        self.to_plain_json().to_string()
    }

    pub fn to_plain_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Path(p) => serde_json::Value::String(p.display().to_string()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_plain_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_plain_json()))
                    .collect(),
            ),
        }
    }

    /// Convert a YAML value from a workflow file
    pub fn from_yaml(yaml: &serde_yaml::Value) -> Self {
        match yaml {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(*b),
            serde_yaml::Value::Number(n) => {
                Value::Number(n.as_f64().unwrap_or(n.as_i64().unwrap_or(0) as f64))
            }
            serde_yaml::Value::String(s) => Value::String(s.clone()),
            serde_yaml::Value::Sequence(seq) => {
                Value::List(seq.iter().map(Self::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(map) => Value::Map(
                map.iter()
                    .filter_map(|(k, v)| {
                        k.as_str()
                            .map(|key| (key.to_string(), Self::from_yaml(v)))
                    })
                    .collect(),
            ),
            serde_yaml::Value::Tagged(tagged) => Self::from_yaml(&tagged.value),
        }
    }

    /// Check the value against a slot type, converting where the type allows it.
    ///
    /// Strings are accepted for `Path` slots and paths for `String` slots.
    pub fn coerce_to(&self, ty: &SlotType) -> Option<Value> {
        match (ty, self) {
            (SlotType::Any, v) => Some(v.clone()),
            (SlotType::Bool, Value::Bool(_)) => Some(self.clone()),
            (SlotType::Number, Value::Number(_)) => Some(self.clone()),
            (SlotType::String, Value::String(_)) => Some(self.clone()),
            (SlotType::String, Value::Path(p)) => Some(Value::String(p.display().to_string())),
            (SlotType::Path, Value::Path(_)) => Some(self.clone()),
            (SlotType::Path, Value::String(s)) => Some(Value::Path(PathBuf::from(s))),
            (SlotType::Map, Value::Map(_)) => Some(self.clone()),
            (SlotType::List(inner), Value::List(items)) => items
                .iter()
                .map(|item| item.coerce_to(inner))
                .collect::<Option<Vec<_>>>()
                .map(Value::List),
            _ => None,
        }
    }

    /// Rewrite every path under `from` so it points under `to` instead
    pub fn relocate(&self, from: &Path, to: &Path) -> Value {
        match self {
            Value::Path(p) => match p.strip_prefix(from) {
                Ok(rest) => Value::Path(to.join(rest)),
                Err(_) => self.clone(),
            },
            Value::List(items) => Value::List(items.iter().map(|v| v.relocate(from, to)).collect()),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.relocate(from, to)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// All paths contained in the value, depth first
    pub fn paths(&self) -> Vec<&Path> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a Path>) {
        match self {
            Value::Path(p) => out.push(p),
            Value::List(items) => items.iter().for_each(|v| v.collect_paths(out)),
            Value::Map(map) => map.values().for_each(|v| v.collect_paths(out)),
            _ => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<PathBuf> for Value {
    fn from(p: PathBuf) -> Self {
        Value::Path(p)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// Slot declarations
// =============================================================================

/// Declared type of an input or output slot
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    #[default]
    Any,
    Bool,
    Number,
    String,
    Path,
    List(Box<SlotType>),
    Map,
}

impl SlotType {
    pub fn list_of(inner: SlotType) -> Self {
        SlotType::List(Box::new(inner))
    }

    /// Whether an output of type `self` may feed an input of type `consumer`
    pub fn is_compatible_with(&self, consumer: &SlotType) -> bool {
        match (self, consumer) {
            (SlotType::Any, _) | (_, SlotType::Any) => true,
            (SlotType::Path, SlotType::String) => true,
            (SlotType::List(a), SlotType::List(b)) => a.is_compatible_with(b),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotType::Any => write!(f, "any"),
            SlotType::Bool => write!(f, "bool"),
            SlotType::Number => write!(f, "number"),
            SlotType::String => write!(f, "string"),
            SlotType::Path => write!(f, "path"),
            SlotType::List(inner) => write!(f, "list<{}>", inner),
            SlotType::Map => write!(f, "map"),
        }
    }
}

/// Declaration of one input slot
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    pub ty: SlotType,
    pub required: bool,
    pub default: Option<Value>,
}

impl InputSpec {
    pub fn required(ty: SlotType) -> Self {
        Self {
            ty,
            required: true,
            default: None,
        }
    }

    pub fn optional(ty: SlotType) -> Self {
        Self {
            ty,
            required: false,
            default: None,
        }
    }

    pub fn with_default(ty: SlotType, default: impl Into<Value>) -> Self {
        Self {
            ty,
            required: false,
            default: Some(default.into()),
        }
    }
}

/// Declaration of one output slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub ty: SlotType,
}

impl OutputSpec {
    pub fn new(ty: SlotType) -> Self {
        Self { ty }
    }
}

// =============================================================================
// Failure
// =============================================================================

/// Error reported by a step action.
///
/// A failure is local to the node that produced it; dependents are skipped
/// and attributed to it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct Failure {
    pub message: String,
    pub exit_code: Option<i32>,
    pub details: Option<String>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
            details: None,
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub(crate) fn cancelled() -> Self {
        Self::new("run cancelled while the action was running")
    }
}
