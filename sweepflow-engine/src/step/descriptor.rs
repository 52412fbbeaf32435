// Step Descriptors
// Immutable definitions of one unit of work and the action seam they execute through

use crate::step::models::{Failure, InputSpec, Inputs, OutputSpec, Outputs};

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Context handed to an action for one execution
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Id of the node being executed
    pub node_id: String,
    /// Label of the expanded instance (`_` when nothing is swept)
    pub instance: String,
    /// Private staging directory; files written here are published on success
    pub work_dir: PathBuf,
}

/// Trait for step actions
#[async_trait::async_trait]
pub trait StepAction: Send + Sync {
    /// Consume realized inputs and produce every declared output, or fail
    async fn run(&self, inputs: &Inputs, ctx: &ActionContext) -> Result<Outputs, Failure>;

    /// Stable description of what the action runs, folded into cache keys.
    ///
    /// Actions configured from data (argv, env, ...) return it here so that
    /// editing the configuration invalidates earlier results. Closures have
    /// no inspectable identity and rely on the step version instead.
    fn identity(&self) -> Option<String> {
        None
    }
}

type ActionFn = dyn Fn(&Inputs, &ActionContext) -> Result<Outputs, Failure> + Send + Sync;

/// Action backed by a plain closure
pub struct FnAction {
    func: Box<ActionFn>,
}

impl FnAction {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Inputs, &ActionContext) -> Result<Outputs, Failure> + Send + Sync + 'static,
    {
        Self {
            func: Box::new(func),
        }
    }
}

#[async_trait::async_trait]
impl StepAction for FnAction {
    async fn run(&self, inputs: &Inputs, ctx: &ActionContext) -> Result<Outputs, Failure> {
        (self.func)(inputs, ctx)
    }
}

/// Immutable description of a processing step
#[derive(Clone)]
pub struct StepDescriptor {
    name: String,
    version: String,
    inputs: BTreeMap<String, InputSpec>,
    outputs: BTreeMap<String, OutputSpec>,
    action: Arc<dyn StepAction>,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self::with_action(name, Arc::new(action))
    }

    pub fn with_action(name: impl Into<String>, action: Arc<dyn StepAction>) -> Self {
        Self {
            name: name.into(),
            version: "1".to_string(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            action,
        }
    }

    /// Set the version; bumping it invalidates every cached result of the step
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Declare an input slot
    pub fn input(mut self, slot: impl Into<String>, spec: InputSpec) -> Self {
        self.inputs.insert(slot.into(), spec);
        self
    }

    /// Declare an output slot
    pub fn output(mut self, slot: impl Into<String>, spec: OutputSpec) -> Self {
        self.outputs.insert(slot.into(), spec);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_version(&self) -> &str {
        &self.version
    }

    pub fn inputs(&self) -> &BTreeMap<String, InputSpec> {
        &self.inputs
    }

    pub fn outputs(&self) -> &BTreeMap<String, OutputSpec> {
        &self.outputs
    }

    pub fn input_spec(&self, slot: &str) -> Option<&InputSpec> {
        self.inputs.get(slot)
    }

    pub fn output_spec(&self, slot: &str) -> Option<&OutputSpec> {
        self.outputs.get(slot)
    }

    pub fn action(&self) -> Arc<dyn StepAction> {
        Arc::clone(&self.action)
    }

    pub fn identity(&self) -> Option<String> {
        self.action.identity()
    }
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::models::{SlotType, Value};

    #[tokio::test]
    async fn test_fn_action_runs_closure() {
        let step = StepDescriptor::new(
            "double",
            FnAction::new(|inputs, _ctx| {
                let x = inputs.get("x").and_then(Value::as_number).unwrap_or(0.0);
                let mut out = Outputs::new();
                out.insert("y".to_string(), Value::Number(x * 2.0));
                Ok(out)
            }),
        )
        .input("x", InputSpec::required(SlotType::Number))
        .output("y", OutputSpec::new(SlotType::Number));

        let mut inputs = Inputs::new();
        inputs.insert("x".to_string(), Value::Number(21.0));
        let ctx = ActionContext {
            node_id: "n".to_string(),
            instance: "_".to_string(),
            work_dir: std::env::temp_dir(),
        };

        let out = step.action().run(&inputs, &ctx).await.unwrap();
        assert_eq!(out.get("y"), Some(&Value::Number(42.0)));
        assert_eq!(step.step_version(), "1");
    }
}
