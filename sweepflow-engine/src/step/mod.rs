// Step Module
// Step descriptors, slot declarations and the action boundary

pub mod descriptor;
pub mod models;
pub mod registry;

// Re-export key types
pub use descriptor::{ActionContext, FnAction, StepAction, StepDescriptor};
pub use models::{Failure, InputSpec, Inputs, OutputSpec, Outputs, SlotType, Value};
pub use registry::StepRegistry;
