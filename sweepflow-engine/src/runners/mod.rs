// Runners Module
// Built-in step actions backed by external processes

pub mod command;

// Re-export key types
pub use command::{CommandAction, CommandOutput};
