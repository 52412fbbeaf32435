// Execution Engine Module
// Handles graph construction, iterable expansion and scheduled execution

pub mod events;
pub mod executor;
pub mod expand;
pub mod graph;
pub mod record;
pub mod report;

// Re-export key types
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressSender};
pub use executor::{CancelHandle, ExecutorConfig, WorkflowExecutor};
pub use expand::{ExpandedInstance, Expansion, InstanceKey, IterableExpander};
pub use graph::{
    Binding, GraphError, GraphErrorKind, Node, OutputRef, SlotDirection, Sweep, WorkflowGraph,
};
pub use record::{ExecutionRecord, NodeStatus, SkipReason};
pub use report::{FailedNode, InstanceReport, RunOutcome, RunReport};
