// Sweepflow Engine Library
// Typed step graphs, parameter sweeps, content-addressed caching and scheduled execution

pub mod cache;
pub mod error;
pub mod execution;
pub mod runners;
pub mod sink;
pub mod step;
pub mod workflow;

// Re-export commonly used types
pub use error::{EngineError, EngineResult};

// Re-export step types
pub use step::{
    ActionContext, Failure, FnAction, InputSpec, Inputs, OutputSpec, Outputs, SlotType,
    StepAction, StepDescriptor, StepRegistry, Value,
};

// Re-export execution types
pub use execution::{
    progress_channel, Binding, CancelHandle, ExecutionEvent, ExecutionRecord, ExecutorConfig,
    GraphError, InstanceReport, IterableExpander, NodeStatus, OutputRef, ProgressSender,
    RunOutcome, RunReport, SkipReason, WorkflowExecutor, WorkflowGraph,
};

// Re-export cache types
pub use cache::{CacheError, CacheKey, ContentCache, ContentCacheConfig};

// Re-export runner, sink and workflow types
pub use runners::CommandAction;
pub use sink::{DataSink, SinkError, SinkMapping, SinkReport};
pub use workflow::{ParseError, WorkflowDefinition, WorkflowParser};
