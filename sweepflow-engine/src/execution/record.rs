// Execution Records
// Per node-instance status, outputs and attribution

use crate::cache::key::CacheKey;
use crate::step::models::{Failure, Outputs};

use std::fmt;
use std::time::Duration;

/// Status of one node within one expanded instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Done,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Done | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Done => "done",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Why a node never ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// An ancestor in the same instance failed
    UpstreamFailed { node: String },
    /// The run was cancelled before the node could start
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UpstreamFailed { node } => write!(f, "upstream node '{}' failed", node),
            SkipReason::Cancelled => write!(f, "run cancelled"),
        }
    }
}

/// Record of one node-instance
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub node_id: String,
    pub step: String,
    pub status: NodeStatus,
    /// Present once the record reaches `Done`
    pub outputs: Option<Outputs>,
    pub failure: Option<Failure>,
    pub cache_key: Option<CacheKey>,
    /// Satisfied from the cache rather than by running the action
    pub cached: bool,
    pub skip_reason: Option<SkipReason>,
    pub duration: Duration,
}

impl ExecutionRecord {
    pub fn new(node_id: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            step: step.into(),
            status: NodeStatus::Pending,
            outputs: None,
            failure: None,
            cache_key: None,
            cached: false,
            skip_reason: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == NodeStatus::Done
    }

    pub(crate) fn complete(&mut self, outputs: Outputs, cached: bool, duration: Duration) {
        self.status = NodeStatus::Done;
        self.outputs = Some(outputs);
        self.cached = cached;
        self.duration = duration;
    }

    pub(crate) fn fail(&mut self, failure: Failure, duration: Duration) {
        self.status = NodeStatus::Failed;
        self.failure = Some(failure);
        self.duration = duration;
    }

    pub(crate) fn skip(&mut self, reason: SkipReason) {
        self.status = NodeStatus::Skipped;
        self.skip_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!NodeStatus::Pending.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(NodeStatus::Done.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_record_transitions() {
        let mut record = ExecutionRecord::new("design", "design");
        assert_eq!(record.status, NodeStatus::Pending);
        assert!(record.outputs.is_none());

        record.skip(SkipReason::UpstreamFailed {
            node: "spec".to_string(),
        });
        assert_eq!(record.status, NodeStatus::Skipped);
        assert_eq!(
            record.skip_reason.as_ref().map(ToString::to_string),
            Some("upstream node 'spec' failed".to_string())
        );
    }
}
