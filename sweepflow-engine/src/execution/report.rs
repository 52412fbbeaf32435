// Run Reports
// Outcome of executing every expanded instance of a workflow

use crate::execution::expand::InstanceKey;
use crate::execution::record::{ExecutionRecord, NodeStatus};
use crate::step::models::Failure;

use std::time::Duration;

/// Records of one expanded instance, in node declaration order
#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub index: usize,
    pub key: InstanceKey,
    pub records: Vec<ExecutionRecord>,
}

impl InstanceReport {
    pub fn record(&self, node_id: &str) -> Option<&ExecutionRecord> {
        self.records.iter().find(|r| r.node_id == node_id)
    }

    pub fn label(&self) -> String {
        self.key.label()
    }

    pub fn success(&self) -> bool {
        self.records.iter().all(ExecutionRecord::is_done)
    }
}

/// A node-instance that failed
#[derive(Debug, Clone, PartialEq)]
pub struct FailedNode {
    /// Instance label
    pub instance: String,
    pub node_id: String,
    pub failure: Failure,
}

/// Overall outcome of a run
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Success,
    PartialFailure { failed: Vec<FailedNode> },
}

/// Result of a workflow run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub workflow: String,
    pub instances: Vec<InstanceReport>,
    /// (instance index, node id) in the order actions were dispatched
    pub dispatch_order: Vec<(usize, String)>,
    pub duration: Duration,
    pub cancelled: bool,
}

impl RunReport {
    /// `Success` iff every node of every instance is done
    pub fn outcome(&self) -> RunOutcome {
        if self.success() {
            return RunOutcome::Success;
        }
        RunOutcome::PartialFailure {
            failed: self.failed(),
        }
    }

    pub fn success(&self) -> bool {
        !self.cancelled && self.instances.iter().all(InstanceReport::success)
    }

    /// Failed node-instances in instance then declaration order
    pub fn failed(&self) -> Vec<FailedNode> {
        self.instances
            .iter()
            .flat_map(|instance| {
                instance.records.iter().filter_map(move |record| {
                    let failure = record.failure.clone()?;
                    (record.status == NodeStatus::Failed).then(|| FailedNode {
                        instance: instance.label(),
                        node_id: record.node_id.clone(),
                        failure,
                    })
                })
            })
            .collect()
    }

    /// Number of actions actually run
    pub fn executed_count(&self) -> usize {
        self.dispatch_order.len()
    }

    /// Number of node-instances satisfied from the cache
    pub fn cached_count(&self) -> usize {
        self.records().filter(|r| r.cached).count()
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.records().filter(|r| r.status == status).count()
    }

    pub fn records(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.instances.iter().flat_map(|i| i.records.iter())
    }

    pub fn instance(&self, label: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| i.label() == label)
    }
}
