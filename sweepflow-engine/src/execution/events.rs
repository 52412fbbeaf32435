// Execution Events
// Progress reporting and event types for workflow execution

use crate::execution::record::SkipReason;
use crate::step::models::Failure;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during workflow execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run started
    RunStarted {
        workflow: String,
        total_instances: usize,
        total_nodes: usize,
    },

    /// Run finished (every record terminal, or cancelled)
    RunCompleted {
        workflow: String,
        success: bool,
        duration: Duration,
    },

    /// An action was dispatched to a worker
    NodeStarted { instance: String, node_id: String },

    /// A node was satisfied from the cache
    NodeCached {
        instance: String,
        node_id: String,
        key: String,
    },

    /// An action finished and its result was published
    NodeCompleted {
        instance: String,
        node_id: String,
        duration: Duration,
    },

    /// An action failed
    NodeFailed {
        instance: String,
        node_id: String,
        failure: Failure,
        duration: Duration,
    },

    /// A node will never run
    NodeSkipped {
        instance: String,
        node_id: String,
        reason: SkipReason,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        node_id: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn run_started(
        workflow: impl Into<String>,
        total_instances: usize,
        total_nodes: usize,
    ) -> Self {
        Self::RunStarted {
            workflow: workflow.into(),
            total_instances,
            total_nodes,
        }
    }

    pub fn run_completed(workflow: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::RunCompleted {
            workflow: workflow.into(),
            success,
            duration,
        }
    }

    pub fn node_started(instance: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::NodeStarted {
            instance: instance.into(),
            node_id: node_id.into(),
        }
    }

    pub fn node_cached(
        instance: impl Into<String>,
        node_id: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::NodeCached {
            instance: instance.into(),
            node_id: node_id.into(),
            key: key.into(),
        }
    }

    pub fn node_completed(
        instance: impl Into<String>,
        node_id: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self::NodeCompleted {
            instance: instance.into(),
            node_id: node_id.into(),
            duration,
        }
    }

    pub fn node_failed(
        instance: impl Into<String>,
        node_id: impl Into<String>,
        failure: Failure,
        duration: Duration,
    ) -> Self {
        Self::NodeFailed {
            instance: instance.into(),
            node_id: node_id.into(),
            failure,
            duration,
        }
    }

    pub fn node_skipped(
        instance: impl Into<String>,
        node_id: impl Into<String>,
        reason: SkipReason,
    ) -> Self {
        Self::NodeSkipped {
            instance: instance.into(),
            node_id: node_id.into(),
            reason,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, node_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            node_id,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, node_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            node_id,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::run_started("glm", 2, 6));
        tx.send_event(ExecutionEvent::node_started("subject=A", "spec"));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ExecutionEvent::RunStarted { .. }));

        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ExecutionEvent::NodeStarted { .. }));
    }

    #[test]
    fn test_skip_event_carries_reason() {
        let event = ExecutionEvent::node_skipped(
            "subject=B",
            "estimate",
            SkipReason::UpstreamFailed {
                node: "design".to_string(),
            },
        );

        if let ExecutionEvent::NodeSkipped {
            instance,
            node_id,
            reason,
        } = event
        {
            assert_eq!(instance, "subject=B");
            assert_eq!(node_id, "estimate");
            assert_eq!(reason.to_string(), "upstream node 'design' failed");
        } else {
            panic!("wrong event type");
        }
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(ExecutionEvent::warning("test", None));
    }
}
