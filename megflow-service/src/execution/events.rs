// Execution Events
// Progress reporting and event types for workflow execution

use super::report::FailureKind;
use crate::units::NodeInstanceId;

use std::path::PathBuf;
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
        instances: usize,
        nodes: usize,
    },

    /// Run finished (every node terminal)
    RunCompleted {
        workflow: String,
        success: bool,
        duration: Duration,
    },

    /// All nodes of one instance reached a terminal state
    InstanceCompleted { context_key: String, success: bool },

    /// Node instance dispatched to a worker
    NodeStarted { node: NodeInstanceId },

    /// Output line from an external routine
    NodeOutput {
        node: NodeInstanceId,
        line: String,
        is_stderr: bool,
    },

    NodeCompleted {
        node: NodeInstanceId,
        duration: Duration,
    },

    NodeFailed {
        node: NodeInstanceId,
        kind: FailureKind,
        message: String,
        duration: Duration,
    },

    /// Node will not run because an upstream node failed
    NodeSkipped { node: NodeInstanceId, reason: String },

    /// Node was never dispatched because shutdown was requested
    NodeCancelled { node: NodeInstanceId },

    /// Output copied into the artifact tree
    ArtifactPublished { node: NodeInstanceId, path: PathBuf },

    /// Shutdown requested; in-flight nodes are left to finish
    ShutdownRequested { in_flight: usize },
}

impl ExecutionEvent {
    pub fn run_started(workflow: impl Into<String>, instances: usize, nodes: usize) -> Self {
        Self::RunStarted {
            workflow: workflow.into(),
            instances,
            nodes,
        }
    }

    pub fn run_completed(workflow: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::RunCompleted {
            workflow: workflow.into(),
            success,
            duration,
        }
    }

    pub fn instance_completed(context_key: impl Into<String>, success: bool) -> Self {
        Self::InstanceCompleted {
            context_key: context_key.into(),
            success,
        }
    }

    pub fn node_started(node: &NodeInstanceId) -> Self {
        Self::NodeStarted { node: node.clone() }
    }

    pub fn node_output(node: &NodeInstanceId, line: impl Into<String>, is_stderr: bool) -> Self {
        Self::NodeOutput {
            node: node.clone(),
            line: line.into(),
            is_stderr,
        }
    }

    pub fn node_completed(node: &NodeInstanceId, duration: Duration) -> Self {
        Self::NodeCompleted {
            node: node.clone(),
            duration,
        }
    }

    pub fn node_failed(
        node: &NodeInstanceId,
        kind: FailureKind,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self::NodeFailed {
            node: node.clone(),
            kind,
            message: message.into(),
            duration,
        }
    }

    pub fn node_skipped(node: &NodeInstanceId, reason: impl Into<String>) -> Self {
        Self::NodeSkipped {
            node: node.clone(),
            reason: reason.into(),
        }
    }

    pub fn node_cancelled(node: &NodeInstanceId) -> Self {
        Self::NodeCancelled { node: node.clone() }
    }

    /// Mirror the event into the tracing log
    pub fn trace(&self) {
        match self {
            Self::RunStarted {
                workflow,
                instances,
                nodes,
            } => tracing::info!(%workflow, instances, nodes, "run started"),
            Self::RunCompleted {
                workflow,
                success,
                duration,
            } => tracing::info!(%workflow, success, ?duration, "run completed"),
            Self::InstanceCompleted {
                context_key,
                success,
            } => tracing::info!(context = %context_key, success, "instance completed"),
            Self::NodeStarted { node } => {
                tracing::info!(unit = %node.unit, context = %node.context_key, "node started")
            }
            Self::NodeOutput {
                node,
                line,
                is_stderr,
            } => tracing::trace!(unit = %node.unit, context = %node.context_key, is_stderr, "{}", line),
            Self::NodeCompleted { node, duration } => tracing::info!(
                unit = %node.unit,
                context = %node.context_key,
                ?duration,
                "node completed"
            ),
            Self::NodeFailed {
                node,
                kind,
                message,
                ..
            } => tracing::error!(
                unit = %node.unit,
                context = %node.context_key,
                kind = %kind,
                "node failed: {}",
                message
            ),
            Self::NodeSkipped { node, reason } => tracing::warn!(
                unit = %node.unit,
                context = %node.context_key,
                "node skipped: {}",
                reason
            ),
            Self::NodeCancelled { node } => {
                tracing::warn!(unit = %node.unit, context = %node.context_key, "node cancelled")
            }
            Self::ArtifactPublished { node, path } => tracing::debug!(
                unit = %node.unit,
                context = %node.context_key,
                path = %path.display(),
                "artifact published"
            ),
            Self::ShutdownRequested { in_flight } => {
                tracing::warn!(in_flight, "shutdown requested, waiting for running nodes")
            }
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
