// Run Report
// Terminal state of every node instance after a run

use super::context::ExecutionContext;
use crate::units::SlotValue;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a node instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    /// Not run because an upstream node failed
    Skipped,
    /// Not run because shutdown was requested first
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Cancelled
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

/// Category of a node failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Input files could not be located
    Resolution,
    /// External program failed or returned incomplete outputs
    ExternalRoutine,
    /// Refused to overwrite an existing artifact
    ArtifactExists,
    /// Malformed stimulus event table
    EventTable,
    /// Inputs of the wrong kind or shape
    Input,
    Io,
    Panicked,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Resolution => "resolution",
            FailureKind::ExternalRoutine => "external routine",
            FailureKind::ArtifactExists => "artifact exists",
            FailureKind::EventTable => "event table",
            FailureKind::Input => "input",
            FailureKind::Io => "io",
            FailureKind::Panicked => "panic",
        };
        write!(f, "{}", label)
    }
}

/// Why a node failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one node instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub unit: String,
    pub status: NodeStatus,
    /// Wall-clock seconds spent running (0 if never dispatched)
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<NodeFailure>,
    /// Reason a node was skipped or cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, SlotValue>,
}

impl NodeReport {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.max(0.0))
    }
}

/// Outcome of one graph instance (one execution context)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    pub context: ExecutionContext,
    pub context_key: String,
    pub nodes: Vec<NodeReport>,
}

impl InstanceReport {
    pub fn success(&self) -> bool {
        self.nodes
            .iter()
            .all(|node| node.status == NodeStatus::Completed)
    }

    pub fn node(&self, unit: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|node| node.unit == unit)
    }
}

/// Result of executing a set of graph instances
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub workflow: String,
    pub duration_secs: f64,
    /// Whether shutdown was requested during the run
    pub cancelled: bool,
    pub instances: Vec<InstanceReport>,
}

impl RunReport {
    /// True iff every node instance completed (vacuously true for an empty run)
    pub fn success(&self) -> bool {
        self.instances.iter().all(InstanceReport::success)
    }

    /// Process exit status: 0 on success, 1 if any node did not complete
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    pub fn total_nodes(&self) -> usize {
        self.instances.iter().map(|i| i.nodes.len()).sum()
    }

    /// Number of nodes in a given terminal state
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes().filter(|(_, node)| node.status == status).count()
    }

    /// Every node with its instance
    pub fn nodes(&self) -> impl Iterator<Item = (&InstanceReport, &NodeReport)> {
        self.instances
            .iter()
            .flat_map(|instance| instance.nodes.iter().map(move |node| (instance, node)))
    }

    /// Failed nodes with their instance
    pub fn failures(&self) -> impl Iterator<Item = (&InstanceReport, &NodeReport)> {
        self.nodes()
            .filter(|(_, node)| node.status == NodeStatus::Failed)
    }

    pub fn instance(&self, context_key: &str) -> Option<&InstanceReport> {
        self.instances
            .iter()
            .find(|instance| instance.context_key == context_key)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.max(0.0))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(unit: &str, status: NodeStatus) -> NodeReport {
        NodeReport {
            unit: unit.to_string(),
            status,
            duration_secs: 1.5,
            failure: None,
            reason: None,
            outputs: BTreeMap::new(),
        }
    }

    fn instance(subject: &str, nodes: Vec<NodeReport>) -> InstanceReport {
        let context = ExecutionContext::single("subject_id", subject);
        InstanceReport {
            context_key: context.key(),
            context,
            nodes,
        }
    }

    #[test]
    fn test_empty_report_succeeds() {
        let report = RunReport::default();
        assert!(report.success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.total_nodes(), 0);
    }

    #[test]
    fn test_counts_and_exit_code() {
        let report = RunReport {
            workflow: "FS_workflow".into(),
            duration_secs: 10.0,
            cancelled: false,
            instances: vec![
                instance(
                    "sub001",
                    vec![node("grab", NodeStatus::Completed), node("recon", NodeStatus::Completed)],
                ),
                instance(
                    "sub002",
                    vec![node("grab", NodeStatus::Failed), node("recon", NodeStatus::Skipped)],
                ),
            ],
        };

        assert!(!report.success());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.count(NodeStatus::Completed), 2);
        assert_eq!(report.count(NodeStatus::Skipped), 1);
        assert_eq!(report.failures().count(), 1);
        assert!(report.instance("_subject_id_sub001").unwrap().success());
    }

    #[test]
    fn test_cancelled_is_not_success() {
        let report = RunReport {
            instances: vec![instance("sub001", vec![node("grab", NodeStatus::Cancelled)])],
            ..RunReport::default()
        };
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_report_serializes() {
        let mut failed = node("recon", NodeStatus::Failed);
        failed.failure = Some(NodeFailure {
            kind: FailureKind::ExternalRoutine,
            message: "exit code 1".into(),
        });
        let report = RunReport {
            workflow: "FS_workflow".into(),
            instances: vec![instance("sub001", vec![failed])],
            ..RunReport::default()
        };

        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"failed\""));
        assert!(json.contains("\"kind\": \"external_routine\""));

        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_terminal_states() {
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(NodeStatus::Cancelled.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
    }
}
