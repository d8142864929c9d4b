//! Run results.
//!
//! A [`RunReport`] is returned by every completed run, failed or not. It holds
//! one [`NodeReport`] per scheduled invocation, in the order the invocations
//! were recorded.

use std::fmt::{self, Display, Formatter, Write as _};

use chrono::{DateTime, Utc};
use console::style;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diagnostics::{ErrorKind, TaskError};
use crate::handle::{NodeId, PendingResult};

/// Lifecycle of a node within one run.
///
/// `Pending -> Ready -> Running -> Succeeded | Failed`, or `Pending ->
/// Cancelled` when an ancestor fails. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Final record of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub task: String,
    pub state: NodeState,
    /// Direct dependencies, in creation order.
    pub dependencies: Vec<NodeId>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub workspace: Option<camino::Utf8PathBuf>,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    /// The failed ancestor which caused the cancellation of this node.
    pub cancelled_by: Option<NodeId>,
}

impl NodeReport {
    /// Wall time between start and end, for nodes which actually ran.
    pub fn duration(&self) -> Option<chrono::TimeDelta> {
        Some(self.finished_at? - self.started_at?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Highest number of nodes observed running at the same time.
    pub peak_running: usize,
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn node(&self, handle: &PendingResult) -> Option<&NodeReport> {
        self.node_by_id(handle.node_id())
    }

    pub fn node_by_id(&self, id: &NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    /// Result of the node behind `handle`, present only if it succeeded.
    pub fn value(&self, handle: &PendingResult) -> Option<&Value> {
        self.node(handle)
            .filter(|node| node.state == NodeState::Succeeded)
            .and_then(|node| node.result.as_ref())
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeReport> {
        self.in_state(NodeState::Failed)
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &NodeReport> {
        self.in_state(NodeState::Cancelled)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &NodeReport> {
        self.in_state(NodeState::Succeeded)
    }

    /// Every error of the run, cancellations included.
    pub fn errors(&self) -> impl Iterator<Item = (&NodeId, &TaskError)> {
        self.nodes
            .iter()
            .filter_map(|node| node.error.as_ref().map(|err| (&node.id, err)))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn in_state(&self, state: NodeState) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(move |node| node.state == state)
    }

    /// Renders the run as a Mermaid diagram, coloured by final node state.
    ///
    /// * **Green**: Succeeded
    /// * **Red**: Failed
    /// * **Grey**: Cancelled
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for (i, node) in self.nodes.iter().enumerate() {
            let label = node.id.as_str().replace('"', "\\\"");
            let detail = match (node.state, node.duration()) {
                (NodeState::Succeeded, Some(d)) => format_delta(d),
                (state, _) => state.to_string(),
            };
            let color = match node.state {
                NodeState::Succeeded => "#86EFAC",
                NodeState::Failed => "#FCA5A5",
                NodeState::Cancelled => "#D1D5DB",
                _ => "#ADD8E6",
            };

            let _ = writeln!(f, "    {i}[\"{label}\\n{detail}\"]");
            let _ = writeln!(f, "    style {i} fill:{color}");
        }

        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.dependencies {
                if let Some(j) = self.nodes.iter().position(|n| &n.id == dep) {
                    let _ = writeln!(f, "    {j} --> {i}");
                }
            }
        }

        f
    }
}

fn format_delta(delta: chrono::TimeDelta) -> String {
    let ms = delta.num_milliseconds();
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.2}s", ms as f64 / 1000.0)
    }
}

impl Display for RunReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let total = format_delta(self.finished_at - self.started_at);
        let status = match self.status {
            RunStatus::Success => style("succeeded").green(),
            RunStatus::Failed => style("failed").red(),
        };
        writeln!(
            f,
            "Run {status} in {total}: {} succeeded, {} failed, {} cancelled (peak {} running)",
            self.succeeded().count(),
            self.failed().count(),
            self.cancelled().count(),
            self.peak_running,
        )?;

        for node in &self.nodes {
            match node.state {
                NodeState::Succeeded => {
                    let took = node.duration().map(format_delta).unwrap_or_default();
                    writeln!(f, "  {} {} {}", style("✓").green(), node.id, style(took).blue())?
                }
                NodeState::Failed => {
                    let reason = node.error.as_ref().map(ToString::to_string).unwrap_or_default();
                    writeln!(f, "  {} {}: {}", style("✗").red(), node.id, reason)?
                }
                NodeState::Cancelled => {
                    let cause = node
                        .cancelled_by
                        .as_ref()
                        .map(|cause| format!(" (caused by {cause})"))
                        .unwrap_or_default();
                    writeln!(f, "  {} {}{}", style("-").yellow(), node.id, style(cause).dim())?
                }
                state => writeln!(f, "  ? {} {state}", node.id)?,
            }
        }

        Ok(())
    }
}

/// Error attached to nodes which never ran because `cause` failed.
pub(crate) fn cancellation(cause: &NodeId) -> TaskError {
    TaskError::new(
        ErrorKind::CancelledDueToFailure,
        format!("Cancelled because {cause} failed"),
        String::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, state: NodeState) -> NodeReport {
        let (task, inv) = id.split_once('/').unwrap();
        NodeReport {
            id: NodeId::new(task, inv),
            task: task.to_string(),
            state,
            dependencies: Vec::new(),
            started_at: None,
            finished_at: None,
            workspace: None,
            result: None,
            error: None,
            cancelled_by: None,
        }
    }

    fn report() -> RunReport {
        let now = Utc::now();
        let mut a = node("a/1", NodeState::Succeeded);
        a.result = Some(json!("/tmp/a"));
        let mut b = node("b/1", NodeState::Failed);
        b.error = Some(TaskError::new(ErrorKind::TaskException, "boom", ""));
        b.dependencies = vec![a.id.clone()];
        let mut c = node("c/1", NodeState::Cancelled);
        c.cancelled_by = Some(b.id.clone());
        c.error = Some(cancellation(&b.id));
        c.dependencies = vec![b.id.clone()];

        RunReport {
            status: RunStatus::Failed,
            started_at: now,
            finished_at: now,
            peak_running: 1,
            nodes: vec![a, b, c],
        }
    }

    #[test]
    fn queries() {
        let report = report();
        assert!(!report.is_success());
        assert_eq!(report.failed().count(), 1);
        assert_eq!(report.cancelled().count(), 1);

        let kinds: Vec<_> = report.errors().map(|(_, err)| err.kind).collect();
        assert_eq!(kinds, [ErrorKind::TaskException, ErrorKind::CancelledDueToFailure]);
    }

    #[test]
    fn json_uses_snake_case_states() {
        let json: Value = serde_json::from_str(&report().to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["nodes"][2]["state"], "cancelled");
        assert_eq!(json["nodes"][2]["cancelled_by"], "b/1");
        assert_eq!(json["nodes"][2]["error"]["kind"], "cancelled_due_to_failure");
    }

    #[test]
    fn summary_lists_every_node() {
        let text = console::strip_ansi_codes(&report().to_string()).to_string();
        assert!(text.starts_with("Run failed"));
        assert!(text.contains("b/1: task exception: boom"));
        assert!(text.contains("c/1 (caused by b/1)"));
    }

    #[test]
    fn mermaid_has_edges_and_colours() {
        let chart = report().render_mermaid();
        assert!(chart.starts_with("graph LR"));
        assert!(chart.contains("0 --> 1"));
        assert!(chart.contains("1 --> 2"));
        assert!(chart.contains("style 1 fill:#FCA5A5"));
    }
}
