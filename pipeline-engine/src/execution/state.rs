// Run State
// Run and node state machines and reconciliation of backend reports

use crate::error::ErrorKind;
use crate::execution::events::ExecutionEvent;
use crate::parser::models::{FailurePolicy, RuntimeTarget};
use crate::processors::{dns_label, ArtifactHeader};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of one submission of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<pipeline-slug>-<UTC yyyymmddHHMMSS>-<8 hex chars>`
    pub fn generate(pipeline_name: &str) -> Self {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}-{}", slug(pipeline_name), stamp, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase DNS-label-safe form of a name, at most 40 characters
pub fn slug(name: &str) -> String {
    let slug = dns_label(name, 40);
    if slug.is_empty() {
        "pipeline".to_string()
    } else {
        slug
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed | RunState::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Pending => "pending",
            RunState::Submitted => "submitted",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Succeeded | NodeState::Failed | NodeState::Skipped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub state: NodeState,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Where the node's output can be read (file path, pod name, task log id)
    pub log_ref: Option<String>,
    pub message: Option<String>,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            state: NodeState::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            log_ref: None,
            message: None,
        }
    }
}

/// Terminal error of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

/// Node status as reported by a backend, already mapped to engine states
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeReport {
    pub state: Option<NodeState>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_ref: Option<String>,
    pub message: Option<String>,
}

impl NodeReport {
    pub fn new(state: NodeState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Backend view of a run, keyed by engine node id
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NativeStatus {
    /// The backend will not make further progress on this run
    pub finished: bool,
    pub nodes: BTreeMap<String, NodeReport>,
    /// Run-level message from the backend
    pub message: Option<String>,
}

impl NativeStatus {
    pub fn node(mut self, id: impl Into<String>, report: NodeReport) -> Self {
        self.nodes.insert(id.into(), report);
        self
    }

    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }
}

/// Point-in-time view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub runtime: RuntimeTarget,
    pub state: RunState,
    pub nodes: BTreeMap<String, NodeStatus>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<RunError>,
}

impl RunSnapshot {
    /// Fresh `Pending` run with every node `Pending`
    pub fn new(header: &ArtifactHeader) -> Self {
        Self {
            run_id: header.run_id.clone(),
            pipeline_name: header.pipeline_name.clone(),
            runtime: header.runtime,
            state: RunState::Pending,
            nodes: header
                .nodes
                .iter()
                .map(|n| (n.id.clone(), NodeStatus::default()))
                .collect(),
            submitted_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn node(&self, id: &str) -> Option<&NodeStatus> {
        self.nodes.get(id)
    }

    /// Count of nodes per state
    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|n| n.state == state).count()
    }

    pub fn mark_submitted(&mut self) -> Vec<ExecutionEvent> {
        self.submitted_at = Some(Utc::now());
        let mut events = Vec::new();
        self.set_state(RunState::Submitted, None, &mut events);
        events
    }

    /// Record a failed submission; nodes never started
    pub fn mark_submission_failed(&mut self, message: impl Into<String>) -> Vec<ExecutionEvent> {
        let error = RunError::new(ErrorKind::Submission, message);
        self.abort(RunState::Failed, error, "run was not submitted")
    }

    /// Stop the run: pending nodes become skipped, running nodes failed
    pub fn abort(&mut self, state: RunState, error: RunError, reason: &str) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        if self.is_terminal() {
            return events;
        }

        let now = Utc::now();
        for (id, status) in self.nodes.iter_mut() {
            let next = match status.state {
                NodeState::Pending => NodeState::Skipped,
                NodeState::Running => NodeState::Failed,
                _ => continue,
            };
            status.state = next;
            status.finished_at = Some(now);
            status.message = Some(reason.to_string());
            events.push(ExecutionEvent::node_state_changed(
                &self.run_id,
                id,
                next,
                status.attempts,
                status.message.clone(),
            ));
        }

        self.set_state(state, Some(error), &mut events);
        events
    }

    /// Fold a backend report into the snapshot and return the resulting transitions.
    ///
    /// Terminal node states never change. Under halt-downstream, nodes
    /// whose dependencies failed or were skipped become skipped. Once the
    /// backend is finished, nodes it never attempted become skipped.
    pub fn reconcile(&mut self, header: &ArtifactHeader, native: &NativeStatus) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        if self.is_terminal() {
            return events;
        }

        self.fold(header, native, &mut events);

        if self.nodes.values().all(|s| s.state.is_terminal()) {
            let failed: Vec<&str> = self
                .nodes
                .iter()
                .filter(|(_, s)| s.state == NodeState::Failed)
                .map(|(id, _)| id.as_str())
                .collect();
            let skipped = self.count(NodeState::Skipped);

            if failed.is_empty() && skipped == 0 {
                self.set_state(RunState::Succeeded, None, &mut events);
            } else {
                let message = if !failed.is_empty() {
                    format!("node(s) failed: {}", failed.join(", "))
                } else {
                    native
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("{} node(s) were never attempted", skipped))
                };
                self.set_state(
                    RunState::Failed,
                    Some(RunError::new(ErrorKind::Execution, message)),
                    &mut events,
                );
            }
        }

        events
    }

    /// Stop the run on request.
    ///
    /// Node results in `last` are kept, but the run itself always ends
    /// `Cancelled`, even when the backend already wound it down as failed.
    pub fn cancel(
        &mut self,
        header: &ArtifactHeader,
        last: Option<&NativeStatus>,
        reason: &str,
    ) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        if self.is_terminal() {
            return events;
        }

        if let Some(native) = last {
            let native = NativeStatus {
                finished: false,
                ..native.clone()
            };
            self.fold(header, &native, &mut events);
        }
        events.extend(self.abort(
            RunState::Cancelled,
            RunError::new(ErrorKind::Cancellation, reason),
            reason,
        ));
        events
    }

    /// Apply node reports without deciding the run's outcome
    fn fold(&mut self, header: &ArtifactHeader, native: &NativeStatus, events: &mut Vec<ExecutionEvent>) {
        let progressed = native.finished
            || native
                .nodes
                .values()
                .any(|r| r.state.map_or(false, |s| s != NodeState::Pending));
        if progressed && matches!(self.state, RunState::Pending | RunState::Submitted) {
            self.set_state(RunState::Running, None, events);
        }

        let halt = header.failure_policy == FailurePolicy::HaltDownstream;
        for artifact_node in &header.nodes {
            let id = artifact_node.id.as_str();
            let blocked_by = if halt {
                artifact_node.upstream.iter().find(|up| {
                    self.nodes
                        .get(up.as_str())
                        .map_or(false, |s| matches!(s.state, NodeState::Failed | NodeState::Skipped))
                })
            } else {
                None
            }
            .cloned();

            let run_id = self.run_id.clone();
            let Some(status) = self.nodes.get_mut(id) else {
                continue;
            };
            if status.state.is_terminal() {
                continue;
            }

            let report = native.nodes.get(id);
            let reported = report.and_then(|r| r.state);
            let previous = status.state;

            if let Some(report) = report {
                status.attempts = status.attempts.max(report.attempts);
                if report.started_at.is_some() {
                    status.started_at = report.started_at;
                }
                if report.log_ref.is_some() {
                    status.log_ref = report.log_ref.clone();
                }
                if report.message.is_some() {
                    status.message = report.message.clone();
                }
            }

            let next = match (reported, blocked_by) {
                (Some(state), _) if state.is_terminal() => state,
                (_, Some(upstream)) if previous == NodeState::Pending && reported != Some(NodeState::Running) => {
                    status.message = Some(format!("upstream node '{}' did not succeed", upstream));
                    NodeState::Skipped
                }
                (Some(state), _) => state,
                (None, _) => previous,
            };

            let next = if native.finished && !next.is_terminal() {
                if next == NodeState::Running {
                    status.message = Some("backend finished without reporting a result".to_string());
                    NodeState::Failed
                } else {
                    if status.message.is_none() {
                        status.message = Some("never attempted".to_string());
                    }
                    NodeState::Skipped
                }
            } else {
                next
            };

            if next == NodeState::Running && status.started_at.is_none() {
                status.started_at = Some(Utc::now());
            }
            if next.is_terminal() {
                status.finished_at = report
                    .and_then(|r| r.finished_at)
                    .or_else(|| Some(Utc::now()));
                if next != NodeState::Skipped && status.attempts == 0 {
                    status.attempts = 1;
                }
            }

            if next != previous {
                status.state = next;
                events.push(ExecutionEvent::node_state_changed(
                    &run_id,
                    id,
                    next,
                    status.attempts,
                    status.message.clone(),
                ));
            }
        }
    }

    fn set_state(&mut self, state: RunState, error: Option<RunError>, events: &mut Vec<ExecutionEvent>) {
        if self.state == state {
            return;
        }
        self.state = state;
        if state.is_terminal() {
            self.finished_at = Some(Utc::now());
            self.error = error.clone();
            tracing::info!(run_id = %self.run_id, %state, "run finished");
        } else {
            tracing::debug!(run_id = %self.run_id, %state, "run state changed");
        }
        events.push(ExecutionEvent::run_state_changed(&self.run_id, state, error));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::processors::ArtifactNode;

    pub(crate) fn diamond_header(policy: FailurePolicy) -> ArtifactHeader {
        let node = |id: &str, upstream: &[&str]| ArtifactNode {
            id: id.to_string(),
            name: id.to_string(),
            native_id: id.to_string(),
            upstream: upstream.iter().map(|u| u.to_string()).collect(),
            max_attempts: 1,
        };
        ArtifactHeader {
            run_id: RunId::new("diamond-1"),
            pipeline_name: "diamond".to_string(),
            runtime: RuntimeTarget::Local,
            failure_policy: policy,
            nodes: vec![
                node("a", &[]),
                node("b", &["a"]),
                node("c", &["a"]),
                node("d", &["b", "c"]),
            ],
            groups: vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ],
        }
    }

    fn states(snapshot: &RunSnapshot) -> Vec<NodeState> {
        snapshot.nodes.values().map(|s| s.state).collect()
    }

    #[test]
    fn test_run_id_generation() {
        let id = RunId::generate("My ETL Pipeline!");
        let text = id.as_str();
        assert!(text.starts_with("my-etl-pipeline-"));
        let parts: Vec<&str> = text.rsplitn(3, '-').collect();
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 14);
        assert_ne!(RunId::generate("x"), RunId::generate("x"));
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("  Daily -- Report "), "daily-report");
        assert_eq!(slug("???"), "pipeline");
        assert_eq!(slug(&"a".repeat(60)).len(), 40);
    }

    #[test]
    fn test_halt_downstream_skips_dependents() {
        let header = diamond_header(FailurePolicy::HaltDownstream);
        let mut snapshot = RunSnapshot::new(&header);
        snapshot.mark_submitted();

        let native = NativeStatus::default()
            .node("a", NodeReport::new(NodeState::Succeeded))
            .node("b", NodeReport::new(NodeState::Failed).with_attempts(2))
            .node("c", NodeReport::new(NodeState::Running));
        snapshot.reconcile(&header, &native);

        assert_eq!(snapshot.state, RunState::Running);
        assert_eq!(snapshot.node("b").unwrap().attempts, 2);
        assert_eq!(snapshot.node("c").unwrap().state, NodeState::Running);
        assert_eq!(snapshot.node("d").unwrap().state, NodeState::Skipped);

        let native = native.node("c", NodeReport::new(NodeState::Succeeded)).finished();
        snapshot.reconcile(&header, &native);

        assert_eq!(
            states(&snapshot),
            vec![
                NodeState::Succeeded,
                NodeState::Failed,
                NodeState::Succeeded,
                NodeState::Skipped
            ]
        );
        assert_eq!(snapshot.state, RunState::Failed);
        let error = snapshot.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Execution);
        assert!(error.message.contains("b"));
    }

    #[test]
    fn test_best_effort_attempts_dependents() {
        let header = diamond_header(FailurePolicy::BestEffort);
        let mut snapshot = RunSnapshot::new(&header);
        snapshot.mark_submitted();

        let native = NativeStatus::default()
            .node("a", NodeReport::new(NodeState::Failed))
            .node("b", NodeReport::new(NodeState::Pending));
        snapshot.reconcile(&header, &native);

        assert_eq!(snapshot.node("b").unwrap().state, NodeState::Pending);
        assert_eq!(snapshot.node("d").unwrap().state, NodeState::Pending);
    }

    #[test]
    fn test_terminal_states_are_monotonic() {
        let header = diamond_header(FailurePolicy::HaltDownstream);
        let mut snapshot = RunSnapshot::new(&header);
        snapshot.mark_submitted();

        snapshot.reconcile(
            &header,
            &NativeStatus::default().node("a", NodeReport::new(NodeState::Succeeded)),
        );
        let events = snapshot.reconcile(
            &header,
            &NativeStatus::default().node("a", NodeReport::new(NodeState::Running)),
        );

        assert!(events.is_empty());
        assert_eq!(snapshot.node("a").unwrap().state, NodeState::Succeeded);
    }

    #[test]
    fn test_each_transition_reported_once() {
        let header = diamond_header(FailurePolicy::HaltDownstream);
        let mut snapshot = RunSnapshot::new(&header);
        let mut events = snapshot.mark_submitted();

        let native = NativeStatus::default().node("a", NodeReport::new(NodeState::Running));
        events.extend(snapshot.reconcile(&header, &native));
        events.extend(snapshot.reconcile(&header, &native));

        let all_done = ["a", "b", "c", "d"]
            .iter()
            .fold(NativeStatus::default(), |n, id| {
                n.node(*id, NodeReport::new(NodeState::Succeeded))
            })
            .finished();
        events.extend(snapshot.reconcile(&header, &all_done));
        events.extend(snapshot.reconcile(&header, &all_done));

        let node_events = events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::NodeStateChanged { .. }))
            .count();
        let run_events = events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::RunStateChanged { .. }))
            .count();
        // a: running + succeeded, b/c/d: succeeded
        assert_eq!(node_events, 5);
        // submitted, running, succeeded
        assert_eq!(run_events, 3);
        assert_eq!(snapshot.state, RunState::Succeeded);
        assert!(snapshot.error.is_none());
    }

    #[test]
    fn test_finished_backend_skips_unattempted_nodes() {
        let header = diamond_header(FailurePolicy::BestEffort);
        let mut snapshot = RunSnapshot::new(&header);
        snapshot.mark_submitted();

        let mut native = NativeStatus::default()
            .node("a", NodeReport::new(NodeState::Succeeded))
            .node("b", NodeReport::new(NodeState::Running))
            .finished();
        native.message = Some("workflow deleted".to_string());
        snapshot.reconcile(&header, &native);

        assert_eq!(snapshot.node("b").unwrap().state, NodeState::Failed);
        assert_eq!(snapshot.node("c").unwrap().state, NodeState::Skipped);
        assert_eq!(snapshot.state, RunState::Failed);
    }

    #[test]
    fn test_abort_marks_cancelled() {
        let header = diamond_header(FailurePolicy::HaltDownstream);
        let mut snapshot = RunSnapshot::new(&header);
        snapshot.mark_submitted();
        snapshot.reconcile(
            &header,
            &NativeStatus::default()
                .node("a", NodeReport::new(NodeState::Succeeded))
                .node("b", NodeReport::new(NodeState::Running)),
        );

        snapshot.abort(
            RunState::Cancelled,
            RunError::new(ErrorKind::Cancellation, "cancelled by user"),
            "cancelled",
        );

        assert_eq!(
            states(&snapshot),
            vec![
                NodeState::Succeeded,
                NodeState::Failed,
                NodeState::Skipped,
                NodeState::Skipped
            ]
        );
        assert_eq!(snapshot.state, RunState::Cancelled);
        assert!(snapshot
            .abort(RunState::Failed, RunError::new(ErrorKind::Timeout, "late"), "x")
            .is_empty());
    }
}
