// Argo Backend
// Drives the `argo` CLI: submit, get, terminate

use crate::config::ArgoConfig;
use crate::execution::backend::{run_cli, BackendError, ExecutionBackend};
use crate::execution::state::{NativeStatus, NodeReport, NodeState, RunId};
use crate::processors::{ArtifactHeader, ArtifactPayload, ExecutionArtifact};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct SubmittedWorkflow {
    name: String,
    namespace: String,
    header: ArtifactHeader,
}

pub struct ArgoBackend {
    config: ArgoConfig,
    runs: Mutex<HashMap<String, SubmittedWorkflow>>,
}

impl ArgoBackend {
    pub fn new(config: ArgoConfig) -> Self {
        Self {
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, SubmittedWorkflow>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn workflow(&self, run_id: &RunId) -> Result<SubmittedWorkflow, BackendError> {
        self.runs()
            .get(run_id.as_str())
            .cloned()
            .ok_or_else(|| BackendError::UnknownRun(run_id.to_string()))
    }
}

#[async_trait]
impl ExecutionBackend for ArgoBackend {
    async fn submit(&self, artifact: &ExecutionArtifact) -> Result<(), BackendError> {
        let ArtifactPayload::Workflow(workflow) = artifact.payload() else {
            return Err(BackendError::WrongArtifact(format!(
                "the argo backend cannot run a {} artifact",
                artifact.runtime()
            )));
        };
        let document = serde_yaml::to_string(workflow)
            .map_err(|e| BackendError::Rejected(format!("could not serialize workflow: {}", e)))?;
        let namespace = workflow.metadata.namespace.clone();

        let output = run_cli(
            &self.config.cli,
            &["submit", "-", "--namespace", &namespace, "--output", "json"],
            Some(&document),
            None,
        )
        .await
        .map_err(|e| match e {
            BackendError::CommandFailed { stderr, .. } => BackendError::Rejected(stderr),
            other => other,
        })?;

        // argo may rename the workflow (generateName); trust what it reports
        let name = serde_json::from_str::<WorkflowDocument>(&output.stdout)
            .ok()
            .and_then(|doc| doc.metadata.name)
            .unwrap_or_else(|| workflow.metadata.name.clone());

        tracing::info!(run_id = %artifact.run_id(), workflow = %name, namespace = %namespace, "submitted argo workflow");
        self.runs().insert(
            artifact.run_id().to_string(),
            SubmittedWorkflow {
                name,
                namespace,
                header: artifact.header().clone(),
            },
        );
        Ok(())
    }

    async fn status(&self, run_id: &RunId) -> Result<NativeStatus, BackendError> {
        let submitted = self.workflow(run_id)?;
        let output = run_cli(
            &self.config.cli,
            &["get", &submitted.name, "--namespace", &submitted.namespace, "--output", "json"],
            None,
            None,
        )
        .await?;
        translate_workflow_status(&submitted.header, &output.stdout)
    }

    async fn cancel(&self, run_id: &RunId) -> Result<(), BackendError> {
        let submitted = self.workflow(run_id)?;
        run_cli(
            &self.config.cli,
            &["terminate", &submitted.name, "--namespace", &submitted.namespace],
            None,
            None,
        )
        .await?;
        tracing::info!(run_id = %run_id, workflow = %submitted.name, "terminated argo workflow");
        Ok(())
    }

    async fn discard(&self, run_id: &RunId) -> Result<(), BackendError> {
        self.runs().remove(run_id.as_str());
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowDocument {
    #[serde(default)]
    metadata: DocumentMetadata,
    #[serde(default)]
    status: WorkflowStatus,
}

#[derive(Debug, Default, Deserialize)]
struct DocumentMetadata {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowStatus {
    phase: Option<String>,
    message: Option<String>,
    #[serde(default)]
    nodes: HashMap<String, WorkflowNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowNode {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    template_name: Option<String>,
    phase: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    message: Option<String>,
}

/// Argo node phase -> engine node state
pub fn map_node_phase(phase: &str) -> NodeState {
    match phase {
        "Running" => NodeState::Running,
        "Succeeded" => NodeState::Succeeded,
        "Failed" | "Error" => NodeState::Failed,
        "Skipped" | "Omitted" => NodeState::Skipped,
        _ => NodeState::Pending,
    }
}

/// Whether a workflow phase means no further progress will happen
pub fn is_final_phase(phase: &str) -> bool {
    matches!(phase, "Succeeded" | "Failed" | "Error")
}

/// Translate `argo get -o json` output into engine terms
pub fn translate_workflow_status(header: &ArtifactHeader, json: &str) -> Result<NativeStatus, BackendError> {
    let document: WorkflowDocument =
        serde_json::from_str(json).map_err(|e| BackendError::MalformedStatus(e.to_string()))?;
    let status = document.status;

    let mut native = NativeStatus {
        finished: status.phase.as_deref().map_or(false, is_final_phase),
        nodes: Default::default(),
        message: status.message.clone(),
    };

    for node in &header.nodes {
        let related: Vec<&WorkflowNode> = status
            .nodes
            .values()
            .filter(|n| n.template_name.as_deref() == Some(node.native_id.as_str()))
            .collect();
        if related.is_empty() {
            continue;
        }

        let mut pods: Vec<&WorkflowNode> = related.iter().copied().filter(|n| n.node_type == "Pod").collect();
        pods.sort_by_key(|p| p.started_at);
        // a Retry node wraps every attempt and carries the overall phase
        let overall = related
            .iter()
            .copied()
            .find(|n| n.node_type == "Retry")
            .or_else(|| pods.last().copied())
            .or_else(|| related.first().copied());
        let Some(overall) = overall else {
            continue;
        };

        let state = overall.phase.as_deref().map_or(NodeState::Pending, map_node_phase);
        let last_pod = pods.last().copied();
        native.nodes.insert(
            node.id.clone(),
            NodeReport {
                state: Some(state),
                attempts: pods.len() as u32,
                started_at: pods.first().and_then(|p| p.started_at).or(overall.started_at),
                finished_at: overall.finished_at,
                log_ref: last_pod.map(|p| p.id.clone()),
                message: overall.message.clone().or_else(|| last_pod.and_then(|p| p.message.clone())),
            },
        );
    }

    Ok(native)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::state::tests::diamond_header;
    use crate::parser::models::FailurePolicy;

    #[test]
    fn test_phase_mapping() {
        assert_eq!(map_node_phase("Pending"), NodeState::Pending);
        assert_eq!(map_node_phase("Running"), NodeState::Running);
        assert_eq!(map_node_phase("Error"), NodeState::Failed);
        assert_eq!(map_node_phase("Omitted"), NodeState::Skipped);
        assert!(is_final_phase("Error"));
        assert!(!is_final_phase("Running"));
    }

    #[test]
    fn test_translate_running_workflow() {
        let header = diamond_header(FailurePolicy::HaltDownstream);
        let json = r#"{
          "metadata": {"name": "wf"},
          "status": {
            "phase": "Running",
            "nodes": {
              "wf": {"id": "wf", "type": "DAG", "templateName": "entrypoint", "phase": "Running"},
              "wf-1": {"id": "wf-1", "type": "Pod", "templateName": "a", "phase": "Succeeded",
                       "startedAt": "2024-05-01T10:00:00Z", "finishedAt": "2024-05-01T10:01:00Z"},
              "wf-2": {"id": "wf-2", "type": "Retry", "templateName": "b", "phase": "Running"},
              "wf-3": {"id": "wf-3", "type": "Pod", "templateName": "b", "phase": "Failed",
                       "startedAt": "2024-05-01T10:01:05Z", "message": "exit code 1"},
              "wf-4": {"id": "wf-4", "type": "Pod", "templateName": "b", "phase": "Running",
                       "startedAt": "2024-05-01T10:02:00Z"}
            }
          }
        }"#;

        let native = translate_workflow_status(&header, json).unwrap();
        assert!(!native.finished);
        assert_eq!(native.nodes["a"].state, Some(NodeState::Succeeded));
        assert_eq!(native.nodes["a"].attempts, 1);

        let b = &native.nodes["b"];
        assert_eq!(b.state, Some(NodeState::Running));
        assert_eq!(b.attempts, 2);
        assert_eq!(b.log_ref.as_deref(), Some("wf-4"));
        assert!(!native.nodes.contains_key("c"));
    }

    #[test]
    fn test_translate_finished_workflow() {
        let header = diamond_header(FailurePolicy::HaltDownstream);
        let json = r#"{"status": {"phase": "Failed", "message": "child failed",
          "nodes": {"x": {"id": "x", "type": "Pod", "templateName": "b", "phase": "Error", "message": "OOMKilled"}}}}"#;

        let native = translate_workflow_status(&header, json).unwrap();
        assert!(native.finished);
        assert_eq!(native.message.as_deref(), Some("child failed"));
        assert_eq!(native.nodes["b"].state, Some(NodeState::Failed));
        assert_eq!(native.nodes["b"].message.as_deref(), Some("OOMKilled"));
    }

    #[test]
    fn test_translate_rejects_garbage() {
        let header = diamond_header(FailurePolicy::HaltDownstream);
        assert!(matches!(
            translate_workflow_status(&header, "not json"),
            Err(BackendError::MalformedStatus(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let backend = ArgoBackend::new(ArgoConfig::default());
        let err = backend.status(&RunId::new("missing")).await.unwrap_err();
        assert!(matches!(err, BackendError::UnknownRun(_)));
    }
}
