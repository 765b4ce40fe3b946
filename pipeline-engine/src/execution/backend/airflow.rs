// Airflow Backend
// Installs DAG files into the scheduler's DAGs folder and drives the `airflow` CLI

use crate::config::AirflowConfig;
use crate::execution::backend::{run_cli, BackendError, ExecutionBackend};
use crate::execution::state::{NativeStatus, NodeReport, NodeState, RunId};
use crate::processors::{ArtifactHeader, ArtifactPayload, ExecutionArtifact};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct TriggeredDag {
    dag_id: String,
    dag_file: PathBuf,
    header: ArtifactHeader,
}

pub struct AirflowBackend {
    config: AirflowConfig,
    runs: Mutex<HashMap<String, TriggeredDag>>,
}

impl AirflowBackend {
    pub fn new(config: AirflowConfig) -> Self {
        Self {
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, TriggeredDag>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dag(&self, run_id: &RunId) -> Result<TriggeredDag, BackendError> {
        self.runs()
            .get(run_id.as_str())
            .cloned()
            .ok_or_else(|| BackendError::UnknownRun(run_id.to_string()))
    }

    async fn airflow(&self, args: &[&str]) -> Result<String, BackendError> {
        Ok(run_cli(&self.config.cli, args, None, None).await?.stdout)
    }
}

#[async_trait]
impl ExecutionBackend for AirflowBackend {
    async fn submit(&self, artifact: &ExecutionArtifact) -> Result<(), BackendError> {
        let ArtifactPayload::Dag(dag) = artifact.payload() else {
            return Err(BackendError::WrongArtifact(format!(
                "the airflow backend cannot run a {} artifact",
                artifact.runtime()
            )));
        };

        // The run is started by the trigger below, never by the scheduler
        let mut dag = dag.clone();
        dag.schedule = None;

        tokio::fs::create_dir_all(&self.config.dags_folder).await?;
        let dag_file = self.config.dags_folder.join(artifact.file_name());
        tokio::fs::write(&dag_file, dag.render()).await?;
        tracing::debug!(dag_id = %dag.dag_id, path = %dag_file.display(), "installed dag file");

        let run_id = artifact.run_id().to_string();
        let triggered = async {
            self.airflow(&["dags", "reserialize"]).await?;
            self.airflow(&["dags", "unpause", &dag.dag_id]).await?;
            self.airflow(&["dags", "trigger", &dag.dag_id, "--run-id", &run_id]).await
        }
        .await;
        if let Err(e) = triggered {
            let _ = tokio::fs::remove_file(&dag_file).await;
            return Err(match e {
                BackendError::CommandFailed { stderr, .. } => BackendError::Rejected(stderr),
                other => other,
            });
        }

        tracing::info!(run_id = %run_id, dag_id = %dag.dag_id, "triggered airflow dag run");
        self.runs().insert(
            run_id,
            TriggeredDag {
                dag_id: dag.dag_id.clone(),
                dag_file,
                header: artifact.header().clone(),
            },
        );
        Ok(())
    }

    async fn status(&self, run_id: &RunId) -> Result<NativeStatus, BackendError> {
        let triggered = self.dag(run_id)?;
        let runs = self
            .airflow(&["dags", "list-runs", "--dag-id", &triggered.dag_id, "--output", "json"])
            .await?;
        let tasks = self
            .airflow(&[
                "tasks",
                "states-for-dag-run",
                &triggered.dag_id,
                run_id.as_str(),
                "--output",
                "json",
            ])
            .await?;
        translate_dag_run_status(&triggered.header, run_id.as_str(), &runs, &tasks)
    }

    /// Airflow's CLI cannot fail a running dag run; pausing stops further scheduling
    async fn cancel(&self, run_id: &RunId) -> Result<(), BackendError> {
        let triggered = self.dag(run_id)?;
        self.airflow(&["dags", "pause", &triggered.dag_id]).await?;
        tracing::info!(run_id = %run_id, dag_id = %triggered.dag_id, "paused airflow dag");
        Ok(())
    }

    /// Remove the run's DAG file and its scheduler metadata
    async fn discard(&self, run_id: &RunId) -> Result<(), BackendError> {
        let Some(triggered) = self.runs().remove(run_id.as_str()) else {
            return Ok(());
        };

        match tokio::fs::remove_file(&triggered.dag_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.airflow(&["dags", "delete", &triggered.dag_id, "--yes"]).await {
            tracing::warn!(dag_id = %triggered.dag_id, error = %e, "failed to delete airflow dag");
        }
        tracing::debug!(
            run_id = %run_id,
            dag_file = %triggered.dag_file.display(),
            "removed airflow dag"
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DagRunRow {
    run_id: String,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskStateRow {
    task_id: String,
    state: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    #[serde(default)]
    try_number: Option<u32>,
}

/// Airflow task instance state -> engine node state
pub fn map_task_state(state: Option<&str>) -> NodeState {
    match state.map(str::trim).unwrap_or("") {
        "running" | "restarting" | "up_for_retry" | "up_for_reschedule" | "deferred" => NodeState::Running,
        "success" => NodeState::Succeeded,
        "failed" => NodeState::Failed,
        "upstream_failed" | "skipped" | "removed" => NodeState::Skipped,
        _ => NodeState::Pending,
    }
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?.trim();
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Translate `dags list-runs` and `tasks states-for-dag-run` JSON into engine terms
pub fn translate_dag_run_status(
    header: &ArtifactHeader,
    run_id: &str,
    runs_json: &str,
    tasks_json: &str,
) -> Result<NativeStatus, BackendError> {
    let runs: Vec<DagRunRow> =
        serde_json::from_str(runs_json).map_err(|e| BackendError::MalformedStatus(e.to_string()))?;
    let tasks: Vec<TaskStateRow> =
        serde_json::from_str(tasks_json).map_err(|e| BackendError::MalformedStatus(e.to_string()))?;

    let run_state = runs
        .iter()
        .find(|r| r.run_id == run_id)
        .and_then(|r| r.state.as_deref())
        .unwrap_or("queued");

    let mut native = NativeStatus {
        finished: matches!(run_state, "success" | "failed"),
        nodes: Default::default(),
        message: (run_state == "failed").then(|| "dag run failed".to_string()),
    };

    for row in &tasks {
        let Some(node) = header.node_by_native_id(&row.task_id) else {
            continue;
        };
        let state = map_task_state(row.state.as_deref());
        let mut report = NodeReport::new(state).with_attempts(row.try_number.unwrap_or(0));
        report.started_at = parse_timestamp(row.start_date.as_deref());
        report.finished_at = parse_timestamp(row.end_date.as_deref());
        report.log_ref = Some(format!("{}/{}/{}", header.run_id, row.task_id, row.try_number.unwrap_or(1)));
        if row.state.as_deref() == Some("upstream_failed") {
            report.message = Some("upstream task failed".to_string());
        }
        native.nodes.insert(node.id.clone(), report);
    }

    Ok(native)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::state::tests::diamond_header;
    use crate::parser::models::{FailurePolicy, RuntimeTarget};
    use crate::processors::AirflowDag;

    fn scheduled_dag_artifact() -> ExecutionArtifact {
        let mut header = diamond_header(FailurePolicy::HaltDownstream);
        header.runtime = RuntimeTarget::Airflow;
        let dag = AirflowDag {
            dag_id: "diamond_1".to_string(),
            run_id: "diamond-1".to_string(),
            description: "diamond".to_string(),
            schedule: Some("@hourly".to_string()),
            namespace: "default".to_string(),
            credentials_secret: None,
            volumes: Vec::new(),
            tasks: Vec::new(),
            edges: Vec::new(),
        };
        ExecutionArtifact::new(header, ArtifactPayload::Dag(dag))
    }

    fn backend(dags_folder: &std::path::Path) -> AirflowBackend {
        AirflowBackend::new(AirflowConfig {
            // Accepts any arguments and exits 0
            cli: "true".to_string(),
            dags_folder: dags_folder.to_path_buf(),
            ..AirflowConfig::default()
        })
    }

    #[tokio::test]
    async fn test_triggered_dag_is_unscheduled_and_removed_on_discard() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let artifact = scheduled_dag_artifact();
        let run_id = RunId::new("diamond-1");

        backend.submit(&artifact).await.unwrap();
        let dag_file = dir.path().join("diamond_1.py");
        let source = std::fs::read_to_string(&dag_file).unwrap();
        assert!(source.contains("schedule_interval=None,"));
        assert!(!source.contains("@hourly"));

        backend.discard(&run_id).await.unwrap();
        assert!(!dag_file.exists());
        assert!(matches!(
            backend.status(&run_id).await,
            Err(BackendError::UnknownRun(_))
        ));

        // Discarding again is a no-op
        backend.discard(&run_id).await.unwrap();
    }

    #[test]
    fn test_task_state_mapping() {
        assert_eq!(map_task_state(None), NodeState::Pending);
        assert_eq!(map_task_state(Some("queued")), NodeState::Pending);
        assert_eq!(map_task_state(Some("up_for_retry")), NodeState::Running);
        assert_eq!(map_task_state(Some("success")), NodeState::Succeeded);
        assert_eq!(map_task_state(Some("failed")), NodeState::Failed);
        assert_eq!(map_task_state(Some("upstream_failed")), NodeState::Skipped);
    }

    #[test]
    fn test_timestamps() {
        assert!(parse_timestamp(Some("2024-03-01T00:00:05.123456+00:00")).is_some());
        assert!(parse_timestamp(Some("2024-03-01 00:00:05.123456+00:00")).is_some());
        assert!(parse_timestamp(Some("")).is_none());
        assert!(parse_timestamp(None).is_none());
    }

    #[test]
    fn test_translate_failed_run() {
        let header = diamond_header(FailurePolicy::HaltDownstream);
        let runs = r#"[
            {"dag_id": "d", "run_id": "older", "state": "success"},
            {"dag_id": "d", "run_id": "diamond-1", "state": "failed"}
        ]"#;
        let tasks = r#"[
            {"dag_id": "d", "task_id": "a", "state": "success", "start_date": "2024-03-01T00:00:05+00:00", "end_date": "2024-03-01T00:01:00+00:00"},
            {"dag_id": "d", "task_id": "b", "state": "failed", "try_number": 3},
            {"dag_id": "d", "task_id": "c", "state": "success"},
            {"dag_id": "d", "task_id": "d", "state": "upstream_failed"},
            {"dag_id": "d", "task_id": "unrelated", "state": "success"}
        ]"#;

        let native = translate_dag_run_status(&header, "diamond-1", runs, tasks).unwrap();
        assert!(native.finished);
        assert_eq!(native.nodes.len(), 4);
        assert_eq!(native.nodes["a"].state, Some(NodeState::Succeeded));
        assert!(native.nodes["a"].started_at.is_some());
        assert_eq!(native.nodes["b"].state, Some(NodeState::Failed));
        assert_eq!(native.nodes["b"].attempts, 3);
        assert_eq!(native.nodes["d"].state, Some(NodeState::Skipped));
    }

    #[test]
    fn test_translate_queued_run() {
        let header = diamond_header(FailurePolicy::BestEffort);
        let native = translate_dag_run_status(&header, "diamond-1", "[]", "[]").unwrap();
        assert!(!native.finished);
        assert!(native.nodes.is_empty());
    }
}
