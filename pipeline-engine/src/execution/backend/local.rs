// Local Backend
// Runs local plans as host processes, group by group

use crate::config::LocalConfig;
use crate::execution::backend::{BackendError, ExecutionBackend};
use crate::execution::state::{NativeStatus, NodeReport, NodeState, RunId};
use crate::parser::models::FailurePolicy;
use crate::processors::local::{FileCopy, LocalPlan, LocalTask};
use crate::processors::{ArtifactPayload, ExecutionArtifact};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type Progress = Arc<Mutex<NativeStatus>>;

struct LocalRun {
    progress: Progress,
    token: CancellationToken,
}

/// Executes [`LocalPlan`]s with bounded concurrency
pub struct LocalBackend {
    limiter: Arc<Semaphore>,
    runs: Mutex<HashMap<String, LocalRun>>,
}

impl LocalBackend {
    pub fn new(config: &LocalConfig) -> Self {
        Self {
            limiter: Arc::new(Semaphore::new(config.concurrency())),
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, LocalRun>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    async fn submit(&self, artifact: &ExecutionArtifact) -> Result<(), BackendError> {
        let ArtifactPayload::Local(plan) = artifact.payload() else {
            return Err(BackendError::WrongArtifact(format!(
                "the local backend cannot run a {} artifact",
                artifact.runtime()
            )));
        };

        let programs: BTreeSet<&str> = plan.tasks().map(|t| t.program.as_str()).collect();
        for program in programs {
            which::which(program).map_err(|e| BackendError::Unavailable {
                tool: program.to_string(),
                message: e.to_string(),
            })?;
        }

        tokio::fs::create_dir_all(&plan.staging_dir).await?;

        let run_id = artifact.run_id().to_string();
        let progress: Progress = Arc::new(Mutex::new(NativeStatus::default()));
        let token = CancellationToken::new();
        {
            let mut runs = self.runs();
            if runs.contains_key(&run_id) {
                return Err(BackendError::Rejected(format!("run '{}' was already submitted", run_id)));
            }
            runs.insert(
                run_id.clone(),
                LocalRun {
                    progress: progress.clone(),
                    token: token.clone(),
                },
            );
        }

        tracing::info!(run_id = %run_id, staging_dir = %plan.staging_dir.display(), "starting local run");
        tokio::spawn(execute(plan.clone(), progress, token, self.limiter.clone()));
        Ok(())
    }

    async fn status(&self, run_id: &RunId) -> Result<NativeStatus, BackendError> {
        let runs = self.runs();
        let run = runs
            .get(run_id.as_str())
            .ok_or_else(|| BackendError::UnknownRun(run_id.to_string()))?;
        let status = lock(&run.progress).clone();
        Ok(status)
    }

    async fn cancel(&self, run_id: &RunId) -> Result<(), BackendError> {
        let runs = self.runs();
        let run = runs
            .get(run_id.as_str())
            .ok_or_else(|| BackendError::UnknownRun(run_id.to_string()))?;
        run.token.cancel();
        Ok(())
    }

    async fn discard(&self, run_id: &RunId) -> Result<(), BackendError> {
        if let Some(run) = self.runs().remove(run_id.as_str()) {
            run.token.cancel();
        }
        Ok(())
    }
}

fn lock(progress: &Mutex<NativeStatus>) -> MutexGuard<'_, NativeStatus> {
    progress.lock().unwrap_or_else(|e| e.into_inner())
}

fn report(progress: &Progress, node_id: &str, report: NodeReport) {
    lock(progress).nodes.insert(node_id.to_string(), report);
}

fn state_of(progress: &Progress, node_id: &str) -> Option<NodeState> {
    lock(progress).nodes.get(node_id).and_then(|r| r.state)
}

async fn execute(plan: LocalPlan, progress: Progress, token: CancellationToken, limiter: Arc<Semaphore>) {
    let halt = plan.failure_policy == FailurePolicy::HaltDownstream;

    for group in &plan.groups {
        if token.is_cancelled() {
            break;
        }

        let mut running = JoinSet::new();
        for task in group {
            if halt {
                let blocked = task
                    .upstream
                    .iter()
                    .find(|up| state_of(&progress, up) != Some(NodeState::Succeeded));
                if let Some(upstream) = blocked {
                    tracing::debug!(node = %task.node_id, upstream = %upstream, "skipping node");
                    report(
                        &progress,
                        &task.node_id,
                        NodeReport::new(NodeState::Skipped)
                            .with_message(format!("upstream node '{}' did not succeed", upstream)),
                    );
                    continue;
                }
            }

            let task = task.clone();
            let progress = progress.clone();
            let token = token.clone();
            let limiter = limiter.clone();
            let log = log_path(&plan.staging_dir, &task.node_id);
            running.spawn(async move {
                let permit = tokio::select! {
                    permit = limiter.acquire_owned() => permit.ok(),
                    _ = token.cancelled() => None,
                };
                if permit.is_none() {
                    return;
                }
                run_task(&task, &log, &progress, &token).await;
            });
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "local task panicked");
            }
        }
    }

    let mut status = lock(&progress);
    for task in plan.tasks() {
        let terminal = status
            .nodes
            .get(&task.node_id)
            .and_then(|r| r.state)
            .map_or(false, |s| s.is_terminal());
        if !terminal && token.is_cancelled() {
            let mut skipped = NodeReport::new(NodeState::Skipped).with_message("run cancelled");
            if let Some(previous) = status.nodes.get(&task.node_id) {
                skipped.attempts = previous.attempts;
            }
            status.nodes.insert(task.node_id.clone(), skipped);
        }
    }
    if token.is_cancelled() {
        status.message = Some("run cancelled".to_string());
    }
    status.finished = true;
    tracing::info!(run_id = %plan.run_id, "local run finished");
}

enum TaskFailure {
    Cancelled,
    Failed(String),
}

async fn run_task(task: &LocalTask, log_path: &Path, progress: &Progress, token: &CancellationToken) {
    let max_attempts = task.max_attempts();
    let started_at = Some(Utc::now());
    let log_ref = Some(log_path.display().to_string());

    for attempt in 1..=max_attempts {
        tracing::info!(node = %task.node_id, attempt, command = %task.command_line(), "running node");
        report(
            progress,
            &task.node_id,
            NodeReport {
                state: Some(NodeState::Running),
                attempts: attempt,
                started_at,
                log_ref: log_ref.clone(),
                ..Default::default()
            },
        );

        let finished = |state: NodeState, message: Option<String>| NodeReport {
            state: Some(state),
            attempts: attempt,
            started_at,
            finished_at: Some(Utc::now()),
            log_ref: log_ref.clone(),
            message,
        };

        match attempt_task(task, log_path, token).await {
            Ok(()) => {
                report(progress, &task.node_id, finished(NodeState::Succeeded, None));
                return;
            }
            Err(TaskFailure::Cancelled) => {
                report(
                    progress,
                    &task.node_id,
                    finished(NodeState::Failed, Some("cancelled while running".to_string())),
                );
                return;
            }
            Err(TaskFailure::Failed(message)) if attempt < max_attempts => {
                let delay = task
                    .retry
                    .as_ref()
                    .map(|r| r.delay_for(attempt))
                    .unwrap_or_default();
                tracing::warn!(node = %task.node_id, attempt, ?delay, error = %message, "node failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => {
                        report(progress, &task.node_id, finished(NodeState::Failed, Some(message)));
                        return;
                    }
                }
            }
            Err(TaskFailure::Failed(message)) => {
                tracing::warn!(node = %task.node_id, attempt, error = %message, "node failed");
                report(progress, &task.node_id, finished(NodeState::Failed, Some(message)));
                return;
            }
        }
    }
}

async fn attempt_task(task: &LocalTask, log_path: &Path, token: &CancellationToken) -> Result<(), TaskFailure> {
    let io = |context: &str, e: std::io::Error| TaskFailure::Failed(format!("{}: {}", context, e));

    tokio::fs::create_dir_all(&task.work_dir)
        .await
        .map_err(|e| io("could not create working directory", e))?;
    for input in &task.inputs {
        copy_file(input).await.map_err(|e| {
            TaskFailure::Failed(format!("input '{}' is not available: {}", input.from.display(), e))
        })?;
    }

    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io("could not create log directory", e))?;
    }
    let stdout = std::fs::File::create(log_path).map_err(|e| io("could not create log file", e))?;
    let stderr = stdout.try_clone().map_err(|e| io("could not create log file", e))?;

    let mut child = Command::new(&task.program)
        .args(&task.args)
        .envs(&task.env)
        .current_dir(&task.work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TaskFailure::Failed(format!("failed to start '{}': {}", task.program, e)))?;

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| io("failed waiting for process", e))?,
        _ = token.cancelled() => {
            let _ = child.kill().await;
            return Err(TaskFailure::Cancelled);
        }
    };

    if !status.success() {
        return Err(TaskFailure::Failed(match status.code() {
            Some(code) => format!("process exited with status {}", code),
            None => "process was terminated by a signal".to_string(),
        }));
    }

    for output in &task.outputs {
        copy_file(output).await.map_err(|_| {
            TaskFailure::Failed(format!(
                "declared output '{}' was not produced",
                output.from.display()
            ))
        })?;
    }
    Ok(())
}

async fn copy_file(copy: &FileCopy) -> std::io::Result<()> {
    if let Some(parent) = copy.to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(&copy.from, &copy.to).await?;
    Ok(())
}

/// Where a node's log lands for a given staging directory
pub fn log_path(staging_dir: &Path, node_id: &str) -> PathBuf {
    staging_dir.join(".logs").join(format!("{}.log", node_id))
}
