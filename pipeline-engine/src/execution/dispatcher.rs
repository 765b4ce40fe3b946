// Execution Dispatcher
// Submits artifacts to backends, tracks run state and drives the monitor loop

use crate::config::{EngineConfig, MonitorConfig};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::execution::backend::{AirflowBackend, ArgoBackend, BackendError, ExecutionBackend, LocalBackend};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::state::{RunError, RunId, RunSnapshot, RunState};
use crate::parser::models::RuntimeTarget;
use crate::processors::{ArtifactHeader, ExecutionArtifact};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Consecutive failed status queries before a run is given up on
const MAX_POLL_FAILURES: u32 = 5;

/// Monitor loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    pub poll_interval: Duration,
    /// Overall deadline, measured from when monitoring starts
    pub timeout: Option<Duration>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

impl MonitorOptions {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            timeout: None,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Poll interval bounded to [50ms, 60s]
    pub fn interval(&self) -> Duration {
        self.poll_interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
    }
}

struct RunEntry {
    header: ArtifactHeader,
    snapshot: RunSnapshot,
}

/// Tracks submitted runs across backends
pub struct Dispatcher {
    backends: HashMap<RuntimeTarget, Arc<dyn ExecutionBackend>>,
    runs: Mutex<HashMap<RunId, RunEntry>>,
    event_tx: Option<ProgressSender>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Dispatcher without any backend
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            runs: Mutex::new(HashMap::new()),
            event_tx: None,
        }
    }

    /// Dispatcher with the local, argo and airflow backends
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new()
            .with_backend(RuntimeTarget::Local, Arc::new(LocalBackend::new(&config.local)))
            .with_backend(RuntimeTarget::Kfp, Arc::new(ArgoBackend::new(config.argo.clone())))
            .with_backend(RuntimeTarget::Airflow, Arc::new(AirflowBackend::new(config.airflow.clone())))
    }

    pub fn with_backend(mut self, runtime: RuntimeTarget, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backends.insert(runtime, backend);
        self
    }

    /// Report run and node transitions on `sender`
    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.event_tx = Some(sender);
        self
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, RunEntry>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn backend(&self, runtime: RuntimeTarget) -> EngineResult<Arc<dyn ExecutionBackend>> {
        self.backends.get(&runtime).cloned().ok_or_else(|| {
            EngineError::Submission(format!("no backend is registered for the {} runtime", runtime))
        })
    }

    /// Apply `f` to a tracked run and publish the events it returns
    fn update<F>(&self, run_id: &RunId, f: F) -> EngineResult<RunSnapshot>
    where
        F: FnOnce(&mut RunEntry) -> Vec<ExecutionEvent>,
    {
        let (snapshot, events) = {
            let mut runs = self.runs();
            let entry = runs
                .get_mut(run_id)
                .ok_or_else(|| EngineError::UnknownRun(run_id.to_string()))?;
            let events = f(entry);
            (entry.snapshot.clone(), events)
        };
        self.event_tx.send_all(events);
        Ok(snapshot)
    }

    /// Current snapshot without asking the backend
    pub fn snapshot(&self, run_id: &RunId) -> EngineResult<RunSnapshot> {
        self.runs()
            .get(run_id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| EngineError::UnknownRun(run_id.to_string()))
    }

    /// Hand an artifact to its backend
    pub async fn submit(&self, artifact: &ExecutionArtifact) -> EngineResult<RunId> {
        let backend = self.backend(artifact.runtime())?;
        let header = artifact.header().clone();
        let run_id = header.run_id.clone();

        {
            let mut runs = self.runs();
            if runs.contains_key(&run_id) {
                return Err(EngineError::Submission(format!("run '{}' was already submitted", run_id)));
            }
            let snapshot = RunSnapshot::new(&header);
            runs.insert(run_id.clone(), RunEntry { header, snapshot });
        }
        self.event_tx.send_event(ExecutionEvent::run_submitted(
            &run_id,
            &artifact.header().pipeline_name,
            artifact.runtime(),
            artifact.header().nodes.len(),
        ));

        match backend.submit(artifact).await {
            Ok(()) => {
                tracing::info!(run_id = %run_id, runtime = %artifact.runtime(), "run submitted");
                self.update(&run_id, |entry| entry.snapshot.mark_submitted())?;
                Ok(run_id)
            }
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "submission failed");
                let message = e.to_string();
                self.update(&run_id, |entry| entry.snapshot.mark_submission_failed(message.clone()))?;
                Err(EngineError::Submission(message))
            }
        }
    }

    /// Ask the backend for progress and fold it into the run's snapshot.
    ///
    /// Polling a terminal run returns the stored snapshot.
    pub async fn poll(&self, run_id: &RunId) -> EngineResult<RunSnapshot> {
        let current = self.snapshot(run_id)?;
        if current.is_terminal() {
            return Ok(current);
        }

        let backend = self.backend(current.runtime)?;
        let native = backend.status(run_id).await.map_err(|e| match e {
            BackendError::UnknownRun(id) => EngineError::UnknownRun(id),
            other => EngineError::Execution(format!("could not read run status: {}", other)),
        })?;

        self.update(run_id, |entry| entry.snapshot.reconcile(&entry.header, &native))
    }

    /// Stop a run. Cancelling a finished run is a no-op.
    pub async fn cancel(&self, run_id: &RunId) -> EngineResult<RunSnapshot> {
        let current = self.snapshot(run_id)?;
        if current.is_terminal() {
            return Ok(current);
        }

        let backend = self.backend(current.runtime)?;
        backend
            .cancel(run_id)
            .await
            .map_err(|e| EngineError::Execution(format!("could not cancel run: {}", e)))?;

        // pick up nodes that finished before the backend stopped
        let last = match backend.status(run_id).await {
            Ok(native) => Some(native),
            Err(e) => {
                tracing::debug!(run_id = %run_id, error = %e, "final status before cancel unavailable");
                None
            }
        };

        tracing::info!(run_id = %run_id, "run cancelled");
        self.update(run_id, |entry| {
            entry.snapshot.cancel(&entry.header, last.as_ref(), "run cancelled")
        })
    }

    /// Forget a finished run
    pub async fn discard(&self, run_id: &RunId) -> EngineResult<()> {
        let current = self.snapshot(run_id)?;
        if !current.is_terminal() {
            return Err(EngineError::Execution(format!(
                "run '{}' is still {}; cancel it before discarding",
                run_id, current.state
            )));
        }

        if let Ok(backend) = self.backend(current.runtime) {
            if let Err(e) = backend.discard(run_id).await {
                tracing::warn!(run_id = %run_id, error = %e, "backend failed to discard run");
            }
        }
        self.runs().remove(run_id);
        Ok(())
    }

    /// Poll until the run is terminal, `token` fires or the timeout elapses
    pub async fn monitor(
        &self,
        run_id: &RunId,
        options: MonitorOptions,
        token: CancellationToken,
    ) -> EngineResult<RunSnapshot> {
        let interval = options.interval();
        let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut failures = 0;

        loop {
            match self.poll(run_id).await {
                Ok(snapshot) if snapshot.is_terminal() => return Ok(snapshot),
                Ok(_) => failures = 0,
                Err(EngineError::UnknownRun(id)) => return Err(EngineError::UnknownRun(id)),
                Err(e) => {
                    failures += 1;
                    tracing::warn!(run_id = %run_id, attempt = failures, error = %e, "status poll failed");
                    self.event_tx.send_event(ExecutionEvent::warning(run_id, e.to_string(), None));
                    if failures >= MAX_POLL_FAILURES {
                        return self.update(run_id, |entry| {
                            entry.snapshot.abort(
                                RunState::Failed,
                                RunError::new(ErrorKind::Execution, format!("lost track of the run: {}", e)),
                                "backend status unavailable",
                            )
                        });
                    }
                }
            }

            let timed_out = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => return self.cancel(run_id).await,
                _ = timed_out => {
                    let timeout = options.timeout.unwrap_or_default();
                    return self.time_out(run_id, timeout).await;
                }
            }
        }
    }

    async fn time_out(&self, run_id: &RunId, timeout: Duration) -> EngineResult<RunSnapshot> {
        let current = self.snapshot(run_id)?;
        if current.is_terminal() {
            return Ok(current);
        }
        tracing::warn!(run_id = %run_id, ?timeout, "run timed out");

        let backend = self.backend(current.runtime)?;
        if let Err(e) = backend.cancel(run_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "backend failed to stop timed out run");
        }
        self.update(run_id, |entry| {
            entry.snapshot.abort(
                RunState::Failed,
                RunError::new(
                    ErrorKind::Timeout,
                    format!("run exceeded its timeout of {}s", timeout.as_secs()),
                ),
                "run timed out",
            )
        })
    }
}
