// Execution backends
// The I/O seam between the dispatcher and the systems that actually run nodes

pub mod airflow;
pub mod argo;
pub mod local;

pub use airflow::AirflowBackend;
pub use argo::ArgoBackend;
pub use local::LocalBackend;

use crate::execution::state::{NativeStatus, RunId};
use crate::processors::ExecutionArtifact;

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Errors raised while talking to a backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{tool} is not available: {message}")]
    Unavailable { tool: String, message: String },

    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("{tool} exited with status {code:?}: {stderr}")]
    CommandFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("could not read backend status: {0}")]
    MalformedStatus(String),

    #[error("run '{0}' is unknown to the backend")]
    UnknownRun(String),

    #[error("artifact does not belong to this backend: {0}")]
    WrongArtifact(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A system that accepts compiled artifacts and reports on their progress
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Hand the artifact over; returns once the backend has accepted it
    async fn submit(&self, artifact: &ExecutionArtifact) -> Result<(), BackendError>;

    /// Current native status of a submitted run
    async fn status(&self, run_id: &RunId) -> Result<NativeStatus, BackendError>;

    /// Ask the backend to stop a run
    async fn cancel(&self, run_id: &RunId) -> Result<(), BackendError>;

    /// Drop any bookkeeping held for a run
    async fn discard(&self, _run_id: &RunId) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Captured output of a CLI invocation
#[derive(Debug, Clone, Default)]
pub struct CliOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program args...`, optionally feeding `stdin`, and fail on a non-zero exit
pub(crate) async fn run_cli(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
    working_dir: Option<&Path>,
) -> Result<CliOutput, BackendError> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    tracing::debug!(program, ?args, "running backend command");
    let mut child = cmd.spawn().map_err(|e| BackendError::Unavailable {
        tool: program.to_string(),
        message: e.to_string(),
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        pipe.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    let result = CliOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if !output.status.success() {
        return Err(BackendError::CommandFailed {
            tool: program.to_string(),
            code: output.status.code(),
            stderr: result.stderr.trim().to_string(),
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_cli_with_stdin() {
        let output = run_cli("sh", &["-c", "cat"], Some("hello"), None).await.unwrap();
        assert_eq!(output.stdout, "hello");
    }

    #[tokio::test]
    async fn test_run_cli_failure() {
        let err = run_cli("sh", &["-c", "echo boom >&2; exit 3"], None, None)
            .await
            .unwrap_err();
        match err {
            BackendError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_run_cli_missing_program() {
        let err = run_cli("pipeforge-no-such-tool", &[], None, None).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable { .. }));
    }
}
