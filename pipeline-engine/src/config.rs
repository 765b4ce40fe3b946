// Engine Configuration
// Runtime connection settings, local execution limits and monitor defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config '{path}': {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Image for generic nodes that do not name one
    pub default_image: Option<String>,
    pub local: LocalConfig,
    pub argo: ArgoConfig,
    pub airflow: AirflowConfig,
    pub monitor: MonitorConfig,
}

impl EngineConfig {
    /// `<config dir>/pipeforge/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pipeforge").join("config.yaml"))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml(&content).map_err(|e| ConfigError::Yaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Load the default config file, falling back to defaults when it does not exist
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "loading engine config");
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }
}

/// Local runtime settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalConfig {
    /// Nodes running at the same time
    pub max_concurrent_nodes: usize,
    /// Root of per-run staging directories
    pub staging_dir: PathBuf,
    /// Directory node filenames are relative to (defaults to the current directory)
    pub working_dir: Option<PathBuf>,
    /// Python interpreter for python-script nodes
    pub python: String,
    /// R interpreter for r-script nodes
    pub r: String,
    /// Notebook runner and its leading arguments
    pub notebook: Vec<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        let staging_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("pipeforge")
            .join("staging");
        Self {
            max_concurrent_nodes: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            staging_dir,
            working_dir: None,
            python: "python3".to_string(),
            r: "Rscript".to_string(),
            notebook: vec!["papermill".to_string()],
        }
    }
}

impl LocalConfig {
    /// Concurrency limit, never zero
    pub fn concurrency(&self) -> usize {
        self.max_concurrent_nodes.max(1)
    }
}

/// Container-orchestrated runtime settings (Argo Workflows)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArgoConfig {
    /// Path or name of the `argo` executable
    pub cli: String,
    pub namespace: String,
    pub service_account: Option<String>,
    /// Staging root when the pipeline has no object storage
    pub staging_root: String,
}

impl Default for ArgoConfig {
    fn default() -> Self {
        Self {
            cli: "argo".to_string(),
            namespace: "default".to_string(),
            service_account: None,
            staging_root: "/mnt/pipeforge/staging".to_string(),
        }
    }
}

/// Batch-scheduler runtime settings (Apache Airflow)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AirflowConfig {
    /// Path or name of the `airflow` executable
    pub cli: String,
    /// Folder the scheduler loads DAG files from
    pub dags_folder: PathBuf,
    /// Kubernetes namespace pods are launched in
    pub namespace: String,
    pub staging_root: String,
}

impl Default for AirflowConfig {
    fn default() -> Self {
        let dags_folder = dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("airflow")
            .join("dags");
        Self {
            cli: "airflow".to_string(),
            dags_folder,
            namespace: "default".to_string(),
            staging_root: "/mnt/pipeforge/staging".to_string(),
        }
    }
}

/// Monitor loop defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    /// Overall run timeout; no timeout when unset
    pub timeout_secs: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            timeout_secs: None,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
