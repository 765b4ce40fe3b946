// Pipeline Document Models
// Serde types for the pipeline documents produced by the editor or written by hand

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Root pipeline document
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Backend the pipeline targets
    #[serde(default)]
    pub runtime: RuntimeTarget,

    /// Runtime-specific settings (staging, volumes, failure policy)
    #[serde(default)]
    pub runtime_config: RuntimeConfig,

    /// Pipeline parameters, overridable at submission time
    #[serde(default)]
    pub parameters: Vec<PipelineParameter>,

    /// Computational nodes
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Dependencies between nodes
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Pipeline {
    /// Find a node by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Find a parameter declaration by name
    pub fn parameter(&self, name: &str) -> Option<&PipelineParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

// =============================================================================
// Runtime selection
// =============================================================================

/// Supported execution backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeTarget {
    /// Sequential-by-wave execution on the local host
    #[default]
    Local,
    /// Container-orchestrated execution as an Argo workflow (Kubeflow Pipelines)
    #[serde(alias = "argo", alias = "kubeflow")]
    Kfp,
    /// Batch-DAG scheduler (Apache Airflow)
    Airflow,
}

impl RuntimeTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeTarget::Local => "local",
            RuntimeTarget::Kfp => "kfp",
            RuntimeTarget::Airflow => "airflow",
        }
    }
}

impl fmt::Display for RuntimeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuntimeTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(RuntimeTarget::Local),
            "kfp" | "argo" | "kubeflow" => Ok(RuntimeTarget::Kfp),
            "airflow" => Ok(RuntimeTarget::Airflow),
            other => Err(format!(
                "unknown runtime '{}', expected one of: local, kfp, airflow",
                other
            )),
        }
    }
}

/// Pipeline-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Object storage used for intermediate files
    pub object_storage: Option<ObjectStorage>,

    /// Explicit staging root, overrides object storage and engine defaults
    pub staging_root: Option<String>,

    /// Shared volumes mounted into every node
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,

    /// What happens to dependents of a failed node
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Default retry policy for nodes without their own
    pub retry: Option<RetryPolicy>,

    /// Batch-scheduler schedule interval (cron or preset such as `@daily`)
    pub schedule: Option<String>,

    /// Kubernetes namespace override for container runtimes
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorage {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
    /// Name of the secret holding credentials; passed through untouched
    pub credentials_secret: Option<String>,
}

impl ObjectStorage {
    /// Root URL for staged files in this bucket
    pub fn staging_url(&self) -> String {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("s3://{}/{}", self.bucket, prefix),
            _ => format!("s3://{}", self.bucket),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Persistent volume claim name
    pub claim: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Dependents of a failed node are skipped
    #[default]
    HaltDownstream,
    /// Dependents are attempted regardless of upstream failures
    BestEffort,
}

/// Retry policy for a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    pub max_backoff_secs: Option<u64>,
}

fn default_backoff_secs() -> u64 {
    10
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_secs: default_backoff_secs(),
            backoff_factor: default_backoff_factor(),
            max_backoff_secs: None,
        }
    }

    pub fn with_backoff(mut self, secs: u64, factor: f64) -> Self {
        self.backoff_secs = secs;
        self.backoff_factor = factor;
        self
    }

    /// Number of retries after the first attempt
    pub fn retries(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Delay before the given retry (1 = first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let factor = if self.backoff_factor < 1.0 {
            1.0
        } else {
            self.backoff_factor
        };
        let mut secs = self.backoff_secs as f64 * factor.powi(exponent);
        if let Some(max) = self.max_backoff_secs {
            secs = secs.min(max as f64);
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineParameter {
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_opt_scalar")]
    pub default: Option<String>,
    pub description: Option<String>,
}

impl PipelineParameter {
    pub fn new(name: impl Into<String>, default: Option<&str>) -> Self {
        Self {
            name: name.into(),
            default: default.map(str::to_string),
            description: None,
        }
    }
}

// =============================================================================
// Nodes and edges
// =============================================================================

/// Kind of work a node performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Notebook,
    #[serde(alias = "python")]
    PythonScript,
    #[serde(alias = "r")]
    RScript,
    /// Custom component described by the component catalog
    Component,
}

impl NodeKind {
    /// Built-in node kinds executing a file from the pipeline's directory
    pub fn is_generic(&self) -> bool {
        !matches!(self, NodeKind::Component)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Notebook => "notebook",
            NodeKind::PythonScript => "python-script",
            NodeKind::RScript => "r-script",
            NodeKind::Component => "component",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work in the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,

    /// Display name; defaults to the file stem of `filename`
    pub name: Option<String>,

    #[serde(rename = "type")]
    pub kind: NodeKind,

    /// Notebook or script to execute (generic nodes)
    pub filename: Option<String>,

    /// Catalog id of the component (component nodes)
    pub component: Option<String>,

    /// Container image
    #[serde(alias = "runtimeImage")]
    pub image: Option<String>,

    #[serde(default)]
    pub resources: Resources,

    /// Ordered file dependencies
    #[serde(default)]
    pub inputs: Vec<FileDependency>,

    /// Files this node produces, relative to its working directory
    #[serde(default)]
    pub outputs: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_scalar_map")]
    pub parameters: BTreeMap<String, String>,

    /// Environment; accepts a map or a list of `NAME=VALUE` entries
    #[serde(default, alias = "envVars", deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,

    pub retry: Option<RetryPolicy>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            filename: None,
            component: None,
            image: None,
            resources: Resources::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: BTreeMap::new(),
            env: BTreeMap::new(),
            retry: None,
        }
    }

    /// Name shown to users: explicit name, else file stem, else id
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        self.filename
            .as_deref()
            .and_then(|f| Path::new(f).file_stem())
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.id.clone())
    }

    /// Iterate over upstream file dependencies as (producer, output)
    pub fn upstream_inputs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inputs.iter().filter_map(|dep| match dep {
            FileDependency::Upstream { node, output } => Some((node.as_str(), output.as_str())),
            FileDependency::Local { .. } => None,
        })
    }
}

/// Resource requests for a node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Resources {
    pub cpu: Option<u32>,
    /// Memory in GiB
    pub memory: Option<u32>,
    pub gpu: Option<u32>,
}

impl Resources {
    pub fn requests_gpu(&self) -> bool {
        self.gpu.unwrap_or(0) > 0
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none() && !self.requests_gpu()
    }
}

/// A file a node needs before it can run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum FileDependency {
    /// Output declared by an upstream node
    Upstream { node: String, output: String },
    /// File shipped from the pipeline's directory
    Local { path: String },
}

/// `target` depends on `source`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Edge {
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

// =============================================================================
// Tolerant deserializers
// =============================================================================

/// Scalar accepted wherever the document stores a textual value
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(n) => n.to_string(),
            Scalar::Str(s) => s,
        }
    }
}

fn deserialize_opt_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(Scalar::into_string))
}

fn deserialize_scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let map = BTreeMap::<String, Scalar>::deserialize(deserializer)?;
    Ok(map.into_iter().map(|(k, v)| (k, v.into_string())).collect())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EnvSpec {
    Map(BTreeMap<String, Scalar>),
    List(Vec<String>),
}

fn deserialize_env<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match EnvSpec::deserialize(deserializer)? {
        EnvSpec::Map(map) => map.into_iter().map(|(k, v)| (k, v.into_string())).collect(),
        EnvSpec::List(entries) => parse_env_entries(&entries),
    })
}

/// Convert `NAME=VALUE` entries into a map.
///
/// Entries with an empty value are skipped; malformed entries are skipped
/// with a warning.
pub fn parse_env_entries(entries: &[String]) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for entry in entries.iter().filter(|e| !e.is_empty()) {
        match entry.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                if value.is_empty() {
                    tracing::info!(
                        "skipping environment variable `{}`: no value",
                        name.trim()
                    );
                } else {
                    env.insert(name.trim().to_string(), value.to_string());
                }
            }
            _ => {
                tracing::warn!("could not process environment variable entry `{}`", entry);
            }
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_falls_back_to_file_stem() {
        let mut node = Node::new("n1", NodeKind::Notebook);
        assert_eq!(node.display_name(), "n1");

        node.filename = Some("analysis/load_data.ipynb".to_string());
        assert_eq!(node.display_name(), "load_data");

        node.name = Some("Load".to_string());
        assert_eq!(node.display_name(), "Load");
    }

    #[test]
    fn test_parse_env_entries() {
        let entries = vec![
            "FOO=bar".to_string(),
            "EMPTY=".to_string(),
            "malformed".to_string(),
            "=novalue".to_string(),
            "URL=http://x?a=b".to_string(),
        ];
        let env = parse_env_entries(&entries);
        assert_eq!(env.len(), 2);
        assert_eq!(env["FOO"], "bar");
        assert_eq!(env["URL"], "http://x?a=b");
    }

    #[test]
    fn test_env_accepts_list_and_map() {
        let json = r#"{"id": "a", "type": "python-script", "env": ["A=1", "B=2"]}"#;
        let node: Node = serde_json::from_str(json).unwrap();
        assert_eq!(node.env["B"], "2");

        let json = r#"{"id": "a", "type": "python-script", "env": {"A": 1, "B": true}}"#;
        let node: Node = serde_json::from_str(json).unwrap();
        assert_eq!(node.env["A"], "1");
        assert_eq!(node.env["B"], "true");
    }

    #[test]
    fn test_file_dependency_forms() {
        let json = r#"[{"node": "a", "output": "data.csv"}, {"path": "utils.py"}]"#;
        let deps: Vec<FileDependency> = serde_json::from_str(json).unwrap();
        assert_eq!(
            deps[0],
            FileDependency::Upstream {
                node: "a".to_string(),
                output: "data.csv".to_string()
            }
        );
        assert_eq!(
            deps[1],
            FileDependency::Local {
                path: "utils.py".to_string()
            }
        );
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let mut policy = RetryPolicy::new(4).with_backoff(5, 2.0);
        assert_eq!(policy.retries(), 3);
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));

        policy.max_backoff_secs = Some(12);
        assert_eq!(policy.delay_for(3), Duration::from_secs(12));
    }

    #[test]
    fn test_runtime_target_parsing() {
        assert_eq!("kfp".parse::<RuntimeTarget>(), Ok(RuntimeTarget::Kfp));
        assert_eq!("Argo".parse::<RuntimeTarget>(), Ok(RuntimeTarget::Kfp));
        assert!("spark".parse::<RuntimeTarget>().is_err());

        let target: RuntimeTarget = serde_json::from_str("\"airflow\"").unwrap();
        assert_eq!(target, RuntimeTarget::Airflow);
    }

    #[test]
    fn test_object_storage_url() {
        let storage = ObjectStorage {
            endpoint: "http://minio:9000".to_string(),
            bucket: "runs".to_string(),
            prefix: Some("/team/a/".to_string()),
            credentials_secret: None,
        };
        assert_eq!(storage.staging_url(), "s3://runs/team/a");
    }
}
