// Airflow DAG Processor
// Compiles resolved pipelines into Airflow 2.x DAG files of KubernetesPodOperator tasks

use crate::config::AirflowConfig;
use crate::error::{EngineError, EngineResult, Violation};
use crate::execution::plan::ExecutionPlan;
use crate::parser::models::{FailurePolicy, NodeKind, RuntimeTarget};
use crate::processors::artifact::{ArtifactHeader, ArtifactPayload, ExecutionArtifact};
use crate::processors::{bootstrap, dns_label, identifier, Capabilities, NameAllocator};
use crate::template::{ResolvedNode, ResolvedPipeline};

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

const MAX_ID_LEN: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    AllSuccess,
    AllDone,
}

impl TriggerRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerRule::AllSuccess => "all_success",
            TriggerRule::AllDone => "all_done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AirflowVolume {
    pub name: String,
    pub claim: String,
    pub mount_path: String,
    pub read_only: bool,
}

/// One KubernetesPodOperator task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AirflowTask {
    pub task_id: String,
    /// Pod name
    pub name: String,
    pub image: String,
    pub cmds: Vec<String>,
    pub arguments: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub retries: u32,
    pub retry_delay_secs: u64,
    pub exponential_backoff: bool,
    pub max_retry_delay_secs: Option<u64>,
    pub trigger_rule: TriggerRule,
    pub cpu: Option<u32>,
    pub memory: Option<u32>,
    pub gpu: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AirflowDag {
    pub dag_id: String,
    pub run_id: String,
    pub description: String,
    pub schedule: Option<String>,
    pub namespace: String,
    pub credentials_secret: Option<String>,
    pub volumes: Vec<AirflowVolume>,
    pub tasks: Vec<AirflowTask>,
    /// (upstream task id, downstream task id)
    pub edges: Vec<(String, String)>,
}

impl AirflowDag {
    pub fn task(&self, task_id: &str) -> Option<&AirflowTask> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// Python source of the DAG file
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Generated by pipeforge for run {}", self.run_id);
        out.push_str("from datetime import timedelta\n\n");
        out.push_str("import pendulum\n");
        out.push_str("from airflow import DAG\n");
        out.push_str("from airflow.providers.cncf.kubernetes.operators.pod import KubernetesPodOperator\n");
        out.push_str("from airflow.providers.cncf.kubernetes.secret import Secret\n");
        out.push_str("from kubernetes.client import models as k8s\n\n");

        if self.volumes.is_empty() {
            out.push_str("volumes = []\nvolume_mounts = []\n");
        } else {
            out.push_str("volumes = [\n");
            for volume in &self.volumes {
                let _ = writeln!(
                    out,
                    "    k8s.V1Volume(name={}, persistent_volume_claim=k8s.V1PersistentVolumeClaimVolumeSource(claim_name={}, read_only={})),",
                    py_str(&volume.name),
                    py_str(&volume.claim),
                    py_bool(volume.read_only)
                );
            }
            out.push_str("]\nvolume_mounts = [\n");
            for volume in &self.volumes {
                let _ = writeln!(
                    out,
                    "    k8s.V1VolumeMount(name={}, mount_path={}, read_only={}),",
                    py_str(&volume.name),
                    py_str(&volume.mount_path),
                    py_bool(volume.read_only)
                );
            }
            out.push_str("]\n");
        }
        match &self.credentials_secret {
            Some(secret) => {
                out.push_str("secrets = [\n");
                for key in ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"] {
                    let _ = writeln!(
                        out,
                        "    Secret(\"env\", {}, {}, {}),",
                        py_str(key),
                        py_str(secret),
                        py_str(key)
                    );
                }
                out.push_str("]\n\n");
            }
            None => out.push_str("secrets = []\n\n"),
        }

        out.push_str("with DAG(\n");
        let _ = writeln!(out, "    dag_id={},", py_str(&self.dag_id));
        let _ = writeln!(out, "    description={},", py_str(&self.description));
        let _ = writeln!(
            out,
            "    schedule_interval={},",
            self.schedule.as_deref().map_or_else(|| "None".to_string(), py_str)
        );
        out.push_str("    start_date=pendulum.datetime(2024, 1, 1, tz=\"UTC\"),\n");
        out.push_str("    catchup=False,\n");
        out.push_str("    is_paused_upon_creation=False,\n");
        out.push_str("    tags=[\"pipeforge\"],\n");
        out.push_str(") as dag:\n");

        for task in &self.tasks {
            out.push('\n');
            self.render_task(&mut out, task);
        }

        if !self.edges.is_empty() {
            out.push('\n');
            for (upstream, downstream) in &self.edges {
                let _ = writeln!(out, "    {} >> {}", task_var(upstream), task_var(downstream));
            }
        }
        out
    }

    fn render_task(&self, out: &mut String, task: &AirflowTask) {
        let _ = writeln!(out, "    {} = KubernetesPodOperator(", task_var(&task.task_id));
        let _ = writeln!(out, "        task_id={},", py_str(&task.task_id));
        let _ = writeln!(out, "        name={},", py_str(&task.name));
        let _ = writeln!(out, "        namespace={},", py_str(&self.namespace));
        let _ = writeln!(out, "        image={},", py_str(&task.image));
        let _ = writeln!(out, "        cmds={},", py_list(&task.cmds));
        let _ = writeln!(out, "        arguments={},", py_list(&task.arguments));
        let _ = writeln!(out, "        env_vars={},", py_dict(&task.env));
        out.push_str("        secrets=secrets,\n");
        out.push_str("        volumes=volumes,\n");
        out.push_str("        volume_mounts=volume_mounts,\n");

        let mut requests = BTreeMap::new();
        if let Some(cpu) = task.cpu {
            requests.insert("cpu".to_string(), cpu.to_string());
        }
        if let Some(memory) = task.memory {
            requests.insert("memory".to_string(), format!("{}Gi", memory));
        }
        let mut limits = BTreeMap::new();
        if let Some(gpu) = task.gpu.filter(|g| *g > 0) {
            limits.insert("nvidia.com/gpu".to_string(), gpu.to_string());
        }
        if !requests.is_empty() || !limits.is_empty() {
            let _ = writeln!(
                out,
                "        container_resources=k8s.V1ResourceRequirements(requests={}, limits={}),",
                py_dict(&requests),
                py_dict(&limits)
            );
        }

        let _ = writeln!(out, "        retries={},", task.retries);
        if task.retries > 0 {
            let _ = writeln!(out, "        retry_delay=timedelta(seconds={}),", task.retry_delay_secs);
            let _ = writeln!(out, "        retry_exponential_backoff={},", py_bool(task.exponential_backoff));
            if let Some(max) = task.max_retry_delay_secs {
                let _ = writeln!(out, "        max_retry_delay=timedelta(seconds={}),", max);
            }
        }
        let _ = writeln!(out, "        trigger_rule={},", py_str(task.trigger_rule.as_str()));
        out.push_str("        get_logs=True,\n");
        out.push_str("    )\n");
    }
}

fn task_var(task_id: &str) -> String {
    format!("task_{}", task_id)
}

fn py_str(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn py_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn py_list(values: &[String]) -> String {
    let items: Vec<String> = values.iter().map(|v| py_str(v)).collect();
    format!("[{}]", items.join(", "))
}

fn py_dict(values: &BTreeMap<String, String>) -> String {
    let items: Vec<String> = values
        .iter()
        .map(|(k, v)| format!("{}: {}", py_str(k), py_str(v)))
        .collect();
    format!("{{{}}}", items.join(", "))
}

#[derive(Debug, Clone)]
pub struct AirflowProcessor {
    config: AirflowConfig,
}

impl AirflowProcessor {
    pub fn new(config: AirflowConfig) -> Self {
        Self { config }
    }

    pub fn capabilities() -> Capabilities {
        Capabilities {
            runtime: RuntimeTarget::Airflow,
            gpu: true,
            components: true,
            requires_image: true,
            retries: true,
        }
    }

    pub fn process(&self, resolved: &ResolvedPipeline, plan: &ExecutionPlan) -> EngineResult<ExecutionArtifact> {
        let mut names = NameAllocator::new(MAX_ID_LEN, &[]);
        let header = ArtifactHeader::build(resolved, plan, |id| names.allocate(&identifier(id, MAX_ID_LEN), '_'))?;
        let config = &resolved.runtime_config;

        let trigger_rule = match config.failure_policy {
            FailurePolicy::HaltDownstream => TriggerRule::AllSuccess,
            FailurePolicy::BestEffort => TriggerRule::AllDone,
        };

        let mut tasks = Vec::with_capacity(header.nodes.len());
        let mut edges = Vec::new();
        for artifact_node in &header.nodes {
            let node = resolved.node(&artifact_node.id).ok_or_else(|| {
                EngineError::Internal(format!("node '{}' was not resolved", artifact_node.id))
            })?;
            tasks.push(self.task(resolved, node, &artifact_node.native_id, trigger_rule)?);

            for up in &artifact_node.upstream {
                if let Some(upstream) = header.node(up) {
                    edges.push((upstream.native_id.clone(), artifact_node.native_id.clone()));
                }
            }
        }

        let dag = AirflowDag {
            dag_id: identifier(resolved.run_id.as_str(), MAX_ID_LEN),
            run_id: resolved.run_id.to_string(),
            description: resolved.name.clone(),
            schedule: config.schedule.clone().filter(|s| !s.is_empty()),
            namespace: config
                .namespace
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| self.config.namespace.clone()),
            credentials_secret: config
                .object_storage
                .as_ref()
                .and_then(|s| s.credentials_secret.clone()),
            volumes: config
                .volumes
                .iter()
                .enumerate()
                .map(|(i, v)| AirflowVolume {
                    name: format!("volume-{}", i),
                    claim: v.claim.clone(),
                    mount_path: v.mount_path.clone(),
                    read_only: v.read_only,
                })
                .collect(),
            tasks,
            edges,
        };

        tracing::debug!(run_id = %resolved.run_id, dag_id = %dag.dag_id, tasks = dag.tasks.len(), "compiled airflow dag");
        Ok(ExecutionArtifact::new(header, ArtifactPayload::Dag(dag)))
    }

    fn task(
        &self,
        resolved: &ResolvedPipeline,
        node: &ResolvedNode,
        task_id: &str,
        trigger_rule: TriggerRule,
    ) -> EngineResult<AirflowTask> {
        let image = node.image.clone().filter(|i| !i.is_empty()).ok_or_else(|| {
            EngineError::Invalid(vec![Violation::capability(
                format!("the airflow runtime requires a container image for '{}'", node.id),
                format!("nodes[{}].image", node.id),
            )])
        })?;

        let (cmds, arguments) = match node.kind {
            NodeKind::Component if !bootstrap::needs_wrapping(resolved, node) => {
                let (program, rest) = node.command.split_first().ok_or_else(|| {
                    EngineError::Internal(format!("component node '{}' has no command", node.id))
                })?;
                (vec![program.clone()], rest.to_vec())
            }
            _ => (
                vec!["sh".to_string(), "-c".to_string()],
                vec![bootstrap::script(resolved, node)?],
            ),
        };

        let retry = node.retry.as_ref().filter(|r| r.retries() > 0);
        let name = match dns_label(task_id, 63) {
            label if label.is_empty() => "node".to_string(),
            label => label,
        };

        Ok(AirflowTask {
            task_id: task_id.to_string(),
            name,
            image,
            cmds,
            arguments,
            env: bootstrap::container_env(resolved, node),
            retries: retry.map_or(0, |r| r.retries()),
            retry_delay_secs: retry.map_or(0, |r| r.backoff_secs),
            exponential_backoff: retry.is_some_and(|r| r.backoff_factor > 1.0),
            max_retry_delay_secs: retry.and_then(|r| r.max_backoff_secs),
            trigger_rule,
            cpu: node.resources.cpu,
            memory: node.resources.memory,
            gpu: node.resources.gpu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::ComponentCatalog;
    use crate::execution::state::RunId;
    use crate::graph::PipelineGraph;
    use crate::parser::PipelineParser;
    use crate::template::{ResolveOptions, Resolver};

    const PIPELINE: &str = r#"
name: nightly etl
runtime: airflow
runtimeConfig:
  schedule: "@daily"
  namespace: etl
  failurePolicy: best-effort
  objectStorage: { endpoint: "http://minio:9000", bucket: lake, prefix: runs, credentialsSecret: lake-creds }
  volumes:
    - { claim: scratch, mountPath: /scratch }
nodes:
  - id: extract-orders
    type: python-script
    filename: extract.py
    image: python:3.11
    outputs: [orders.csv]
    retry: { maxAttempts: 4, backoffSecs: 15, backoffFactor: 2.0 }
  - id: score
    type: r-script
    filename: score.R
    image: r-base:4.3.2
    resources: { gpu: 1, memory: 8 }
    inputs: [{ node: extract-orders, output: orders.csv }]
    parameters: { threshold: "0.7" }
edges:
  - { source: extract-orders, target: score }
"#;

    fn compile(source: &str) -> ExecutionArtifact {
        let pipeline = PipelineParser::parse_yaml(source).unwrap();
        let catalog = ComponentCatalog::empty();
        let graph = PipelineGraph::new(&pipeline);
        let plan = ExecutionPlan::order(&graph).unwrap();
        let resolved = Resolver::new(&catalog)
            .resolve(&pipeline, &graph, &plan, &ResolveOptions::new(RunId::new("nightly-etl-20240301000000-0f0f0f0f"), "/unused"))
            .unwrap();
        AirflowProcessor::new(AirflowConfig::default())
            .process(&resolved, &plan)
            .unwrap()
    }

    fn dag(artifact: &ExecutionArtifact) -> &AirflowDag {
        match artifact.payload() {
            ArtifactPayload::Dag(dag) => dag,
            other => panic!("expected dag, got {:?}", other),
        }
    }

    #[test]
    fn test_dag_structure() {
        let artifact = compile(PIPELINE);
        let dag = dag(&artifact);

        assert_eq!(dag.dag_id, "nightly_etl_20240301000000_0f0f0f0f");
        assert_eq!(dag.schedule.as_deref(), Some("@daily"));
        assert_eq!(dag.namespace, "etl");
        assert_eq!(dag.edges, vec![("extract_orders".to_string(), "score".to_string())]);
        assert_eq!(artifact.file_name(), "nightly_etl_20240301000000_0f0f0f0f.py");

        let extract = dag.task("extract_orders").unwrap();
        assert_eq!(extract.name, "extract-orders");
        assert_eq!(extract.retries, 3);
        assert_eq!(extract.retry_delay_secs, 15);
        assert!(extract.exponential_backoff);
        assert_eq!(extract.trigger_rule, TriggerRule::AllDone);
        assert_eq!(extract.cmds, vec!["sh", "-c"]);
        assert!(extract.arguments[0].contains("copy orders.csv s3://lake/runs/nightly-etl-20240301000000-0f0f0f0f/extract-orders/orders.csv"));

        let score = dag.task("score").unwrap();
        assert_eq!(score.retries, 0);
        assert_eq!(score.gpu, Some(1));
        assert!(score.arguments[0].contains("Rscript score.R --threshold 0.7"));
        assert_eq!(score.env["PIPELINE_S3_BUCKET"], "lake");
    }

    #[test]
    fn test_rendered_python() {
        let artifact = compile(PIPELINE);
        let source = artifact.render().unwrap();

        assert!(source.contains("from airflow.providers.cncf.kubernetes.operators.pod import KubernetesPodOperator"));
        assert!(source.contains("dag_id=\"nightly_etl_20240301000000_0f0f0f0f\","));
        assert!(source.contains("schedule_interval=\"@daily\","));
        assert!(source.contains("task_extract_orders = KubernetesPodOperator("));
        assert!(source.contains("retry_delay=timedelta(seconds=15),"));
        assert!(source.contains("retry_exponential_backoff=True,"));
        assert!(source.contains("trigger_rule=\"all_done\","));
        assert!(source.contains("limits={\"nvidia.com/gpu\": \"1\"}"));
        assert!(source.contains("requests={\"memory\": \"8Gi\"}"));
        assert!(source.contains("Secret(\"env\", \"AWS_ACCESS_KEY_ID\", \"lake-creds\", \"AWS_ACCESS_KEY_ID\"),"));
        assert!(source.contains("claim_name=\"scratch\", read_only=False"));
        assert!(source.trim_end().ends_with("task_extract_orders >> task_score"));
    }

    #[test]
    fn test_halt_downstream_and_unscheduled() {
        let source = PIPELINE
            .replace("  schedule: \"@daily\"\n", "")
            .replace("failurePolicy: best-effort", "failurePolicy: halt-downstream");
        let artifact = compile(&source);
        let dag = dag(&artifact);

        assert!(dag.tasks.iter().all(|t| t.trigger_rule == TriggerRule::AllSuccess));
        assert!(artifact.render().unwrap().contains("schedule_interval=None,"));
    }
}
