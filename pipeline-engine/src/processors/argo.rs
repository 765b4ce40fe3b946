// Argo Workflow Processor
// Compiles resolved pipelines into argoproj.io/v1alpha1 Workflow documents

use crate::config::ArgoConfig;
use crate::error::{EngineError, EngineResult, Violation};
use crate::execution::plan::ExecutionPlan;
use crate::parser::models::{FailurePolicy, NodeKind, RetryPolicy, RuntimeConfig, RuntimeTarget};
use crate::processors::artifact::{ArtifactHeader, ArtifactPayload, ExecutionArtifact};
use crate::processors::{bootstrap, dns_label, Capabilities, NameAllocator};
use crate::template::{ResolvedNode, ResolvedPipeline};

use serde::Serialize;
use std::collections::BTreeMap;

pub const API_VERSION: &str = "argoproj.io/v1alpha1";
const ENTRYPOINT: &str = "entrypoint";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: WorkflowSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub entrypoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    pub templates: Vec<Template>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dag: Option<DagTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub image: String,
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

impl EnvVar {
    fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }

    fn secret(name: &str, secret: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: SecretKeySelector {
                    name: secret.to_string(),
                    key: name.to_string(),
                },
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    pub secret_key_ref: SecretKeySelector,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ResourceRequirements {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub persistent_volume_claim: PvcSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PvcSource {
    pub claim_name: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    pub limit: u32,
    pub retry_policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    pub duration: String,
    pub factor: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DagTemplate {
    pub tasks: Vec<DagTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DagTask {
    pub name: String,
    pub template: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_on: Option<ContinueOn>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinueOn {
    pub failed: bool,
}

#[derive(Debug, Clone)]
pub struct ArgoProcessor {
    config: ArgoConfig,
}

impl ArgoProcessor {
    pub fn new(config: ArgoConfig) -> Self {
        Self { config }
    }

    pub fn capabilities() -> Capabilities {
        Capabilities {
            runtime: RuntimeTarget::Kfp,
            gpu: true,
            components: true,
            requires_image: true,
            retries: true,
        }
    }

    pub fn process(&self, resolved: &ResolvedPipeline, plan: &ExecutionPlan) -> EngineResult<ExecutionArtifact> {
        let mut names = NameAllocator::new(63, &[ENTRYPOINT]);
        let header = ArtifactHeader::build(resolved, plan, |id| names.allocate(&dns_label(id, 63), '-'))?;
        let config = &resolved.runtime_config;

        let volumes: Vec<Volume> = config
            .volumes
            .iter()
            .enumerate()
            .map(|(i, v)| Volume {
                name: format!("volume-{}", i),
                persistent_volume_claim: PvcSource {
                    claim_name: v.claim.clone(),
                    read_only: v.read_only,
                },
            })
            .collect();
        let mounts: Vec<VolumeMount> = config
            .volumes
            .iter()
            .enumerate()
            .map(|(i, v)| VolumeMount {
                name: format!("volume-{}", i),
                mount_path: v.mount_path.clone(),
                read_only: v.read_only,
            })
            .collect();

        let mut templates = Vec::with_capacity(header.nodes.len() + 1);
        let mut tasks = Vec::with_capacity(header.nodes.len());
        let native: BTreeMap<&str, &str> = header
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.native_id.as_str()))
            .collect();

        for artifact_node in &header.nodes {
            let node = resolved.node(&artifact_node.id).ok_or_else(|| {
                EngineError::Internal(format!("node '{}' was not resolved", artifact_node.id))
            })?;
            let name = artifact_node.native_id.clone();

            templates.push(Template {
                name: name.clone(),
                container: Some(self.container(resolved, node, &mounts)?),
                dag: None,
                retry_strategy: node.retry.as_ref().and_then(retry_strategy),
            });

            tasks.push(DagTask {
                name: name.clone(),
                template: name,
                dependencies: node
                    .upstream
                    .iter()
                    .filter_map(|up| native.get(up.as_str()).map(|n| n.to_string()))
                    .collect(),
                continue_on: (config.failure_policy == FailurePolicy::BestEffort)
                    .then_some(ContinueOn { failed: true }),
            });
        }

        templates.push(Template {
            name: ENTRYPOINT.to_string(),
            container: None,
            dag: Some(DagTemplate { tasks }),
            retry_strategy: None,
        });

        let mut labels = BTreeMap::new();
        labels.insert("pipeforge/pipeline".to_string(), dns_label(&resolved.name, 63));
        labels.insert("pipeforge/run-id".to_string(), dns_label(resolved.run_id.as_str(), 63));

        let workflow = Workflow {
            api_version: API_VERSION.to_string(),
            kind: "Workflow".to_string(),
            metadata: ObjectMeta {
                name: dns_label(resolved.run_id.as_str(), 63),
                namespace: self.namespace(config),
                labels,
            },
            spec: WorkflowSpec {
                entrypoint: ENTRYPOINT.to_string(),
                service_account_name: self.config.service_account.clone(),
                templates,
                volumes,
            },
        };

        tracing::debug!(run_id = %resolved.run_id, workflow = %workflow.metadata.name, "compiled argo workflow");
        Ok(ExecutionArtifact::new(header, ArtifactPayload::Workflow(workflow)))
    }

    fn namespace(&self, config: &RuntimeConfig) -> String {
        config
            .namespace
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.config.namespace.clone())
    }

    fn container(
        &self,
        resolved: &ResolvedPipeline,
        node: &ResolvedNode,
        mounts: &[VolumeMount],
    ) -> EngineResult<Container> {
        let image = node.image.clone().filter(|i| !i.is_empty()).ok_or_else(|| {
            EngineError::Invalid(vec![Violation::capability(
                format!("the kfp runtime requires a container image for '{}'", node.id),
                format!("nodes[{}].image", node.id),
            )])
        })?;

        let (command, args) = match node.kind {
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

        Ok(Container {
            image,
            command,
            args,
            env: container_env(resolved, node),
            resources: resources(node),
            volume_mounts: mounts.to_vec(),
        })
    }
}

fn container_env(resolved: &ResolvedPipeline, node: &ResolvedNode) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = bootstrap::container_env(resolved, node)
        .into_iter()
        .map(|(k, v)| EnvVar::value(k, v))
        .collect();
    if let Some(secret) = resolved
        .runtime_config
        .object_storage
        .as_ref()
        .and_then(|s| s.credentials_secret.as_deref())
    {
        env.push(EnvVar::secret("AWS_ACCESS_KEY_ID", secret));
        env.push(EnvVar::secret("AWS_SECRET_ACCESS_KEY", secret));
    }
    env
}

fn resources(node: &ResolvedNode) -> Option<ResourceRequirements> {
    if node.resources.is_empty() {
        return None;
    }
    let mut requirements = ResourceRequirements::default();
    if let Some(cpu) = node.resources.cpu {
        requirements.requests.insert("cpu".to_string(), cpu.to_string());
    }
    if let Some(memory) = node.resources.memory {
        requirements.requests.insert("memory".to_string(), format!("{}Gi", memory));
    }
    if let Some(gpu) = node.resources.gpu.filter(|g| *g > 0) {
        requirements.limits.insert("nvidia.com/gpu".to_string(), gpu.to_string());
    }
    Some(requirements)
}

fn retry_strategy(policy: &RetryPolicy) -> Option<RetryStrategy> {
    if policy.retries() == 0 {
        return None;
    }
    Some(RetryStrategy {
        limit: policy.retries(),
        retry_policy: "Always".to_string(),
        backoff: Some(Backoff {
            duration: format!("{}s", policy.backoff_secs),
            factor: policy.backoff_factor.round().max(1.0) as u32,
            max_duration: policy.max_backoff_secs.map(|s| format!("{}s", s)),
        }),
    })
}
