// Execution Artifacts
// Immutable backend documents plus the header the dispatcher tracks runs with

use crate::error::{EngineError, EngineResult};
use crate::execution::plan::ExecutionPlan;
use crate::execution::state::RunId;
use crate::parser::models::{FailurePolicy, RuntimeTarget};
use crate::processors::airflow::AirflowDag;
use crate::processors::argo::Workflow;
use crate::processors::local::LocalPlan;
use crate::template::ResolvedPipeline;

use serde::Serialize;
use std::sync::Arc;

/// Node summary shared by every backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactNode {
    pub id: String,
    pub name: String,
    /// Name of the node inside the backend document (task name, task id)
    pub native_id: String,
    pub upstream: Vec<String>,
    pub max_attempts: u32,
}

/// Common header of every artifact
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactHeader {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub runtime: RuntimeTarget,
    pub failure_policy: FailurePolicy,
    /// Nodes in topological order
    pub nodes: Vec<ArtifactNode>,
    pub groups: Vec<Vec<String>>,
}

impl ArtifactHeader {
    /// Build the header, naming each node with `native_id`
    pub fn build<F>(resolved: &ResolvedPipeline, plan: &ExecutionPlan, mut native_id: F) -> EngineResult<Self>
    where
        F: FnMut(&str) -> String,
    {
        let mut nodes = Vec::with_capacity(plan.node_count());
        for id in plan.topological() {
            let node = resolved.node(id).ok_or_else(|| {
                EngineError::Internal(format!("planned node '{}' was not resolved", id))
            })?;
            nodes.push(ArtifactNode {
                id: node.id.clone(),
                name: node.name.clone(),
                native_id: native_id(&node.id),
                upstream: node.upstream.clone(),
                max_attempts: node.max_attempts(),
            });
        }

        Ok(Self {
            run_id: resolved.run_id.clone(),
            pipeline_name: resolved.name.clone(),
            runtime: resolved.runtime,
            failure_policy: resolved.runtime_config.failure_policy,
            nodes,
            groups: plan.groups().to_vec(),
        })
    }

    pub fn node(&self, id: &str) -> Option<&ArtifactNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Engine node id for a backend name
    pub fn node_by_native_id(&self, native_id: &str) -> Option<&ArtifactNode> {
        self.nodes.iter().find(|n| n.native_id == native_id)
    }
}

/// Backend-specific document
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactPayload {
    Local(LocalPlan),
    Workflow(Workflow),
    Dag(AirflowDag),
}

#[derive(Debug, PartialEq)]
struct ArtifactInner {
    header: ArtifactHeader,
    payload: ArtifactPayload,
}

/// Compiled, immutable description of one run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionArtifact {
    inner: Arc<ArtifactInner>,
}

impl ExecutionArtifact {
    pub fn new(header: ArtifactHeader, payload: ArtifactPayload) -> Self {
        Self {
            inner: Arc::new(ArtifactInner { header, payload }),
        }
    }

    pub fn header(&self) -> &ArtifactHeader {
        &self.inner.header
    }

    pub fn payload(&self) -> &ArtifactPayload {
        &self.inner.payload
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.header.run_id
    }

    pub fn runtime(&self) -> RuntimeTarget {
        self.inner.header.runtime
    }

    /// Backend document as text: JSON plan, Argo YAML or Airflow Python
    pub fn render(&self) -> EngineResult<String> {
        match self.payload() {
            ArtifactPayload::Local(plan) => serde_json::to_string_pretty(plan)
                .map_err(|e| EngineError::Internal(format!("failed to render local plan: {}", e))),
            ArtifactPayload::Workflow(workflow) => serde_yaml::to_string(workflow)
                .map_err(|e| EngineError::Internal(format!("failed to render workflow: {}", e))),
            ArtifactPayload::Dag(dag) => Ok(dag.render()),
        }
    }

    /// File name for the rendered document
    pub fn file_name(&self) -> String {
        match self.payload() {
            ArtifactPayload::Local(_) => format!("{}.plan.json", self.run_id()),
            ArtifactPayload::Workflow(_) => format!("{}.yaml", self.run_id()),
            ArtifactPayload::Dag(dag) => format!("{}.py", dag.dag_id),
        }
    }
}
