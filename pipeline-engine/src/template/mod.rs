// Parameter & template resolution
// Turns validated nodes into fully substituted, staged node specs

pub mod resolver;
pub mod staging;
pub mod substitution;

pub use resolver::{ResolveOptions, Resolver};
pub use staging::staged_path;

use crate::execution::state::RunId;
use crate::parser::models::{NodeKind, Resources, RetryPolicy, RuntimeConfig, RuntimeTarget};

use serde::Serialize;
use std::collections::BTreeMap;

/// A file made available to a node before it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedInput {
    /// Path of the file relative to the node's working directory
    pub name: String,
    /// Staged location (upstream outputs) or path relative to the pipeline directory (local files)
    pub path: String,
    /// Node producing the file, for upstream outputs
    pub producer: Option<String>,
}

/// A file a node must leave behind for its dependents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedOutput {
    pub name: String,
    pub path: String,
}

/// A node with every reference substituted and every file staged
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedNode {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub filename: Option<String>,
    pub component: Option<String>,
    pub image: Option<String>,
    /// Container command for component nodes; empty for generic nodes
    pub command: Vec<String>,
    pub parameters: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub resources: Resources,
    pub inputs: Vec<StagedInput>,
    pub outputs: Vec<StagedOutput>,
    pub retry: Option<RetryPolicy>,
    /// Direct dependencies, ordered by id
    pub upstream: Vec<String>,
}

impl ResolvedNode {
    /// Total attempts allowed for this node
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, |r| r.max_attempts.max(1))
    }
}

/// Output of the resolver: one concrete node spec per node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPipeline {
    pub name: String,
    pub run_id: RunId,
    pub runtime: RuntimeTarget,
    pub runtime_config: RuntimeConfig,
    /// Final parameter values after overrides
    pub parameters: BTreeMap<String, String>,
    pub nodes: BTreeMap<String, ResolvedNode>,
    /// Root under which `<run-id>/<node>/<output>` files are staged
    pub staging_root: String,
}

impl ResolvedPipeline {
    pub fn node(&self, id: &str) -> Option<&ResolvedNode> {
        self.nodes.get(id)
    }

    /// Staging directory of this run
    pub fn run_dir(&self) -> String {
        staging::run_dir(&self.staging_root, self.run_id.as_str())
    }
}
