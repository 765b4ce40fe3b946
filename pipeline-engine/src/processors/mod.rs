// Runtime processors
// Compile resolved pipelines into backend-specific execution artifacts

pub mod airflow;
pub mod argo;
pub mod artifact;
pub(crate) mod bootstrap;
pub mod local;

pub use airflow::{AirflowDag, AirflowProcessor};
pub use argo::{ArgoProcessor, Workflow};
pub use artifact::{ArtifactHeader, ArtifactNode, ArtifactPayload, ExecutionArtifact};
pub use local::{LocalPlan, LocalProcessor};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, Violation};
use crate::execution::plan::ExecutionPlan;
use crate::parser::models::{NodeKind, RuntimeTarget};
use crate::template::ResolvedPipeline;

use std::collections::BTreeSet;

/// What a runtime can express
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub runtime: RuntimeTarget,
    pub gpu: bool,
    pub components: bool,
    pub requires_image: bool,
    pub retries: bool,
}

impl Capabilities {
    pub fn for_runtime(runtime: RuntimeTarget) -> Self {
        match runtime {
            RuntimeTarget::Local => LocalProcessor::capabilities(),
            RuntimeTarget::Kfp => ArgoProcessor::capabilities(),
            RuntimeTarget::Airflow => AirflowProcessor::capabilities(),
        }
    }

    /// Labelled feature flags, in display order
    pub fn describe(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("gpu resources", self.gpu),
            ("custom components", self.components),
            ("per-node container images", self.requires_image),
            ("node retries", self.retries),
        ]
    }
}

/// Processor selected for a pipeline's runtime target
#[derive(Debug, Clone)]
pub enum RuntimeProcessor {
    Local(LocalProcessor),
    ContainerOrchestrated(ArgoProcessor),
    BatchScheduler(AirflowProcessor),
}

impl RuntimeProcessor {
    pub fn for_runtime(runtime: RuntimeTarget, config: &EngineConfig) -> Self {
        match runtime {
            RuntimeTarget::Local => Self::Local(LocalProcessor::new(config.local.clone())),
            RuntimeTarget::Kfp => Self::ContainerOrchestrated(ArgoProcessor::new(config.argo.clone())),
            RuntimeTarget::Airflow => Self::BatchScheduler(AirflowProcessor::new(config.airflow.clone())),
        }
    }

    pub fn runtime(&self) -> RuntimeTarget {
        match self {
            Self::Local(_) => RuntimeTarget::Local,
            Self::ContainerOrchestrated(_) => RuntimeTarget::Kfp,
            Self::BatchScheduler(_) => RuntimeTarget::Airflow,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::for_runtime(self.runtime())
    }

    /// Compile a resolved pipeline into this runtime's artifact
    pub fn process(&self, resolved: &ResolvedPipeline, plan: &ExecutionPlan) -> EngineResult<ExecutionArtifact> {
        if resolved.runtime != self.runtime() {
            return Err(EngineError::Internal(format!(
                "pipeline targets the {} runtime but was handed to the {} processor",
                resolved.runtime,
                self.runtime()
            )));
        }

        let violations = check_resolved(resolved, self.capabilities());
        if !violations.is_empty() {
            return Err(EngineError::Invalid(violations));
        }

        let _span = tracing::debug_span!("process", runtime = %self.runtime(), run_id = %resolved.run_id).entered();
        match self {
            Self::Local(processor) => processor.process(resolved, plan),
            Self::ContainerOrchestrated(processor) => processor.process(resolved, plan),
            Self::BatchScheduler(processor) => processor.process(resolved, plan),
        }
    }
}

fn check_resolved(resolved: &ResolvedPipeline, caps: Capabilities) -> Vec<Violation> {
    let runtime = caps.runtime;
    let mut violations = Vec::new();
    for node in resolved.nodes.values() {
        if !caps.gpu && node.resources.requests_gpu() {
            violations.push(Violation::capability(
                format!("the {} runtime cannot schedule gpu resources", runtime),
                format!("nodes[{}].resources.gpu", node.id),
            ));
        }
        if !caps.components && node.kind == NodeKind::Component {
            violations.push(Violation::capability(
                format!("the {} runtime does not run custom components", runtime),
                format!("nodes[{}].type", node.id),
            ));
        }
        if caps.requires_image && node.image.as_deref().map_or(true, str::is_empty) {
            violations.push(
                Violation::capability(
                    format!("the {} runtime requires a container image for every node", runtime),
                    format!("nodes[{}].image", node.id),
                )
                .with_suggestion("set 'image' on the node or 'default_image' in the engine config"),
            );
        }
        if !caps.retries && node.max_attempts() > 1 {
            violations.push(Violation::capability(
                format!("the {} runtime does not retry nodes", runtime),
                format!("nodes[{}].retry", node.id),
            ));
        }
    }
    violations
}

/// Lowercase RFC 1123 label: `Fraud Model_v2` -> `fraud-model-v2`.
///
/// May be empty when `name` holds no alphanumerics.
pub fn dns_label(name: &str, max: usize) -> String {
    let mut label = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            label.push(c.to_ascii_lowercase());
        } else if !label.is_empty() && !label.ends_with('-') {
            label.push('-');
        }
    }
    label.truncate(max);
    label.trim_end_matches('-').to_string()
}

/// Python identifier-ish name used for Airflow dag and task ids
pub fn identifier(name: &str, max: usize) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    ident.truncate(max);
    ident
}

/// Hands out unique backend names
pub(crate) struct NameAllocator {
    taken: BTreeSet<String>,
    max: usize,
}

impl NameAllocator {
    pub(crate) fn new(max: usize, reserved: &[&str]) -> Self {
        Self {
            taken: reserved.iter().map(|s| s.to_string()).collect(),
            max,
        }
    }

    /// `base`, or `base-2`, `base-3`... when already handed out
    pub(crate) fn allocate(&mut self, base: &str, separator: char) -> String {
        let base = if base.is_empty() { "node" } else { base };
        let mut candidate: String = base.chars().take(self.max).collect();
        let mut n = 2;
        while self.taken.contains(&candidate) {
            let suffix = format!("{}{}", separator, n);
            let keep = self.max.saturating_sub(suffix.len());
            let stem: String = base.chars().take(keep).collect();
            candidate = format!("{}{}", stem.trim_end_matches(separator), suffix);
            n += 1;
        }
        self.taken.insert(candidate.clone());
        candidate
    }
}

/// Quote `arg` for a POSIX shell when it holds anything special
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
