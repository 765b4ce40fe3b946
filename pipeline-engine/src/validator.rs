// Pipeline Validator
// Structural, reference and runtime capability checks over a pipeline graph

use crate::components::ComponentProvider;
use crate::error::{EngineError, EngineResult, Violation};
use crate::graph::PipelineGraph;
use crate::parser::models::{FileDependency, Node, NodeKind, Pipeline};
use crate::processors::Capabilities;
use crate::template::staging::{is_contained, is_path_segment, RESERVED_DIRS};
use crate::template::substitution;

use std::collections::{HashMap, HashSet};

/// Outcome of validating a pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.violations.iter().all(|v| !v.is_error())
    }

    pub fn errors(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| !v.is_error())
    }

    /// `Err(Invalid)` with the error-severity violations, if any
    pub fn into_result(self) -> EngineResult<()> {
        if self.is_valid() {
            return Ok(());
        }
        Err(EngineError::Invalid(
            self.violations.into_iter().filter(|v| v.is_error()).collect(),
        ))
    }
}

/// Validator for a pipeline against one runtime
pub struct PipelineValidator<'a> {
    provider: &'a dyn ComponentProvider,
    capabilities: Capabilities,
    default_image: Option<&'a str>,
}

impl<'a> PipelineValidator<'a> {
    pub fn new(provider: &'a dyn ComponentProvider, capabilities: Capabilities) -> Self {
        Self {
            provider,
            capabilities,
            default_image: None,
        }
    }

    /// Image used for generic nodes that do not name one
    pub fn with_default_image(mut self, image: Option<&'a str>) -> Self {
        self.default_image = image.filter(|i| !i.is_empty());
        self
    }

    pub fn validate(&self, pipeline: &Pipeline) -> ValidationResult {
        let graph = PipelineGraph::new(pipeline);
        self.validate_graph(pipeline, &graph)
    }

    /// Validate with a graph already built from `pipeline`
    pub fn validate_graph(&self, pipeline: &Pipeline, graph: &PipelineGraph) -> ValidationResult {
        let mut violations = Vec::new();

        if pipeline.nodes.is_empty() {
            violations.push(
                Violation::structural("pipeline has no nodes", "nodes")
                    .with_suggestion("add at least one notebook, script or component node"),
            );
        }

        Self::check_parameters(pipeline, &mut violations);
        Self::check_structure(pipeline, graph, &mut violations);

        for cycle in find_cycles(graph) {
            violations.push(Violation::structural(
                format!("circular dependency detected: {}", cycle.join(" -> ")),
                "edges",
            ));
        }

        if graph.len() > 1 {
            for idx in graph.isolated() {
                violations.push(
                    Violation::structural(
                        format!("node '{}' is not connected to any other node", graph.id_of(idx)),
                        format!("nodes[{}]", graph.id_of(idx)),
                    )
                    .warning(),
                );
            }
        }

        for (idx, node) in graph.nodes().iter().enumerate() {
            let path = format!("nodes[{}]", node.id);
            self.check_properties(node, &path, &mut violations);
            Self::check_references(pipeline, node, &path, &mut violations);
            Self::check_file_dependencies(graph, idx, node, &path, &mut violations);
            self.check_component(node, &path, &mut violations);
            self.check_capabilities(node, &path, &mut violations);
        }

        for (i, volume) in pipeline.runtime_config.volumes.iter().enumerate() {
            if volume.claim.trim().is_empty() || volume.mount_path.trim().is_empty() {
                violations.push(Violation::structural(
                    "volume mounts need a claim name and a mount path",
                    format!("runtimeConfig.volumes[{}]", i),
                ));
            }
        }

        if !self.capabilities.retries {
            if let Some(retry) = pipeline.runtime_config.retry.as_ref().filter(|r| r.max_attempts > 1) {
                violations.push(Violation::capability(
                    format!(
                        "the {} runtime does not support retries (maxAttempts: {})",
                        self.capabilities.runtime, retry.max_attempts
                    ),
                    "runtimeConfig.retry",
                ));
            }
        }

        let errors = violations.iter().filter(|v| v.is_error()).count();
        tracing::debug!(
            pipeline = %pipeline.name,
            errors,
            warnings = violations.len() - errors,
            "validated pipeline"
        );

        ValidationResult { violations }
    }

    fn check_parameters(pipeline: &Pipeline, violations: &mut Vec<Violation>) {
        let mut seen = HashSet::new();
        for (i, param) in pipeline.parameters.iter().enumerate() {
            if param.name.is_empty() || !param.name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
                violations.push(Violation::structural(
                    format!("invalid parameter name '{}'", param.name),
                    format!("parameters[{}]", i),
                ));
            } else if !seen.insert(param.name.as_str()) {
                violations.push(Violation::structural(
                    format!("parameter '{}' is declared more than once", param.name),
                    format!("parameters[{}]", i),
                ));
            }
        }

        let usage = parameter_usage(pipeline);
        for (i, param) in pipeline.parameters.iter().enumerate() {
            if !param.name.is_empty() && !usage.contains_key(&param.name) {
                violations.push(
                    Violation::reference(
                        format!("parameter '{}' is never referenced", param.name),
                        format!("parameters[{}]", i),
                    )
                    .warning(),
                );
            }
        }
    }

    fn check_structure(pipeline: &Pipeline, graph: &PipelineGraph, violations: &mut Vec<Violation>) {
        for (i, node) in pipeline.nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                violations.push(Violation::structural(
                    "node id must not be empty",
                    format!("nodes[{}].id", i),
                ));
            } else if !is_path_segment(&node.id) {
                violations.push(
                    Violation::structural(
                        format!("node id '{}' must not contain path separators or be '.' or '..'", node.id),
                        format!("nodes[{}].id", i),
                    )
                    .with_suggestion("node ids name the node's staging directory"),
                );
            } else if RESERVED_DIRS.contains(&node.id.as_str()) {
                violations.push(Violation::structural(
                    format!("node id '{}' is reserved for run files", node.id),
                    format!("nodes[{}].id", i),
                ));
            }
        }

        for duplicate in graph.duplicate_nodes() {
            violations.push(Violation::structural(
                format!("duplicate node id '{}'", duplicate.id),
                format!("nodes[{}].id", duplicate.position),
            ));
        }

        for dangling in graph.dangling_edges() {
            violations.push(
                Violation::structural(
                    format!(
                        "edge {} '{}' does not name a node",
                        dangling.end.as_str(),
                        dangling.missing
                    ),
                    format!("edges[{}].{}", dangling.position, dangling.end.as_str()),
                )
                .with_suggestion("check the node id for typos"),
            );
        }
    }

    fn check_properties(&self, node: &Node, path: &str, violations: &mut Vec<Violation>) {
        match node.kind {
            NodeKind::Component => {
                if node.component.as_deref().map_or(true, str::is_empty) {
                    violations.push(Violation::structural(
                        "component node does not name a component",
                        format!("{}.component", path),
                    ));
                }
            }
            _ => {
                if node.filename.as_deref().map_or(true, |f| f.trim().is_empty()) {
                    violations.push(Violation::structural(
                        format!("{} node requires a filename", node.kind),
                        format!("{}.filename", path),
                    ));
                }
            }
        }

        if node.resources.cpu == Some(0) {
            violations.push(Violation::structural(
                "cpu must be at least 1",
                format!("{}.resources.cpu", path),
            ));
        }
        if node.resources.memory == Some(0) {
            violations.push(Violation::structural(
                "memory must be at least 1 GiB",
                format!("{}.resources.memory", path),
            ));
        }
        if node.retry.as_ref().map_or(false, |r| r.max_attempts == 0) {
            violations.push(Violation::structural(
                "maxAttempts must be at least 1",
                format!("{}.retry.maxAttempts", path),
            ));
        }

        let mut outputs = HashSet::new();
        for output in &node.outputs {
            if output.trim().is_empty() || !outputs.insert(output.as_str()) {
                violations.push(Violation::structural(
                    format!("output '{}' is empty or declared twice", output),
                    format!("{}.outputs", path),
                ));
            } else if !is_contained(output) {
                violations.push(Violation::structural(
                    format!("output '{}' must be a relative path without '..' segments", output),
                    format!("{}.outputs", path),
                ));
            }
        }

        if let Some(filename) = node.filename.as_deref().filter(|f| !f.trim().is_empty()) {
            if !is_contained(filename) {
                violations.push(Violation::structural(
                    format!("filename '{}' must be a relative path without '..' segments", filename),
                    format!("{}.filename", path),
                ));
            }
        }
    }

    fn check_references(pipeline: &Pipeline, node: &Node, path: &str, violations: &mut Vec<Violation>) {
        let declared: HashSet<&str> = pipeline.parameters.iter().map(|p| p.name.as_str()).collect();

        let mut fields: Vec<(String, &str)> = Vec::new();
        if let Some(image) = &node.image {
            fields.push((format!("{}.image", path), image));
        }
        if let Some(filename) = &node.filename {
            fields.push((format!("{}.filename", path), filename));
        }
        for (key, value) in &node.parameters {
            fields.push((format!("{}.parameters.{}", path, key), value));
        }
        for (key, value) in &node.env {
            fields.push((format!("{}.env.{}", path, key), value));
        }

        for (field, value) in fields {
            match substitution::references(value) {
                Ok(names) => {
                    for name in names {
                        if !declared.contains(name.as_str()) {
                            violations.push(
                                Violation::reference(
                                    format!(
                                        "node '{}' references undeclared parameter '{}'",
                                        node.id, name
                                    ),
                                    field.clone(),
                                )
                                .with_suggestion(format!("declare '{}' under parameters", name)),
                            );
                        }
                    }
                }
                Err(e) => {
                    violations.push(
                        Violation::reference(format!("node '{}': {}", node.id, e), field)
                            .with_suggestion("use $${ for a literal ${"),
                    );
                }
            }
        }
    }

    fn check_file_dependencies(
        graph: &PipelineGraph,
        idx: usize,
        node: &Node,
        path: &str,
        violations: &mut Vec<Violation>,
    ) {
        for (i, dependency) in node.inputs.iter().enumerate() {
            let field = format!("{}.inputs[{}]", path, i);
            match dependency {
                FileDependency::Upstream { node: producer, output } => {
                    let Some(producer_idx) = graph.index_of(producer) else {
                        violations.push(Violation::reference(
                            format!("input names unknown node '{}'", producer),
                            field,
                        ));
                        continue;
                    };
                    if !graph.is_ancestor(producer_idx, idx) {
                        violations.push(
                            Violation::reference(
                                format!(
                                    "input '{}' comes from '{}', which is not upstream of '{}'",
                                    output, producer, node.id
                                ),
                                field.clone(),
                            )
                            .with_suggestion(format!(
                                "add an edge from '{}' to '{}'",
                                producer, node.id
                            )),
                        );
                    }
                    if !graph.node_at(producer_idx).outputs.iter().any(|o| o == output) {
                        violations.push(Violation::reference(
                            format!("node '{}' does not declare output '{}'", producer, output),
                            field,
                        ));
                    }
                }
                FileDependency::Local { path: local } => {
                    if local.trim().is_empty() {
                        violations.push(Violation::structural("input path is empty", field));
                    } else if !is_contained(local) {
                        violations.push(Violation::structural(
                            format!("input '{}' must be a relative path without '..' segments", local),
                            field,
                        ));
                    }
                }
            }
        }
    }

    fn check_component(&self, node: &Node, path: &str, violations: &mut Vec<Violation>) {
        if node.kind != NodeKind::Component {
            return;
        }
        let Some(id) = node.component.as_deref().filter(|c| !c.is_empty()) else {
            return;
        };
        let Some(spec) = self.provider.component(id) else {
            violations.push(
                Violation::reference(
                    format!("unknown component '{}'", id),
                    format!("{}.component", path),
                )
                .with_suggestion("check the component catalog"),
            );
            return;
        };

        for input in &spec.inputs {
            if input.required && input.default.is_none() && !node.parameters.contains_key(&input.key) {
                violations.push(Violation::reference(
                    format!(
                        "component '{}' requires input '{}' ({})",
                        id, input.key, input.name
                    ),
                    format!("{}.parameters.{}", path, input.key),
                ));
            }
        }

        for key in node.parameters.keys() {
            if spec.input(key).is_none() {
                violations.push(
                    Violation::reference(
                        format!("component '{}' has no input '{}'", id, key),
                        format!("{}.parameters.{}", path, key),
                    )
                    .warning(),
                );
            }
        }
    }

    fn check_capabilities(&self, node: &Node, path: &str, violations: &mut Vec<Violation>) {
        let caps = &self.capabilities;

        if !caps.gpu && node.resources.requests_gpu() {
            violations.push(Violation::capability(
                format!("the {} runtime cannot schedule GPUs", caps.runtime),
                format!("{}.resources.gpu", path),
            ));
        }

        if !caps.components && node.kind == NodeKind::Component {
            violations.push(Violation::capability(
                format!("the {} runtime does not run custom components", caps.runtime),
                format!("{}.type", path),
            ));
        }

        if caps.requires_image && !self.has_image(node) {
            violations.push(
                Violation::capability(
                    format!("the {} runtime requires a container image for '{}'", caps.runtime, node.id),
                    format!("{}.image", path),
                )
                .with_suggestion("set 'image' on the node or 'default_image' in the engine config"),
            );
        }

        if !caps.retries && node.retry.as_ref().map_or(false, |r| r.max_attempts > 1) {
            violations.push(Violation::capability(
                format!("the {} runtime does not support retries", caps.runtime),
                format!("{}.retry", path),
            ));
        }
    }

    fn has_image(&self, node: &Node) -> bool {
        if node.image.as_deref().map_or(false, |i| !i.trim().is_empty()) {
            return true;
        }
        match node.kind {
            NodeKind::Component => node
                .component
                .as_deref()
                .and_then(|id| self.provider.component(id))
                .is_some(),
            _ => self.default_image.is_some(),
        }
    }
}

/// Upper bound on enumerated cycles; dense graphs have exponentially many
pub const MAX_CYCLES: usize = 64;

/// Every elementary cycle, as id sequences closing on their start.
///
/// Each cycle is reported once, starting from its lowest id; successors are
/// followed in id order. Enumeration stops after [`MAX_CYCLES`].
pub fn find_cycles(graph: &PipelineGraph) -> Vec<Vec<String>> {
    let order = graph.sorted_indices();
    let mut rank = vec![0; graph.len()];
    for (position, &idx) in order.iter().enumerate() {
        rank[idx] = position;
    }

    let mut cycles = Vec::new();
    let mut path = Vec::new();
    let mut on_path = vec![false; graph.len()];
    for &start in &order {
        let mut search = CycleSearch {
            graph,
            rank: &rank,
            start,
            path: &mut path,
            on_path: &mut on_path,
            cycles: &mut cycles,
        };
        search.extend(start);
        if cycles.len() >= MAX_CYCLES {
            break;
        }
    }
    cycles
}

/// Simple paths from `start` through nodes ranked above it
struct CycleSearch<'g> {
    graph: &'g PipelineGraph,
    rank: &'g [usize],
    start: usize,
    path: &'g mut Vec<usize>,
    on_path: &'g mut [bool],
    cycles: &'g mut Vec<Vec<String>>,
}

impl CycleSearch<'_> {
    fn extend(&mut self, idx: usize) {
        let graph = self.graph;
        self.path.push(idx);
        self.on_path[idx] = true;

        for &next in graph.successors(idx) {
            if self.cycles.len() >= MAX_CYCLES {
                break;
            }
            if next == self.start {
                let mut cycle: Vec<String> =
                    self.path.iter().map(|n| graph.id_of(*n).to_string()).collect();
                cycle.push(graph.id_of(next).to_string());
                self.cycles.push(cycle);
            } else if self.rank[next] > self.rank[self.start] && !self.on_path[next] {
                self.extend(next);
            }
        }

        self.on_path[idx] = false;
        self.path.pop();
    }
}

/// Parameters referenced anywhere in the pipeline, per parameter name
pub fn parameter_usage(pipeline: &Pipeline) -> HashMap<String, Vec<String>> {
    let mut usage: HashMap<String, Vec<String>> = HashMap::new();
    for node in &pipeline.nodes {
        let values = node
            .parameters
            .values()
            .chain(node.env.values())
            .chain(node.image.iter())
            .chain(node.filename.iter());
        for value in values {
            for name in substitution::references(value).unwrap_or_default() {
                let users = usage.entry(name).or_default();
                if !users.contains(&node.id) {
                    users.push(node.id.clone());
                }
            }
        }
    }
    usage
}
