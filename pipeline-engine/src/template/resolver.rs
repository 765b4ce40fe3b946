// Parameter resolver
// Applies parameter values, component defaults and staging paths to every node

use crate::components::{CommandArg, ComponentProvider, ComponentSpec};
use crate::error::{EngineError, EngineResult, Violation};
use crate::execution::plan::ExecutionPlan;
use crate::execution::state::RunId;
use crate::graph::PipelineGraph;
use crate::parser::models::{FileDependency, Node, NodeKind, Pipeline, RetryPolicy};
use crate::template::staging::{source_path, staged_path};
use crate::template::substitution::{self, SubstitutionError};
use crate::template::{ResolvedNode, ResolvedPipeline, StagedInput, StagedOutput};

use std::collections::BTreeMap;

/// Per-submission inputs to resolution
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub run_id: RunId,
    /// Parameter values supplied by the caller
    pub overrides: BTreeMap<String, String>,
    /// Staging root used when the pipeline sets neither `stagingRoot` nor object storage
    pub staging_root: String,
    /// Image for generic nodes without one
    pub default_image: Option<String>,
}

impl ResolveOptions {
    pub fn new(run_id: RunId, staging_root: impl Into<String>) -> Self {
        Self {
            run_id,
            overrides: BTreeMap::new(),
            staging_root: staging_root.into(),
            default_image: None,
        }
    }

    pub fn with_overrides(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_default_image(mut self, image: Option<String>) -> Self {
        self.default_image = image;
        self
    }
}

/// Resolves validated pipelines into concrete node specs
pub struct Resolver<'a> {
    provider: &'a dyn ComponentProvider,
}

impl<'a> Resolver<'a> {
    pub fn new(provider: &'a dyn ComponentProvider) -> Self {
        Self { provider }
    }

    /// Resolve every node of `pipeline`.
    ///
    /// All unresolvable references are collected and returned together as
    /// `EngineError::Invalid`; nothing is produced in that case.
    pub fn resolve(
        &self,
        pipeline: &Pipeline,
        graph: &PipelineGraph,
        plan: &ExecutionPlan,
        options: &ResolveOptions,
    ) -> EngineResult<ResolvedPipeline> {
        let mut violations = Vec::new();
        let parameters = parameter_table(pipeline, &options.overrides, &mut violations);
        let staging_root = staging_root(pipeline, options);

        let mut nodes = BTreeMap::new();
        for id in plan.topological() {
            let node = graph
                .node(id)
                .ok_or_else(|| EngineError::Internal(format!("planned node '{}' is not in the graph", id)))?;
            let upstream = graph.upstream_ids(id).into_iter().map(str::to_string).collect();

            let mut context = NodeContext {
                node,
                parameters: &parameters,
                violations: &mut violations,
            };
            if let Some(resolved) = self.resolve_node(
                &mut context,
                upstream,
                &staging_root,
                pipeline.runtime_config.retry.as_ref(),
                options,
            ) {
                nodes.insert(node.id.clone(), resolved);
            }
        }

        if !violations.is_empty() {
            return Err(EngineError::Invalid(violations));
        }

        tracing::debug!(
            pipeline = %pipeline.name,
            run_id = %options.run_id,
            nodes = nodes.len(),
            staging_root = %staging_root,
            "resolved pipeline"
        );

        Ok(ResolvedPipeline {
            name: pipeline.name.clone(),
            run_id: options.run_id.clone(),
            runtime: pipeline.runtime,
            runtime_config: pipeline.runtime_config.clone(),
            parameters,
            nodes,
            staging_root,
        })
    }

    fn resolve_node(
        &self,
        ctx: &mut NodeContext<'_>,
        upstream: Vec<String>,
        staging_root: &str,
        default_retry: Option<&RetryPolicy>,
        options: &ResolveOptions,
    ) -> Option<ResolvedNode> {
        let node = ctx.node;
        let path = format!("nodes[{}]", node.id);
        let run_id = options.run_id.as_str();

        let mut parameters = BTreeMap::new();
        for (key, value) in &node.parameters {
            parameters.insert(key.clone(), ctx.substitute(value, &format!("{}.parameters.{}", path, key)));
        }

        let mut env = BTreeMap::new();
        for (key, value) in &node.env {
            env.insert(key.clone(), ctx.substitute(value, &format!("{}.env.{}", path, key)));
        }

        let filename = node
            .filename
            .as_deref()
            .map(|f| ctx.substitute(f, &format!("{}.filename", path)));
        let mut image = node
            .image
            .as_deref()
            .filter(|i| !i.trim().is_empty())
            .map(|i| ctx.substitute(i, &format!("{}.image", path)));

        let mut outputs: Vec<StagedOutput> = node
            .outputs
            .iter()
            .map(|name| StagedOutput {
                name: name.clone(),
                path: staged_path(staging_root, run_id, &node.id, name),
            })
            .collect();

        let inputs: Vec<StagedInput> = node
            .inputs
            .iter()
            .map(|dependency| match dependency {
                FileDependency::Upstream { node: producer, output } => StagedInput {
                    name: output.clone(),
                    path: staged_path(staging_root, run_id, producer, output),
                    producer: Some(producer.clone()),
                },
                FileDependency::Local { path } => StagedInput {
                    name: path.trim_start_matches("./").to_string(),
                    path: path.clone(),
                    producer: None,
                },
            })
            .collect();

        let mut command = Vec::new();
        match node.kind {
            NodeKind::Component => {
                let id = node.component.as_deref().unwrap_or_default();
                let Some(spec) = self.provider.component(id) else {
                    ctx.violations.push(Violation::reference(
                        format!("unknown component '{}'", id),
                        format!("{}.component", path),
                    ));
                    return None;
                };
                apply_component_defaults(&spec, &mut parameters);
                if image.is_none() {
                    image = Some(spec.image.clone());
                }
                let wiring = CommandWiring {
                    node: &node.id,
                    path: &path,
                    staging_root,
                    run_id,
                    inputs: &inputs,
                };
                command = wiring.expand(&spec, &parameters, &mut outputs, &mut *ctx.violations);
            }
            _ => {
                if image.is_none() {
                    image = options.default_image.clone().filter(|i| !i.is_empty());
                }
            }
        }

        let retry = node.retry.clone().or_else(|| default_retry.cloned());

        Some(ResolvedNode {
            id: node.id.clone(),
            name: node.display_name(),
            kind: node.kind,
            filename,
            component: node.component.clone(),
            image,
            command,
            parameters,
            env,
            resources: node.resources,
            inputs,
            outputs,
            retry,
            upstream,
        })
    }
}

struct NodeContext<'c> {
    node: &'c Node,
    parameters: &'c BTreeMap<String, String>,
    violations: &'c mut Vec<Violation>,
}

impl NodeContext<'_> {
    /// Substitute parameters, recording a violation and keeping the raw text on failure
    fn substitute(&mut self, value: &str, path: &str) -> String {
        let parameters = self.parameters;
        match substitution::substitute(value, |name| parameters.get(name).map(String::as_str)) {
            Ok(resolved) => resolved,
            Err(SubstitutionError::Unresolved(names)) => {
                for name in names {
                    self.violations.push(
                        Violation::reference(
                            format!(
                                "node '{}' references unresolved parameter '{}'",
                                self.node.id, name
                            ),
                            path,
                        )
                        .with_suggestion(format!("declare '{}' under parameters or supply a value", name)),
                    );
                }
                value.to_string()
            }
            Err(e) => {
                self.violations.push(Violation::reference(
                    format!("node '{}': {}", self.node.id, e),
                    path,
                ));
                value.to_string()
            }
        }
    }
}

/// Final parameter values: caller overrides win over declared defaults
fn parameter_table(
    pipeline: &Pipeline,
    overrides: &BTreeMap<String, String>,
    violations: &mut Vec<Violation>,
) -> BTreeMap<String, String> {
    let mut table = BTreeMap::new();

    for name in overrides.keys() {
        if pipeline.parameter(name).is_none() {
            violations.push(
                Violation::reference(
                    format!("value supplied for undeclared parameter '{}'", name),
                    format!("parameters[{}]", name),
                )
                .with_suggestion("only declared pipeline parameters can be overridden"),
            );
        }
    }

    for param in &pipeline.parameters {
        match overrides.get(&param.name).or(param.default.as_ref()) {
            Some(value) => {
                table.insert(param.name.clone(), value.clone());
            }
            None => violations.push(
                Violation::reference(
                    format!("parameter '{}' has no default and no value was supplied", param.name),
                    format!("parameters[{}]", param.name),
                )
                .with_suggestion(format!("pass a value for '{}'", param.name)),
            ),
        }
    }

    table
}

/// Staging root precedence: explicit `stagingRoot`, then object storage, then the configured root
fn staging_root(pipeline: &Pipeline, options: &ResolveOptions) -> String {
    let config = &pipeline.runtime_config;
    if let Some(root) = config.staging_root.as_deref().filter(|r| !r.is_empty()) {
        return root.trim_end_matches('/').to_string();
    }
    if let Some(storage) = &config.object_storage {
        return storage.staging_url();
    }
    options.staging_root.trim_end_matches('/').to_string()
}

fn apply_component_defaults(spec: &ComponentSpec, parameters: &mut BTreeMap<String, String>) {
    for input in &spec.inputs {
        if let Some(default) = &input.default {
            parameters
                .entry(input.key.clone())
                .or_insert_with(|| default.clone());
        }
    }
}

/// What a component command line is expanded against
struct CommandWiring<'w> {
    node: &'w str,
    path: &'w str,
    staging_root: &'w str,
    run_id: &'w str,
    inputs: &'w [StagedInput],
}

impl CommandWiring<'_> {
    /// Expand a component command line.
    ///
    /// Output placeholders become staged paths and `inputPath` placeholders the
    /// staged location of the node input they name. An unset optional input is
    /// dropped along with the flag written right before it.
    fn expand(
        &self,
        spec: &ComponentSpec,
        parameters: &BTreeMap<String, String>,
        outputs: &mut Vec<StagedOutput>,
        violations: &mut Vec<Violation>,
    ) -> Vec<String> {
        let mut command = Vec::with_capacity(spec.command.len());
        // Index of a trailing `--flag` literal, if the last element pushed was one
        let mut flag = None;

        for arg in &spec.command {
            let value = match arg {
                CommandArg::Literal(text) => {
                    flag = text.starts_with('-').then_some(command.len());
                    command.push(text.clone());
                    continue;
                }
                CommandArg::InputValue(key) => parameters.get(key).cloned().ok_or(key),
                CommandArg::InputPath(key) => match parameters.get(key) {
                    Some(name) => match self.input_file(name) {
                        Some(staged) => Ok(staged),
                        None => {
                            violations.push(
                                Violation::reference(
                                    format!(
                                        "input '{}' of node '{}' names '{}', which is not one of its inputs",
                                        key, self.node, name
                                    ),
                                    format!("{}.parameters.{}", self.path, key),
                                )
                                .with_suggestion(format!(
                                    "add '{}' under the node's inputs or name an existing input",
                                    name
                                )),
                            );
                            Ok(name.clone())
                        }
                    },
                    None => Err(key),
                },
                CommandArg::OutputPath(key) => {
                    let path = staged_path(self.staging_root, self.run_id, self.node, key);
                    if !outputs.iter().any(|o| &o.name == key) {
                        outputs.push(StagedOutput {
                            name: key.clone(),
                            path: path.clone(),
                        });
                    }
                    Ok(path)
                }
            };

            match value {
                Ok(value) => command.push(value),
                Err(key) if spec.input(key).map_or(false, |input| input.required) => {
                    violations.push(
                        Violation::reference(
                            format!("component '{}' requires input '{}'", spec.id, key),
                            format!("{}.parameters.{}", self.path, key),
                        )
                        .with_suggestion(format!("set '{}' under the node's parameters", key)),
                    );
                }
                Err(_) => {
                    if let Some(index) = flag {
                        command.truncate(index);
                    }
                }
            }
            flag = None;
        }
        command
    }

    /// Staged location of the node input called `name` (`output`, `producer/output` or a local path)
    fn input_file(&self, name: &str) -> Option<String> {
        let name = name.trim().trim_start_matches("./");
        self.inputs.iter().find_map(|input| match input.producer.as_deref() {
            Some(producer) => (input.name == name || format!("{}/{}", producer, input.name) == name)
                .then(|| input.path.clone()),
            None => (input.name == name)
                .then(|| source_path(self.staging_root, self.run_id, &input.name)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{parse_component_yaml, ComponentCatalog};
    use crate::error::ErrorKind;
    use crate::parser::models::{ObjectStorage, PipelineParameter};
    use crate::parser::PipelineParser;

    const PIPELINE: &str = r#"
name: churn
parameters:
  - name: date
    default: "2024-05-01"
  - name: epochs
    default: 5
  - name: registry
nodes:
  - id: extract
    type: python-script
    filename: extract.py
    outputs: [raw.csv]
    env:
      DAY: ${date}
      LITERAL: $${date}
  - id: train
    type: component
    component: trainer
    inputs: [{ node: extract, output: raw.csv }, { path: conf/model.yaml }]
    parameters:
      epochs: ${epochs}
    retry: { maxAttempts: 2 }
  - id: publish
    type: notebook
    filename: publish-${date}.ipynb
    image: ${registry}/publisher:1
edges:
  - { source: extract, target: train }
  - { source: train, target: publish }
"#;

    fn catalog() -> ComponentCatalog {
        let spec = parse_component_yaml(
            "trainer",
            r#"
name: Trainer
inputs:
- {name: Epochs, optional: false}
- {name: Learning Rate, default: "0.1"}
- {name: Data}
outputs:
- {name: Model}
implementation:
  container:
    image: trainer:2.0
    command: [python, train.py]
    args: [--epochs, {inputValue: Epochs}, --lr, {inputValue: Learning Rate}, --data, {inputPath: Data}, --model, {outputPath: Model}]
"#,
        )
        .unwrap();
        ComponentCatalog::from_specs([spec])
    }

    fn resolve(pipeline: &Pipeline, overrides: &[(&str, &str)]) -> EngineResult<ResolvedPipeline> {
        let catalog = catalog();
        let graph = PipelineGraph::new(pipeline);
        let plan = ExecutionPlan::order(&graph)?;
        let options = ResolveOptions::new(RunId::new("churn-run-1"), "/stage")
            .with_overrides(
                overrides
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
            .with_default_image(Some("python:3.11".to_string()));
        Resolver::new(&catalog).resolve(pipeline, &graph, &plan, &options)
    }

    #[test]
    fn test_resolves_parameters_and_staging() {
        let pipeline = PipelineParser::parse_yaml(PIPELINE).unwrap();
        let resolved = resolve(&pipeline, &[("registry", "ghcr.io/acme"), ("epochs", "20")]).unwrap();

        assert_eq!(resolved.parameters["epochs"], "20");
        assert_eq!(resolved.run_dir(), "/stage/churn-run-1");

        let extract = resolved.node("extract").unwrap();
        assert_eq!(extract.env["DAY"], "2024-05-01");
        assert_eq!(extract.env["LITERAL"], "${date}");
        assert_eq!(extract.image.as_deref(), Some("python:3.11"));
        assert_eq!(extract.outputs[0].path, "/stage/churn-run-1/extract/raw.csv");

        let train = resolved.node("train").unwrap();
        assert_eq!(train.image.as_deref(), Some("trainer:2.0"));
        assert_eq!(train.parameters["learning_rate"], "0.1");
        assert_eq!(train.upstream, vec!["extract"]);
        assert_eq!(train.max_attempts(), 2);
        assert_eq!(train.inputs[0].path, "/stage/churn-run-1/extract/raw.csv");
        assert_eq!(train.inputs[0].producer.as_deref(), Some("extract"));
        assert_eq!(train.inputs[1].name, "conf/model.yaml");
        assert_eq!(
            train.command,
            vec![
                "python",
                "train.py",
                "--epochs",
                "20",
                "--lr",
                "0.1",
                "--model",
                "/stage/churn-run-1/train/model",
            ]
        );
        assert_eq!(train.outputs[0].name, "model");

        let publish = resolved.node("publish").unwrap();
        assert_eq!(publish.filename.as_deref(), Some("publish-2024-05-01.ipynb"));
        assert_eq!(publish.image.as_deref(), Some("ghcr.io/acme/publisher:1"));
        assert_eq!(publish.max_attempts(), 1);
    }

    #[test]
    fn test_input_paths_point_at_staged_files() {
        let mut pipeline = PipelineParser::parse_yaml(PIPELINE).unwrap();
        let train = pipeline.nodes.iter_mut().find(|n| n.id == "train").unwrap();
        train.parameters.insert("data".to_string(), "raw.csv".to_string());

        let resolved = resolve(&pipeline, &[("registry", "r")]).unwrap();
        let command = &resolved.node("train").unwrap().command;
        assert_eq!(command[6..8], ["--data", "/stage/churn-run-1/extract/raw.csv"]);

        let train = pipeline.nodes.iter_mut().find(|n| n.id == "train").unwrap();
        train.parameters.insert("data".to_string(), "./conf/model.yaml".to_string());
        let resolved = resolve(&pipeline, &[("registry", "r")]).unwrap();
        let command = &resolved.node("train").unwrap().command;
        assert_eq!(command[6..8], ["--data", "/stage/churn-run-1/_sources/conf/model.yaml"]);

        let train = pipeline.nodes.iter_mut().find(|n| n.id == "train").unwrap();
        train.parameters.insert("data".to_string(), "extract/raw.csv".to_string());
        let resolved = resolve(&pipeline, &[("registry", "r")]).unwrap();
        let command = &resolved.node("train").unwrap().command;
        assert_eq!(command[7], "/stage/churn-run-1/extract/raw.csv");
    }

    #[test]
    fn test_unwired_component_inputs_fail_resolution() {
        let mut pipeline = PipelineParser::parse_yaml(PIPELINE).unwrap();
        let train = pipeline.nodes.iter_mut().find(|n| n.id == "train").unwrap();
        train.parameters.remove("epochs");
        train.parameters.insert("data".to_string(), "missing.csv".to_string());

        let err = resolve(&pipeline, &[("registry", "r")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reference);
        let found: Vec<(&str, &str)> = err
            .violations()
            .iter()
            .map(|v| (v.message.as_str(), v.path.as_str()))
            .collect();
        assert_eq!(
            found,
            vec![
                ("component 'trainer' requires input 'epochs'", "nodes[train].parameters.epochs"),
                (
                    "input 'data' of node 'train' names 'missing.csv', which is not one of its inputs",
                    "nodes[train].parameters.data"
                ),
            ]
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let pipeline = PipelineParser::parse_yaml(PIPELINE).unwrap();
        let first = resolve(&pipeline, &[("registry", "r")]).unwrap();
        let second = resolve(&pipeline, &[("registry", "r")]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unresolved_references_are_batched() {
        let mut pipeline = PipelineParser::parse_yaml(PIPELINE).unwrap();
        pipeline.nodes[0]
            .env
            .insert("OOPS".to_string(), "${missing}-${also_missing}-${missing}".to_string());

        let err = resolve(&pipeline, &[("bogus", "1")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reference);

        let messages: Vec<&str> = err.violations().iter().map(|v| v.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "value supplied for undeclared parameter 'bogus'",
                "parameter 'registry' has no default and no value was supplied",
                "node 'extract' references unresolved parameter 'missing'",
                "node 'extract' references unresolved parameter 'also_missing'",
                "node 'publish' references unresolved parameter 'registry'",
            ]
        );
    }

    #[test]
    fn test_pipeline_retry_and_storage_root() {
        let mut pipeline = PipelineParser::parse_yaml(PIPELINE).unwrap();
        pipeline.parameters.retain(|p| p.name != "registry");
        pipeline.parameters.push(PipelineParameter::new("registry", Some("docker.io")));
        pipeline.runtime_config.retry = Some(RetryPolicy::new(4));
        pipeline.runtime_config.object_storage = Some(ObjectStorage {
            endpoint: "http://minio:9000".to_string(),
            bucket: "artifacts".to_string(),
            prefix: Some("churn".to_string()),
            credentials_secret: None,
        });

        let resolved = resolve(&pipeline, &[]).unwrap();
        assert_eq!(resolved.staging_root, "s3://artifacts/churn");
        assert_eq!(resolved.node("extract").unwrap().max_attempts(), 4);
        assert_eq!(resolved.node("train").unwrap().max_attempts(), 2);

        pipeline.runtime_config.staging_root = Some("/mnt/shared/".to_string());
        let resolved = resolve(&pipeline, &[]).unwrap();
        assert_eq!(resolved.staging_root, "/mnt/shared");
    }
}
