// Pipeline Engine
// Facade over validation, resolution, compilation and dispatch

use crate::components::ComponentProvider;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, Violation};
use crate::execution::dispatcher::Dispatcher;
use crate::execution::plan::ExecutionPlan;
use crate::execution::state::RunId;
use crate::graph::PipelineGraph;
use crate::parser::models::{Pipeline, RuntimeTarget};
use crate::processors::{Capabilities, ExecutionArtifact, RuntimeProcessor};
use crate::template::staging::{is_path_segment, source_path, RESERVED_DIRS};
use crate::template::{ResolveOptions, ResolvedPipeline, Resolver};
use crate::validator::{PipelineValidator, ValidationResult};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-run inputs
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Generated from the pipeline name when unset
    pub run_id: Option<RunId>,
    pub overrides: BTreeMap<String, String>,
}

impl RunOptions {
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_override(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(name.into(), value.into());
        self
    }
}

/// Everything produced while compiling one run
#[derive(Debug, Clone)]
pub struct CompiledRun {
    pub plan: ExecutionPlan,
    pub resolved: ResolvedPipeline,
    pub artifact: ExecutionArtifact,
}

pub struct PipelineEngine {
    config: EngineConfig,
    provider: Arc<dyn ComponentProvider>,
}

impl PipelineEngine {
    pub fn new(config: EngineConfig, provider: Arc<dyn ComponentProvider>) -> Self {
        Self { config, provider }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &dyn ComponentProvider {
        self.provider.as_ref()
    }

    fn validator(&self, runtime: RuntimeTarget) -> PipelineValidator<'_> {
        PipelineValidator::new(self.provider.as_ref(), Capabilities::for_runtime(runtime))
            .with_default_image(self.config.default_image.as_deref())
    }

    /// Every violation found in `pipeline` for its runtime target
    pub fn validate(&self, pipeline: &Pipeline) -> ValidationResult {
        self.validator(pipeline.runtime).validate(pipeline)
    }

    /// Validate, order and resolve `pipeline`
    pub fn resolve(&self, pipeline: &Pipeline, options: &RunOptions) -> EngineResult<(ExecutionPlan, ResolvedPipeline)> {
        let graph = PipelineGraph::new(pipeline);
        self.validator(pipeline.runtime)
            .validate_graph(pipeline, &graph)
            .into_result()?;
        let plan = ExecutionPlan::order(&graph)?;

        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| RunId::generate(&pipeline.name));
        if !is_path_segment(run_id.as_str()) || RESERVED_DIRS.contains(&run_id.as_str()) {
            return Err(EngineError::Invalid(vec![Violation::structural(
                format!("run id '{}' must be a single directory name", run_id),
                "runId",
            )]));
        }
        let resolve_options = ResolveOptions::new(run_id, self.staging_root(pipeline.runtime))
            .with_overrides(options.overrides.clone())
            .with_default_image(self.config.default_image.clone());

        let resolved = Resolver::new(self.provider.as_ref()).resolve(pipeline, &graph, &plan, &resolve_options)?;
        tracing::debug!(
            pipeline = %pipeline.name,
            run_id = %resolved.run_id,
            groups = plan.len(),
            "resolved pipeline"
        );
        Ok((plan, resolved))
    }

    /// Validate, resolve and process `pipeline` into an artifact for its runtime
    pub fn compile(&self, pipeline: &Pipeline, options: &RunOptions) -> EngineResult<CompiledRun> {
        let (plan, resolved) = self.resolve(pipeline, options)?;
        let artifact = self.processor(pipeline.runtime).process(&resolved, &plan)?;
        tracing::info!(
            pipeline = %pipeline.name,
            run_id = %artifact.run_id(),
            runtime = %artifact.runtime(),
            "compiled pipeline"
        );
        Ok(CompiledRun {
            plan,
            resolved,
            artifact,
        })
    }

    pub fn processor(&self, runtime: RuntimeTarget) -> RuntimeProcessor {
        RuntimeProcessor::for_runtime(runtime, &self.config)
    }

    /// Dispatcher wired to every configured backend
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::from_config(&self.config)
    }

    /// Staging root used when a pipeline sets neither `stagingRoot` nor object storage
    pub fn staging_root(&self, runtime: RuntimeTarget) -> String {
        match runtime {
            RuntimeTarget::Local => self.config.local.staging_dir.display().to_string(),
            RuntimeTarget::Kfp => self.config.argo.staging_root.clone(),
            RuntimeTarget::Airflow => self.config.airflow.staging_root.clone(),
        }
    }
}

/// Copy node sources and local inputs under `<root>/<run-id>/_sources` so container nodes can fetch them.
///
/// Only filesystem staging roots are handled; object storage roots are
/// skipped and must be populated by the caller.
pub fn stage_sources(resolved: &ResolvedPipeline, source_dir: &Path) -> EngineResult<Vec<PathBuf>> {
    if resolved.staging_root.contains("://") {
        tracing::warn!(
            root = %resolved.staging_root,
            "sources must be uploaded to object storage before the run starts"
        );
        return Ok(Vec::new());
    }

    let mut files: Vec<&str> = Vec::new();
    for node in resolved.nodes.values() {
        if let Some(filename) = &node.filename {
            files.push(filename);
        }
        for input in node.inputs.iter().filter(|i| i.producer.is_none()) {
            files.push(&input.path);
        }
    }
    files.sort_unstable();
    files.dedup();

    let mut staged = Vec::with_capacity(files.len());
    for file in files {
        let target = PathBuf::from(source_path(&resolved.staging_root, resolved.run_id.as_str(), file));
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source_dir.join(file), &target)?;
        tracing::debug!(file, target = %target.display(), "staged source");
        staged.push(target);
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::ComponentCatalog;
    use crate::error::ErrorKind;
    use crate::parser::PipelineParser;
    use crate::processors::ArtifactPayload;
    use tempfile::TempDir;

    fn engine(staging: &Path) -> PipelineEngine {
        let mut config = EngineConfig::default();
        config.local.staging_dir = staging.to_path_buf();
        config.argo.staging_root = staging.display().to_string();
        config.default_image = Some("python:3.11".to_string());
        PipelineEngine::new(config, Arc::new(ComponentCatalog::empty()))
    }

    const PIPELINE: &str = r#"
name: report
parameters:
  - { name: day, default: "2024-06-01" }
nodes:
  - { id: fetch, type: python-script, filename: fetch.py, outputs: [raw.json], parameters: { day: "${day}" } }
  - { id: render, type: notebook, filename: render.ipynb, inputs: [{ node: fetch, output: raw.json }, { path: style.css }] }
edges:
  - { source: fetch, target: render }
"#;

    #[test]
    fn test_compile_local() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());
        let pipeline = PipelineParser::parse_yaml(PIPELINE).unwrap();

        let options = RunOptions::default()
            .with_run_id(RunId::new("report-1"))
            .with_override("day", "2024-07-04");
        let compiled = engine.compile(&pipeline, &options).unwrap();

        assert_eq!(compiled.plan.groups().len(), 2);
        assert_eq!(compiled.resolved.node("fetch").unwrap().parameters["day"], "2024-07-04");
        let ArtifactPayload::Local(plan) = compiled.artifact.payload() else {
            panic!("expected local plan");
        };
        assert_eq!(plan.staging_dir, dir.path().join("report-1"));
    }

    #[test]
    fn test_compile_rejects_invalid_pipeline() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());
        let pipeline = PipelineParser::parse_yaml(&PIPELINE.replace("${day}", "${month}")).unwrap();

        let err = engine.compile(&pipeline, &RunOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reference);
        assert!(err.violations().iter().any(|v| v.message.contains("month")));
    }

    #[test]
    fn test_run_id_cannot_leave_staging_root() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());
        let pipeline = PipelineParser::parse_yaml(PIPELINE).unwrap();

        for bad in ["../elsewhere", "a/b", ".."] {
            let err = engine
                .compile(&pipeline, &RunOptions::default().with_run_id(RunId::new(bad)))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Structural, "{}", bad);
        }
    }

    #[test]
    fn test_escaping_output_is_rejected_before_compiling() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());
        let pipeline =
            PipelineParser::parse_yaml(&PIPELINE.replace("outputs: [raw.json]", "outputs: [raw.json, ../../escape.txt]")).unwrap();

        let err = engine
            .compile(&pipeline, &RunOptions::default().with_run_id(RunId::new("report-3")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Structural);
        assert!(err.violations().iter().any(|v| v.path == "nodes[fetch].outputs"));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_generated_run_ids_differ() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());
        let pipeline = PipelineParser::parse_yaml(PIPELINE).unwrap();

        let first = engine.compile(&pipeline, &RunOptions::default()).unwrap();
        let second = engine.compile(&pipeline, &RunOptions::default()).unwrap();
        assert!(first.artifact.run_id().as_str().starts_with("report-"));
        assert_ne!(first.artifact.run_id(), second.artifact.run_id());
    }

    #[test]
    fn test_stage_sources_for_container_runtime() {
        let sources = TempDir::new().unwrap();
        std::fs::write(sources.path().join("fetch.py"), "print('hi')").unwrap();
        std::fs::write(sources.path().join("render.ipynb"), "{}").unwrap();
        std::fs::write(sources.path().join("style.css"), "body {}").unwrap();

        let staging = TempDir::new().unwrap();
        let engine = engine(staging.path());
        let pipeline = PipelineParser::parse_yaml(&PIPELINE.replace("name: report", "name: report\nruntime: kfp")).unwrap();
        let compiled = engine
            .compile(&pipeline, &RunOptions::default().with_run_id(RunId::new("report-2")))
            .unwrap();

        let staged = stage_sources(&compiled.resolved, sources.path()).unwrap();
        assert_eq!(staged.len(), 3);
        let css = staging.path().join("report-2/_sources/style.css");
        assert_eq!(std::fs::read_to_string(css).unwrap(), "body {}");
    }
}
