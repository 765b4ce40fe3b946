// Local Processor
// Compiles resolved pipelines into process invocations on the local host

use crate::config::LocalConfig;
use crate::error::{EngineError, EngineResult, Violation};
use crate::execution::plan::ExecutionPlan;
use crate::parser::models::{FailurePolicy, NodeKind, RetryPolicy};
use crate::processors::artifact::{ArtifactHeader, ArtifactPayload, ExecutionArtifact};
use crate::processors::Capabilities;
use crate::template::staging::env_key;
use crate::template::{ResolvedNode, ResolvedPipeline};

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A file copied before or after a task runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCopy {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// One node as a local process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalTask {
    pub node_id: String,
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Scratch directory the process runs in
    pub work_dir: PathBuf,
    /// Copied into `work_dir` before the process starts
    pub inputs: Vec<FileCopy>,
    /// Copied out of `work_dir` after the process succeeds
    pub outputs: Vec<FileCopy>,
    pub retry: Option<RetryPolicy>,
    pub upstream: Vec<String>,
}

impl LocalTask {
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, |r| r.max_attempts.max(1))
    }

    /// Command line for display
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Ordered groups of local tasks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalPlan {
    pub run_id: String,
    pub failure_policy: FailurePolicy,
    /// `<staging root>/<run-id>`
    pub staging_dir: PathBuf,
    /// Directory node filenames and local inputs are relative to
    pub source_dir: PathBuf,
    pub groups: Vec<Vec<LocalTask>>,
}

impl LocalPlan {
    pub fn task(&self, node_id: &str) -> Option<&LocalTask> {
        self.groups.iter().flatten().find(|t| t.node_id == node_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &LocalTask> {
        self.groups.iter().flatten()
    }
}

#[derive(Debug, Clone)]
pub struct LocalProcessor {
    config: LocalConfig,
}

impl LocalProcessor {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    pub fn capabilities() -> Capabilities {
        Capabilities {
            runtime: crate::parser::models::RuntimeTarget::Local,
            gpu: false,
            components: false,
            requires_image: false,
            retries: true,
        }
    }

    pub fn process(&self, resolved: &ResolvedPipeline, plan: &ExecutionPlan) -> EngineResult<ExecutionArtifact> {
        if resolved.staging_root.contains("://") {
            return Err(EngineError::Invalid(vec![Violation::capability(
                format!(
                    "the local runtime stages files on disk and cannot use '{}'",
                    resolved.staging_root
                ),
                "runtimeConfig.objectStorage",
            )]));
        }

        let staging_dir = PathBuf::from(resolved.run_dir());
        let source_dir = match &self.config.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        let mut groups = Vec::with_capacity(plan.len());
        for group in plan.groups() {
            let mut tasks = Vec::with_capacity(group.len());
            for id in group {
                let node = resolved.node(id).ok_or_else(|| {
                    EngineError::Internal(format!("planned node '{}' was not resolved", id))
                })?;
                tasks.push(self.task(resolved, node, &staging_dir, &source_dir)?);
            }
            groups.push(tasks);
        }

        let header = ArtifactHeader::build(resolved, plan, |id| id.to_string())?;
        tracing::debug!(run_id = %resolved.run_id, tasks = header.nodes.len(), "compiled local plan");

        Ok(ExecutionArtifact::new(
            header,
            ArtifactPayload::Local(LocalPlan {
                run_id: resolved.run_id.to_string(),
                failure_policy: resolved.runtime_config.failure_policy,
                staging_dir,
                source_dir,
                groups,
            }),
        ))
    }

    fn task(
        &self,
        resolved: &ResolvedPipeline,
        node: &ResolvedNode,
        staging_dir: &Path,
        source_dir: &Path,
    ) -> EngineResult<LocalTask> {
        let filename = node.filename.as_deref().ok_or_else(|| {
            EngineError::Invalid(vec![Violation::structural(
                format!("{} node requires a filename", node.kind),
                format!("nodes[{}].filename", node.id),
            )])
        })?;
        let script = source_dir.join(filename);
        let work_dir = staging_dir.join(".work").join(&node.id);

        let (program, mut args) = match node.kind {
            NodeKind::Notebook => {
                let (runner, leading) = self.config.notebook.split_first().ok_or_else(|| {
                    EngineError::Internal("no notebook runner configured".to_string())
                })?;
                let mut args = leading.to_vec();
                args.push(script.display().to_string());
                args.push(work_dir.join(executed_notebook_name(filename)).display().to_string());
                for (key, value) in &node.parameters {
                    args.extend(["-p".to_string(), key.clone(), value.clone()]);
                }
                (runner.clone(), args)
            }
            NodeKind::PythonScript => (self.config.python.clone(), vec![script.display().to_string()]),
            NodeKind::RScript => (self.config.r.clone(), vec![script.display().to_string()]),
            NodeKind::Component => {
                return Err(EngineError::Invalid(vec![Violation::capability(
                    "the local runtime does not run custom components",
                    format!("nodes[{}].type", node.id),
                )]));
            }
        };
        if node.kind != NodeKind::Notebook {
            for (key, value) in &node.parameters {
                args.push(format!("--{}", key));
                args.push(value.clone());
            }
        }

        let mut env = node.env.clone();
        env.insert("PIPELINE_RUN_ID".to_string(), resolved.run_id.to_string());
        env.insert("PIPELINE_NODE_ID".to_string(), node.id.clone());
        env.insert(
            "PIPELINE_STAGING_DIR".to_string(),
            staging_dir.display().to_string(),
        );

        let inputs = node
            .inputs
            .iter()
            .map(|input| {
                let from = match input.producer {
                    Some(_) => PathBuf::from(&input.path),
                    None => source_dir.join(&input.path),
                };
                env.insert(
                    env_key("PIPELINE_INPUT", &input.name),
                    work_dir.join(&input.name).display().to_string(),
                );
                FileCopy {
                    from,
                    to: work_dir.join(&input.name),
                }
            })
            .collect();

        let outputs = node
            .outputs
            .iter()
            .map(|output| {
                env.insert(
                    env_key("PIPELINE_OUTPUT", &output.name),
                    work_dir.join(&output.name).display().to_string(),
                );
                FileCopy {
                    from: work_dir.join(&output.name),
                    to: PathBuf::from(&output.path),
                }
            })
            .collect();

        Ok(LocalTask {
            node_id: node.id.clone(),
            name: node.name.clone(),
            program,
            args,
            env,
            work_dir,
            inputs,
            outputs,
            retry: node.retry.clone(),
            upstream: node.upstream.clone(),
        })
    }
}

/// `analysis/load.ipynb` -> `load-output.ipynb`
pub fn executed_notebook_name(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("notebook");
    format!("{}-output.ipynb", stem)
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
name: local-demo
parameters:
  - name: rows
    default: 50
nodes:
  - id: prep
    type: python-script
    filename: scripts/prep.py
    outputs: [clean.csv]
    parameters: { rows: "${rows}" }
    env: { MODE: fast }
  - id: report
    type: notebook
    filename: report.ipynb
    inputs: [{ node: prep, output: clean.csv }, { path: style.css }]
    parameters: { title: Weekly }
  - id: plot
    type: r-script
    filename: plot.R
    inputs: [{ node: prep, output: clean.csv }]
    retry: { maxAttempts: 3, backoffSecs: 1 }
edges:
  - { source: prep, target: report }
  - { source: prep, target: plot }
"#;

    fn compile(config: LocalConfig) -> EngineResult<ExecutionArtifact> {
        let pipeline = PipelineParser::parse_yaml(PIPELINE).unwrap();
        let graph = PipelineGraph::new(&pipeline);
        let plan = ExecutionPlan::order(&graph).unwrap();
        let catalog = ComponentCatalog::empty();
        let options = ResolveOptions::new(RunId::new("local-demo-1"), "/tmp/stage");
        let resolved = Resolver::new(&catalog)
            .resolve(&pipeline, &graph, &plan, &options)
            .unwrap();
        LocalProcessor::new(config).process(&resolved, &plan)
    }

    fn config() -> LocalConfig {
        LocalConfig {
            working_dir: Some(PathBuf::from("/work/project")),
            ..Default::default()
        }
    }

    #[test]
    fn test_local_plan_layout() {
        let artifact = compile(config()).unwrap();
        let ArtifactPayload::Local(plan) = artifact.payload() else {
            panic!("expected a local plan");
        };

        assert_eq!(plan.staging_dir, PathBuf::from("/tmp/stage/local-demo-1"));
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups[1].len(), 2);

        let prep = plan.task("prep").unwrap();
        assert_eq!(prep.program, "python3");
        assert_eq!(prep.args, vec!["/work/project/scripts/prep.py", "--rows", "50"]);
        assert_eq!(prep.env["MODE"], "fast");
        assert_eq!(prep.env["PIPELINE_RUN_ID"], "local-demo-1");
        assert_eq!(
            prep.outputs[0],
            FileCopy {
                from: PathBuf::from("/tmp/stage/local-demo-1/.work/prep/clean.csv"),
                to: PathBuf::from("/tmp/stage/local-demo-1/prep/clean.csv"),
            }
        );

        let report = plan.task("report").unwrap();
        assert_eq!(report.program, "papermill");
        assert_eq!(
            report.args,
            vec![
                "/work/project/report.ipynb",
                "/tmp/stage/local-demo-1/.work/report/report-output.ipynb",
                "-p",
                "title",
                "Weekly",
            ]
        );
        assert_eq!(report.inputs[0].from, PathBuf::from("/tmp/stage/local-demo-1/prep/clean.csv"));
        assert_eq!(report.inputs[1].from, PathBuf::from("/work/project/style.css"));
        assert_eq!(
            report.env["PIPELINE_INPUT_CLEAN_CSV"],
            "/tmp/stage/local-demo-1/.work/report/clean.csv"
        );

        let plot = plan.task("plot").unwrap();
        assert_eq!(plot.program, "Rscript");
        assert_eq!(plot.max_attempts(), 3);
    }

    #[test]
    fn test_render_and_header() {
        let artifact = compile(config()).unwrap();
        assert_eq!(artifact.file_name(), "local-demo-1.plan.json");
        assert_eq!(artifact.header().nodes[0].id, "prep");
        assert_eq!(artifact.header().node("plot").unwrap().max_attempts, 3);

        let rendered = artifact.render().unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["groups"][0][0]["program"], "python3");
        assert_eq!(value["failure_policy"], "halt-downstream");
    }

    #[test]
    fn test_configured_interpreters() {
        let artifact = compile(LocalConfig {
            python: "/opt/py/bin/python".to_string(),
            notebook: vec!["jupyter".to_string(), "execute".to_string()],
            ..config()
        })
        .unwrap();
        let ArtifactPayload::Local(plan) = artifact.payload() else {
            panic!("expected a local plan");
        };
        assert_eq!(plan.task("prep").unwrap().program, "/opt/py/bin/python");
        let report = plan.task("report").unwrap();
        assert_eq!(report.program, "jupyter");
        assert_eq!(report.args[0], "execute");
    }

    #[test]
    fn test_executed_notebook_name() {
        assert_eq!(executed_notebook_name("a/b/train.ipynb"), "train-output.ipynb");
    }
}
