// Container bootstrap
// Shell entrypoint that fetches inputs, runs a node and stages its outputs

use crate::error::{EngineError, EngineResult};
use crate::parser::models::NodeKind;
use crate::processors::local::executed_notebook_name;
use crate::processors::shell_quote;
use crate::template::staging::{env_key, source_path, staged_path};
use crate::template::{ResolvedNode, ResolvedPipeline};

use std::collections::BTreeMap;

/// Working directory inside the container
pub(crate) const WORK_DIR: &str = "/tmp/pipeforge";

const COPY_FN: &str = r#"copy() {
  case "$2" in *://*) ;; *) mkdir -p "$(dirname "$2")" ;; esac
  case "$1$2" in
    *://*) aws ${PIPELINE_S3_ENDPOINT:+--endpoint-url "$PIPELINE_S3_ENDPOINT"} s3 cp "$1" "$2" ;;
    *) cp "$1" "$2" ;;
  esac
}"#;

/// Environment every container node sees
pub(crate) fn container_env(resolved: &ResolvedPipeline, node: &ResolvedNode) -> BTreeMap<String, String> {
    let mut env = node.env.clone();
    env.insert("PIPELINE_RUN_ID".to_string(), resolved.run_id.to_string());
    env.insert("PIPELINE_NODE_ID".to_string(), node.id.clone());
    env.insert("PIPELINE_STAGING_DIR".to_string(), resolved.run_dir());
    if let Some(storage) = &resolved.runtime_config.object_storage {
        env.insert("PIPELINE_S3_ENDPOINT".to_string(), storage.endpoint.clone());
        env.insert("PIPELINE_S3_BUCKET".to_string(), storage.bucket.clone());
    }
    if node.kind != NodeKind::Component {
        for input in &node.inputs {
            env.insert(env_key("PIPELINE_INPUT", &input.name), work_path(&input.name));
        }
        for output in &node.outputs {
            env.insert(env_key("PIPELINE_OUTPUT", &output.name), work_path(&output.name));
        }
    }
    env
}

/// Component nodes write straight to their staged paths unless those are remote
pub(crate) fn needs_wrapping(resolved: &ResolvedPipeline, node: &ResolvedNode) -> bool {
    node.kind == NodeKind::Component
        && is_remote(&resolved.staging_root)
        && (!node.outputs.is_empty() || node.command.iter().any(|a| is_remote(a)))
}

/// `sh -c` script running `node` inside its container
pub(crate) fn script(resolved: &ResolvedPipeline, node: &ResolvedNode) -> EngineResult<String> {
    let mut lines = vec!["set -eu".to_string(), COPY_FN.to_string()];
    lines.push(format!("mkdir -p {} && cd {}", WORK_DIR, WORK_DIR));

    if node.kind == NodeKind::Component {
        let mut command = node.command.clone();
        for (from, name) in source_files(resolved, node) {
            if !is_remote(&from) || !command.contains(&from) {
                continue;
            }
            let local = work_path(&format!("inputs/{}", name));
            lines.push(format!("copy {} {}", shell_quote(&from), shell_quote(&local)));
            for arg in command.iter_mut().filter(|a| **a == from) {
                *arg = local.clone();
            }
        }
        for output in &node.outputs {
            let local = work_path(&format!("outputs/{}", output.name));
            for arg in command.iter_mut().filter(|a| **a == output.path) {
                *arg = local.clone();
            }
            lines.push(format!("mkdir -p \"$(dirname {})\"", shell_quote(&local)));
        }
        lines.push(join(&command));
        for output in &node.outputs {
            let local = work_path(&format!("outputs/{}", output.name));
            lines.push(format!("copy {} {}", shell_quote(&local), shell_quote(&output.path)));
        }
        return Ok(lines.join("\n"));
    }

    for (from, to) in source_files(resolved, node) {
        lines.push(format!("copy {} {}", shell_quote(&from), shell_quote(&to)));
    }
    lines.push(join(&generic_command(node)?));
    for output in &node.outputs {
        lines.push(format!("copy {} {}", shell_quote(&output.name), shell_quote(&output.path)));
    }
    if let (NodeKind::Notebook, Some(filename)) = (node.kind, node.filename.as_deref()) {
        let executed = executed_notebook_name(filename);
        let staged = staged_path(&resolved.staging_root, resolved.run_id.as_str(), &node.id, &executed);
        lines.push(format!("copy {} {}", shell_quote(&executed), shell_quote(&staged)));
    }
    Ok(lines.join("\n"))
}

/// Command a generic node runs inside its container
pub(crate) fn generic_command(node: &ResolvedNode) -> EngineResult<Vec<String>> {
    if node.kind == NodeKind::Component {
        return Ok(node.command.clone());
    }
    let filename = node.filename.as_deref().ok_or_else(|| {
        EngineError::Internal(format!("generic node '{}' has no filename", node.id))
    })?;
    let mut command = match node.kind {
        NodeKind::Notebook => vec![
            "papermill".to_string(),
            filename.to_string(),
            executed_notebook_name(filename),
        ],
        NodeKind::RScript => vec!["Rscript".to_string(), filename.to_string()],
        _ => vec!["python3".to_string(), filename.to_string()],
    };
    for (key, value) in &node.parameters {
        if node.kind == NodeKind::Notebook {
            command.extend(["-p".to_string(), key.clone(), value.clone()]);
        } else {
            command.extend([format!("--{}", key), value.clone()]);
        }
    }
    Ok(command)
}

/// Files fetched into the work dir before a generic node runs, as (from, to)
pub(crate) fn source_files(resolved: &ResolvedPipeline, node: &ResolvedNode) -> Vec<(String, String)> {
    let run_id = resolved.run_id.as_str();
    let mut files = Vec::new();
    if let Some(filename) = &node.filename {
        files.push((source_path(&resolved.staging_root, run_id, filename), filename.clone()));
    }
    for input in &node.inputs {
        let from = match input.producer {
            Some(_) => input.path.clone(),
            None => source_path(&resolved.staging_root, run_id, &input.path),
        };
        files.push((from, input.name.clone()));
    }
    files
}

fn work_path(name: &str) -> String {
    format!("{}/{}", WORK_DIR, name.trim_start_matches("./"))
}

fn is_remote(root: &str) -> bool {
    root.contains("://")
}

fn join(command: &[String]) -> String {
    command.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{parse_component_yaml, ComponentCatalog};
    use crate::execution::plan::ExecutionPlan;
    use crate::execution::state::RunId;
    use crate::graph::PipelineGraph;
    use crate::parser::PipelineParser;
    use crate::template::{ResolveOptions, Resolver};

    fn resolve(source: &str, root: &str) -> ResolvedPipeline {
        let pipeline = PipelineParser::parse_yaml(source).unwrap();
        let catalog = ComponentCatalog::from_specs([parse_component_yaml(
            "split",
            r#"
name: Split
inputs: [{name: Ratio}, {name: Data}]
outputs: [{name: Train}]
implementation:
  container:
    image: python:3.11
    command: [split, --ratio, {inputValue: Ratio}, --data, {inputPath: Data}, --out, {outputPath: Train}]
"#,
        )
        .unwrap()]);
        let graph = PipelineGraph::new(&pipeline);
        let plan = ExecutionPlan::order(&graph).unwrap();
        Resolver::new(&catalog)
            .resolve(&pipeline, &graph, &plan, &ResolveOptions::new(RunId::new("run-1"), root))
            .unwrap()
    }

    const PIPELINE: &str = r#"
name: p
runtime: kfp
nodes:
  - id: explore
    type: notebook
    filename: nb/explore.ipynb
    image: jupyter/base-notebook
    inputs: [{ path: data/raw.csv }]
    outputs: [summary.json]
    parameters: { alpha: "0.5" }
  - id: split
    type: component
    component: split
    inputs: [{ node: explore, output: summary.json }]
    parameters: { ratio: "0.8", data: summary.json }
"#;

    #[test]
    fn test_generic_script() {
        let resolved = resolve(PIPELINE, "/mnt/stage");
        let script = script(&resolved, resolved.node("explore").unwrap()).unwrap();
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "set -eu");
        assert!(script.contains("copy /mnt/stage/run-1/_sources/nb/explore.ipynb nb/explore.ipynb"));
        assert!(script.contains("copy /mnt/stage/run-1/_sources/data/raw.csv data/raw.csv"));
        assert!(script.contains("papermill nb/explore.ipynb explore-output.ipynb -p alpha 0.5"));
        assert!(script.contains("copy summary.json /mnt/stage/run-1/explore/summary.json"));
        assert_eq!(
            lines.last().copied(),
            Some("copy explore-output.ipynb /mnt/stage/run-1/explore/explore-output.ipynb")
        );
    }

    #[test]
    fn test_component_wrapping_for_remote_staging() {
        let local = resolve(PIPELINE, "/mnt/stage");
        assert!(!needs_wrapping(&local, local.node("split").unwrap()));

        let remote = resolve(PIPELINE, "s3://bucket/runs");
        let split = remote.node("split").unwrap();
        assert!(needs_wrapping(&remote, split));

        let script = script(&remote, split).unwrap();
        assert!(script.contains(
            "copy s3://bucket/runs/run-1/explore/summary.json /tmp/pipeforge/inputs/summary.json"
        ));
        assert!(script.contains(
            "split --ratio 0.8 --data /tmp/pipeforge/inputs/summary.json --out /tmp/pipeforge/outputs/train"
        ));
        assert!(script.contains("copy /tmp/pipeforge/outputs/train s3://bucket/runs/run-1/split/train"));
    }

    #[test]
    fn test_container_env() {
        let resolved = resolve(PIPELINE, "/mnt/stage");
        let env = container_env(&resolved, resolved.node("explore").unwrap());
        assert_eq!(env["PIPELINE_RUN_ID"], "run-1");
        assert_eq!(env["PIPELINE_STAGING_DIR"], "/mnt/stage/run-1");
        assert_eq!(env["PIPELINE_INPUT_DATA_RAW_CSV"], "/tmp/pipeforge/data/raw.csv");
        assert_eq!(env["PIPELINE_OUTPUT_SUMMARY_JSON"], "/tmp/pipeforge/summary.json");
    }
}
