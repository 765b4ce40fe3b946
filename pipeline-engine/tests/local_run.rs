// End-to-end run of a pipeline document through the local backend

use pipeline_engine::{
    event_stream, progress_channel, ComponentCatalog, EngineConfig, ExecutionEvent, MonitorOptions,
    NodeState, PipelineEngine, PipelineParser, RunId, RunOptions, RunState,
};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const PIPELINE: &str = r#"{
  "name": "Word Count",
  "runtime": "local",
  "runtimeConfig": { "failurePolicy": "halt-downstream" },
  "parameters": [{ "name": "word", "default": "pipeline" }],
  "nodes": [
    { "id": "generate", "type": "python-script", "filename": "generate.py",
      "outputs": ["words.txt"], "parameters": { "word": "${word}" } },
    { "id": "count", "type": "python-script", "filename": "count.py",
      "inputs": [{ "node": "generate", "output": "words.txt" }], "outputs": ["count.txt"] },
    { "id": "upper", "type": "python-script", "filename": "upper.py",
      "inputs": [{ "node": "generate", "output": "words.txt" }] },
    { "id": "report", "type": "python-script", "filename": "report.py",
      "inputs": [{ "node": "count", "output": "count.txt" }] }
  ],
  "edges": [
    { "source": "generate", "target": "count" },
    { "source": "generate", "target": "upper" },
    { "source": "count", "target": "report" },
    { "source": "upper", "target": "report" }
  ]
}"#;

fn write(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).unwrap();
}

fn engine(workspace: &TempDir) -> PipelineEngine {
    let mut config = EngineConfig::default();
    // scripts are plain shell; `--word value` arrives as $1 $2
    config.local.python = "sh".to_string();
    config.local.working_dir = Some(workspace.path().to_path_buf());
    config.local.staging_dir = workspace.path().join("staging");
    PipelineEngine::new(config, Arc::new(ComponentCatalog::empty()))
}

#[tokio::test]
async fn test_local_run_end_to_end() {
    let workspace = TempDir::new().unwrap();
    let dir = workspace.path();
    write(dir, "generate.py", "for i in 1 2 3; do echo \"$2\"; done > words.txt\n");
    write(dir, "count.py", "wc -l < words.txt | tr -d ' ' > count.txt\n");
    write(dir, "upper.py", "tr a-z A-Z < words.txt\n");
    write(dir, "report.py", "test \"$(cat count.txt)\" = 3\n");

    let engine = engine(&workspace);
    let pipeline = PipelineParser::parse_json(PIPELINE).unwrap();
    assert!(engine.validate(&pipeline).is_valid());

    let options = RunOptions::default()
        .with_run_id(RunId::new("word-count-1"))
        .with_override("word", "rust");
    let compiled = engine.compile(&pipeline, &options).unwrap();

    let (tx, rx) = progress_channel();
    let dispatcher = engine.dispatcher().with_progress(tx);
    let run_id = dispatcher.submit(&compiled.artifact).await.unwrap();

    let snapshot = tokio::time::timeout(
        Duration::from_secs(30),
        dispatcher.monitor(&run_id, MonitorOptions::new(Duration::from_millis(50)), CancellationToken::new()),
    )
    .await
    .expect("run did not finish in time")
    .unwrap();

    assert_eq!(snapshot.state, RunState::Succeeded, "{:?}", snapshot);
    assert_eq!(snapshot.count(NodeState::Succeeded), 4);

    let words = std::fs::read_to_string(dir.join("staging/word-count-1/generate/words.txt")).unwrap();
    assert_eq!(words, "rust\nrust\nrust\n");
    let count = std::fs::read_to_string(dir.join("staging/word-count-1/count/count.txt")).unwrap();
    assert_eq!(count.trim(), "3");

    drop(dispatcher);
    let events: Vec<ExecutionEvent> = event_stream(rx).collect().await;
    assert!(matches!(events.first(), Some(ExecutionEvent::RunSubmitted { total_nodes: 4, .. })));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn test_local_run_failure_skips_downstream() {
    let workspace = TempDir::new().unwrap();
    let dir = workspace.path();
    write(dir, "generate.py", "echo word > words.txt\n");
    write(dir, "count.py", "exit 2\n");
    write(dir, "upper.py", "true\n");
    write(dir, "report.py", "true\n");

    let engine = engine(&workspace);
    let pipeline = PipelineParser::parse_json(PIPELINE).unwrap();
    let compiled = engine
        .compile(&pipeline, &RunOptions::default().with_run_id(RunId::new("word-count-2")))
        .unwrap();

    let dispatcher = engine.dispatcher();
    let run_id = dispatcher.submit(&compiled.artifact).await.unwrap();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(30),
        dispatcher.monitor(&run_id, MonitorOptions::new(Duration::from_millis(50)), CancellationToken::new()),
    )
    .await
    .expect("run did not finish in time")
    .unwrap();

    assert_eq!(snapshot.state, RunState::Failed);
    assert_eq!(snapshot.node("generate").unwrap().state, NodeState::Succeeded);
    assert_eq!(snapshot.node("count").unwrap().state, NodeState::Failed);
    assert_eq!(snapshot.node("upper").unwrap().state, NodeState::Succeeded);
    assert_eq!(snapshot.node("report").unwrap().state, NodeState::Skipped);
    assert!(snapshot.error.unwrap().message.contains("count"));
}

#[tokio::test]
async fn test_cyclic_pipeline_is_rejected_before_running() {
    let workspace = TempDir::new().unwrap();
    let engine = engine(&workspace);
    let cyclic = PIPELINE.replace(
        r#"{ "source": "upper", "target": "report" }"#,
        r#"{ "source": "upper", "target": "report" }, { "source": "report", "target": "generate" }"#,
    );
    let pipeline = PipelineParser::parse_json(&cyclic).unwrap();

    let result = engine.validate(&pipeline);
    assert!(!result.is_valid());
    assert!(result
        .errors()
        .any(|v| v.message.starts_with("circular dependency detected")));
    assert!(engine.compile(&pipeline, &RunOptions::default()).is_err());
}
