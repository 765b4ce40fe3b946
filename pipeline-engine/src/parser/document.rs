// Pipeline document parser
// Reads pipeline documents from JSON or YAML, by content or by file extension

use crate::parser::error::{ParseError, ParseErrorKind, ParseResult};
use crate::parser::models::Pipeline;

use std::fs;
use std::path::Path;

/// Document formats accepted for pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    /// Guess the format from a file extension. `.pipeline` files are JSON.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" | "pipeline" => Some(DocumentFormat::Json),
            "yaml" | "yml" => Some(DocumentFormat::Yaml),
            _ => None,
        }
    }
}

/// Pipeline document parser
pub struct PipelineParser;

impl PipelineParser {
    pub fn parse_json(content: &str) -> ParseResult<Pipeline> {
        serde_json::from_str(content).map_err(|e| ParseError::from_json_error(&e, content))
    }

    pub fn parse_yaml(content: &str) -> ParseResult<Pipeline> {
        serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))
    }

    pub fn parse(content: &str, format: DocumentFormat) -> ParseResult<Pipeline> {
        match format {
            DocumentFormat::Json => Self::parse_json(content),
            DocumentFormat::Yaml => Self::parse_yaml(content),
        }
    }

    /// Parse a pipeline file, choosing the format by extension
    pub fn parse_file<P: AsRef<Path>>(path: P) -> ParseResult<Pipeline> {
        let path = path.as_ref();
        let format = DocumentFormat::from_path(path).ok_or_else(|| {
            ParseError::io(format!(
                "unrecognized pipeline document '{}'",
                path.display()
            ))
            .with_suggestion("use a .json, .pipeline, .yaml or .yml file")
        })?;

        let content = fs::read_to_string(path).map_err(|e| {
            ParseError::new(format!("failed to read '{}': {}", path.display(), e), 0, 0)
                .with_kind(ParseErrorKind::Io)
        })?;

        tracing::debug!(path = %path.display(), ?format, "parsing pipeline document");
        Self::parse(&content, format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::{FailurePolicy, FileDependency, NodeKind, RuntimeTarget};
    use std::io::Write;

    #[test]
    fn test_parse_yaml_pipeline() {
        let yaml = r#"
name: etl
runtime: kfp
parameters:
  - name: date
    default: 2024-01-01
  - name: sample
    default: 10
runtimeConfig:
  failurePolicy: best-effort
  objectStorage:
    endpoint: http://minio:9000
    bucket: pipelines
nodes:
  - id: load
    type: notebook
    filename: load.ipynb
    image: python:3.11
    outputs: [data.csv]
    parameters:
      date: ${date}
  - id: train
    type: python-script
    filename: train.py
    runtimeImage: python:3.11
    resources: { cpu: 2, memory: 4, gpu: 1 }
    inputs:
      - { node: load, output: data.csv }
      - { path: utils.py }
    env:
      - SAMPLE=${sample}
edges:
  - { source: load, target: train }
"#;
        let pipeline = PipelineParser::parse_yaml(yaml).unwrap();

        assert_eq!(pipeline.name, "etl");
        assert_eq!(pipeline.runtime, RuntimeTarget::Kfp);
        assert_eq!(pipeline.runtime_config.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(pipeline.parameters[1].default.as_deref(), Some("10"));
        assert_eq!(pipeline.nodes.len(), 2);

        let train = pipeline.node("train").unwrap();
        assert_eq!(train.kind, NodeKind::PythonScript);
        assert_eq!(train.image.as_deref(), Some("python:3.11"));
        assert_eq!(train.resources.gpu, Some(1));
        assert_eq!(train.env["SAMPLE"], "${sample}");
        assert!(matches!(train.inputs[1], FileDependency::Local { .. }));
        assert_eq!(pipeline.edges[0].source, "load");
    }

    #[test]
    fn test_parse_json_pipeline() {
        let json = r#"{
  "name": "demo",
  "nodes": [
    {"id": "a", "type": "r-script", "filename": "a.R"}
  ],
  "edges": []
}"#;
        let pipeline = PipelineParser::parse_json(json).unwrap();
        assert_eq!(pipeline.runtime, RuntimeTarget::Local);
        assert_eq!(pipeline.nodes[0].kind, NodeKind::RScript);
    }

    #[test]
    fn test_parse_json_syntax_error() {
        let json = "{\n  \"name\": \"demo\",\n  \"nodes\": [\n}";
        let err = PipelineParser::parse_json(json).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Syntax);
        assert_eq!(err.line, 4);
    }

    #[test]
    fn test_parse_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "name: flow\nnodes: []").unwrap();

        let pipeline = PipelineParser::parse_file(&path).unwrap();
        assert_eq!(pipeline.name, "flow");

        let bad = dir.path().join("flow.toml");
        fs::write(&bad, "name = 'x'").unwrap();
        let err = PipelineParser::parse_file(&bad).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Io);
    }
}
