// Component specifications
// Parses container component definitions (KFP component YAML)

use crate::components::CatalogError;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// A custom component as described by its definition file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentSpec {
    /// Catalog id
    pub id: String,
    pub name: String,
    pub description: String,
    /// Container image the component runs in
    pub image: String,
    pub inputs: Vec<ComponentInput>,
    pub outputs: Vec<ComponentOutput>,
    /// Container command followed by its args
    pub command: Vec<CommandArg>,
}

impl ComponentSpec {
    pub fn input(&self, key: &str) -> Option<&ComponentInput> {
        self.inputs.iter().find(|i| i.key == key)
    }

    pub fn output(&self, key: &str) -> Option<&ComponentOutput> {
        self.outputs.iter().find(|o| o.key == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// Passed to the command as a literal value
    Value,
    /// Passed to the command as the path of a file holding the value
    Path,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentInput {
    /// Name as written in the definition
    pub name: String,
    /// Parameter key used by nodes: lowercase, spaces replaced by `_`
    pub key: String,
    pub kind: InputKind,
    pub type_name: String,
    pub default: Option<String>,
    pub description: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentOutput {
    pub name: String,
    pub key: String,
    pub description: String,
}

/// One element of a component command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CommandArg {
    Literal(String),
    /// Replaced by the value of the input
    InputValue(String),
    /// Replaced by a path to a file containing the input
    InputPath(String),
    /// Replaced by the path the output must be written to
    OutputPath(String),
}

/// Parameter key for an input or output name
pub fn normalize_key(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

#[derive(Deserialize)]
struct RawComponent {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    inputs: Vec<RawIo>,
    #[serde(default)]
    outputs: Vec<RawIo>,
    implementation: Option<RawImplementation>,
}

#[derive(Deserialize)]
struct RawIo {
    name: String,
    #[serde(rename = "type")]
    type_name: Option<Value>,
    optional: Option<bool>,
    default: Option<Value>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct RawImplementation {
    container: Option<RawContainer>,
}

#[derive(Deserialize)]
struct RawContainer {
    image: Option<String>,
    #[serde(default)]
    command: Vec<Value>,
    #[serde(default)]
    args: Vec<Value>,
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a component definition
pub fn parse_component_yaml(id: &str, source: &str) -> Result<ComponentSpec, CatalogError> {
    let raw: RawComponent = serde_yaml::from_str(source).map_err(|e| CatalogError::Yaml {
        id: id.to_string(),
        source: e,
    })?;
    let invalid = |message: String| CatalogError::InvalidComponent {
        id: id.to_string(),
        message,
    };

    let container = raw
        .implementation
        .and_then(|i| i.container)
        .ok_or_else(|| invalid("missing implementation.container".to_string()))?;

    let image = container
        .image
        .filter(|i| !i.trim().is_empty())
        .ok_or_else(|| invalid("error accessing runtime image".to_string()))?;

    let mut command = Vec::with_capacity(container.command.len() + container.args.len());
    for value in container.command.iter().chain(container.args.iter()) {
        command.push(parse_arg(value).map_err(&invalid)?);
    }

    let inputs = raw
        .inputs
        .into_iter()
        .map(|io| {
            let key = normalize_key(&io.name);
            let kind = if command
                .iter()
                .any(|arg| matches!(arg, CommandArg::InputPath(k) if *k == key))
            {
                InputKind::Path
            } else {
                InputKind::Value
            };
            ComponentInput {
                type_name: io
                    .type_name
                    .as_ref()
                    .and_then(scalar_to_string)
                    .unwrap_or_else(|| "String".to_string()),
                default: io.default.as_ref().and_then(scalar_to_string),
                description: io.description.as_deref().map(collapse_whitespace).unwrap_or_default(),
                required: io.optional == Some(false),
                name: io.name,
                key,
                kind,
            }
        })
        .collect();

    let outputs = raw
        .outputs
        .into_iter()
        .map(|io| ComponentOutput {
            key: normalize_key(&io.name),
            description: io.description.as_deref().map(collapse_whitespace).unwrap_or_default(),
            name: io.name,
        })
        .collect();

    Ok(ComponentSpec {
        id: id.to_string(),
        name: raw.name.unwrap_or_else(|| id.to_string()),
        description: raw.description.as_deref().map(collapse_whitespace).unwrap_or_default(),
        image,
        inputs,
        outputs,
        command,
    })
}

fn parse_arg(value: &Value) -> Result<CommandArg, String> {
    if let Some(literal) = scalar_to_string(value) {
        return Ok(CommandArg::Literal(literal));
    }

    let mapping = value
        .as_mapping()
        .filter(|m| m.len() == 1)
        .ok_or_else(|| format!("unsupported command element: {:?}", value))?;

    let (placeholder, name) = mapping
        .iter()
        .next()
        .and_then(|(k, v)| Some((k.as_str()?, v.as_str()?)))
        .ok_or_else(|| format!("unsupported command element: {:?}", value))?;

    let key = normalize_key(name);
    match placeholder {
        "inputValue" => Ok(CommandArg::InputValue(key)),
        "inputPath" => Ok(CommandArg::InputPath(key)),
        "outputPath" => Ok(CommandArg::OutputPath(key)),
        other => Err(format!("unsupported command placeholder '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOWNLOAD: &str = r#"
name: Download Data
description: |
  Downloads a file
  from a URL.
inputs:
- {name: Url, type: String, optional: false, description: Source URL}
- {name: Retry Count, type: Integer, default: 3}
- {name: Headers File, type: String}
outputs:
- {name: Data}
implementation:
  container:
    image: curlimages/curl:8.5.0
    command: [sh, -c, 'curl -sf "$0" -H @"$2" -o "$1"']
    args:
    - {inputValue: Url}
    - {outputPath: Data}
    - {inputPath: Headers File}
"#;

    #[test]
    fn test_parse_component() {
        let spec = parse_component_yaml("download", DOWNLOAD).unwrap();

        assert_eq!(spec.name, "Download Data");
        assert_eq!(spec.description, "Downloads a file from a URL.");
        assert_eq!(spec.image, "curlimages/curl:8.5.0");
        assert_eq!(spec.inputs.len(), 3);

        let url = spec.input("url").unwrap();
        assert!(url.required);
        assert_eq!(url.kind, InputKind::Value);

        let retry = spec.input("retry_count").unwrap();
        assert!(!retry.required);
        assert_eq!(retry.default.as_deref(), Some("3"));
        assert_eq!(retry.type_name, "Integer");

        assert_eq!(spec.input("headers_file").unwrap().kind, InputKind::Path);
        assert_eq!(spec.output("data").unwrap().name, "Data");
        assert_eq!(
            spec.command[3..],
            [
                CommandArg::InputValue("url".to_string()),
                CommandArg::OutputPath("data".to_string()),
                CommandArg::InputPath("headers_file".to_string()),
            ]
        );
    }

    #[test]
    fn test_missing_image_is_rejected() {
        let source = "name: x\nimplementation:\n  container:\n    command: [echo]\n";
        let err = parse_component_yaml("x", source).unwrap_err();
        assert!(err.to_string().contains("runtime image"));
    }

    #[test]
    fn test_unsupported_placeholder() {
        let source = r#"
name: x
implementation:
  container:
    image: alpine
    command: [{concat: [a, b]}]
"#;
        let err = parse_component_yaml("x", source).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidComponent { .. }));
    }
}
