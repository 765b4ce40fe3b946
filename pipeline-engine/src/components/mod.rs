// Component metadata
// Provider trait, catalog loading and the built-in generic node types

pub mod catalog;
pub mod spec;

pub use catalog::ComponentCatalog;
pub use spec::{
    normalize_key, parse_component_yaml, CommandArg, ComponentInput, ComponentOutput,
    ComponentSpec, InputKind,
};

use crate::parser::models::NodeKind;

use std::path::PathBuf;
use thiserror::Error;

/// Errors loading component definitions
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid catalog '{path}': {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid definition for component '{id}': {source}")]
    Yaml {
        id: String,
        source: serde_yaml::Error,
    },

    #[error("component '{id}': {message}")]
    InvalidComponent { id: String, message: String },

    #[error("component '{id}': unsupported location type '{kind}', only 'file' is supported")]
    UnsupportedLocation { id: String, kind: String },
}

/// Source of custom component metadata
pub trait ComponentProvider: Send + Sync {
    fn component(&self, id: &str) -> Option<ComponentSpec>;

    fn components(&self) -> Vec<ComponentSpec>;
}

/// Built-in node type executing a file from the pipeline's directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericComponent {
    pub kind: NodeKind,
    pub name: &'static str,
    pub description: &'static str,
    pub extensions: &'static [&'static str],
}

pub fn generic_components() -> Vec<GenericComponent> {
    vec![
        GenericComponent {
            kind: NodeKind::Notebook,
            name: "Notebook",
            description: "Notebook file",
            extensions: &["ipynb"],
        },
        GenericComponent {
            kind: NodeKind::PythonScript,
            name: "Python",
            description: "Python script",
            extensions: &["py"],
        },
        GenericComponent {
            kind: NodeKind::RScript,
            name: "R",
            description: "R script",
            extensions: &["r", "R"],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_components_cover_file_kinds() {
        let generic = generic_components();
        assert_eq!(generic.len(), 3);
        assert!(generic.iter().all(|g| g.kind.is_generic()));
        assert!(generic
            .iter()
            .any(|g| g.kind == NodeKind::Notebook && g.extensions.contains(&"ipynb")));
    }
}
