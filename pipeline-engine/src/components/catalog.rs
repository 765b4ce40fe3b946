// Component catalog
// File-backed component provider loaded once from a JSON catalog

use crate::components::spec::{parse_component_yaml, ComponentSpec};
use crate::components::{CatalogError, ComponentProvider};

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Deserialize)]
struct RawCatalog {
    #[serde(default)]
    components: BTreeMap<String, RawEntry>,
}

#[derive(Deserialize)]
struct RawEntry {
    name: Option<String>,
    location: BTreeMap<String, String>,
}

/// In-memory catalog of component definitions
#[derive(Debug, Clone, Default)]
pub struct ComponentCatalog {
    components: BTreeMap<String, ComponentSpec>,
}

impl ComponentCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: impl IntoIterator<Item = ComponentSpec>) -> Self {
        Self {
            components: specs.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    /// Load a catalog file and every component definition it lists.
    ///
    /// File locations are relative to the catalog's directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = read(path)?;
        let raw: RawCatalog = serde_json::from_str(&content).map_err(|e| CatalogError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut components = BTreeMap::new();
        for (id, entry) in raw.components {
            let location = resolve_location(&id, &entry.location, base)?;
            let definition = read(&location)?;
            let mut spec = parse_component_yaml(&id, &definition)?;
            if let Some(name) = entry.name.filter(|n| !n.is_empty()) {
                spec.name = name;
            }
            tracing::debug!(component = %id, location = %location.display(), "loaded component");
            components.insert(id, spec);
        }

        tracing::info!(count = components.len(), catalog = %path.display(), "component catalog loaded");
        Ok(Self { components })
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl ComponentProvider for ComponentCatalog {
    fn component(&self, id: &str) -> Option<ComponentSpec> {
        self.components.get(id).cloned()
    }

    fn components(&self) -> Vec<ComponentSpec> {
        self.components.values().cloned().collect()
    }
}

fn read(path: &Path) -> Result<String, CatalogError> {
    fs::read_to_string(path).map_err(|e| CatalogError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

fn resolve_location(
    id: &str,
    location: &BTreeMap<String, String>,
    base: &Path,
) -> Result<PathBuf, CatalogError> {
    match location.iter().next() {
        Some((kind, value)) if kind == "file" && location.len() == 1 => {
            let path = Path::new(value);
            Ok(if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            })
        }
        Some((kind, _)) => Err(CatalogError::UnsupportedLocation {
            id: id.to_string(),
            kind: kind.clone(),
        }),
        None => Err(CatalogError::InvalidComponent {
            id: id.to_string(),
            message: "catalog entry has no location".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO: &str = r#"
name: Echo
inputs:
- {name: Message, optional: false}
implementation:
  container:
    image: alpine:3.19
    command: [echo, {inputValue: Message}]
"#;

    #[test]
    fn test_load_catalog() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("defs")).unwrap();
        fs::write(dir.path().join("defs/echo.yaml"), ECHO).unwrap();
        let catalog_path = dir.path().join("catalog.json");
        fs::write(
            &catalog_path,
            r#"{"components": {"echo": {"name": "Say Hello", "location": {"file": "defs/echo.yaml"}}}}"#,
        )
        .unwrap();

        let catalog = ComponentCatalog::load(&catalog_path).unwrap();
        assert_eq!(catalog.len(), 1);

        let echo = catalog.component("echo").unwrap();
        assert_eq!(echo.name, "Say Hello");
        assert_eq!(echo.image, "alpine:3.19");
        assert!(catalog.component("missing").is_none());
    }

    #[test]
    fn test_url_location_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let catalog_path = dir.path().join("catalog.json");
        fs::write(
            &catalog_path,
            r#"{"components": {"remote": {"location": {"url": "https://example.com/c.yaml"}}}}"#,
        )
        .unwrap();

        let err = ComponentCatalog::load(&catalog_path).unwrap_err();
        assert!(matches!(err, CatalogError::UnsupportedLocation { ref kind, .. } if kind == "url"));
    }

    #[test]
    fn test_missing_definition_file() {
        let dir = tempfile::tempdir().unwrap();
        let catalog_path = dir.path().join("catalog.json");
        fs::write(
            &catalog_path,
            r#"{"components": {"gone": {"location": {"file": "gone.yaml"}}}}"#,
        )
        .unwrap();

        let err = ComponentCatalog::load(&catalog_path).unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
    }
}
