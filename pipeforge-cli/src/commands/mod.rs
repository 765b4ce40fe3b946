pub mod compile;
pub mod components;
pub mod run;
pub mod validate;

use crate::output;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;

use pipeline_engine::{
    ComponentCatalog, EngineConfig, EngineError, Pipeline, PipelineEngine, PipelineParser, RuntimeTarget,
};

/// Settings shared by every command
pub struct Context {
    pub config: EngineConfig,
    pub catalog: Arc<ComponentCatalog>,
}

impl Context {
    pub fn load(config: Option<&Path>, catalog: Option<&Path>) -> Result<Self> {
        let config = match config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::load_default()?,
        };
        let catalog = match catalog {
            Some(path) => ComponentCatalog::load(path)?,
            None => ComponentCatalog::empty(),
        };
        Ok(Self {
            config,
            catalog: Arc::new(catalog),
        })
    }

    /// Engine whose local working directory defaults to the pipeline's directory
    pub fn engine_for(&self, pipeline_path: &Path) -> PipelineEngine {
        let mut config = self.config.clone();
        if config.local.working_dir.is_none() {
            config.local.working_dir = Some(pipeline_dir(pipeline_path));
        }
        PipelineEngine::new(config, self.catalog.clone())
    }
}

/// Directory node filenames are relative to
pub fn pipeline_dir(pipeline_path: &Path) -> PathBuf {
    match pipeline_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Parse a pipeline document, optionally retargeting it to another runtime
pub fn load_pipeline(path: &Path, runtime: Option<RuntimeTarget>) -> Result<Pipeline> {
    if !path.exists() {
        bail!("Pipeline file not found: {}", path.display());
    }

    let mut pipeline = match PipelineParser::parse_file(path) {
        Ok(p) => p,
        Err(e) => {
            eprint!("{}", e);
            std::process::exit(1);
        }
    };
    if let Some(runtime) = runtime {
        pipeline.runtime = runtime;
    }
    Ok(pipeline)
}

/// `--param name=value` flags
pub fn parse_params(params: &[String]) -> Result<BTreeMap<String, String>> {
    let mut overrides = BTreeMap::new();
    for param in params {
        let Some((name, value)) = param.split_once('=') else {
            bail!("Invalid parameter format '{}'. Expected name=value", param);
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("Invalid parameter format '{}'. Expected name=value", param);
        }
        overrides.insert(name.to_string(), value.to_string());
    }
    Ok(overrides)
}

/// Print an engine error, listing violations one per line, and exit
pub fn report_engine_error(error: EngineError) -> color_eyre::Report {
    if error.violations().is_empty() {
        return eyre!(error);
    }
    output::violations(error.violations());
    std::process::exit(1);
}
