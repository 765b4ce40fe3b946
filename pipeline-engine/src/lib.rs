// Pipeline Engine Library
// Validation, compilation and execution of data-science pipelines

pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod graph;
pub mod parser;
pub mod processors;
pub mod template;
pub mod validator;

// Re-export commonly used types
pub use config::{AirflowConfig, ArgoConfig, ConfigError, EngineConfig, LocalConfig, MonitorConfig};
pub use engine::{stage_sources, CompiledRun, PipelineEngine, RunOptions};
pub use error::{EngineError, EngineResult, ErrorKind, Severity, Violation};
pub use graph::PipelineGraph;
pub use validator::{PipelineValidator, ValidationResult};

// Re-export parser types
pub use parser::{
    DocumentFormat, Edge, FailurePolicy, FileDependency, Node, NodeKind, ParseError, ParseErrorKind,
    ParseResult, Pipeline, PipelineParser, RuntimeTarget,
};

// Re-export component types
pub use components::{generic_components, CatalogError, ComponentCatalog, ComponentProvider, ComponentSpec};

// Re-export execution types
pub use execution::{
    event_stream, progress_channel, Dispatcher, EventSender, ExecutionBackend, ExecutionEvent, ExecutionPlan,
    MonitorOptions, NodeState, ProgressReceiver, ProgressSender, RunId, RunSnapshot, RunState,
};

// Re-export processor types
pub use processors::{Capabilities, ExecutionArtifact, RuntimeProcessor};
pub use template::{ResolvedNode, ResolvedPipeline};
