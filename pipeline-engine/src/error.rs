// Engine errors
// Error kinds, batched violations and the crate-wide result type

use crate::components::CatalogError;
use crate::parser::ParseError;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification shared by violations, run errors and engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed graph: cycles, dangling edges, duplicate ids, bad property ranges
    Structural,
    /// A name that does not resolve: parameters, components, upstream outputs
    Reference,
    /// The selected runtime cannot express something the pipeline needs
    Capability,
    /// The backend refused or failed to accept the run
    Submission,
    /// A node or the backend failed while running
    Execution,
    Timeout,
    Cancellation,
    /// Broken engine invariant
    Internal,
    /// Unreadable or malformed input document
    Document,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Structural => "structural",
            ErrorKind::Reference => "reference",
            ErrorKind::Capability => "capability",
            ErrorKind::Submission => "submission",
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancellation => "cancellation",
            ErrorKind::Internal => "internal",
            ErrorKind::Document => "document",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A single problem found while validating or resolving a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    /// Location in the document, e.g. `nodes[train].env.DATA`
    pub path: String,
    pub suggestion: Option<String>,
}

impl Violation {
    pub fn new(kind: ErrorKind, message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Error,
            message: message.into(),
            path: path.into(),
            suggestion: None,
        }
    }

    pub fn structural(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(ErrorKind::Structural, message, path)
    }

    pub fn reference(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(ErrorKind::Reference, message, path)
    }

    pub fn capability(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(ErrorKind::Capability, message, path)
    }

    pub fn warning(mut self) -> Self {
        self.severity = Severity::Warning;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{} {} at '{}': {}", self.kind, label, self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("pipeline is invalid: {}", summarize(.0))]
    Invalid(Vec<Violation>),

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("run timed out after {0:?}")]
    Timeout(Duration),

    #[error("run was cancelled")]
    Cancelled,

    #[error("unknown run '{0}'")]
    UnknownRun(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Invalid(violations) => violations
                .iter()
                .find(|v| v.is_error())
                .map(|v| v.kind)
                .unwrap_or(ErrorKind::Structural),
            EngineError::Submission(_) => ErrorKind::Submission,
            EngineError::Execution(_) => ErrorKind::Execution,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Cancelled => ErrorKind::Cancellation,
            EngineError::UnknownRun(_) => ErrorKind::Reference,
            EngineError::Internal(_) => ErrorKind::Internal,
            EngineError::Parse(_) | EngineError::Catalog(_) | EngineError::Io(_) => {
                ErrorKind::Document
            }
        }
    }

    /// Violations carried by an `Invalid` error
    pub fn violations(&self) -> &[Violation] {
        match self {
            EngineError::Invalid(violations) => violations,
            _ => &[],
        }
    }
}

fn summarize(violations: &[Violation]) -> String {
    match violations {
        [] => "no details".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{} (and {} more)", first, rest.len()),
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
