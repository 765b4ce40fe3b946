// Pipeline document parsing
// Document models and JSON/YAML readers with source-aware errors

pub mod document;
pub mod error;
pub mod models;

pub use document::{DocumentFormat, PipelineParser};
pub use error::{ParseError, ParseErrorKind, ParseResult};
pub use models::*;
