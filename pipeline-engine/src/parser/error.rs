// Document parse errors
// Location, source context and fix suggestions for malformed pipeline documents

use std::fmt;

/// Parse error with location and context
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    /// Line number (1-indexed)
    pub line: usize,
    /// Column number (1-indexed)
    pub column: usize,
    /// Lines surrounding the error, with a caret under the column
    pub context: String,
    pub suggestion: Option<String>,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Not well-formed YAML or JSON
    Syntax,
    /// Well-formed but the wrong shape (missing field, wrong type)
    InvalidSchema,
    /// Unknown document format or unreadable file
    Io,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            context: String::new(),
            suggestion: None,
            kind: ParseErrorKind::InvalidSchema,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(message, 0, 0).with_kind(ParseErrorKind::Io)
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    fn with_suggestion_opt(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }

    pub fn with_kind(mut self, kind: ParseErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Attach the lines around the error location
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }
        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let marker = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", marker, line_num, line));

            if line_num == self.line && self.column > 0 {
                let caret = " ".repeat(self.column.saturating_sub(1)) + "^";
                context.push_str(&format!("       | {}\n", caret));
            }
        }

        self.context = context;
        self
    }

    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));
        Self::from_message(err.to_string(), line, column, source)
    }

    pub fn from_json_error(err: &serde_json::Error, source: &str) -> Self {
        let (line, column) = (err.line().max(1), err.column().max(1));
        let mut parsed = Self::from_message(err.to_string(), line, column, source);
        if err.is_syntax() || err.is_eof() {
            parsed.kind = ParseErrorKind::Syntax;
        }
        parsed
    }

    fn from_message(raw: String, line: usize, column: usize, source: &str) -> Self {
        let kind = if is_schema_message(&raw) {
            ParseErrorKind::InvalidSchema
        } else {
            ParseErrorKind::Syntax
        };
        let suggestion = suggest_fix(&raw, source, line);
        ParseError::new(format_message(&raw), line, column)
            .with_kind(kind)
            .with_source_context(source, 2)
            .with_suggestion_opt(suggestion)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        if self.line > 0 {
            writeln!(f, "  --> line {}:{}", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            writeln!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

pub type ParseResult<T> = Result<T, ParseError>;

fn is_schema_message(msg: &str) -> bool {
    ["missing field", "unknown field", "invalid type", "unknown variant", "invalid value"]
        .iter()
        .any(|pattern| msg.contains(pattern))
}

/// Rewrite serde messages into something closer to the document's vocabulary
fn format_message(msg: &str) -> String {
    let msg = strip_location(msg);

    if let Some(field) = extract_between(msg, "missing field `", "`") {
        return format!("missing required field '{}'", field);
    }

    if let Some(variant) = extract_between(msg, "unknown variant `", "`") {
        if let Some(expected) = extract_expected(msg) {
            return format!(
                "unknown value '{}', expected one of: {}",
                variant,
                expected.join(", ")
            );
        }
        return format!("unknown value '{}'", variant);
    }

    if msg.contains("invalid type") {
        if let (Some(found), Some(expected)) = (
            extract_between(msg, "invalid type: ", ", expected"),
            msg.split(", expected ").nth(1),
        ) {
            return format!("expected {}, but found {}", expected, found);
        }
    }

    msg.to_string()
}

fn strip_location(msg: &str) -> &str {
    match msg.rfind(" at line ") {
        Some(idx) => &msg[..idx],
        None => msg,
    }
}

fn extract_between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

fn extract_expected(msg: &str) -> Option<Vec<String>> {
    let start = msg.find("expected one of ")? + "expected one of ".len();
    let rest = strip_location(&msg[start..]);
    Some(
        rest.split(", ")
            .map(|s| s.trim_matches('`').to_string())
            .collect(),
    )
}

/// Suggest fixes for common authoring mistakes
fn suggest_fix(msg: &str, source: &str, line: usize) -> Option<String> {
    let error_line = source.lines().nth(line.saturating_sub(1)).unwrap_or("");

    if msg.contains("missing field `type`") {
        return Some(
            "every node needs a 'type': notebook, python-script, r-script or component".to_string(),
        );
    }

    if msg.contains("missing field `id`") {
        return Some("every node needs a unique 'id'".to_string());
    }

    if msg.contains("data did not match any variant") && error_line.contains("node") {
        return Some(
            "file inputs are either { node: <id>, output: <file> } or { path: <file> }".to_string(),
        );
    }

    if error_line.starts_with('\t') {
        return Some(
            "YAML prefers spaces over tabs for indentation. Replace tabs with spaces.".to_string(),
        );
    }

    let typo_suggestions = [
        ("runtime_image", "image"),
        ("env_vars", "env"),
        ("dependencies", "edges"),
        ("runtimeconfig", "runtimeConfig"),
        ("failurepolicy", "failurePolicy"),
        ("maxattempts", "maxAttempts"),
    ];

    let lower_line = error_line.to_lowercase();
    for (typo, correct) in typo_suggestions {
        if lower_line.contains(typo) && !error_line.contains(correct) {
            return Some(format!("did you mean '{}'?", correct));
        }
    }

    None
}
