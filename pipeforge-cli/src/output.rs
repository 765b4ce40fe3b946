// Output formatting helpers for CLI commands

use pipeline_engine::{NodeState, Severity, Violation};

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// One line per node state change, colored by state
pub fn node_state(node_id: &str, state: NodeState, attempts: u32, message: Option<&str>) {
    let (color, label) = match state {
        NodeState::Pending => ("2", "PENDING"),
        NodeState::Running => ("36", "RUNNING"),
        NodeState::Succeeded => ("32", "OK"),
        NodeState::Failed => ("31", "FAIL"),
        NodeState::Skipped => ("33", "SKIP"),
    };
    let retry = if attempts > 1 {
        format!(" (attempt {})", attempts)
    } else {
        String::new()
    };
    match message {
        Some(message) => eprintln!(
            "\x1b[{}m{:>12}\x1b[0m {}{}: {}",
            color, label, node_id, retry, message
        ),
        None => eprintln!("\x1b[{}m{:>12}\x1b[0m {}{}", color, label, node_id, retry),
    }
}

/// Print validation findings, errors first
pub fn violations(violations: &[Violation]) {
    let (errors, warnings): (Vec<&Violation>, Vec<&Violation>) =
        violations.iter().partition(|v| v.severity == Severity::Error);

    if !errors.is_empty() {
        error(&format!("{} validation error(s):", errors.len()));
        for violation in errors {
            print_violation(violation, false);
        }
    }
    for violation in warnings {
        print_violation(violation, true);
    }
}

fn print_violation(violation: &Violation, is_warning: bool) {
    let line = format!("[{}] {}: {}", violation.kind, violation.path, violation.message);
    if is_warning {
        warning(&line);
    } else {
        eprintln!("\x1b[31m  - \x1b[0m{}", line);
    }
    if let Some(suggestion) = &violation.suggestion {
        info(&format!("  Suggestion: {}", suggestion));
    }
}
