//! Error taxonomy shared by every Warden crate.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used across the workspace.
pub type WardenResult<T> = Result<T, WardenError>;

/// All failure modes surfaced by warden-core components.
///
/// Every variant is recoverable at the component boundary: callers receive a
/// structured failure kind plus a human-readable detail string. Nothing in
/// this enum is allowed to take the process down.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The remote source could not be fetched (network, DNS, HTTP status).
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Candidate is missing the structural marker that identifies it as a
    /// legitimate member of this agent's source family.
    #[error("invalid content: {0}")]
    InvalidContent(String),

    /// Candidate failed the syntax gate.
    #[error("invalid syntax{}: {detail}", line.map(|l| format!(" at line {l}")).unwrap_or_default())]
    InvalidSyntax { line: Option<u32>, detail: String },

    /// Both the direct write and the elevated fallback were refused.
    #[error("write denied: {0}")]
    WriteDenied(String),

    /// Privilege escalation is unavailable or was rejected.
    #[error("privilege failure: {0}")]
    Privilege(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A second apply was attempted while one is already in flight.
    #[error("an update is already in progress")]
    UpdateBusy,

    /// No running process matched the configured signature.
    #[error("target process not found: {0}")]
    ProcessNotFound(String),

    /// None of the candidate log paths exist on disk. Expected during
    /// first-run before the target has produced output, hence the full
    /// candidate list instead of a bare error.
    #[error("no log file found; candidates were: {}", format_candidates(candidates))]
    LogNotFound { candidates: Vec<PathBuf> },

    /// Unexpected internal fault. The only class of error that warrants a
    /// loud log entry at the site it occurred.
    #[error("internal fault: {0}")]
    Internal(String),
}

fn format_candidates(candidates: &[PathBuf]) -> String {
    candidates
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_renders_line_number() {
        let err = WardenError::InvalidSyntax {
            line: Some(42),
            detail: "unexpected token".into(),
        };
        assert_eq!(err.to_string(), "invalid syntax at line 42: unexpected token");
    }

    #[test]
    fn syntax_error_without_line() {
        let err = WardenError::InvalidSyntax {
            line: None,
            detail: "parse failure".into(),
        };
        assert_eq!(err.to_string(), "invalid syntax: parse failure");
    }

    #[test]
    fn log_not_found_lists_candidates() {
        let err = WardenError::LogNotFound {
            candidates: vec![PathBuf::from("/a.log"), PathBuf::from("/b.log")],
        };
        assert!(err.to_string().contains("/a.log, /b.log"));
    }
}
