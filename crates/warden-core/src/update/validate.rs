//! Candidate vetting before the agent trusts a fetched source.
//!
//! Two gates guard the artifact: a structural marker that identifies the
//! candidate as a member of this agent's source family, and a syntax check
//! so an unparsable file can never brick the supervised service.

use crate::error::{WardenError, WardenResult};
use crate::exec::run_with_input;
use regex::Regex;
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::sync::OnceLock;
use std::time::Duration;

/// Validation verdict over a candidate source blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Candidate passed every gate and carries a newer/different version.
    Valid { version: String },
    /// Structural marker missing; the blob is not one of ours.
    InvalidContent,
    /// Candidate failed the syntax gate.
    InvalidSyntax { line: Option<u32>, detail: String },
    /// Candidate matches the currently running version. A no-op, not an error.
    SameVersion,
}

/// Checks a candidate for structural sanity and version identity.
///
/// Pure over its inputs: the currently running version is injected by the
/// caller rather than read from ambient state.
#[derive(Debug, Clone)]
pub struct ContentValidator {
    required_marker: String,
    syntax_checker: Vec<String>,
    checker_timeout: Duration,
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"VERSION\s*=\s*"([^"]*)""#).expect("static regex"))
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)line\s+(\d+)").expect("static regex"))
}

impl ContentValidator {
    pub fn new(
        required_marker: impl Into<String>,
        syntax_checker: Vec<String>,
        checker_timeout: Duration,
    ) -> Self {
        Self {
            required_marker: required_marker.into(),
            syntax_checker,
            checker_timeout,
        }
    }

    /// Run every gate against `candidate` and report the verdict.
    ///
    /// Gate order matters: marker first (cheapest, rejects foreign blobs),
    /// syntax second, version comparison last.
    pub fn validate(&self, candidate: &str, current_version: &str) -> WardenResult<Verdict> {
        if !candidate.contains(&self.required_marker) {
            return Ok(Verdict::InvalidContent);
        }

        if let Some(verdict) = self.check_syntax(candidate)? {
            return Ok(verdict);
        }

        match extract_version(candidate) {
            Some(version) if version == current_version => Ok(Verdict::SameVersion),
            Some(version) => Ok(Verdict::Valid { version }),
            // No version token at all: treat as a distinct version so a
            // deliberately unversioned rollout still applies.
            None => Ok(Verdict::Valid {
                version: String::new(),
            }),
        }
    }

    /// Run the configured external checker against a temp copy of the
    /// candidate. `None` means the gate passed (or is disabled).
    fn check_syntax(&self, candidate: &str) -> WardenResult<Option<Verdict>> {
        let Some((checker, flags)) = self.syntax_checker.split_first() else {
            return Ok(None);
        };

        let mut scratch = tempfile::Builder::new()
            .prefix("warden-candidate-")
            .tempfile()?;
        scratch.write_all(candidate.as_bytes())?;
        scratch.flush()?;

        let mut args: Vec<OsString> = flags.iter().map(OsString::from).collect();
        args.push(scratch.path().as_os_str().to_os_string());

        let output = run_with_input(OsStr::new(checker), &args, None, self.checker_timeout)
            .map_err(|err| {
                WardenError::Internal(format!("syntax checker {checker} failed to run: {err}"))
            })?;

        if output.success() {
            return Ok(None);
        }

        let detail = output.diagnostic();
        let line = line_pattern()
            .captures(&detail)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok());

        Ok(Some(Verdict::InvalidSyntax {
            line,
            detail: if detail.is_empty() {
                format!("{checker} exited with status {}", output.status)
            } else {
                detail
            },
        }))
    }
}

/// Extract the `VERSION = "<value>"` token from a source blob.
pub fn extract_version(source: &str) -> Option<String> {
    version_pattern()
        .captures(source)
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "# warden-agent";

    fn validator() -> ContentValidator {
        ContentValidator::new(
            MARKER,
            vec!["bash".into(), "-n".into()],
            Duration::from_secs(10),
        )
    }

    fn sample(version: &str) -> String {
        format!("#!/bin/sh\n{MARKER}\nVERSION=\"{version}\"\necho running\n")
    }

    #[test]
    fn missing_marker_is_invalid_content() {
        let verdict = validator()
            .validate("#!/bin/sh\necho rogue\n", "1.0")
            .unwrap();
        assert_eq!(verdict, Verdict::InvalidContent);
    }

    #[test]
    fn broken_syntax_reports_line_number() {
        let candidate = format!("{MARKER}\nVERSION=\"2.0\"\nif then fi (\n");
        let verdict = validator().validate(&candidate, "1.0").unwrap();
        match verdict {
            Verdict::InvalidSyntax { line, detail } => {
                assert!(line.is_some(), "bash -n reports a line: {detail}");
            }
            other => panic!("expected syntax rejection, got {other:?}"),
        }
    }

    #[test]
    fn same_version_is_a_noop_signal() {
        let verdict = validator().validate(&sample("1.0"), "1.0").unwrap();
        assert_eq!(verdict, Verdict::SameVersion);
    }

    #[test]
    fn newer_version_is_valid() {
        let verdict = validator().validate(&sample("2.0"), "1.0").unwrap();
        assert_eq!(
            verdict,
            Verdict::Valid {
                version: "2.0".into()
            }
        );
    }

    #[test]
    fn disabled_checker_skips_syntax_gate() {
        let lenient = ContentValidator::new(MARKER, Vec::new(), Duration::from_secs(5));
        let candidate = format!("{MARKER}\nVERSION=\"2.0\"\nif then fi (\n");
        let verdict = lenient.validate(&candidate, "1.0").unwrap();
        assert_eq!(
            verdict,
            Verdict::Valid {
                version: "2.0".into()
            }
        );
    }

    #[test]
    fn version_extraction_accepts_spaced_assignment() {
        assert_eq!(
            extract_version("VERSION = \"4.0 (LTS)\""),
            Some("4.0 (LTS)".to_string())
        );
        assert_eq!(extract_version("VERSION=\"1.2\""), Some("1.2".to_string()));
        assert_eq!(extract_version("no token here"), None);
    }
}
