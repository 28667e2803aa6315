//! Console bridge to the supervised external process.
//!
//! Commands are injected into the target's interactive screen session; logs
//! are tailed from a prioritized list of candidate paths. Injection crosses a
//! privilege boundary: the session is only addressable by its owning user,
//! which is usually not the agent's own identity.

use crate::config::WardenConfig;
use crate::error::{WardenError, WardenResult};
use crate::exec::run_with_input;
use crate::privilege;
use crate::process::{ProcessLocator, ProcessTable};
use log::{debug, info};
use std::collections::VecDeque;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Tail of the first log candidate that exists on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTail {
    pub path: PathBuf,
    /// Oldest-to-newest ordering of the last N lines.
    pub lines: Vec<String>,
}

/// Seam for the actual injection mechanism so dispatch behaviour can be
/// asserted without a live screen session.
pub trait SessionInjector: Send + Sync {
    /// Issue the injection command. `run_as` selects the identity the
    /// session belongs to; `None` means the agent's own identity suffices.
    fn inject(&self, session: &str, run_as: Option<&str>, line: &str) -> WardenResult<()>;
}

/// Injector backed by `screen -X stuff`, impersonating the owner via sudo
/// when required.
#[derive(Debug, Clone)]
pub struct ScreenInjector {
    timeout: Duration,
}

impl ScreenInjector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl SessionInjector for ScreenInjector {
    fn inject(&self, session: &str, run_as: Option<&str>, line: &str) -> WardenResult<()> {
        let payload = format!("{line}\r");
        let args: Vec<OsString> = ["-S", session, "-p", "0", "-X", "stuff", payload.as_str()]
            .iter()
            .copied()
            .map(OsString::from)
            .collect();

        let output = match run_as {
            Some(user) => privilege::run_as_user(user, "screen", &args, self.timeout)?,
            None => run_with_input(OsStr::new("screen"), &args, None, self.timeout)?,
        };

        // Dispatch-only semantics: screen gives no acknowledgement from the
        // session itself, so a zero exit means "issued", nothing more. A
        // nonzero exit usually means the session does not exist, which is
        // not an error the caller can act on; log and carry on.
        if !output.success() {
            debug!(
                "screen stuff into {session} exited {}: {}",
                output.status,
                output.diagnostic()
            );
        }
        Ok(())
    }
}

/// Relays commands and log tails to the discovered target process.
pub struct ConsoleBridge<T, I = ScreenInjector> {
    config: Arc<WardenConfig>,
    locator: ProcessLocator<T>,
    injector: I,
}

impl<T: ProcessTable> ConsoleBridge<T, ScreenInjector> {
    pub fn new(config: Arc<WardenConfig>, table: T) -> Self {
        let injector = ScreenInjector::new(config.command_timeout());
        Self::with_injector(config, table, injector)
    }
}

impl<T: ProcessTable, I: SessionInjector> ConsoleBridge<T, I> {
    pub fn with_injector(config: Arc<WardenConfig>, table: T, injector: I) -> Self {
        let locator = ProcessLocator::new(table, config.console.signature.clone());
        Self {
            config,
            locator,
            injector,
        }
    }

    pub fn locator(&self) -> &ProcessLocator<T> {
        &self.locator
    }

    /// Send one command line into the target's console session.
    ///
    /// Success means "the injection command was issued" — there is no
    /// acknowledgement channel from the session.
    pub fn send_command(&self, line: &str) -> WardenResult<()> {
        let line = line.strip_prefix('/').unwrap_or(line);
        let owner = self.resolve_owner();
        let run_as = run_as_for(&owner, current_identity().as_deref());
        info!(
            "dispatching console command to session {} as {}",
            self.config.console.session,
            run_as.unwrap_or("self")
        );
        self.injector
            .inject(&self.config.console.session, run_as, line)
    }

    /// Owner identity used for injection: configuration wins, discovery is
    /// consulted under `auto`, and root is the fallback when nothing
    /// resolved (the session must belong to somebody).
    fn resolve_owner(&self) -> String {
        let configured = self.config.console.owner.trim();
        if !configured.is_empty() && !configured.eq_ignore_ascii_case("auto") {
            return configured.to_string();
        }
        self.locator
            .locate()
            .owner
            .unwrap_or_else(|| "root".to_string())
    }

    /// Candidate log paths in priority order. Recomputed per request: the
    /// target's log directory is not stable across its restarts.
    fn log_candidates(&self) -> Vec<PathBuf> {
        let console = &self.config.console;
        let mut candidates = Vec::new();

        if let Some(path) = &console.log_path {
            candidates.push(path.clone());
        }

        for row in self.locator.matching() {
            if let Some(cwd) = row.working_dir {
                candidates.push(cwd.join(&console.log_relative_path));
            }
        }

        if let Ok(entries) = fs::read_dir(&console.home_root) {
            let mut homes: Vec<PathBuf> = entries
                .flatten()
                .filter(|entry| entry.path().is_dir())
                .map(|entry| entry.path().join(&console.log_relative_path))
                .collect();
            homes.sort();
            candidates.extend(homes);
        }

        candidates.dedup();
        candidates
    }

    /// Return the last N lines of the first candidate that exists.
    pub fn tail_log(&self) -> WardenResult<LogTail> {
        let candidates = self.log_candidates();
        for candidate in &candidates {
            if !candidate.is_file() {
                continue;
            }
            // Lossy decode: a mangled byte in the log must not fail the
            // whole tail.
            let bytes = fs::read(candidate)?;
            let contents = String::from_utf8_lossy(&bytes);
            let mut window = VecDeque::with_capacity(self.config.console.tail_lines);
            for line in contents.lines() {
                if window.len() == self.config.console.tail_lines {
                    window.pop_front();
                }
                window.push_back(line.to_string());
            }
            return Ok(LogTail {
                path: candidate.clone(),
                lines: window.into(),
            });
        }

        Err(WardenError::LogNotFound { candidates })
    }
}

/// Identity the agent is running as, resolved from the effective uid
/// first. A systemd service account usually carries no USER in its
/// environment, and a wrong guess here would address another user's
/// session.
fn current_identity() -> Option<String> {
    if privilege::running_as_root() {
        return Some("root".to_string());
    }
    privilege::effective_user().or_else(|| env::var("USER").ok().filter(|name| !name.is_empty()))
}

/// Skip impersonation only when the owner provably is the current
/// identity; an unknown identity always impersonates.
fn run_as_for<'a>(owner: &'a str, current: Option<&str>) -> Option<&'a str> {
    match current {
        Some(me) if me == owner => None,
        _ => Some(owner),
    }
}
