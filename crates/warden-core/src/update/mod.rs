//! Self-replacing update pipeline: fetch, validate, write, restart.

mod rescue;
mod validate;
mod writer;

#[cfg(test)]
mod tests;

use crate::config::WardenConfig;
use crate::error::{WardenError, WardenResult};
use crate::fetch::{HttpFetcher, SourceFetcher};
use crate::privilege;
use log::{error, info, warn};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

pub use rescue::{RescueGenerator, RESCUE_FILE_NAME};
pub use validate::{extract_version, ContentValidator, Verdict};
pub use writer::{AtomicWriter, ElevatedMover, SudoMover, WriteOutcome};

/// Where the pipeline currently is. `RestartScheduled` survives until the
/// supervisor actually bounces the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Fetching,
    Validating,
    Writing,
    RestartScheduled,
}

/// Result of a non-mutating update check.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub available: bool,
    pub remote_version: Option<String>,
    pub verdict: Verdict,
}

/// Result of a successful (or no-op) apply. Rejections surface as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New source written and a restart scheduled.
    Applied { version: String },
    /// Remote matches the running version; nothing changed.
    AlreadyCurrent,
}

/// Collaborator that restarts the supervised unit. The agent never execs
/// itself; it relies on the service supervisor's restart policy.
pub trait ServiceRestarter: Send + Sync {
    fn restart(&self, unit: &str) -> WardenResult<()>;
}

/// systemd-backed restarter going through the privilege runner.
#[derive(Debug, Clone)]
pub struct SystemdRestarter {
    timeout: Duration,
}

impl SystemdRestarter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ServiceRestarter for SystemdRestarter {
    fn restart(&self, unit: &str) -> WardenResult<()> {
        let args = vec![OsString::from("restart"), OsString::from(unit)];
        let output = privilege::run_elevated("systemctl", &args, self.timeout)?;
        if output.success() {
            Ok(())
        } else {
            Err(WardenError::Privilege(format!(
                "systemctl restart {unit} failed: {}",
                output.diagnostic()
            )))
        }
    }
}

/// Orchestrates the whole pipeline and owns the process-wide trusted version.
///
/// All-or-nothing from the caller's point of view: either the artifact is
/// replaced wholesale and a restart is scheduled, or nothing changed and a
/// structured error explains why.
pub struct UpdateController<F = HttpFetcher, M = SudoMover> {
    config: Arc<WardenConfig>,
    fetcher: F,
    validator: ContentValidator,
    writer: AtomicWriter<M>,
    restarter: Arc<dyn ServiceRestarter>,
    current_version: RwLock<String>,
    phase: Mutex<UpdatePhase>,
    // Single-flight gate: held across the whole check-then-act window so a
    // concurrent apply can never reach the write step with a second candidate.
    flight: Mutex<()>,
}

impl UpdateController<HttpFetcher, SudoMover> {
    pub fn new(config: Arc<WardenConfig>) -> Self {
        let fetcher = HttpFetcher::new(config.update.source_url.clone(), config.fetch_timeout());
        let writer = AtomicWriter::new(config.command_timeout());
        let restarter = Arc::new(SystemdRestarter::new(config.command_timeout()));
        Self::with_parts(config, fetcher, writer, restarter)
    }
}

impl<F: SourceFetcher, M: ElevatedMover> UpdateController<F, M> {
    pub fn with_parts(
        config: Arc<WardenConfig>,
        fetcher: F,
        writer: AtomicWriter<M>,
        restarter: Arc<dyn ServiceRestarter>,
    ) -> Self {
        let validator = ContentValidator::new(
            config.agent.required_marker.clone(),
            config.update.syntax_checker.clone(),
            config.command_timeout(),
        );
        let current_version = RwLock::new(read_installed_version(&config));
        Self {
            config,
            fetcher,
            validator,
            writer,
            restarter,
            current_version,
            phase: Mutex::new(UpdatePhase::Idle),
            flight: Mutex::new(()),
        }
    }

    /// Version string extracted from the trusted source at boot or after the
    /// last successful apply.
    pub fn current_version(&self) -> String {
        self.current_version.read().unwrap().clone()
    }

    pub fn phase(&self) -> UpdatePhase {
        *self.phase.lock().unwrap()
    }

    fn set_phase(&self, phase: UpdatePhase) {
        *self.phase.lock().unwrap() = phase;
    }

    /// Fetch and validate the remote candidate without writing anything.
    /// Safe to poll on an interval.
    pub fn check_for_update(&self) -> WardenResult<CheckOutcome> {
        let candidate = self.fetcher.fetch()?;
        let current = self.current_version();
        let verdict = self.validator.validate(&candidate, &current)?;
        Ok(match &verdict {
            Verdict::Valid { version } => CheckOutcome {
                available: true,
                remote_version: Some(version.clone()),
                verdict,
            },
            Verdict::SameVersion => CheckOutcome {
                available: false,
                remote_version: Some(current),
                verdict,
            },
            Verdict::InvalidContent | Verdict::InvalidSyntax { .. } => CheckOutcome {
                available: false,
                remote_version: extract_version(&candidate),
                verdict,
            },
        })
    }

    /// Fetch, validate, replace the artifact, and schedule a restart.
    ///
    /// A second call while one is in flight is rejected with `UpdateBusy`
    /// rather than queued; callers retry once the current cycle settles.
    pub fn apply_update(&self) -> WardenResult<ApplyOutcome> {
        let _guard = self.flight.try_lock().map_err(|_| WardenError::UpdateBusy)?;

        // A scheduled restart outlives the guard: the previous apply is
        // still in progress until the supervisor bounces the process, so a
        // new candidate must not be admitted in that window.
        if self.phase() == UpdatePhase::RestartScheduled {
            return Err(WardenError::UpdateBusy);
        }

        let result = self.apply_locked();
        if !matches!(result, Ok(ApplyOutcome::Applied { .. })) {
            self.set_phase(UpdatePhase::Idle);
        }
        result
    }

    fn apply_locked(&self) -> WardenResult<ApplyOutcome> {
        self.set_phase(UpdatePhase::Fetching);
        let candidate = self.fetcher.fetch()?;

        self.set_phase(UpdatePhase::Validating);
        let current = self.current_version();
        let version = match self.validator.validate(&candidate, &current)? {
            Verdict::Valid { version } => version,
            Verdict::SameVersion => {
                info!("remote source matches running version {current}; nothing to apply");
                return Ok(ApplyOutcome::AlreadyCurrent);
            }
            Verdict::InvalidContent => {
                return Err(WardenError::InvalidContent(
                    "candidate is missing the required structural marker".into(),
                ));
            }
            Verdict::InvalidSyntax { line, detail } => {
                return Err(WardenError::InvalidSyntax { line, detail });
            }
        };

        self.set_phase(UpdatePhase::Writing);
        let artifact = &self.config.agent.artifact_path;
        let outcome = self.writer.write(artifact, &candidate)?;
        info!(
            "artifact {} replaced ({}), version {current} -> {version}",
            artifact.display(),
            match outcome {
                WriteOutcome::Direct => "direct write",
                WriteOutcome::Elevated => "elevated write",
            }
        );

        *self.current_version.write().unwrap() = version.clone();
        self.schedule_restart();
        self.set_phase(UpdatePhase::RestartScheduled);

        Ok(ApplyOutcome::Applied { version })
    }

    /// Ask the supervisor to restart the unit after a short delay so the
    /// triggering response can reach its caller before the process dies.
    fn schedule_restart(&self) {
        let unit = self.config.agent.service_unit.clone();
        let delay = self.config.restart_delay();
        let restarter = self.restarter.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            info!("requesting supervisor restart of {unit}");
            if let Err(err) = restarter.restart(&unit) {
                error!("scheduled restart of {unit} failed: {err}");
            }
        });
    }

    /// Snapshot the currently installed artifact into the rescue tool.
    ///
    /// Deliberately reads the on-disk artifact, not the fetched candidate:
    /// the snapshot must be the last state the operator knows to be good.
    pub fn generate_rescue(&self) -> WardenResult<PathBuf> {
        let artifact = &self.config.agent.artifact_path;
        let trusted = fs::read_to_string(artifact).map_err(|err| {
            WardenError::InvalidContent(format!(
                "cannot snapshot {}: {err}",
                artifact.display()
            ))
        })?;
        let generator = RescueGenerator::from_config(&self.config);
        generator.generate(&trusted, &self.writer)
    }
}

/// Read the installed artifact and extract its version, degrading to
/// "unknown" when the file is absent or carries no version token.
fn read_installed_version(config: &WardenConfig) -> String {
    match fs::read_to_string(&config.agent.artifact_path) {
        Ok(source) => extract_version(&source).unwrap_or_else(|| {
            warn!(
                "artifact {} carries no VERSION token",
                config.agent.artifact_path.display()
            );
            "unknown".to_string()
        }),
        Err(err) => {
            warn!(
                "cannot read artifact {}: {err}",
                config.agent.artifact_path.display()
            );
            "unknown".to_string()
        }
    }
}
