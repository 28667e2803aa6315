//! Discovery of the supervised external process.
//!
//! The target server is independently managed: its owner, working directory,
//! and even existence are unknown a priori and can change across restarts.
//! Every query re-derives the answer from the live process table; nothing is
//! cached.

use crate::error::WardenResult;
use log::warn;
use std::path::PathBuf;

/// One row of the process table as seen by the locator.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    pub command: String,
    pub owner: Option<String>,
    pub working_dir: Option<PathBuf>,
}

/// Seam over the host process table so discovery logic is testable with
/// canned rows.
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> WardenResult<Vec<ProcessRecord>>;
}

/// Best-effort view of the target process. Each field degrades to `None`
/// independently; callers must be able to render a partial result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetProcess {
    pub exists: bool,
    pub pid: Option<u32>,
    pub owner: Option<String>,
    pub working_dir: Option<PathBuf>,
    /// Every PID whose command line matched the signature. The first entry
    /// is treated as authoritative (documented heuristic); the full list is
    /// exposed so callers can detect ambiguity.
    pub matches: Vec<u32>,
}

/// Finds the target process by fuzzy command-line match.
#[derive(Debug, Clone)]
pub struct ProcessLocator<T> {
    table: T,
    signature: String,
}

impl<T: ProcessTable> ProcessLocator<T> {
    pub fn new(table: T, signature: impl Into<String>) -> Self {
        Self {
            table,
            signature: signature.into(),
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// All process-table rows whose command line contains the signature.
    ///
    /// Degrades to an empty list when the table itself cannot be queried.
    pub fn matching(&self) -> Vec<ProcessRecord> {
        let rows = match self.table.snapshot() {
            Ok(rows) => rows,
            Err(err) => {
                warn!("process table query failed: {err}");
                return Vec::new();
            }
        };

        rows.into_iter()
            .filter(|row| row.command.contains(&self.signature))
            .collect()
    }

    /// Locate the target process right now.
    ///
    /// Never fails: a process-table error degrades to "nothing found", and
    /// per-PID metadata that could not be resolved stays `None`.
    pub fn locate(&self) -> TargetProcess {
        let matched = self.matching();
        let Some(first) = matched.first() else {
            return TargetProcess::default();
        };

        TargetProcess {
            exists: true,
            pid: Some(first.pid),
            owner: first.owner.clone(),
            working_dir: first.working_dir.clone(),
            matches: matched.iter().map(|row| row.pid).collect(),
        }
    }
}

/// Process table backed by sysinfo.
#[derive(Debug, Clone, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> WardenResult<Vec<ProcessRecord>> {
        use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users};

        let refresh = ProcessRefreshKind::nothing()
            .with_cmd(UpdateKind::Always)
            .with_cwd(UpdateKind::Always)
            .with_user(UpdateKind::Always);
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh);
        let users = Users::new_with_refreshed_list();

        let rows = system
            .processes()
            .iter()
            .map(|(pid, process)| {
                let command = process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(" ");
                let owner = process
                    .user_id()
                    .and_then(|uid| users.get_user_by_id(uid))
                    .map(|user| user.name().to_string());
                ProcessRecord {
                    pid: pid.as_u32(),
                    command,
                    owner,
                    working_dir: process.cwd().map(|path| path.to_path_buf()),
                }
            })
            .collect();

        Ok(rows)
    }
}
