//! Two-tier artifact writer.
//!
//! The agent frequently runs as a service account while the artifact it must
//! overwrite was installed by root. A permission mismatch is therefore the
//! expected steady state, not an edge case: the direct rename path is tried
//! first, and denial falls back to an elevated move plus ownership repair so
//! future writes need no escalation.

use crate::error::{WardenError, WardenResult};
use crate::privilege;
use log::{error, warn};
use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Which strategy placed the content on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Direct,
    Elevated,
}

/// Seam for the privileged move/chown collaborator so tests can fake
/// elevation without sudo.
pub trait ElevatedMover: Send + Sync {
    /// Move `temp` onto `target` wholesale with elevated rights.
    fn move_into_place(&self, temp: &Path, target: &Path) -> WardenResult<()>;

    /// Hand ownership of `target` back to `user`.
    fn repair_ownership(&self, target: &Path, user: &str) -> WardenResult<()>;
}

/// Production mover backed by `sudo mv` / `sudo chown`.
#[derive(Debug, Clone)]
pub struct SudoMover {
    timeout: Duration,
}

impl SudoMover {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ElevatedMover for SudoMover {
    fn move_into_place(&self, temp: &Path, target: &Path) -> WardenResult<()> {
        let args = vec![
            OsString::from(temp.as_os_str()),
            OsString::from(target.as_os_str()),
        ];
        let output = privilege::run_elevated("mv", &args, self.timeout)?;
        if output.success() {
            Ok(())
        } else {
            Err(WardenError::WriteDenied(format!(
                "elevated move onto {} failed: {}",
                target.display(),
                output.diagnostic()
            )))
        }
    }

    fn repair_ownership(&self, target: &Path, user: &str) -> WardenResult<()> {
        let args = vec![
            OsString::from(user),
            OsString::from(target.as_os_str()),
        ];
        let output = privilege::run_elevated("chown", &args, self.timeout)?;
        if output.success() {
            Ok(())
        } else {
            Err(WardenError::Privilege(format!(
                "chown {} {} failed: {}",
                user,
                target.display(),
                output.diagnostic()
            )))
        }
    }
}

/// Writes a file to a possibly privileged path without ever leaving a
/// truncated target behind.
#[derive(Debug, Clone)]
pub struct AtomicWriter<M = SudoMover> {
    mover: M,
}

impl AtomicWriter<SudoMover> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            mover: SudoMover::new(timeout),
        }
    }
}

impl<M: ElevatedMover> AtomicWriter<M> {
    pub fn with_mover(mover: M) -> Self {
        Self { mover }
    }

    /// Replace `path` with `content`, reporting which strategy succeeded.
    pub fn write(&self, path: &Path, content: &str) -> WardenResult<WriteOutcome> {
        match self.write_direct(path, content) {
            Ok(()) => return Ok(WriteOutcome::Direct),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {}
            Err(err) => {
                // Anything other than a permission refusal leaves ambiguous
                // intent; surface it loudly before reporting the failure.
                error!("direct write to {} failed: {err}", path.display());
                return Err(WardenError::Io(err));
            }
        }

        self.write_elevated(path, content)
            .map(|()| WriteOutcome::Elevated)
    }

    /// Temp file in the target directory plus rename, so readers never
    /// observe partial bytes.
    fn write_direct(&self, path: &Path, content: &str) -> std::io::Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(content.as_bytes())?;
        temp.flush()?;
        let _ = temp.as_file().sync_all();
        temp.persist(path).map_err(|err| err.error)?;
        Ok(())
    }

    fn write_elevated(&self, path: &Path, content: &str) -> WardenResult<()> {
        let mut staging = tempfile::Builder::new()
            .prefix("warden-stage-")
            .tempfile()
            .map_err(|err| WardenError::WriteDenied(format!("staging file: {err}")))?;
        staging
            .write_all(content.as_bytes())
            .map_err(|err| WardenError::WriteDenied(format!("staging write: {err}")))?;
        staging
            .flush()
            .map_err(|err| WardenError::WriteDenied(format!("staging flush: {err}")))?;
        let _ = staging.as_file().sync_all();

        let staged = staging.into_temp_path();
        self.mover.move_into_place(&staged, path)?;

        // The move consumed the staged file; dropping the TempPath after
        // this point is a no-op.
        if let Some(user) = privilege::invoking_user() {
            if let Err(err) = self.mover.repair_ownership(path, &user) {
                warn!(
                    "ownership repair on {} failed; future writes will need elevation: {err}",
                    path.display()
                );
            }
        }

        Ok(())
    }
}
