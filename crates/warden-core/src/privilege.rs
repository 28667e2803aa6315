//! Privilege escalation helpers.
//!
//! The agent usually runs as an unprivileged service account while the
//! artifacts it manages (its own source file, the supervisor, the target
//! process's session) may belong to root or to another user. Escalation goes
//! through non-interactive sudo; a configured sudoers entry is part of the
//! install contract.

use crate::error::{WardenError, WardenResult};
use crate::exec::{run_with_input, CommandOutput};
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::time::Duration;

pub(crate) const SUDO_BINARIES: &[&str] = &["/usr/bin/sudo", "/bin/sudo"];

/// Run `program args` elevated to root via `sudo -n`.
pub fn run_elevated(
    program: &str,
    args: &[OsString],
    timeout: Duration,
) -> WardenResult<CommandOutput> {
    run_via_sudo(None, program, args, timeout)
}

/// Run `program args` as `user` via `sudo -n -u <user>`.
///
/// Used by the console bridge: a screen session is only addressable by the
/// user that owns it.
pub fn run_as_user(
    user: &str,
    program: &str,
    args: &[OsString],
    timeout: Duration,
) -> WardenResult<CommandOutput> {
    run_via_sudo(Some(user), program, args, timeout)
}

fn run_via_sudo(
    user: Option<&str>,
    program: &str,
    args: &[OsString],
    timeout: Duration,
) -> WardenResult<CommandOutput> {
    let sudo = sudo_binary().ok_or_else(missing_privilege_error)?;

    let mut sudo_args: Vec<OsString> = vec![OsString::from("-n")];
    if let Some(user) = user {
        sudo_args.push(OsString::from("-u"));
        sudo_args.push(OsString::from(user));
    }
    sudo_args.push(OsString::from(program));
    sudo_args.extend(args.iter().cloned());

    let output = run_with_input(OsStr::new(sudo), &sudo_args, None, timeout)?;
    if !output.success() && sudo_refused(&output) {
        return Err(missing_privilege_error());
    }
    Ok(output)
}

fn sudo_refused(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_ascii_lowercase();
    stderr.contains("a password is required")
        || stderr.contains("a terminal is required")
        || stderr.contains("not in the sudoers file")
}

/// Verify up front that the escalation path exists so failures surface at
/// startup instead of mid-update.
pub fn ensure_privilege_support() -> WardenResult<()> {
    if running_as_root() || sudo_binary().is_some() {
        Ok(())
    } else {
        Err(missing_privilege_error())
    }
}

pub(crate) fn sudo_binary() -> Option<&'static str> {
    SUDO_BINARIES
        .iter()
        .copied()
        .find(|path| Path::new(path).exists())
}

#[cfg(unix)]
pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn running_as_root() -> bool {
    true
}

/// Name of the effective user, resolved from the uid rather than the
/// environment. Service accounts frequently run without USER set, and
/// guessing a name wrong here means acting as somebody else.
#[cfg(unix)]
pub fn effective_user() -> Option<String> {
    use sysinfo::{Uid, Users};

    let uid = unsafe { libc::geteuid() }.to_string().parse::<Uid>().ok()?;
    let users = Users::new_with_refreshed_list();
    users
        .get_user_by_id(&uid)
        .map(|user| user.name().to_string())
}

#[cfg(not(unix))]
pub fn effective_user() -> Option<String> {
    None
}

/// Best-effort name of the invoking user, for ownership repair after an
/// elevated write.
pub fn invoking_user() -> Option<String> {
    env::var("SUDO_USER")
        .or_else(|_| env::var("USER"))
        .ok()
        .filter(|name| !name.is_empty())
}

fn missing_privilege_error() -> WardenError {
    WardenError::Privilege(
        "sudo is unavailable or requires a password; install sudo and grant the warden service \
         account non-interactive access (NOPASSWD) to mv, chown, systemctl, and screen, or run \
         the daemon as root"
            .into(),
    )
}
