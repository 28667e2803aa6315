//! Execution wrapper for external host commands.
//!
//! Keeps shell integration isolated so component logic stays testable (stub
//! runners, deterministic stdout parsing). Every spawn carries a timeout; a
//! hung subprocess must never stall the agent indefinitely.

use crate::error::{WardenError, WardenResult};
use std::ffi::{OsStr, OsString};
use std::io::{Read, Write};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Captured output of a finished external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Prefer stderr over stdout when summarising a failure.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else {
            stdout.to_string()
        }
    }
}

/// Run `program` with `args`, feeding `input` to stdin when provided.
pub fn run_with_input(
    program: &OsStr,
    args: &[OsString],
    input: Option<&[u8]>,
    timeout: Duration,
) -> WardenResult<CommandOutput> {
    let mut command = Command::new(program);
    command.args(args);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = command.spawn()?;
    if let Some(payload) = input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload)?;
            stdin.flush().ok();
        }
    }

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    wait_with_timeout(program, child, stdout_pipe, stderr_pipe, timeout)
}

fn wait_with_timeout(
    program: &OsStr,
    mut child: Child,
    stdout_pipe: Option<ChildStdout>,
    stderr_pipe: Option<ChildStderr>,
    timeout: Duration,
) -> WardenResult<CommandOutput> {
    let start = Instant::now();
    let stdout_handle = spawn_output_reader(stdout_pipe);
    let stderr_handle = spawn_output_reader(stderr_pipe);
    let mut exit_status = None;

    while start.elapsed() <= timeout {
        if let Some(status) = child.try_wait()? {
            exit_status = Some(status);
            break;
        }
        thread::sleep(Duration::from_millis(25));
    }

    if exit_status.is_none() {
        let _ = child.kill();
        let _ = child.wait();
        return Err(WardenError::Internal(format!(
            "{} timed out after {:?}",
            program.to_string_lossy(),
            timeout
        )));
    }

    let stdout = stdout_handle
        .join()
        .map_err(|_| WardenError::Internal("stdout reader thread panicked".into()))??;
    let stderr = stderr_handle
        .join()
        .map_err(|_| WardenError::Internal("stderr reader thread panicked".into()))??;

    let status = exit_status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);

    Ok(CommandOutput {
        stdout,
        stderr,
        status,
    })
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<WardenResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> WardenResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn captures_stdout_and_status() {
        let out = run_with_input(
            OsStr::new("echo"),
            &os(&["hello"]),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn nonzero_exit_is_reported_not_an_error() {
        let out = run_with_input(OsStr::new("false"), &[], None, Duration::from_secs(5)).unwrap();
        assert!(!out.success());
    }

    #[test]
    fn timeout_kills_the_child() {
        let err = run_with_input(
            OsStr::new("sleep"),
            &os(&["10"]),
            None,
            Duration::from_millis(200),
        )
        .unwrap_err();
        assert!(matches!(err, WardenError::Internal(_)));
    }

    #[test]
    fn stdin_payload_reaches_the_child() {
        let out = run_with_input(
            OsStr::new("cat"),
            &[],
            Some(b"payload"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.stdout, "payload");
    }
}
