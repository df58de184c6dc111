//! Local command execution.

use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::process::Stdio as StdStdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config;
use crate::error::Error;
use crate::result::CommandResult;
use crate::shaping;

/// Opens a fresh anonymous pipe, returning `(read_fd, write_fd)`.
fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// A command to hand to [`local`]: either shell syntax (wrapped per `use_shell`) or an
/// argv sequence run directly, with no shell in between.
///
/// Mirrors the spec's own invariant that `use_shell=false` commands must already be an
/// argv sequence rather than a string a shell would need to split.
#[derive(Debug, Clone)]
pub enum LocalCommand {
    /// Shell syntax. Only valid when `use_shell` resolves to `true`.
    Shell(String),
    /// Program plus arguments, executed directly via `execve`, no shell involved.
    Argv(Vec<String>),
}

/// Options accepted by [`local`]. Every field mirrors a recognized configuration key and
/// falls back to the active [`crate::config`] scope, then a fixed default, when absent.
#[derive(Debug, Clone, Default)]
pub struct LocalOptions {
    pub use_shell: Option<bool>,
    pub use_sudo: Option<bool>,
    pub combine_stderr: Option<bool>,
    pub capture: Option<bool>,
    pub quiet: Option<bool>,
    pub warn_only: Option<bool>,
    pub timeout: Option<Duration>,
}

fn resolved_bool(explicit: Option<bool>, key: &str, default: bool) -> bool {
    explicit
        .or_else(|| config::get(key).and_then(|v| v.as_bool()))
        .unwrap_or(default)
}

/// Runs `command` on the local machine.
pub async fn local(command: LocalCommand, opts: LocalOptions) -> Result<CommandResult, Error> {
    let use_shell = resolved_bool(opts.use_shell, "use_shell", true);
    let use_sudo = resolved_bool(opts.use_sudo, "use_sudo", false);
    let combine_stderr = resolved_bool(opts.combine_stderr, "combine_stderr", true);
    let capture = resolved_bool(opts.capture, "capture", false);
    let quiet = resolved_bool(opts.quiet, "quiet", false);
    let warn_only = resolved_bool(opts.warn_only, "warn_only", false);
    let timeout_duration = opts.timeout.or_else(|| {
        config::get("timeout")
            .and_then(|v| v.as_f64())
            .map(Duration::from_secs_f64)
    });
    let remote_working_dir =
        config::get("remote_working_dir").and_then(|v| v.as_str().map(String::from));

    let (mut cmd, shaped_display) = match command {
        LocalCommand::Shell(raw) => {
            if !use_shell {
                return Err(Error::usage(
                    "a Shell command requires use_shell=true; pass Argv instead",
                ));
            }
            let shaped = shaping::shape(&raw, remote_working_dir.as_deref(), true, use_sudo);
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(&shaped);
            (cmd, shaped)
        }
        LocalCommand::Argv(mut argv) => {
            if use_shell {
                return Err(Error::usage(
                    "an Argv command requires use_shell=false; pass Shell instead",
                ));
            }
            if argv.is_empty() {
                return Err(Error::usage("argv command must have at least a program name"));
            }
            if use_sudo {
                argv.insert(0, "--non-interactive".to_string());
                argv.insert(0, "sudo".to_string());
            }
            let display = argv
                .iter()
                .map(|a| crate::escape::escape(std::ffi::OsStr::new(a)).to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            (cmd, display)
        }
    };

    // `capture && combine_stderr` needs real OS-level interleaving of the two streams, not
    // two buffers concatenated after the fact — so both `Stdio`s are pointed at the write
    // end of the same pipe (the remote side gets this the same way, via a PTY; there's no
    // PTY here, just a plain pipe, since nothing downstream needs a terminal).
    let combined_reader = if capture && combine_stderr {
        let (read_fd, write_fd) = pipe().map_err(Error::IOError)?;
        // SAFETY: `read_fd` was just returned by `pipe()` and is uniquely owned here.
        let reader = unsafe { std::fs::File::from_raw_fd(read_fd) };
        let write_fd2 = unsafe { libc::dup(write_fd) };
        if write_fd2 < 0 {
            return Err(Error::IOError(io::Error::last_os_error()));
        }
        // SAFETY: both `write_fd` and `write_fd2` are uniquely owned fds (the second a
        // fresh `dup` of the first); `Stdio` takes ownership and closes them once `spawn`
        // has dup2'd them into the child.
        cmd.stdout(unsafe { StdStdio::from_raw_fd(write_fd) });
        cmd.stderr(unsafe { StdStdio::from_raw_fd(write_fd2) });
        Some(tokio::fs::File::from_std(reader))
    } else if capture {
        cmd.stdout(StdStdio::piped());
        cmd.stderr(StdStdio::piped());
        None
    } else if quiet {
        cmd.stdout(StdStdio::null()).stderr(StdStdio::null());
        None
    } else {
        cmd.stdout(StdStdio::inherit()).stderr(StdStdio::inherit());
        None
    };
    cmd.stdin(StdStdio::null());

    let mut child = cmd.spawn().map_err(Error::Ssh)?;
    // Drop our half of the builder now: if this spawned a combined-pipe write end, `cmd`
    // is the only thing in this process still holding it open, and the read below would
    // otherwise never see EOF.
    drop(cmd);

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    if let Some(mut reader) = combined_reader {
        reader.read_to_end(&mut stdout_buf).await.map_err(Error::IOError)?;
    } else if capture {
        if let Some(mut out) = child.stdout.take() {
            out.read_to_end(&mut stdout_buf).await.map_err(Error::IOError)?;
        }
        if let Some(mut err) = child.stderr.take() {
            err.read_to_end(&mut stderr_buf).await.map_err(Error::IOError)?;
        }
    }

    let wait = child.wait();
    let status = match timeout_duration {
        Some(d) => match timeout(d, wait).await {
            Ok(status) => status.map_err(Error::IOError)?,
            Err(_) => {
                child.start_kill().map_err(Error::IOError)?;
                child.wait().await.map_err(Error::IOError)?
            }
        },
        None => wait.await.map_err(Error::IOError)?,
    };

    let return_code = status
        .code()
        .unwrap_or_else(|| -signal_number(&status).unwrap_or(1));

    let result = CommandResult {
        command: shaped_display,
        return_code,
        stdout: split_lines(&stdout_buf),
        stderr: split_lines(&stderr_buf),
    };

    crate::result::finish_command(result, warn_only, quiet)
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    if bytes.is_empty() {
        return Vec::new();
    }
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

#[cfg(unix)]
fn signal_number(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_number(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_and_captures_stdout() {
        let result = local(
            LocalCommand::Shell("echo hello".to_string()),
            LocalOptions {
                capture: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(result.stdout, vec!["hello".to_string()]);
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn argv_form_runs_without_a_shell() {
        let result = local(
            LocalCommand::Argv(vec!["echo".to_string(), "hi there".to_string()]),
            LocalOptions {
                use_shell: Some(false),
                capture: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(result.stdout, vec!["hi there".to_string()]);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_without_warn_only() {
        let err = local(
            LocalCommand::Shell("exit 7".to_string()),
            LocalOptions {
                capture: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        match err {
            Error::CommandFailed(result) => assert_eq!(result.return_code, 7),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_returns_result_with_warn_only() {
        let result = local(
            LocalCommand::Shell("exit 7".to_string()),
            LocalOptions {
                capture: Some(true),
                warn_only: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(result.return_code, 7);
        assert!(result.failed());
    }

    #[tokio::test]
    async fn quiet_discards_output() {
        let result = local(
            LocalCommand::Shell("echo hello".to_string()),
            LocalOptions {
                capture: Some(false),
                quiet: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(result.stdout.is_empty());
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn timeout_kills_and_fails() {
        let result = local(
            LocalCommand::Shell("sleep 5".to_string()),
            LocalOptions {
                capture: Some(true),
                warn_only: Some(true),
                timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(result.failed());
    }
}
