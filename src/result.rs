//! The structured result returned by [`crate::local::local`] and [`crate::remote::remote`].

use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::Error;

/// The outcome of running a single shaped command, locally or remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// The final shaped command string that was actually executed.
    pub command: String,
    /// The process's exit code. Negative when the local process was killed by a signal
    /// (the negated signal number), matching the convention used by `std::process::exit`.
    pub return_code: i32,
    /// Captured stdout, split into lines. Empty when output was discarded.
    pub stdout: Vec<String>,
    /// Captured stderr, split into lines. Always empty when `combine_stderr` was set.
    pub stderr: Vec<String>,
}

impl CommandResult {
    /// `true` iff the command exited with status zero.
    pub fn succeeded(&self) -> bool {
        self.return_code == 0
    }

    /// The logical negation of [`succeeded`](Self::succeeded).
    ///
    /// Deliberately *not* `return_code > 0`: the original implementation this crate
    /// supersedes treated negative (signal-terminated) exit codes as "not failed", which
    /// silently hid killed commands as successes. Here, anything other than exactly zero
    /// is a failure.
    pub fn failed(&self) -> bool {
        !self.succeeded()
    }
}

/// Applies the shared failure policy to a just-finished command: `warn_only` always
/// returns the result as-is; otherwise a failing command is logged (if `display_aborts`
/// and not `quiet`) and either raised as [`Error::CommandFailed`], or, when `abort_exception`
/// is explicitly set to `false` in the active scope, turned into an immediate process exit —
/// the nearest Rust equivalent of the source's "abort_exception is explicitly null" case,
/// since a typed `Result` has no notion of silently swallowing the error kind.
pub(crate) fn finish_command(result: CommandResult, warn_only: bool, quiet: bool) -> Result<CommandResult, Error> {
    if result.succeeded() || warn_only {
        return Ok(result);
    }

    let display_aborts = config::get("display_aborts")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    if display_aborts && !quiet {
        tracing::error!(command = %result.command, return_code = result.return_code, "command failed");
    }

    if matches!(config::get("abort_exception"), Some(v) if v.as_bool() == Some(false)) {
        std::process::exit(1);
    }

    Err(Error::CommandFailed(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(return_code: i32) -> CommandResult {
        CommandResult {
            command: "whoami".to_string(),
            return_code,
            stdout: vec![],
            stderr: vec![],
        }
    }

    #[test]
    fn zero_is_success() {
        assert!(result(0).succeeded());
        assert!(!result(0).failed());
    }

    #[test]
    fn nonzero_is_failure() {
        assert!(result(123).failed());
        assert!(!result(123).succeeded());
    }

    #[test]
    fn negative_signal_code_is_failure() {
        // the original's `failed = returncode > 0` bug would call this a success.
        assert!(result(-9).failed());
    }
}
