use std::fmt;
use std::io;

use crate::result::CommandResult;

/// Errors produced by scoped configuration, command shaping, and command execution.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Caller supplied arguments that violate a documented contract (e.g. writing to
    /// configuration outside an active scope, or passing `param_key` without `param_values`).
    Usage(String),

    /// A shaped command ran to completion and exited non-zero, or was killed, and
    /// `warn_only` was not set.
    CommandFailed(CommandResult),

    /// A worker requested interactive input while prompts were disabled for the scope.
    Prompted,

    /// A parallel worker panicked and `raise_unhandled_errors` was set; carries the
    /// panic message captured in the child process.
    WorkerFailed(String),

    /// The master ssh connection failed.
    Master(io::Error),

    /// Failed to establish the initial connection to the remote host.
    Connect(io::Error),

    /// The local `ssh` command could not be executed.
    Ssh(io::Error),

    /// The remote command could not be executed.
    Remote(io::Error),

    /// The connection to the remote host was severed.
    ///
    /// This is a best-effort classification: it may instead mean the remote process
    /// exited with status 255. Call [`Session::check`](crate::session::Session::check)
    /// to find out which.
    Disconnected,

    /// Remote process terminated, likely by signal (or the ssh connection dropped).
    RemoteProcessTerminated,

    /// Failed to remove the temporary directory holding the ssh control socket.
    RemoveTempDir(io::Error),

    /// I/O error reading/writing a remote process's standard streams.
    IOError(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Usage(msg) => write!(f, "usage error: {msg}"),
            Error::CommandFailed(result) => write!(
                f,
                "command {:?} exited with code {}",
                result.command, result.return_code
            ),
            Error::Prompted => write!(f, "a prompt was requested but prompts are disabled"),
            Error::WorkerFailed(msg) => write!(f, "parallel worker failed: {msg}"),
            Error::Master(_) => write!(f, "the master connection failed"),
            Error::Connect(_) => write!(f, "failed to connect to the remote host"),
            Error::Ssh(_) => write!(f, "the local ssh command could not be executed"),
            Error::Remote(_) => write!(f, "the remote command could not be executed"),
            Error::Disconnected => write!(f, "the connection was terminated"),
            Error::RemoteProcessTerminated => write!(f, "remote process is terminated"),
            Error::RemoveTempDir(_) => write!(
                f,
                "failed to remove temporary directory where ssh socket and output is stored"
            ),
            Error::IOError(_) => {
                write!(f, "failure while accessing standard I/O of remote process")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Master(e)
            | Error::Connect(e)
            | Error::Ssh(e)
            | Error::Remote(e)
            | Error::RemoveTempDir(e)
            | Error::IOError(e) => Some(e),

            Error::Usage(_)
            | Error::CommandFailed(_)
            | Error::Prompted
            | Error::WorkerFailed(_)
            | Error::RemoteProcessTerminated
            | Error::Disconnected => None,
        }
    }
}

impl Error {
    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    pub(crate) fn interpret_ssh_error(stderr: &str) -> Self {
        // we want to turn the string-only ssh error into something a little more "handleable".
        // we do this by trying to interpret the output from `ssh`. this is error-prone, but
        // the best we can do.
        //
        // format is:
        //
        //     ssh: ssh error: io error
        let mut stderr = stderr.trim();
        if let Some(rest) = stderr.strip_prefix("ssh: ") {
            stderr = rest;
        }
        if stderr.starts_with("Warning: Permanently added ") {
            stderr = stderr.split_once("\r\n").map(|x| x.1).unwrap_or("");
        }
        let mut kind = io::ErrorKind::ConnectionAborted;
        let mut err = stderr.splitn(2, ": ");
        if let Some(ssh_error) = err.next() {
            if ssh_error.starts_with("Could not resolve") {
                kind = io::ErrorKind::Other;
            }

            if let Some(io_error) = err.next() {
                match io_error {
                    "Network is unreachable" => {
                        kind = io::ErrorKind::Other;
                    }
                    "Connection refused" => {
                        kind = io::ErrorKind::ConnectionRefused;
                    }
                    e if ssh_error.starts_with("connect to host")
                        && e == "Connection timed out" =>
                    {
                        kind = io::ErrorKind::TimedOut;
                    }
                    e if ssh_error.starts_with("connect to host") && e == "Operation timed out" => {
                        kind = io::ErrorKind::TimedOut;
                    }
                    e if ssh_error.starts_with("connect to host") && e == "Permission denied" => {
                        kind = io::ErrorKind::Other;
                    }
                    e if e.contains("Permission denied (") => {
                        kind = io::ErrorKind::PermissionDenied;
                    }
                    _ => {}
                }
            }
        }

        Error::Connect(io::Error::new(kind, stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error() {
        let err = "ssh: Warning: Permanently added \'login.csail.mit.edu,128.52.131.0\' (ECDSA) to the list of known hosts.\r\nopenssh-tester@login.csail.mit.edu: Permission denied (publickey,gssapi-keyex,gssapi-with-mic,password,keyboard-interactive).";
        let err = Error::interpret_ssh_error(err);
        let target = io::Error::new(io::ErrorKind::PermissionDenied, "openssh-tester@login.csail.mit.edu: Permission denied (publickey,gssapi-keyex,gssapi-with-mic,password,keyboard-interactive).");
        if let Error::Connect(e) = err {
            assert_eq!(e.kind(), target.kind());
            assert_eq!(format!("{}", e), format!("{}", target));
        } else {
            unreachable!("{:?}", err);
        }
    }

    #[test]
    fn error_sanity() {
        use std::error::Error as _;

        let ioe = || io::Error::new(io::ErrorKind::Other, "test");
        let expect = ioe();

        let e = Error::Master(ioe());
        assert!(!format!("{}", e).is_empty());
        let e = e
            .source()
            .expect("source failed")
            .downcast_ref::<io::Error>()
            .expect("source not io");
        assert_eq!(e.kind(), expect.kind());

        let e = Error::Disconnected;
        assert!(!format!("{}", e).is_empty());
        assert!(e.source().is_none());

        let e = Error::Usage("param_key without param_values".into());
        assert!(format!("{}", e).contains("usage error"));
        assert!(e.source().is_none());
    }
}
