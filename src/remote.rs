//! Remote command execution over a cached, multiplexed SSH session.

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::timeout;

use crate::config::{self, SessionKey};
use crate::error::Error;
use crate::line_format::{self, Pipe};
use crate::result::CommandResult;
use crate::session::{self, Session};
use crate::shaping;

/// Options accepted by [`remote`]. Unset fields fall back to the active configuration
/// scope, then to the defaults documented in the recognized-keys table.
#[derive(Debug, Clone, Default)]
pub struct RemoteOptions {
    pub user: Option<String>,
    pub host_string: Option<String>,
    pub port: Option<u16>,
    pub key_filename: Option<String>,
    pub use_shell: Option<bool>,
    pub use_sudo: Option<bool>,
    pub combine_stderr: Option<bool>,
    pub quiet: Option<bool>,
    pub discard_output: Option<bool>,
    pub warn_only: Option<bool>,
    pub display_running: Option<bool>,
    pub display_prefix: Option<bool>,
    pub line_template: Option<String>,
    pub timeout: Option<Duration>,
}

fn cfg_bool(explicit: Option<bool>, key: &str, default: bool) -> bool {
    explicit
        .or_else(|| config::get(key).and_then(|v| v.as_bool()))
        .unwrap_or(default)
}

fn cfg_string(explicit: Option<String>, key: &str) -> Option<String> {
    explicit.or_else(|| config::get(key).and_then(|v| v.as_str().map(String::from)))
}

async fn acquire_session(opts: &RemoteOptions) -> Result<Rc<Session>, Error> {
    let user = cfg_string(opts.user.clone(), "user");
    let host = cfg_string(opts.host_string.clone(), "host_string")
        .ok_or_else(|| Error::usage("host_string must be set to use remote()"))?;
    let port = opts
        .port
        .or_else(|| config::get("port").and_then(|v| v.as_u64()).map(|p| p as u16));
    let key_filename = cfg_string(opts.key_filename.clone(), "key_filename");
    let timeout_secs = opts
        .timeout
        .map(|d| d.as_secs())
        .or_else(|| config::get("timeout").and_then(|v| v.as_f64()).map(|t| t as u64));

    let key = SessionKey {
        user: user.clone(),
        host: host.clone(),
        key_filename: key_filename.clone(),
        port,
        timeout: timeout_secs,
    };

    if config::in_scope() {
        if let Some(session) = config::cached_session(&key) {
            return Ok(session);
        }
    }

    let resolved_key = session::resolve_key_filename(key_filename.as_deref());
    let destination = match &user {
        Some(u) => format!("{u}@{host}"),
        None => host.clone(),
    };

    let session = Rc::new(
        Session::connect(
            &destination,
            user.as_deref(),
            port,
            resolved_key.as_deref().map(PathBuf::as_path),
            timeout_secs,
        )
        .await?,
    );

    if config::in_scope() {
        config::cache_session(key, Rc::clone(&session));
    }

    Ok(session)
}

/// Runs `command` on a remote host, reusing a cached session when available.
pub async fn remote(command: &str, opts: RemoteOptions) -> Result<CommandResult, Error> {
    let use_shell = cfg_bool(opts.use_shell, "use_shell", true);
    let use_sudo = cfg_bool(opts.use_sudo, "use_sudo", false);
    let combine_stderr = cfg_bool(opts.combine_stderr, "combine_stderr", true);
    let quiet = cfg_bool(opts.quiet, "quiet", false);
    let discard_output = cfg_bool(opts.discard_output, "discard_output", false);
    let warn_only = cfg_bool(opts.warn_only, "warn_only", false);
    let display_running = cfg_bool(opts.display_running, "display_running", false);
    let display_prefix = cfg_bool(opts.display_prefix, "display_prefix", true);
    let line_template = cfg_string(opts.line_template.clone(), "line_template")
        .unwrap_or_else(|| line_format::DEFAULT_TEMPLATE.to_string());
    let remote_working_dir =
        config::get("remote_working_dir").and_then(|v| v.as_str().map(String::from));
    let timeout_duration = opts.timeout.or_else(|| {
        config::get("timeout")
            .and_then(|v| v.as_f64())
            .map(Duration::from_secs_f64)
    });

    let shaped = shaping::shape(command, remote_working_dir.as_deref(), use_shell, use_sudo);
    // `use_pty` is derived, not configurable: the remote shell only combines its own
    // stdout/stderr when ssh allocates a PTY for it.
    let use_pty = combine_stderr;

    let session = acquire_session(&opts).await?;
    let host = cfg_string(opts.host_string.clone(), "host_string").unwrap_or_default();

    let template = if display_prefix {
        line_template.clone()
    } else {
        line_format::without_prefix(&line_template)
            .map(str::to_string)
            .unwrap_or_else(|| {
                tracing::warn!("line_template has no {{line}} placeholder; using raw line");
                line_format::DEFAULT_TEMPLATE.to_string()
            })
    };

    if display_running && !quiet {
        println!("{}", line_format::render(&template, &host, Pipe::Run, &shaped));
    }

    let mut child = session.spawn(&shaped, use_pty).map_err(Error::Ssh)?;

    let stdout_reader = child.stdout.take().map(BufReader::new);
    let stderr_reader = child.stderr.take().map(BufReader::new);

    let stream_stdout = stream_lines(stdout_reader, &template, &host, Pipe::Out, quiet, discard_output);
    let stream_stderr = stream_lines(stderr_reader, &template, &host, Pipe::Err, quiet, discard_output);

    let (stdout, stderr) = tokio::join!(stream_stdout, stream_stderr);
    let stdout = stdout.map_err(Error::IOError)?;
    let stderr = stderr.map_err(Error::IOError)?;

    let wait = child.wait();
    let status = match timeout_duration {
        Some(d) => match timeout(d, wait).await {
            Ok(status) => status.map_err(Error::IOError)?,
            Err(_) => {
                let _ = child.start_kill();
                child.wait().await.map_err(Error::IOError)?
            }
        },
        None => wait.await.map_err(Error::IOError)?,
    };

    let return_code = status.code().unwrap_or(-1);

    let result = CommandResult {
        command: shaped,
        return_code,
        stdout,
        stderr,
    };

    crate::result::finish_command(result, warn_only, quiet)
}

async fn stream_lines<R: tokio::io::AsyncRead + Unpin>(
    reader: Option<BufReader<R>>,
    template: &str,
    host: &str,
    pipe: Pipe,
    quiet: bool,
    discard_output: bool,
) -> std::io::Result<Vec<String>> {
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if !quiet {
            println!("{}", line_format::render(template, host, pipe, trimmed));
        }
        if !discard_output {
            out.push(trimmed.to_string());
        }
    }
    Ok(out)
}

/// `remote()` with `use_sudo` forced on.
pub async fn remote_sudo(command: &str, mut opts: RemoteOptions) -> Result<CommandResult, Error> {
    opts.use_sudo = Some(true);
    remote(command, opts).await
}

/// `true` iff `path` exists on the remote host.
pub async fn remote_file_exists(path: &str, opts: RemoteOptions) -> Result<bool, Error> {
    let mut opts = opts;
    opts.warn_only = Some(true);
    let result = remote(&format!("test -e {path}"), opts).await?;
    Ok(result.succeeded())
}
