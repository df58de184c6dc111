//! Serial and parallel dispatch of a worker procedure.
//!
//! Parallel dispatch uses real OS process forking rather than threads or async tasks, the
//! same way the source this crate supersedes relies on CPython's `multiprocessing` defaulting
//! to `fork()`: the child inherits a copy-on-write snapshot of the parent's memory, which
//! includes the already-pushed [`crate::config`] frame, for free. Only the worker's final
//! result has to cross back over an explicit pipe, since unlike CPython's `multiprocessing.Queue`
//! Rust gives us no implicit marshalling across that boundary.
//!
//! Forking a process that has other OS threads running (as a multi-threaded tokio runtime
//! does) only carries the calling thread into the child; anything another thread held
//! locked at the moment of `fork()` stays locked forever in the child. Callers should drive
//! this module from a `current_thread` runtime, exactly as [`crate::config`] already
//! requires.

use std::future::Future;
use std::os::unix::io::RawFd;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::{self, ConfigMap, ConfigValue};
use crate::error::Error;

/// How a [`Worker`] should be dispatched by [`execute`].
#[derive(Debug, Clone, Copy)]
pub enum Dispatch {
    /// Run `pool_size` times (or once per `param_values` entry) in the calling process,
    /// one after another.
    Serial { pool_size: Option<usize> },
    /// Run `pool_size` times (or once per `param_values` entry) in separate forked
    /// processes, concurrently.
    Parallel { pool_size: Option<usize> },
}

/// A worker procedure tagged with its dispatch mode. The tagged-variant binding for what
/// the source expresses as function attributes (`func.parallel`, `func.pool_size`).
#[derive(Clone)]
pub struct Worker<F> {
    pub(crate) func: F,
    pub(crate) dispatch: Dispatch,
}

/// Tags `func` to run serially, `pool_size` times when no parameter list is given
/// (default 1).
pub fn serial<F>(func: F, pool_size: Option<usize>) -> Worker<F> {
    Worker {
        func,
        dispatch: Dispatch::Serial { pool_size },
    }
}

/// Tags `func` to run in parallel worker processes, `pool_size` of them when no parameter
/// list is given (default 1).
pub fn parallel<F>(func: F, pool_size: Option<usize>) -> Worker<F> {
    Worker {
        func,
        dispatch: Dispatch::Parallel { pool_size },
    }
}

/// The result of one worker invocation: either its return value, or a description of
/// whatever it panicked with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome<T> {
    Success(T),
    Failed(String),
}

impl<T> Outcome<T> {
    /// Unwraps a successful outcome, panicking with the captured message otherwise.
    pub fn unwrap(self) -> T {
        match self {
            Outcome::Success(v) => v,
            Outcome::Failed(msg) => panic!("{msg}"),
        }
    }
}

/// Parameters controlling [`execute`] beyond the worker itself.
pub struct ExecuteOptions {
    /// Configuration key patched with each entry of `param_values` before that
    /// invocation. Required together with `param_values`, or not at all.
    pub param_key: Option<String>,
    /// One value per worker invocation; its length determines the pool size when given.
    pub param_values: Option<Vec<ConfigValue>>,
    /// When `true` (the default) the first captured panic from a parallel run is
    /// re-raised as [`Error::WorkerFailed`] instead of appearing in the result list.
    pub raise_unhandled_errors: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        ExecuteOptions {
            param_key: None,
            param_values: None,
            raise_unhandled_errors: true,
        }
    }
}

fn validate(opts: &ExecuteOptions) -> Result<(), Error> {
    match (&opts.param_key, &opts.param_values) {
        (Some(_), Some(_)) | (None, None) => Ok(()),
        _ => Err(Error::usage(
            "either both param_key and param_values must be given, or neither",
        )),
    }
}

/// Drives `worker` either serially or across a pool of forked processes, depending on how
/// it was tagged. Results are ordered to match `param_values` (or pool index when no
/// parameter list was given) — not by completion order, and (for the parallel path) not by
/// the lexical sort of internal process names the source this supersedes used, which would
/// misorder `process--10` ahead of `process--2`.
pub async fn execute<F, Fut, T>(worker: Worker<F>, opts: ExecuteOptions) -> Result<Vec<Outcome<T>>, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = T>,
    T: Serialize + DeserializeOwned,
{
    validate(&opts)?;

    let pool_size = match &opts.dispatch_pool_size(&worker) {
        Some(n) => *n,
        None => opts.param_values.as_ref().map(Vec::len).unwrap_or(1),
    };

    match worker.dispatch {
        Dispatch::Serial { .. } => execute_serial(worker.func, opts, pool_size).await,
        Dispatch::Parallel { .. } => execute_parallel(worker.func, opts, pool_size),
    }
}

impl ExecuteOptions {
    fn dispatch_pool_size<F>(&self, worker: &Worker<F>) -> Option<usize> {
        match worker.dispatch {
            Dispatch::Serial { pool_size } | Dispatch::Parallel { pool_size } => {
                if self.param_values.is_some() {
                    None
                } else {
                    Some(pool_size.unwrap_or(1))
                }
            }
        }
    }
}

async fn execute_serial<F, Fut, T>(
    func: F,
    opts: ExecuteOptions,
    pool_size: usize,
) -> Result<Vec<Outcome<T>>, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = T>,
{
    let mut results = Vec::with_capacity(pool_size);
    if let (Some(key), Some(values)) = (&opts.param_key, &opts.param_values) {
        for value in values {
            let mut overrides = ConfigMap::new();
            overrides.insert(key.clone(), value.clone());
            let _scope = config::settings(overrides);
            results.push(Outcome::Success(func().await));
        }
    } else {
        for _ in 0..pool_size {
            let _scope = config::settings(ConfigMap::new());
            results.push(Outcome::Success(func().await));
        }
    }
    Ok(results)
}

/// `name` follows the source's own `process--1`, `process--2`, ... scheme, kept purely for
/// display/record purposes; ordering of the returned `Vec` tracks `index`, never `name`.
#[derive(Debug, Clone)]
pub struct WorkerProcessRecord {
    pub name: String,
    pub pid: i32,
    pub index: usize,
    pub exitcode: Option<i32>,
    pub alive: bool,
    pub killed: bool,
    pub kill_signal: Option<i32>,
}

struct ChildHandle {
    pid: libc::pid_t,
    read_fd: RawFd,
    record: WorkerProcessRecord,
}

fn execute_parallel<F, Fut, T>(
    func: F,
    opts: ExecuteOptions,
    pool_size: usize,
) -> Result<Vec<Outcome<T>>, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = T>,
    T: Serialize + DeserializeOwned,
{
    let overrides_for = |idx: usize| -> ConfigMap {
        let mut overrides = ConfigMap::new();
        if let (Some(key), Some(values)) = (&opts.param_key, &opts.param_values) {
            overrides.insert(key.clone(), values[idx].clone());
        }
        overrides.insert("parallel".to_string(), ConfigValue::Bool(true));
        overrides.insert("abort_on_prompts".to_string(), ConfigValue::Bool(true));
        overrides
    };

    let mut children = Vec::with_capacity(pool_size);

    for idx in 0..pool_size {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::Ssh(std::io::Error::last_os_error()));
        }
        let [read_fd, write_fd] = fds;

        use std::io::Write as _;
        let _ = std::io::stdout().flush(); // avoid duplicating buffered output into the child

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(Error::Ssh(std::io::Error::last_os_error()));
        }

        if pid == 0 {
            // child: the entire address space (including the thread-local config stack)
            // is already a copy-on-write snapshot of the parent at this instant.
            unsafe { libc::close(read_fd) };
            let outcome = run_worker_in_child(&func, overrides_for(idx));
            write_outcome(write_fd, &outcome);
            unsafe { libc::close(write_fd) };
            std::process::exit(0);
        }

        unsafe { libc::close(write_fd) };
        children.push(ChildHandle {
            pid,
            read_fd,
            record: WorkerProcessRecord {
                name: format!("process--{}", idx + 1),
                pid: pid as i32,
                index: idx,
                exitcode: None,
                alive: true,
                killed: false,
                kill_signal: None,
            },
        });
    }

    let mut results: Vec<Option<Outcome<T>>> = (0..pool_size).map(|_| None).collect();
    let mut remaining = children;

    while !remaining.is_empty() {
        let mut still_running = Vec::with_capacity(remaining.len());
        for mut child in remaining.drain(..) {
            let mut status: libc::c_int = 0;
            let waited = unsafe { libc::waitpid(child.pid, &mut status, libc::WNOHANG) };

            if waited == child.pid {
                child.record.alive = false;
                if libc::WIFSIGNALED(status) {
                    child.record.killed = true;
                    child.record.kill_signal = Some(libc::WTERMSIG(status));
                    child.record.exitcode = Some(-libc::WTERMSIG(status));
                } else {
                    child.record.exitcode = Some(libc::WEXITSTATUS(status));
                }
                let outcome = read_outcome::<T>(child.read_fd);
                results[child.record.index] = Some(outcome);
                unsafe { libc::close(child.read_fd) };
            } else if result_already_readable(child.read_fd) {
                // defensive: a result is sitting in the pipe but the process is still
                // reported alive. observed occasionally with some transports; kill it
                // and take the result we already have rather than wait forever.
                tracing::warn!(
                    process = %child.record.name,
                    pid = child.pid,
                    "worker result readable before process reported exit; terminating it"
                );
                unsafe { libc::kill(child.pid, libc::SIGKILL) };
                unsafe { libc::waitpid(child.pid, &mut status, 0) };
                child.record.alive = false;
                child.record.killed = true;
                let outcome = read_outcome::<T>(child.read_fd);
                results[child.record.index] = Some(outcome);
                unsafe { libc::close(child.read_fd) };
            } else {
                still_running.push(child);
            }
        }
        remaining = still_running;
        if !remaining.is_empty() {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    let results: Vec<Outcome<T>> = results.into_iter().map(|r| r.expect("every index filled")).collect();

    if opts.raise_unhandled_errors {
        if let Some(Outcome::Failed(msg)) = results.iter().find(|r| matches!(r, Outcome::Failed(_))) {
            return Err(Error::WorkerFailed(msg.clone()));
        }
    }

    Ok(results)
}

fn run_worker_in_child<F, Fut, T>(func: &F, overrides: ConfigMap) -> Outcome<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = T>,
{
    let _scope = config::settings(overrides);
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => return Outcome::Failed(format!("failed to build child runtime: {e}")),
    };

    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| runtime.block_on(func()))) {
        Ok(value) => Outcome::Success(value),
        Err(payload) => Outcome::Failed(panic_message(payload)),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}

fn write_all_raw(fd: RawFd, mut buf: &[u8]) {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n <= 0 {
            return;
        }
        buf = &buf[n as usize..];
    }
}

fn read_exact_raw(fd: RawFd, buf: &mut [u8]) -> bool {
    let mut filled = 0;
    while filled < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[filled..].as_mut_ptr().cast(),
                buf.len() - filled,
            )
        };
        if n <= 0 {
            return false;
        }
        filled += n as usize;
    }
    true
}

fn write_outcome<T: Serialize>(write_fd: RawFd, outcome: &Outcome<T>) {
    let Ok(bytes) = serde_json::to_vec(outcome) else {
        return;
    };
    let len = (bytes.len() as u32).to_le_bytes();
    write_all_raw(write_fd, &len);
    write_all_raw(write_fd, &bytes);
}

fn read_outcome<T: DeserializeOwned>(read_fd: RawFd) -> Outcome<T> {
    let mut len_buf = [0u8; 4];
    if !read_exact_raw(read_fd, &mut len_buf) {
        return Outcome::Failed("worker exited without producing a result".to_string());
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    if !read_exact_raw(read_fd, &mut buf) {
        return Outcome::Failed("worker result was truncated".to_string());
    }
    serde_json::from_slice(&buf)
        .unwrap_or_else(|e| Outcome::Failed(format!("failed to decode worker result: {e}")))
}

fn result_already_readable(fd: RawFd) -> bool {
    let mut poll_fd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut poll_fd, 1, 0) };
    rc > 0 && (poll_fd.revents & libc::POLLIN) != 0
}

/// Convenience wrapper: `execute` with `param_key` fixed to `"host_string"`.
pub async fn execute_with_hosts<F, Fut, T>(
    worker: Worker<F>,
    hosts: Vec<String>,
) -> Result<Vec<(String, Outcome<T>)>, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = T>,
    T: Serialize + DeserializeOwned,
{
    let values = hosts.iter().cloned().map(ConfigValue::Str).collect();
    let results = execute(
        worker,
        ExecuteOptions {
            param_key: Some("host_string".to_string()),
            param_values: Some(values),
            raise_unhandled_errors: true,
        },
    )
    .await?;
    Ok(hosts.into_iter().zip(results).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serial_runs_pool_size_times_with_no_params() {
        let worker = serial(|| async { 7 }, Some(3));
        let results = execute(worker, ExecuteOptions::default()).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| matches!(r, Outcome::Success(7))));
    }

    #[tokio::test]
    async fn serial_binds_param_key_per_invocation() {
        let worker = serial(
            || async {
                config::get("mykey").and_then(|v| v.as_u64()).unwrap_or(0)
            },
            None,
        );
        let results = execute(
            worker,
            ExecuteOptions {
                param_key: Some("mykey".to_string()),
                param_values: Some(vec![ConfigValue::UInt(1), ConfigValue::UInt(2), ConfigValue::UInt(3)]),
                raise_unhandled_errors: true,
            },
        )
        .await
        .unwrap();
        let values: Vec<_> = results.into_iter().map(Outcome::unwrap).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn validate_rejects_param_key_without_values() {
        let worker = serial(|| async {}, None);
        let err = execute(
            worker,
            ExecuteOptions {
                param_key: Some("x".to_string()),
                param_values: None,
                raise_unhandled_errors: true,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }
}
