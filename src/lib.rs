//! Scoped configuration, command shaping, and local/remote command execution (**unix only**).
//!
//! This crate is a small, opinionated successor to the fabric/paramiko style of host
//! automation toolkit. Rather than juggling connection objects and passing configuration
//! through every call, every operation reads its parameters from a nestable configuration
//! scope (see [`config`]), and the same shaped-command pipeline runs a process either
//! locally ([`local`]) or over SSH ([`remote`]).
//!
//! # Scoped configuration
//!
//! ```no_run
//! use hostwork::config::{self, ConfigValue};
//!
//! let overrides = [("host_string".to_string(), ConfigValue::from("example.com"))].into();
//! let _scope = config::settings(overrides);
//! // every `local`/`remote` call inside this scope sees `host_string = "example.com"`
//! ```
//!
//! Leaving the scope (when the returned [`config::ScopedContext`] drops) restores exactly
//! the configuration that was visible before it was entered, running any cleanup callbacks
//! registered with [`config::add_cleanup`] first.
//!
//! # Running commands
//!
//! [`local::local`] shapes and runs a command as a child process of the calling machine;
//! [`remote::remote`] does the same over a cached, multiplexed SSH connection, the way this
//! crate's own `ssh`-wrapping ancestor does: a real `ssh -M -f -N` control-master process is
//! spawned once per (user, host, key, port, timeout) tuple, and later commands are run
//! through `ssh -S <socket>` against that same socket so everything already configured in
//! `~/.ssh/config` keeps working.
//!
//! # Running across many hosts
//!
//! [`parallel::execute`] drives a worker either serially or across a pool of forked
//! processes (see [`parallel`] for why processes rather than threads), optionally binding a
//! configuration key to one value per invocation — [`parallel::execute_with_hosts`] is the
//! common case of that, binding `host_string`.
//!
//! # Errors
//!
//! Since most operations here either shell out to a local child process or to `ssh`, errors
//! are necessarily coarser than a native implementation could offer: see [`Error`] and, for
//! SSH specifically, [`session::Session::check`].

#![warn(
    missing_docs,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links,
    rust_2018_idioms,
    unreachable_pub
)]

#[cfg(not(unix))]
compile_error!("this crate can only be used on unix");

pub mod cd;
pub mod config;
pub mod error;
pub mod escape;
pub mod line_format;
pub mod local;
pub mod parallel;
pub mod prompt;
pub mod remote;
pub mod result;
pub mod session;
pub mod shaping;

pub use cd::{hide, lcd, rcd};
pub use config::{settings, set_defaults, ConfigMap, ConfigValue, ScopedContext, Snapshot};
pub use error::Error;
pub use local::{local, LocalCommand, LocalOptions};
pub use parallel::{execute, execute_with_hosts, parallel, serial, ExecuteOptions, Outcome, Worker};
pub use prompt::prompt;
pub use remote::{remote, remote_file_exists, remote_sudo, RemoteOptions};
pub use result::CommandResult;
pub use shaping::single_command;
