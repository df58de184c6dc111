//! A single multiplexed SSH connection, implemented the same way the `process_impl` backend
//! of this crate's teacher does: spawn a real `ssh -M -f -N` control-master process rooted
//! in a temporary directory, then shell out to `ssh -S <socket> ...` for every subsequent
//! command so all the usual `~/.ssh/config` behavior keeps working.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio as StdStdio;

use once_cell::sync::OnceCell;
use tempfile::{Builder, TempDir};
use tokio::process::{Child, Command};

use crate::error::Error;

fn get_default_control_dir<'a>() -> Result<&'a Path, Error> {
    static DEFAULT_CONTROL_DIR: OnceCell<Option<Box<Path>>> = OnceCell::new();

    DEFAULT_CONTROL_DIR
        .get_or_try_init(|| {
            if let Some(dir) = dirs::state_dir() {
                fs::create_dir_all(&dir).map_err(Error::Connect)?;
                Ok(Some(dir.into_boxed_path()))
            } else {
                Ok(None)
            }
        })
        .map(|dir| dir.as_deref().unwrap_or_else(|| Path::new("./")))
}

/// Default candidate private key paths, probed in this order when the caller doesn't name
/// one explicitly. The original only ever tried `~/.ssh/id_rsa`; this is a deliberate
/// supplement to cover the other common OpenSSH key types.
pub fn default_key_candidates() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    ["id_rsa", "id_dsa", "identity", "id_ecdsa"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .collect()
}

/// Resolves which private key to hand to `ssh -i`, per the probing order in
/// [`default_key_candidates`]. If `explicit` is given it is always used, even if it does
/// not exist (the failure will surface clearly once `ssh` is invoked).
pub fn resolve_key_filename(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(explicit) = explicit {
        return Some(PathBuf::from(explicit));
    }
    let candidates = default_key_candidates();
    candidates
        .iter()
        .find(|p| p.exists())
        .cloned()
        .or_else(|| candidates.into_iter().next())
}

/// A live SSH `ControlMaster` connection and the destination it was made to.
#[derive(Debug)]
pub struct Session {
    ctl: TempDir,
    destination: String,
}

impl Session {
    fn ctl_path(&self) -> PathBuf {
        self.ctl.path().join("master")
    }

    /// Spawns `ssh -M -f -N -S <socket> ...` and waits for the control master to come up.
    pub async fn connect(
        destination: &str,
        user: Option<&str>,
        port: Option<u16>,
        key_filename: Option<&Path>,
        timeout_secs: Option<u64>,
    ) -> Result<Self, Error> {
        let socketdir = get_default_control_dir()?;
        let dir = Builder::new()
            .prefix(".hostwork-ssh")
            .tempdir_in(socketdir)
            .map_err(Error::Master)?;
        let log = dir.path().join("log");

        let mut init = Command::new("ssh");
        init.stdin(StdStdio::null())
            .stdout(StdStdio::null())
            .stderr(StdStdio::null())
            .arg("-E")
            .arg(&log)
            .arg("-S")
            .arg(dir.path().join("master"))
            .arg("-M")
            .arg("-f")
            .arg("-N")
            .arg("-o")
            .arg("ControlPersist=yes")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new");

        if let Some(timeout) = timeout_secs {
            init.arg("-o").arg(format!("ConnectTimeout={timeout}"));
        }
        if let Some(port) = port {
            init.arg("-p").arg(port.to_string());
        }
        if let Some(user) = user {
            init.arg("-l").arg(user);
        }
        if let Some(key) = key_filename {
            init.arg("-o").arg("IdentitiesOnly=yes");
            init.arg("-i").arg(key);
        }

        init.arg(destination);

        let status = init.status().await.map_err(Error::Connect)?;
        if !status.success() {
            let output = fs::read_to_string(&log).unwrap_or_default();
            return Err(Error::interpret_ssh_error(&output));
        }

        Ok(Session {
            ctl: dir,
            destination: destination.to_string(),
        })
    }

    /// Checks whether the master connection is still usable.
    pub async fn check(&self) -> Result<(), Error> {
        let check = Command::new("ssh")
            .arg("-S")
            .arg(self.ctl_path())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-O")
            .arg("check")
            .arg(&self.destination)
            .output()
            .await
            .map_err(Error::Ssh)?;

        if check.status.code() == Some(255) {
            Err(Error::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Builds (but does not spawn) the `ssh -S <socket> ... -- <command>` invocation for a
    /// single already-shaped command string. `use_pty` allocates a PTY, which is required
    /// for the remote side to combine its own stdout/stderr.
    pub fn build_command(&self, shaped_command: &str, use_pty: bool) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(self.ctl_path())
            .arg("-o")
            .arg("BatchMode=yes");
        if use_pty {
            cmd.arg("-t").arg("-t");
        } else {
            cmd.arg("-T");
        }
        cmd.arg(&self.destination).arg("--").arg(shaped_command);
        cmd
    }

    /// Spawns a shaped command over this session with piped stdout (and, unless
    /// `use_pty`, piped stderr too).
    pub fn spawn(&self, shaped_command: &str, use_pty: bool) -> io::Result<Child> {
        let mut cmd = self.build_command(shaped_command, use_pty);
        cmd.stdin(StdStdio::null())
            .stdout(StdStdio::piped())
            .stderr(if use_pty {
                StdStdio::null()
            } else {
                StdStdio::piped()
            });
        cmd.spawn()
    }

    async fn terminate(&self) -> Result<(), Error> {
        let exit = Command::new("ssh")
            .arg("-S")
            .arg(self.ctl_path())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-O")
            .arg("exit")
            .arg(&self.destination)
            .output()
            .await
            .map_err(Error::Ssh)?;

        if exit.status.success() {
            Ok(())
        } else {
            Ok(()) // remote end may have already closed cleanly; see teacher's Session::terminate
        }
    }

    /// Explicitly closes the control master, surfacing any teardown error.
    pub async fn close(self) -> Result<(), Error> {
        self.terminate().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = std::process::Command::new("ssh")
            .arg("-S")
            .arg(self.ctl_path())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-O")
            .arg("exit")
            .arg(&self.destination)
            .stdout(StdStdio::null())
            .stderr(StdStdio::null())
            .status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_candidates_are_probed_in_fixed_order() {
        let candidates = default_key_candidates();
        if !candidates.is_empty() {
            let names: Vec<_> = candidates
                .iter()
                .map(|p| p.file_name().unwrap().to_str().unwrap())
                .collect();
            assert_eq!(names, vec!["id_rsa", "id_dsa", "identity", "id_ecdsa"]);
        }
    }

    #[test]
    fn explicit_key_filename_is_used_verbatim() {
        assert_eq!(
            resolve_key_filename(Some("/tmp/mykey")),
            Some(PathBuf::from("/tmp/mykey"))
        );
    }
}
