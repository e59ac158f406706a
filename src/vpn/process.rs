//! OpenVPN subprocess launching and termination
//!
//! Builds the command line (optionally wrapped in an elevation helper such
//! as pkexec), spawns with piped output for the monitor tasks, and owns
//! the forced-termination fallback. When the subprocess runs elevated, a
//! plain kill from this process would be refused, so the kill goes through
//! the same helper.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::timeout;

use crate::config;
use crate::error::{Error, Result};

use super::types::{ConfigEntry, Credentials};

/// How long an elevated kill command may take before falling back
const KILL_HELPER_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawns OpenVPN subprocesses wired for monitoring
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: String,
    elevation: Option<String>,
    management_port: u16,
    auth_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(
        binary: impl Into<String>,
        elevation: Option<String>,
        management_port: u16,
        auth_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            elevation,
            management_port,
            auth_dir: auth_dir.into(),
        }
    }

    /// Program and arguments for a launch, elevation helper included
    fn command_line(&self, config_path: &Path, auth_path: &Path) -> (String, Vec<String>) {
        let mut args = Vec::new();
        let program = match &self.elevation {
            Some(helper) => {
                args.push(self.binary.clone());
                helper.clone()
            }
            None => self.binary.clone(),
        };
        args.push("--config".into());
        args.push(config_path.to_string_lossy().into_owned());
        args.push("--auth-user-pass".into());
        args.push(auth_path.to_string_lossy().into_owned());
        args.push("--management".into());
        args.push("127.0.0.1".into());
        args.push(self.management_port.to_string());
        (program, args)
    }

    /// Spawn OpenVPN against the given config
    ///
    /// Writes the auth file, validates the config path, and returns a
    /// handle with both output streams piped. Does not wait for the
    /// tunnel; lifecycle signals come from the log monitors.
    pub async fn launch(
        &self,
        entry: &ConfigEntry,
        creds: &Credentials,
    ) -> Result<ManagedProcess> {
        if !entry.path.is_file() {
            return Err(Error::ConfigNotFound(entry.path.clone()));
        }
        let auth_path = config::write_auth_file(&self.auth_dir, creds).await?;

        let (program, args) = self.command_line(&entry.path, &auth_path);
        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => Error::BinaryNotFound(program.clone()),
                _ => Error::Spawn(e),
            })?;

        tracing::info!(config = %entry.name, pid = ?child.id(), "spawned OpenVPN");
        let pid = child.id();
        Ok(ManagedProcess {
            child,
            pid,
            elevation: self.elevation.clone(),
            auth_path,
            terminated: false,
        })
    }
}

/// A live OpenVPN subprocess
#[derive(Debug)]
pub struct ManagedProcess {
    child: Child,
    pid: Option<u32>,
    elevation: Option<String>,
    auth_path: PathBuf,
    terminated: bool,
}

impl ManagedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hand the stdout stream to a monitor task; can only be taken once
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Hand the stderr stream to a monitor task; can only be taken once
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the subprocess to exit
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Whether the subprocess has exited
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Force the subprocess down; idempotent
    ///
    /// Elevated processes are killed through the elevation helper, since
    /// this process lacks the privileges to signal them directly. Callers
    /// follow up with `wait` to confirm the exit.
    pub async fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        if let (Some(helper), Some(pid)) = (&self.elevation, self.pid) {
            tracing::info!(pid, "killing elevated subprocess via {}", helper);
            let kill = Command::new(helper)
                .arg("kill")
                .arg(pid.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match timeout(KILL_HELPER_TIMEOUT, kill).await {
                Ok(Ok(status)) if status.success() => return Ok(()),
                Ok(Ok(status)) => {
                    tracing::warn!(pid, ?status, "elevated kill refused, killing directly")
                }
                Ok(Err(e)) => tracing::warn!(pid, "elevated kill failed: {}", e),
                Err(_) => tracing::warn!(pid, "elevated kill timed out, killing directly"),
            }
        }

        self.child.start_kill()?;
        Ok(())
    }

    /// Remove the on-disk auth file once the session is over
    pub async fn cleanup(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.auth_path).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::debug!("failed to remove auth file: {}", e);
            }
        }
    }
}
