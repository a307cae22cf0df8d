//! Shell access to a single host
//!
//! [`Shell`] is the seam the migration engine talks through: scripts are plain
//! POSIX `sh` snippets, and implementations decide where they run. [`SshShell`]
//! runs them on a conversion host over `ssh`; [`LocalShell`] runs them on the
//! controller itself.

use async_trait::async_trait;
use futures::stream::Stream;
use std::path::Path;
use std::pin::Pin;
use tracing::{debug, warn};

use crate::backends::local::LocalLauncher;
use crate::backends::ssh::{SshConfig, SshLauncher};
use crate::backends::sudo::SudoLauncher;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::event::ProcessEvent;
use crate::launcher::Launcher;
use crate::process::{ExitResult, ProcessHandle};

/// Boxed stream of events from a spawned script
pub type EventStream = Pin<Box<dyn Stream<Item = ProcessEvent> + Send>>;

/// A long-running script started by [`Shell::spawn`]
pub struct SpawnedProcess {
    /// Output lines as they arrive
    pub events: EventStream,
    /// Control handle; dropping it kills the local end of the process
    pub handle: Box<dyn ProcessHandle>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.handle.pid())
            .finish()
    }
}

/// Command execution and file transfer on one host
#[async_trait]
pub trait Shell: Send + Sync {
    /// Name of the host, for logs and errors
    fn host(&self) -> &str;

    /// Run a script to completion. A non-zero exit is not an error.
    async fn run(&self, script: &str) -> Result<ExitResult>;

    /// Start a long-running script
    async fn spawn(&self, script: &str) -> Result<SpawnedProcess>;

    /// Copy a local file to `remote` on the host
    async fn copy_to(&self, local: &Path, remote: &str) -> Result<()>;

    /// Copy `remote` from the host to a local file
    async fn copy_from(&self, remote: &str, local: &Path) -> Result<()>;

    /// Run a script and return only its exit code
    async fn status(&self, script: &str) -> Result<Option<i32>> {
        Ok(self.run(script).await?.code())
    }

    /// Run a script and return its stdout, failing on a non-zero exit
    async fn run_checked(&self, script: &str) -> Result<String> {
        let result = self.run(script).await?;
        if result.success() {
            Ok(result.stdout)
        } else {
            Err(Error::CommandFailed {
                host: self.host().to_string(),
                command: script.to_string(),
                code: result.code(),
                output: result.output,
            })
        }
    }

    /// Verify the host answers at all
    async fn self_test(&self) -> Result<()> {
        match self.run("true").await {
            Ok(result) if result.success() => {
                debug!(host = self.host(), "connectivity check passed");
                Ok(())
            }
            Ok(result) => Err(Error::ConnectivityFailed {
                host: self.host().to_string(),
                reason: format!("exit {:?}: {}", result.code(), result.output.trim()),
            }),
            Err(e) => Err(Error::ConnectivityFailed {
                host: self.host().to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

async fn spawn_with<L: Launcher>(launcher: &L, command: Command) -> Result<SpawnedProcess> {
    let (events, handle) = launcher.launch(command).await?;
    Ok(SpawnedProcess {
        events: Box::pin(events),
        handle: Box::new(handle),
    })
}

/// Shell running scripts on the local machine through `sh -c`
#[derive(Debug, Clone)]
pub struct LocalShell {
    name: String,
    launcher: SudoLauncher<LocalLauncher>,
}

impl LocalShell {
    /// Create a local shell
    pub fn new() -> Self {
        Self {
            name: "localhost".to_string(),
            launcher: SudoLauncher::when(LocalLauncher, false),
        }
    }

    /// Run scripts under `sudo -n`
    pub fn with_sudo(mut self, enabled: bool) -> Self {
        self.launcher = SudoLauncher::when(LocalLauncher, enabled);
        self
    }

    /// Name used in logs and errors
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Default for LocalShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Shell for LocalShell {
    fn host(&self) -> &str {
        &self.name
    }

    async fn run(&self, script: &str) -> Result<ExitResult> {
        self.launcher.execute(Command::shell(script)).await
    }

    async fn spawn(&self, script: &str) -> Result<SpawnedProcess> {
        spawn_with(&self.launcher, Command::shell(script)).await
    }

    async fn copy_to(&self, local: &Path, remote: &str) -> Result<()> {
        async_fs::copy(local, remote)
            .await
            .map(|_| ())
            .map_err(|e| Error::CopyFailed {
                from: local.display().to_string(),
                to: remote.to_string(),
                reason: e.to_string(),
            })
    }

    async fn copy_from(&self, remote: &str, local: &Path) -> Result<()> {
        async_fs::copy(remote, local)
            .await
            .map(|_| ())
            .map_err(|e| Error::CopyFailed {
                from: remote.to_string(),
                to: local.display().to_string(),
                reason: e.to_string(),
            })
    }
}

/// Shell running scripts on a remote host over `ssh`
#[derive(Debug, Clone)]
pub struct SshShell {
    launcher: SudoLauncher<SshLauncher<LocalLauncher>>,
    name: String,
}

impl SshShell {
    /// Create a shell for the configured host
    pub fn new(config: SshConfig) -> Self {
        Self {
            name: config.host().to_string(),
            launcher: SudoLauncher::when(SshLauncher::to_host(config), false),
        }
    }

    /// Run remote scripts under `sudo -n`
    pub fn with_sudo(self, enabled: bool) -> Self {
        let ssh = self.launcher.inner().clone();
        Self {
            launcher: SudoLauncher::when(ssh, enabled),
            name: self.name,
        }
    }

    /// Connection configuration
    pub fn config(&self) -> &SshConfig {
        self.launcher.inner().config()
    }

    async fn transfer(&self, command: Command, from: String, to: String) -> Result<()> {
        debug!(host = %self.name, %from, %to, "copying file");
        let result = LocalLauncher.execute(command).await?;
        if result.success() {
            Ok(())
        } else {
            warn!(host = %self.name, %from, %to, "scp failed");
            Err(Error::CopyFailed {
                from,
                to,
                reason: result.output.trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl Shell for SshShell {
    fn host(&self) -> &str {
        &self.name
    }

    async fn run(&self, script: &str) -> Result<ExitResult> {
        self.launcher.execute(Command::shell(script)).await
    }

    async fn spawn(&self, script: &str) -> Result<SpawnedProcess> {
        spawn_with(&self.launcher, Command::shell(script)).await
    }

    async fn copy_to(&self, local: &Path, remote: &str) -> Result<()> {
        let command = self.config().upload_command(local, remote);
        self.transfer(
            command,
            local.display().to_string(),
            format!("{}:{}", self.name, remote),
        )
        .await
    }

    async fn copy_from(&self, remote: &str, local: &Path) -> Result<()> {
        let command = self.config().download_command(remote, local);
        self.transfer(
            command,
            format!("{}:{}", self.name, remote),
            local.display().to_string(),
        )
        .await
    }
}
