//! Sudo launcher for privilege escalation
//!
//! Commands run with `sudo -n`: sudo must be configured with NOPASSWD for the
//! login user, otherwise the command fails immediately instead of prompting.

use crate::{Command, error::Result, launcher::Launcher};
use async_trait::async_trait;

/// Launcher that wraps another launcher to execute commands with sudo
#[derive(Debug, Clone)]
pub struct SudoLauncher<L> {
    inner: L,
    enabled: bool,
}

impl<L> SudoLauncher<L> {
    /// Create a sudo launcher wrapping the given launcher
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            enabled: true,
        }
    }

    /// Create a launcher that only uses sudo when `enabled` is set
    pub fn when(inner: L, enabled: bool) -> Self {
        Self { inner, enabled }
    }

    /// The wrapped launcher
    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// Whether commands are wrapped with sudo
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

/// Wrap `command` as `sudo -n <command>`, keeping its environment and directory
pub fn wrap(command: &Command) -> Command {
    let mut sudo = Command::new("sudo");
    sudo.arg("-n");
    // Environment is passed as leading assignments so sudo's env reset keeps them.
    for (key, val) in command.get_envs() {
        let mut assignment = key.clone();
        assignment.push("=");
        assignment.push(val);
        sudo.arg(assignment);
    }
    sudo.arg(command.get_program()).args(command.get_args());
    if let Some(dir) = command.get_current_dir() {
        sudo.current_dir(dir);
    }
    sudo
}

#[async_trait]
impl<L> Launcher for SudoLauncher<L>
where
    L: Launcher,
{
    type EventStream = L::EventStream;
    type Handle = L::Handle;

    async fn launch(&self, command: Command) -> Result<(Self::EventStream, Self::Handle)> {
        let command = if self.enabled { wrap(&command) } else { command };
        self.inner
            .launch(command)
            .await
            .map_err(|e| e.with_layer_context("Sudo"))
    }
}
