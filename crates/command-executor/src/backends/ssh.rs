//! SSH remote execution backend using the `ssh`/`scp` CLIs

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::command::Command;
use crate::error::Result;
use crate::launcher::Launcher;

/// Default bound on connection setup
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// SSH connection configuration
///
/// Every invocation runs non-interactively: batch mode, no password
/// authentication and no host key verification. Conversion hosts are
/// provisioned by the same operator running the migration.
#[derive(Debug, Clone)]
pub struct SshConfig {
    host: String,
    user: Option<String>,
    port: Option<u16>,
    identity_file: Option<PathBuf>,
    connect_timeout: Duration,
    extra_options: Vec<String>,
}

impl SshConfig {
    /// Create a new SSH configuration for the given host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            extra_options: Vec::new(),
        }
    }

    /// Set the SSH user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the identity file (private key)
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Bound the time spent establishing a connection
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Add an extra `-o` option, e.g. `ServerAliveInterval=30`
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.extra_options.push(option.into());
        self
    }

    /// Target host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Login user, if set
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Identity file, if set
    pub fn identity_file(&self) -> Option<&std::path::Path> {
        self.identity_file.as_deref()
    }

    /// Get the host string (user@host if user is specified)
    pub fn host_string(&self) -> String {
        if let Some(user) = &self.user {
            format!("{}@{}", user, self.host)
        } else {
            self.host.clone()
        }
    }

    /// The `-o` options applied to every ssh and scp invocation
    pub fn options(&self) -> Vec<String> {
        let mut options = vec![
            "BatchMode=yes".to_string(),
            "PasswordAuthentication=no".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "LogLevel=ERROR".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        options.extend(self.extra_options.iter().cloned());
        options
    }

    fn apply_common(&self, cmd: &mut Command, port_flag: &str) {
        for option in self.options() {
            cmd.arg("-o").arg(option);
        }
        if let Some(port) = self.port {
            cmd.arg(port_flag).arg(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
    }

    /// Build the `ssh` command that runs `remote` on the host
    pub fn ssh_command(&self, remote: &Command) -> Command {
        let mut ssh_cmd = Command::new("ssh");
        self.apply_common(&mut ssh_cmd, "-p");
        ssh_cmd.arg(self.host_string());
        ssh_cmd.arg(format_remote_command(remote));
        ssh_cmd
    }

    /// Build an `scp` command copying a local file to the host
    pub fn upload_command(&self, local: &std::path::Path, remote: &str) -> Command {
        let mut scp = Command::new("scp");
        self.apply_common(&mut scp, "-P");
        scp.arg(local);
        scp.arg(format!("{}:{}", self.host_string(), remote));
        scp
    }

    /// Build an `scp` command copying a file from the host
    pub fn download_command(&self, remote: &str, local: &std::path::Path) -> Command {
        let mut scp = Command::new("scp");
        self.apply_common(&mut scp, "-P");
        scp.arg(format!("{}:{}", self.host_string(), remote));
        scp.arg(local);
        scp
    }
}

/// SSH launcher that wraps another launcher for remote execution
#[derive(Debug, Clone)]
pub struct SshLauncher<L> {
    inner: L,
    config: SshConfig,
}

impl<L> SshLauncher<L> {
    /// Create a new SSH launcher wrapping the given inner launcher
    pub fn new(inner: L, config: SshConfig) -> Self {
        Self { inner, config }
    }

    /// Connection configuration
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// The wrapped launcher
    pub fn inner(&self) -> &L {
        &self.inner
    }
}

impl SshLauncher<crate::backends::local::LocalLauncher> {
    /// Convenience constructor for SSH wrapping LocalLauncher
    pub fn to_host(config: SshConfig) -> Self {
        Self {
            inner: crate::backends::local::LocalLauncher,
            config,
        }
    }
}

#[async_trait]
impl<L> Launcher for SshLauncher<L>
where
    L: Launcher,
{
    type EventStream = L::EventStream;
    type Handle = L::Handle;

    async fn launch(&self, command: Command) -> Result<(Self::EventStream, Self::Handle)> {
        let ssh_cmd = self.config.ssh_command(&command);
        self.inner
            .launch(ssh_cmd)
            .await
            .map_err(|e| e.with_layer_context("SSH"))
    }
}

/// Format a command for remote execution via SSH
fn format_remote_command(cmd: &Command) -> String {
    let mut parts = Vec::new();
    for (key, val) in cmd.get_envs() {
        parts.push(format!(
            "{}={}",
            key.to_string_lossy(),
            shell_escape(&val.to_string_lossy())
        ));
    }
    parts.push(shell_escape(&cmd.get_program().to_string_lossy()));
    parts.extend(
        cmd.get_args()
            .iter()
            .map(|arg| shell_escape(&arg.to_string_lossy())),
    );
    let line = parts.join(" ");

    match cmd.get_current_dir() {
        Some(dir) => format!("cd {} && {}", shell_escape(&dir.to_string_lossy()), line),
        None => line,
    }
}

/// Escape a string for safe inclusion in a POSIX shell command
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.contains(|c: char| c.is_whitespace() || "\"'\\$`!*?<>|&;()[]{}#~=%".contains(c)) {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    } else {
        s.to_string()
    }
}
