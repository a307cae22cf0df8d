//! NBD exports and `qemu-img` helpers on a conversion host

use command_executor::{Shell, shell_escape};
use tracing::{debug, info};

use crate::config::Timeouts;
use crate::error::{Error, Result};
use crate::poll::poll_until;

/// NBD server implementation found on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdServer {
    /// `nbdkit` with its file plugin
    Nbdkit,
    /// `qemu-nbd`
    QemuNbd,
}

impl NbdServer {
    /// Find a usable NBD server on the host, preferring nbdkit
    pub async fn detect(shell: &dyn Shell) -> Result<Self> {
        let nbdkit = "command -v nbdkit >/dev/null 2>&1 && nbdkit file --version >/dev/null 2>&1";
        if shell.status(nbdkit).await? == Some(0) {
            return Ok(NbdServer::Nbdkit);
        }
        if shell.status("command -v qemu-nbd >/dev/null 2>&1").await? == Some(0) {
            debug!(host = shell.host(), "nbdkit file plugin unavailable, using qemu-nbd");
            return Ok(NbdServer::QemuNbd);
        }
        Err(Error::ToolUnavailable {
            host: shell.host().to_string(),
            tools: "nbdkit (with the file plugin), qemu-nbd".to_string(),
        })
    }

    /// Command starting a daemonized read-only export of `device` on localhost
    pub fn start_command(&self, port: u16, export_name: &str, device: &str) -> String {
        let name = shell_escape(export_name);
        let device = shell_escape(device);
        match self {
            NbdServer::Nbdkit => format!(
                "nbdkit --readonly --ipaddr 127.0.0.1 --port {port} --exportname {name} file file={device}"
            ),
            NbdServer::QemuNbd => format!(
                "qemu-nbd --read-only --bind 127.0.0.1 --port {port} --export-name {name} \
                 --persistent --fork --format raw {device}"
            ),
        }
    }

    /// Start an export and return its URL
    pub async fn start(
        &self,
        shell: &dyn Shell,
        port: u16,
        export_name: &str,
        device: &str,
    ) -> Result<String> {
        let result = shell
            .run(&self.start_command(port, export_name, device))
            .await?;
        if !result.success() {
            return Err(Error::CommandFailed {
                what: format!("{self:?} export of {device}"),
                host: shell.host().to_string(),
                code: result.code(),
                output: result.output,
            });
        }
        let url = nbd_url(port, export_name);
        info!(host = shell.host(), %device, %url, server = ?self, "export started");
        Ok(url)
    }
}

/// NBD URL of an export on localhost
pub fn nbd_url(port: u16, export_name: &str) -> String {
    format!("nbd://127.0.0.1:{port}/{export_name}")
}

/// Poll `qemu-img info` on `url` until the export answers
pub async fn wait_ready(shell: &dyn Shell, url: &str, timeouts: &Timeouts) -> Result<()> {
    let script = format!("qemu-img info {}", shell_escape(url));
    let what = format!("{url} to answer on {}", shell.host());
    poll_until(&what, timeouts.poll_interval, timeouts.operation, || {
        let script = &script;
        async move { Ok((shell.status(script).await? == Some(0)).then_some(())) }
    })
    .await?;
    debug!(host = shell.host(), %url, "export ready");
    Ok(())
}

/// Kill every process whose command line contains `tag`
///
/// The pattern is written so it does not match the shell running pkill.
pub async fn kill_tagged(shell: &dyn Shell, tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let Some(first) = chars.next() else {
        return Ok(());
    };
    let pattern = format!("[{first}]{}", chars.as_str());
    let script = format!("pkill -f {}", shell_escape(&pattern));
    let result = shell.run(&script).await?;
    match result.code() {
        Some(0) => {
            info!(host = shell.host(), %tag, "killed tagged processes");
            Ok(())
        }
        Some(1) => Ok(()),
        code => Err(Error::CommandFailed {
            what: format!("pkill for {tag}"),
            host: shell.host().to_string(),
            code,
            output: result.output,
        }),
    }
}
