//! Simulated conversion host
//!
//! Storage and NBD tooling are simulated: the block device list follows the
//! attachments recorded in [`MockCloud`], and exports, `qemu-img` and
//! `virt-sparsify` answer without touching any disk. Everything else (lock
//! files, the port registry, key copies) runs for real through a local
//! shell, so tests point the remote paths at a temporary directory.

use async_trait::async_trait;
use command_executor::{ExitResult, ExitStatus, LocalShell, Result, Shell, SpawnedProcess};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::MockCloud;
use crate::host::LIST_BLOCK_DEVICES;

/// Knobs for the simulated host
#[derive(Debug, Clone)]
pub struct HostBehavior {
    /// nbdkit with the file plugin is installed
    pub nbdkit: bool,
    /// qemu-nbd is installed
    pub qemu_nbd: bool,
    /// virt-sparsify exits non-zero
    pub sparsify_fails: bool,
    /// Exit code of `qemu-img convert`
    pub convert_exit_code: i32,
    /// Device that shows up alongside any attached volume
    pub extra_device: Option<String>,
    /// Attached volumes never show up in the guest
    pub hide_attached: bool,
    /// `qemu-img info` never reaches the export
    pub exports_unreachable: bool,
}

impl Default for HostBehavior {
    fn default() -> Self {
        Self {
            nbdkit: true,
            qemu_nbd: true,
            sparsify_fails: false,
            convert_exit_code: 0,
            extra_device: None,
            hide_attached: false,
            exports_unreachable: false,
        }
    }
}

/// A conversion host whose block devices mirror a [`MockCloud`] server
pub struct FakeHost {
    name: String,
    server_id: String,
    cloud: Arc<MockCloud>,
    local: LocalShell,
    behavior: Mutex<HostBehavior>,
    scripts: Mutex<Vec<String>>,
}

impl FakeHost {
    /// Simulate the conversion host `server_id` of `cloud`
    pub fn new(name: &str, server_id: &str, cloud: Arc<MockCloud>) -> Self {
        Self {
            name: name.to_string(),
            server_id: server_id.to_string(),
            cloud,
            local: LocalShell::new().with_name(name),
            behavior: Mutex::new(HostBehavior::default()),
            scripts: Mutex::new(Vec::new()),
        }
    }

    /// Change the host's behavior
    pub fn configure(&self, change: impl FnOnce(&mut HostBehavior)) {
        change(&mut self.behavior.lock().unwrap());
    }

    /// Every script run or spawned so far
    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    /// Scripts starting with `prefix`
    pub fn scripts_starting_with(&self, prefix: &str) -> Vec<String> {
        self.scripts()
            .into_iter()
            .filter(|s| s.starts_with(prefix))
            .collect()
    }

    fn behavior(&self) -> HostBehavior {
        self.behavior.lock().unwrap().clone()
    }

    fn block_devices(&self) -> String {
        let behavior = self.behavior();
        let attached = self.cloud.attached_devices(&self.server_id);
        let mut devices = vec!["/dev/vda".to_string()];
        if !behavior.hide_attached {
            devices.extend(attached.iter().cloned());
        }
        if let Some(extra) = behavior.extra_device {
            if !attached.is_empty() {
                devices.push(extra);
            }
        }
        devices.join("\n") + "\n"
    }

    /// Answer for a simulated tool, or `None` to run the script locally
    fn simulate(&self, script: &str) -> Option<ExitResult> {
        let behavior = self.behavior();
        let (code, stdout) = if script == LIST_BLOCK_DEVICES {
            (0, self.block_devices())
        } else if script.starts_with("command -v nbdkit") {
            (if behavior.nbdkit { 0 } else { 1 }, String::new())
        } else if script.starts_with("command -v qemu-nbd") {
            (if behavior.qemu_nbd { 0 } else { 1 }, String::new())
        } else if script.starts_with("qemu-img info ") {
            if behavior.exports_unreachable {
                (1, "qemu-img: Could not open 'nbd://127.0.0.1': Failed to connect\n".to_string())
            } else {
                (0, String::new())
            }
        } else if script.starts_with("nbdkit ")
            || script.starts_with("qemu-nbd ")
            || script.starts_with("qemu-img create ")
        {
            (0, String::new())
        } else if script.contains("virt-sparsify") {
            if behavior.sparsify_fails {
                (1, "virt-sparsify: error: libguestfs error: appliance closed\n".to_string())
            } else {
                (0, String::new())
            }
        } else if script.starts_with("pkill -f ") {
            (1, String::new())
        } else if script.starts_with("timeout 1 nc ") {
            (124, String::new())
        } else {
            return None;
        };

        Some(ExitResult {
            status: ExitStatus::from_code(code),
            output: stdout.clone(),
            stdout,
            stderr: String::new(),
        })
    }

    fn record(&self, script: &str) {
        self.scripts.lock().unwrap().push(script.to_string());
    }
}

#[async_trait]
impl Shell for FakeHost {
    fn host(&self) -> &str {
        &self.name
    }

    async fn run(&self, script: &str) -> Result<ExitResult> {
        self.record(script);
        match self.simulate(script) {
            Some(result) => Ok(result),
            None => self.local.run(script).await,
        }
    }

    async fn spawn(&self, script: &str) -> Result<SpawnedProcess> {
        self.record(script);
        if script.contains("qemu-img convert") {
            let code = self.behavior().convert_exit_code;
            let failure = if code == 0 {
                ""
            } else {
                "echo 'qemu-img: error while reading sector 2048: Input/output error'; "
            };
            let fake = format!(
                "printf '    (0.00/100%%)\\n    (25.00/100%%)\\n    (50.00/100%%)\\n    (75.50/100%%)\\n'; {failure}exit {code}"
            );
            return self.local.spawn(&fake).await;
        }
        if script.starts_with("ssh -N ") {
            return self.local.spawn("exec sleep 600").await;
        }
        self.local.spawn(script).await
    }

    async fn copy_to(&self, local: &Path, remote: &str) -> Result<()> {
        self.local.copy_to(local, remote).await
    }

    async fn copy_from(&self, remote: &str, local: &Path) -> Result<()> {
        self.local.copy_from(remote, local).await
    }
}
