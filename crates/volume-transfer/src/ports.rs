//! Shared TCP port registry on a conversion host
//!
//! Every migration using a host claims its NBD ports in a JSON array of
//! integers kept on that host. The registry is only read or written while
//! holding the port lock, and always re-read after the lock is taken.
//! Because the registry cannot see listeners started outside this engine,
//! each candidate is also probed on the host before it is handed out.

use command_executor::{Shell, shell_escape};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::{EngineConfig, PROBE_FREE_EXIT_CODE, PortSettings};
use crate::error::{Error, Result};
use crate::lock::AdvisoryLock;

/// Exit code of the registry read when the file does not exist
const REGISTRY_MISSING_EXIT_CODE: i32 = 3;

/// Allocates ports from the registry on one host
#[derive(Clone)]
pub struct PortAllocator {
    shell: Arc<dyn Shell>,
    registry: String,
    lock: AdvisoryLock,
    settings: PortSettings,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("host", &self.shell.host())
            .field("registry", &self.registry)
            .field("range", &(self.settings.start..=self.settings.end))
            .finish()
    }
}

impl PortAllocator {
    /// Create an allocator for the shell's host
    pub fn new(shell: Arc<dyn Shell>, config: &EngineConfig) -> Self {
        let lock = AdvisoryLock::new(
            shell.clone(),
            config.paths.port_lock.clone(),
            config.timeouts.lock,
            config.timeouts.poll_interval,
        );
        Self {
            shell,
            registry: config.paths.port_registry.clone(),
            lock,
            settings: config.ports.clone(),
        }
    }

    /// Claim a port that is free in the registry and on the host
    #[instrument(skip(self), fields(host = self.shell.host()))]
    pub async fn allocate(&self) -> Result<u16> {
        self.lock.with_lock(self.allocate_locked()).await
    }

    /// Return `ports` to the pool; ports not in the registry are ignored
    #[instrument(skip(self), fields(host = self.shell.host()))]
    pub async fn release(&self, ports: &[u16]) -> Result<()> {
        if ports.is_empty() {
            return Ok(());
        }
        self.lock.with_lock(self.release_locked(ports)).await
    }

    /// Shell of the host the registry lives on
    pub fn shell(&self) -> &Arc<dyn Shell> {
        &self.shell
    }

    /// Ports currently claimed in the registry
    pub async fn claimed(&self) -> Result<BTreeSet<u16>> {
        self.lock.with_lock(self.read_registry()).await
    }

    async fn allocate_locked(&self) -> Result<u16> {
        let mut used = self.read_registry().await?;
        let mut busy = BTreeSet::new();
        let mut candidates: Vec<u16> = (self.settings.start..=self.settings.end)
            .filter(|port| !used.contains(port))
            .collect();

        while let Some(port) = candidates.pop() {
            if !self.probe(port).await? {
                debug!(port, "port in use on host, skipping");
                busy.insert(port);
                continue;
            }
            used.insert(port);
            self.write_registry(&used).await?;
            info!(port, "allocated port");
            return Ok(port);
        }

        warn!(skipped = busy.len(), "port range exhausted");
        Err(Error::PortsExhausted {
            start: self.settings.start,
            end: self.settings.end,
        })
    }

    async fn release_locked(&self, ports: &[u16]) -> Result<()> {
        let mut used = self.read_registry().await?;
        let before = used.len();
        for port in ports {
            if !used.remove(port) {
                debug!(port, "port not in registry");
            }
        }
        if used.len() != before {
            self.write_registry(&used).await?;
            info!(?ports, "released ports");
        }
        Ok(())
    }

    /// A port is free when the bounded listen is still up at its deadline
    async fn probe(&self, port: u16) -> Result<bool> {
        let code = self.shell.status(&self.settings.probe_command(port)).await?;
        Ok(code == Some(PROBE_FREE_EXIT_CODE))
    }

    /// Claimed ports; a missing or garbled registry starts over empty
    async fn read_registry(&self) -> Result<BTreeSet<u16>> {
        let path = shell_escape(&self.registry);
        let script = format!("[ -e {path} ] || exit {REGISTRY_MISSING_EXIT_CODE}; cat {path}");
        let result = self.shell.run(&script).await?;
        match result.code() {
            Some(0) => {}
            Some(REGISTRY_MISSING_EXIT_CODE) => {
                debug!(path = %self.registry, "no port registry yet");
                return self.reset_registry().await;
            }
            code => {
                return Err(Error::CommandFailed {
                    what: format!("reading port registry {}", self.registry),
                    host: self.shell.host().to_string(),
                    code,
                    output: result.output.trim().to_string(),
                });
            }
        }
        match serde_json::from_str::<Vec<u16>>(result.stdout.trim()) {
            Ok(ports) => Ok(ports.into_iter().collect()),
            Err(e) => {
                warn!(path = %self.registry, error = %e, "port registry unparsable, resetting");
                self.reset_registry().await
            }
        }
    }

    async fn reset_registry(&self) -> Result<BTreeSet<u16>> {
        let empty = BTreeSet::new();
        self.write_registry(&empty).await?;
        Ok(empty)
    }

    async fn write_registry(&self, ports: &BTreeSet<u16>) -> Result<()> {
        let json = serde_json::to_string(&ports.iter().collect::<Vec<_>>())?;
        let path = shell_escape(&self.registry);
        let tmp = shell_escape(&format!("{}.tmp", self.registry));
        let script = format!("printf '%s\\n' {} > {tmp} && mv -f {tmp} {path}", shell_escape(&json));
        self.shell.run_checked(&script).await?;
        Ok(())
    }
}
