//! Engine configuration: timeouts, remote file locations and the port range
//!
//! Ceilings and intervals are explicit parameters so that every polling loop
//! in the engine can be traced back to a value set here.

use std::path::PathBuf;
use std::time::Duration;

/// Default port registry file on a conversion host
pub const DEFAULT_PORT_REGISTRY: &str = "/var/run/v2v-migration-ports";
/// Default lock guarding the port registry
pub const DEFAULT_PORT_LOCK: &str = "/var/lock/v2v-migration-lock";
/// Default lock serializing attach/detach on the source conversion host
pub const DEFAULT_SOURCE_ATTACH_LOCK: &str = "/var/lock/v2v-source-volume-lock";
/// Default lock serializing attach/detach on the destination conversion host
pub const DEFAULT_DESTINATION_ATTACH_LOCK: &str = "/var/lock/v2v-destination-volume-lock";
/// Default scratch directory for tunnel keys and overlays
pub const DEFAULT_WORK_DIR: &str = "/tmp";

/// First port of the default ephemeral range
pub const DEFAULT_PORT_START: u16 = 49152;
/// Last port of the default ephemeral range
pub const DEFAULT_PORT_END: u16 = 65535;

/// Bounded listen used to probe a port. `{port}` is substituted.
///
/// The probe exits with 124 when `timeout` expires, which means the listen
/// was still up after one second and nothing else holds the port. An
/// immediate exit means the bind failed.
pub const DEFAULT_PROBE_TEMPLATE: &str = "timeout 1 nc -l 127.0.0.1 {port}";

/// Exit code of `timeout(1)` when the deadline expired
pub const PROBE_FREE_EXIT_CODE: i32 = 124;

/// Polling ceilings and cadence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Ceiling for cloud operations and readiness/attach polling
    pub operation: Duration,
    /// Ceiling for acquiring an advisory lock
    pub lock: Duration,
    /// Fixed polling cadence
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            operation: Duration::from_secs(1800),
            lock: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Remote file locations shared with concurrent migrations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePaths {
    /// JSON array of claimed ports
    pub port_registry: String,
    /// Lock guarding the port registry
    pub port_lock: String,
    /// Attach/detach lock on the source conversion host
    pub source_attach_lock: String,
    /// Attach/detach lock on the destination conversion host
    pub destination_attach_lock: String,
    /// Scratch directory for tunnel keys and overlays
    pub work_dir: String,
}

impl Default for RemotePaths {
    fn default() -> Self {
        Self {
            port_registry: DEFAULT_PORT_REGISTRY.to_string(),
            port_lock: DEFAULT_PORT_LOCK.to_string(),
            source_attach_lock: DEFAULT_SOURCE_ATTACH_LOCK.to_string(),
            destination_attach_lock: DEFAULT_DESTINATION_ATTACH_LOCK.to_string(),
            work_dir: DEFAULT_WORK_DIR.to_string(),
        }
    }
}

/// Port range and probe used by the port allocator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    /// First port of the range, inclusive
    pub start: u16,
    /// Last port of the range, inclusive
    pub end: u16,
    /// Probe command template, see [`DEFAULT_PROBE_TEMPLATE`]
    pub probe_template: String,
}

impl PortSettings {
    /// Probe command for `port`
    pub fn probe_command(&self, port: u16) -> String {
        self.probe_template.replace("{port}", &port.to_string())
    }
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_START,
            end: DEFAULT_PORT_END,
            probe_template: DEFAULT_PROBE_TEMPLATE.to_string(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Polling ceilings and cadence
    pub timeouts: Timeouts,
    /// Remote file locations
    pub paths: RemotePaths,
    /// Port range and probe
    pub ports: PortSettings,
    /// Optional local progress file rewritten on every progress update
    pub progress_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.timeouts.operation, Duration::from_secs(1800));
        assert_eq!(config.timeouts.lock, Duration::from_secs(600));
        assert_eq!(config.ports.start, 49152);
        assert_eq!(config.ports.end, 65535);
        assert_eq!(config.paths.port_registry, "/var/run/v2v-migration-ports");
        assert!(config.progress_file.is_none());
    }

    #[test]
    fn test_probe_command() {
        let ports = PortSettings::default();
        assert_eq!(ports.probe_command(50000), "timeout 1 nc -l 127.0.0.1 50000");
    }
}
