//! YAML configuration parser and conversion into engine types

use crate::resolver::{ResolutionContext, resolve_config};
use crate::{Config, ConfigError, HostConfig, Result, Settings};
use command_executor::{Shell, SshConfig, SshShell};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use volume_transfer::{
    ConversionHost, EngineConfig, PortSettings, RemotePaths, Timeouts, TunnelTarget,
};

/// Supported configuration version
pub const SUPPORTED_VERSION: &str = "1.0";

/// Parse a configuration file
pub fn parse_file(path: impl AsRef<Path>) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}

/// Parse configuration from a YAML string
pub fn parse_str(content: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse a configuration file and resolve its `${VAR}` references
pub fn load(path: impl AsRef<Path>, context: &ResolutionContext) -> Result<Config> {
    let resolved = resolve_config(&parse_file(path)?, context)?;
    validate_config(&resolved)?;
    Ok(resolved)
}

/// Validate a parsed configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.version != SUPPORTED_VERSION {
        return Err(ConfigError::ValidationError(format!(
            "Unsupported version: {}. Expected {}",
            config.version, SUPPORTED_VERSION
        )));
    }

    validate_host("source", &config.source)?;
    validate_host("destination", &config.destination)?;
    validate_settings(&config.settings)
}

fn validate_host(role: &str, host: &HostConfig) -> Result<()> {
    for (field, value) in [
        ("address", &host.address),
        ("user", &host.user),
        ("ssh_key", &host.ssh_key),
        ("server_id", &host.server_id),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{role} host: {field} must not be empty"
            )));
        }
    }
    if host.ssh_port == Some(0) {
        return Err(ConfigError::ValidationError(format!(
            "{role} host: ssh_port must not be 0"
        )));
    }
    Ok(())
}

fn validate_settings(settings: &Settings) -> Result<()> {
    for (field, value) in [
        ("operation_timeout", settings.operation_timeout),
        ("lock_timeout", settings.lock_timeout),
        ("poll_interval", settings.poll_interval),
        ("connect_timeout", settings.connect_timeout),
    ] {
        if value == 0 {
            return Err(ConfigError::ValidationError(format!(
                "settings: {field} must be greater than 0"
            )));
        }
    }

    let range = settings.port_range;
    if range.start == 0 || range.start > range.end {
        return Err(ConfigError::ValidationError(format!(
            "settings: invalid port range {}-{}",
            range.start, range.end
        )));
    }
    if !settings.port_probe.contains("{port}") {
        return Err(ConfigError::ValidationError(
            "settings: port_probe must contain {port}".to_string(),
        ));
    }
    Ok(())
}

impl Settings {
    /// Engine configuration shared by both conversion hosts
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            timeouts: Timeouts {
                operation: Duration::from_secs(self.operation_timeout),
                lock: Duration::from_secs(self.lock_timeout),
                poll_interval: Duration::from_secs(self.poll_interval),
            },
            paths: RemotePaths {
                port_registry: self.port_registry.clone(),
                port_lock: self.port_lock.clone(),
                source_attach_lock: self.source_attach_lock.clone(),
                destination_attach_lock: self.destination_attach_lock.clone(),
                work_dir: self.work_dir.clone(),
            },
            ports: PortSettings {
                start: self.port_range.start,
                end: self.port_range.end,
                probe_template: self.port_probe.clone(),
            },
            progress_file: self.progress_file.as_ref().map(PathBuf::from),
        }
    }
}

impl HostConfig {
    /// SSH connection settings for reaching the host from the controller
    pub fn ssh_config(&self, connect_timeout: Duration) -> SshConfig {
        let config = SshConfig::new(&self.address)
            .with_user(&self.user)
            .with_identity_file(&self.ssh_key)
            .with_connect_timeout(connect_timeout);
        match self.ssh_port {
            Some(port) => config.with_port(port),
            None => config,
        }
    }

    /// Remote shell on the host
    pub fn shell(&self, connect_timeout: Duration) -> SshShell {
        SshShell::new(self.ssh_config(connect_timeout)).with_sudo(self.sudo)
    }

    /// The host as seen by the migration engine
    pub fn conversion_host(&self, connect_timeout: Duration) -> ConversionHost {
        let shell: Arc<dyn Shell> = Arc::new(self.shell(connect_timeout));
        ConversionHost::new(shell, &self.server_id)
    }

    /// How another conversion host opens a tunnel back to this one
    pub fn tunnel_target(&self, connect_timeout: Duration) -> TunnelTarget {
        TunnelTarget {
            address: self
                .tunnel_address
                .clone()
                .unwrap_or_else(|| self.address.clone()),
            user: self.user.clone(),
            port: self.ssh_port,
            identity_file: PathBuf::from(&self.ssh_key),
            connect_timeout_secs: connect_timeout.as_secs().max(1),
        }
    }
}

impl Config {
    /// SSH connection setup bound
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.connect_timeout)
    }

    /// Source conversion host
    pub fn source_host(&self) -> ConversionHost {
        self.source.conversion_host(self.connect_timeout())
    }

    /// Destination conversion host
    pub fn destination_host(&self) -> ConversionHost {
        self.destination.conversion_host(self.connect_timeout())
    }

    /// Tunnel target the destination host uses to reach the source exports
    pub fn source_tunnel(&self) -> TunnelTarget {
        self.source.tunnel_target(self.connect_timeout())
    }
}
