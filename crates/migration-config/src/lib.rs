//! # Migration Configuration
//!
//! YAML configuration for a volume transfer migration: the two conversion
//! hosts, how to reach them and the engine settings shared by both sides.
//!
//! ```yaml
//! version: "1.0"
//! source:
//!   address: 10.0.0.5
//!   user: cloud-user
//!   ssh_key: ${HOME}/.ssh/conversion
//!   server_id: 6f1c...
//! destination:
//!   address: 10.1.0.7
//!   ssh_key: ${HOME}/.ssh/conversion
//!   server_id: 93be...
//! settings:
//!   operation_timeout: 1800
//!   port_range: { start: 49152, end: 65535 }
//! ```
//!
//! String values may reference environment variables as `${VAR}` or
//! `${VAR:-default}`.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use volume_transfer::config as defaults;

pub mod parser;
pub mod resolver;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse YAML
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Environment variable not found
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Optional migration name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Optional description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Conversion host in the source cloud
    pub source: HostConfig,

    /// Conversion host in the destination cloud
    pub destination: HostConfig,

    /// Engine settings
    #[serde(default)]
    pub settings: Settings,
}

/// A conversion host and how to reach it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Address reachable from the controller
    pub address: String,

    /// Login user
    #[serde(default = "default_user")]
    pub user: String,

    /// Private key accepted by the host
    pub ssh_key: String,

    /// SSH port, if not 22
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,

    /// Server id of the host in its cloud
    pub server_id: String,

    /// Run remote commands through `sudo -n`
    #[serde(default)]
    pub sudo: bool,

    /// Address the other conversion host uses to reach this one,
    /// when it differs from `address`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_address: Option<String>,
}

fn default_user() -> String {
    "cloud-user".to_string()
}

/// Inclusive TCP port range
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    /// First port
    pub start: u16,
    /// Last port
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: defaults::DEFAULT_PORT_START,
            end: defaults::DEFAULT_PORT_END,
        }
    }
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Ceiling for cloud operations and readiness polling, in seconds
    pub operation_timeout: u64,
    /// Ceiling for taking a lock, in seconds
    pub lock_timeout: u64,
    /// Polling cadence, in seconds
    pub poll_interval: u64,
    /// SSH connection setup bound, in seconds
    pub connect_timeout: u64,
    /// Ports handed out for NBD exports and tunnels
    pub port_range: PortRange,
    /// Port probe command, `{port}` is substituted
    pub port_probe: String,
    /// Port registry file on each conversion host
    pub port_registry: String,
    /// Lock guarding the port registry
    pub port_lock: String,
    /// Attach lock on the source conversion host
    pub source_attach_lock: String,
    /// Attach lock on the destination conversion host
    pub destination_attach_lock: String,
    /// Scratch directory on the conversion hosts
    pub work_dir: String,
    /// Local file receiving copy progress
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_file: Option<String>,
    /// Copy the boot disk of VMs booted from an image
    pub boot_disk_copy: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            operation_timeout: 1800,
            lock_timeout: 600,
            poll_interval: 1,
            connect_timeout: 10,
            port_range: PortRange::default(),
            port_probe: defaults::DEFAULT_PROBE_TEMPLATE.to_string(),
            port_registry: defaults::DEFAULT_PORT_REGISTRY.to_string(),
            port_lock: defaults::DEFAULT_PORT_LOCK.to_string(),
            source_attach_lock: defaults::DEFAULT_SOURCE_ATTACH_LOCK.to_string(),
            destination_attach_lock: defaults::DEFAULT_DESTINATION_ATTACH_LOCK.to_string(),
            work_dir: defaults::DEFAULT_WORK_DIR.to_string(),
            progress_file: None,
            boot_disk_copy: false,
        }
    }
}
