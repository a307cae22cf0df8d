//! Environment variable resolution
//!
//! String values may contain `${VAR}` or `${VAR:-default}`. Variables are
//! looked up in the [`ResolutionContext`] first, then in the process
//! environment.

use crate::{Config, ConfigError, HostConfig, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static ENV_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env reference pattern is valid"));

/// Context for resolving variables
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    /// Environment variables (can be overridden)
    pub env_vars: HashMap<String, String>,
}

impl ResolutionContext {
    /// Create a context seeded with the process environment
    pub fn new() -> Self {
        Self {
            env_vars: std::env::vars().collect(),
        }
    }

    /// Add or update an environment variable
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env_vars.insert(key.into(), value.into());
    }
}

/// Resolve all variables in a string
pub fn resolve_string(input: &str, context: &ResolutionContext) -> Result<String> {
    let mut result = input.to_string();
    let mut missing = Vec::new();

    for cap in ENV_REF.captures_iter(input) {
        let full_match = &cap[0];
        let expr = &cap[1];

        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };

        if let Some(value) = context.env_vars.get(name) {
            result = result.replace(full_match, value);
        } else if let Ok(value) = std::env::var(name) {
            result = result.replace(full_match, &value);
        } else if let Some(default) = default {
            result = result.replace(full_match, default);
        } else {
            missing.push(name.to_string());
        }
    }

    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }
    Ok(result)
}

fn resolve_opt(value: &Option<String>, context: &ResolutionContext) -> Result<Option<String>> {
    value
        .as_deref()
        .map(|v| resolve_string(v, context))
        .transpose()
}

fn resolve_host(host: &HostConfig, context: &ResolutionContext) -> Result<HostConfig> {
    Ok(HostConfig {
        address: resolve_string(&host.address, context)?,
        user: resolve_string(&host.user, context)?,
        ssh_key: resolve_string(&host.ssh_key, context)?,
        ssh_port: host.ssh_port,
        server_id: resolve_string(&host.server_id, context)?,
        sudo: host.sudo,
        tunnel_address: resolve_opt(&host.tunnel_address, context)?,
    })
}

/// Resolve every string value of a configuration
pub fn resolve_config(config: &Config, context: &ResolutionContext) -> Result<Config> {
    let mut resolved = config.clone();
    resolved.source = resolve_host(&config.source, context)?;
    resolved.destination = resolve_host(&config.destination, context)?;

    let settings = &mut resolved.settings;
    settings.port_probe = resolve_string(&settings.port_probe, context)?;
    settings.port_registry = resolve_string(&settings.port_registry, context)?;
    settings.port_lock = resolve_string(&settings.port_lock, context)?;
    settings.source_attach_lock = resolve_string(&settings.source_attach_lock, context)?;
    settings.destination_attach_lock =
        resolve_string(&settings.destination_attach_lock, context)?;
    settings.work_dir = resolve_string(&settings.work_dir, context)?;
    settings.progress_file = resolve_opt(&settings.progress_file, context)?;

    Ok(resolved)
}

/// Names of all variables referenced by a string
pub fn find_env_references(input: &str) -> Vec<String> {
    ENV_REF
        .captures_iter(input)
        .map(|cap| match cap[1].split_once(":-") {
            Some((name, _)) => name.to_string(),
            None => cap[1].to_string(),
        })
        .collect()
}
