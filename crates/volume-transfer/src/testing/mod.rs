//! Test doubles for the engine: an in-memory cloud and a simulated
//! conversion host
//!
//! Only available with the `test-utils` feature.

mod cloud;
mod host;

pub use cloud::{CloudCall, MockCloud};
pub use host::{FakeHost, HostBehavior};

use std::path::Path;
use std::time::Duration;

use crate::config::{EngineConfig, PortSettings, RemotePaths, Timeouts};

/// Engine configuration with every remote path under `dir` and short timeouts
pub fn test_config(dir: &Path) -> EngineConfig {
    let path = |name: &str| dir.join(name).display().to_string();
    EngineConfig {
        timeouts: Timeouts {
            operation: Duration::from_secs(5),
            lock: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        },
        paths: RemotePaths {
            port_registry: path("ports.json"),
            port_lock: path("ports.lock"),
            source_attach_lock: path("source-volume.lock"),
            destination_attach_lock: path("destination-volume.lock"),
            work_dir: dir.display().to_string(),
        },
        ports: PortSettings {
            start: 50000,
            end: 50099,
            probe_template: "exit 124 # {port}".to_string(),
        },
        progress_file: None,
    }
}
