//! # Volume transfer
//!
//! Moves a VM's disks between two clouds through a pair of conversion hosts
//! reached over SSH. The source side exposes each volume as an NBD export,
//! the destination side pulls the exports through an SSH tunnel and copies
//! them onto freshly created volumes with `qemu-img`.
//!
//! Concurrent migrations sharing a conversion host coordinate only through
//! lock files and a port registry kept on that host.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use command_executor::{SshConfig, SshShell};
//! use volume_transfer::{
//!     CleanupOrchestrator, CloudDriver, ConversionHost, EngineConfig, ExportOrchestrator,
//!     ExportRequest,
//! };
//!
//! # async fn example(cloud: Arc<dyn CloudDriver>) -> anyhow::Result<()> {
//! let shell = Arc::new(SshShell::new(
//!     SshConfig::new("10.0.0.5").with_user("cloud-user").with_identity_file("/keys/src"),
//! ));
//! let host = ConversionHost::new(shell, "conversion-host-id");
//! let config = EngineConfig::default();
//!
//! let mut export = ExportOrchestrator::new(cloud.clone(), host.clone(), config.clone());
//! let request = ExportRequest {
//!     server_id: "vm-id".to_string(),
//!     expected_volume_ids: vec!["vol-1".to_string()],
//!     boot_disk_copy: true,
//! };
//! if let Err(e) = export.run(&request).await {
//!     CleanupOrchestrator::new(cloud, host, config)
//!         .cleanup_source("vm-id", export.transfer_uuid(), export.mapping())
//!         .await?;
//!     return Err(e.into());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod cleanup;
pub mod cloud;
pub mod config;
pub mod error;
pub mod export;
pub mod host;
pub mod lock;
pub mod mapping;
pub mod nbd;
pub mod poll;
pub mod ports;
pub mod progress;
pub mod transfer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use cleanup::CleanupOrchestrator;
pub use cloud::{
    AttachmentRecord, CloudDriver, CloudError, CloudResult, Image, Server, Volume, VolumeRequest,
    VolumeSource,
};
pub use config::{EngineConfig, PortSettings, RemotePaths, Timeouts};
pub use error::{Error, Result, Stage};
pub use export::{ExportOrchestrator, ExportOutcome, ExportRequest};
pub use host::ConversionHost;
pub use lock::AdvisoryLock;
pub use mapping::{BOOT_DEVICE, BlockDeviceMapping, VolumeEntry, VolumeMapping, VolumeParams};
pub use nbd::NbdServer;
pub use ports::PortAllocator;
pub use progress::ProgressFile;
pub use transfer::{TransferOrchestrator, TransferOutcome, TransferRequest, TunnelTarget};
