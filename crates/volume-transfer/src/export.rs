//! Source side of a migration: expose the VM's disks as NBD exports
//!
//! Stages run strictly in order and each one must fully succeed before the
//! next starts. Whatever was built before a failure stays readable through
//! [`ExportOrchestrator::transfer_uuid`] and [`ExportOrchestrator::mapping`]
//! so the cleanup can undo it.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cloud::{CloudDriver, SERVER_SHUTOFF, Server, VolumeRequest, VolumeSource};
use crate::config::EngineConfig;
use crate::error::{Error, Result, Stage};
use crate::host::{ConversionHost, detach_confirmed};
use crate::lock::AdvisoryLock;
use crate::mapping::{BOOT_DEVICE, VolumeEntry, VolumeMapping};
use crate::nbd::{self, NbdServer};
use crate::ports::PortAllocator;

/// What to export
#[derive(Debug, Clone)]
pub struct ExportRequest {
    /// Source VM
    pub server_id: String,
    /// Volume ids recorded when the VM's metadata was exported
    pub expected_volume_ids: Vec<String>,
    /// Copy the boot disk of a VM booted from an image
    pub boot_disk_copy: bool,
}

/// Result of a successful export
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    /// Export name and process tag of this migration
    pub transfer_uuid: String,
    /// Mapping with export ports and URLs filled in
    pub mapping: VolumeMapping,
}

/// Drives the source side of one migration
pub struct ExportOrchestrator {
    cloud: Arc<dyn CloudDriver>,
    host: ConversionHost,
    config: EngineConfig,
    ports: PortAllocator,
    attach_lock: AdvisoryLock,
    transfer_uuid: String,
    mapping: VolumeMapping,
}

impl ExportOrchestrator {
    /// Create an orchestrator with a fresh transfer uuid
    pub fn new(cloud: Arc<dyn CloudDriver>, host: ConversionHost, config: EngineConfig) -> Self {
        let ports = PortAllocator::new(host.shell().clone(), &config);
        let attach_lock = AdvisoryLock::new(
            host.shell().clone(),
            config.paths.source_attach_lock.clone(),
            config.timeouts.lock,
            config.timeouts.poll_interval,
        );
        Self {
            cloud,
            host,
            config,
            ports,
            attach_lock,
            transfer_uuid: Uuid::new_v4().to_string(),
            mapping: VolumeMapping::new(),
        }
    }

    /// Export name and process tag of this migration
    pub fn transfer_uuid(&self) -> &str {
        &self.transfer_uuid
    }

    /// Mapping as built so far
    pub fn mapping(&self) -> &VolumeMapping {
        &self.mapping
    }

    /// Run every export stage
    #[instrument(skip_all, fields(server = %request.server_id, uuid = %self.transfer_uuid))]
    pub async fn run(&mut self, request: &ExportRequest) -> Result<ExportOutcome> {
        info!("starting export");
        self.host
            .shell()
            .self_test()
            .await
            .map_err(|e| Error::from(e).in_stage(Stage::SelfTest))?;

        let server = self
            .check_power_state(&request.server_id)
            .await
            .map_err(|e| e.in_stage(Stage::Precondition))?;
        self.discover(&server)
            .await
            .map_err(|e| e.in_stage(Stage::Discover))?;
        self.validate(&request.expected_volume_ids)
            .map_err(|e| e.in_stage(Stage::Validate))?;
        self.prepare_volumes(&server, request.boot_disk_copy)
            .await
            .map_err(|e| e.in_stage(Stage::PrepareVolumes))?;
        self.attach_all()
            .await
            .map_err(|e| e.in_stage(Stage::AttachSource))?;
        self.export_all()
            .await
            .map_err(|e| e.in_stage(Stage::Export))?;

        info!(volumes = self.mapping.len(), "export complete");
        Ok(ExportOutcome {
            transfer_uuid: self.transfer_uuid.clone(),
            mapping: self.mapping.clone(),
        })
    }

    async fn check_power_state(&self, server_id: &str) -> Result<Server> {
        let server = self.cloud.get_server(server_id).await?;
        if server.status != SERVER_SHUTOFF {
            return Err(Error::Precondition(format!(
                "server {} ({}) is {}, it must be {SERVER_SHUTOFF}",
                server.name, server.id, server.status
            )));
        }
        Ok(server)
    }

    async fn discover(&mut self, server: &Server) -> Result<()> {
        for attachment in self.cloud.server_volumes(&server.id).await? {
            let volume = self.cloud.get_volume(&attachment.volume_id).await?;
            let key = if server.root_device_name.as_deref() == Some(attachment.device.as_str()) {
                BOOT_DEVICE.to_string()
            } else {
                attachment.device.clone()
            };
            let entry = VolumeEntry::new(&volume.id, &volume.name, volume.size_gb, volume.bootable)?
                .with_params(volume.params());
            debug!(device = %key, volume = %volume.id, size_gb = volume.size_gb, "discovered volume");
            self.mapping.insert(key, entry)?;
        }
        Ok(())
    }

    fn validate(&self, expected: &[String]) -> Result<()> {
        let found: BTreeSet<String> = self.mapping.source_volume_ids().into_iter().collect();
        let expected: BTreeSet<String> = expected.iter().cloned().collect();
        if found == expected {
            return Ok(());
        }
        let missing: Vec<_> = expected.difference(&found).cloned().collect();
        let unexpected: Vec<_> = found.difference(&expected).cloned().collect();
        Err(Error::Precondition(format!(
            "attached volumes differ from the recorded ones (missing: [{}], unexpected: [{}])",
            missing.join(", "),
            unexpected.join(", ")
        )))
    }

    async fn prepare_volumes(&mut self, server: &Server, boot_disk_copy: bool) -> Result<()> {
        if server.boots_from_image() {
            if boot_disk_copy {
                self.copy_image_boot_disk(server).await?;
            } else {
                info!("server boots from an image and boot disk copy is off, skipping boot disk");
            }
        } else {
            self.copy_boot_volume().await?;
        }

        let data: Vec<String> = self
            .mapping
            .iter()
            .filter(|(device, _)| device.as_str() != BOOT_DEVICE)
            .map(|(_, entry)| entry.source_volume_id.clone())
            .collect();
        for volume_id in data {
            detach_confirmed(
                self.cloud.as_ref(),
                &server.id,
                &volume_id,
                &self.config.timeouts,
            )
            .await?;
        }
        Ok(())
    }

    /// Replace the boot volume in the mapping with a copy made from a snapshot
    async fn copy_boot_volume(&mut self) -> Result<()> {
        let timeout = self.config.timeouts.operation;
        let (original, request_base) = {
            let entry = self.mapping.get(BOOT_DEVICE).ok_or_else(|| {
                Error::Inconsistency(format!(
                    "server boots from a volume but nothing is attached at {BOOT_DEVICE}"
                ))
            })?;
            (entry.source_volume_id.clone(), entry.clone())
        };

        let snapshot_name = format!("{}-boot-snapshot", self.transfer_uuid);
        let snapshot_id = self
            .cloud
            .create_volume_snapshot(&original, &snapshot_name, timeout)
            .await?;

        let request = VolumeRequest {
            name: format!("{}-boot-copy", self.transfer_uuid),
            size_gb: request_base.size_gb,
            bootable: true,
            source: VolumeSource::Snapshot(snapshot_id.clone()),
            params: request_base.volume_params.clone().unwrap_or_default(),
        };
        let copy = match self.cloud.create_volume(&request, timeout).await {
            Ok(volume) => volume,
            Err(e) => {
                if let Err(cleanup) = self.cloud.delete_volume_snapshot(&snapshot_id, timeout).await {
                    warn!(snapshot = %snapshot_id, error = %cleanup, "failed to remove boot snapshot");
                }
                return Err(e.into());
            }
        };

        if let Some(entry) = self.mapping.get_mut(BOOT_DEVICE) {
            entry.source_volume_id = copy.id.clone();
            entry.snapshot_id = Some(snapshot_id);
        }
        info!(original = %original, copy = %copy.id, "boot volume copied from snapshot");
        Ok(())
    }

    /// Add a boot volume made from an image snapshot of the server
    async fn copy_image_boot_disk(&mut self, server: &Server) -> Result<()> {
        if server.root_disk_gb == 0 {
            return Err(Error::Precondition(format!(
                "server {} has no root disk size to copy its boot disk into",
                server.id
            )));
        }
        let timeout = self.config.timeouts.operation;
        let image_name = format!("{}-boot-image", self.transfer_uuid);
        let image_id = self
            .cloud
            .create_server_image(&server.id, &image_name, timeout)
            .await?;

        let request = VolumeRequest {
            name: format!("{}-boot", server.name),
            size_gb: server.root_disk_gb,
            bootable: true,
            source: VolumeSource::Image(image_id.clone()),
            params: Default::default(),
        };
        let volume = match self.cloud.create_volume(&request, timeout).await {
            Ok(volume) => volume,
            Err(e) => {
                if let Err(cleanup) = self.cloud.delete_image(&image_id).await {
                    warn!(image = %image_id, error = %cleanup, "failed to remove boot image");
                }
                return Err(e.into());
            }
        };

        let mut entry = match VolumeEntry::new(&volume.id, &volume.name, volume.size_gb, true) {
            Ok(entry) => entry,
            Err(e) => {
                if let Err(cleanup) = self.cloud.delete_volume(&volume.id, timeout).await {
                    warn!(volume = %volume.id, error = %cleanup, "failed to remove boot volume");
                }
                if let Err(cleanup) = self.cloud.delete_image(&image_id).await {
                    warn!(image = %image_id, error = %cleanup, "failed to remove boot image");
                }
                return Err(e);
            }
        };
        entry.image_id = Some(image_id);
        self.mapping.insert(BOOT_DEVICE, entry)?;
        info!(volume = %volume.id, "boot disk copied from server image");
        Ok(())
    }

    async fn attach_all(&mut self) -> Result<()> {
        let cloud = self.cloud.clone();
        let host = &self.host;
        let timeouts = &self.config.timeouts;
        let mapping = &mut self.mapping;

        self.attach_lock
            .with_lock(async move {
                for (device, entry) in mapping.iter_mut() {
                    let guest = host
                        .attach_volume(cloud.as_ref(), &entry.source_volume_id, timeouts)
                        .await?;
                    debug!(%device, %guest, "mapped source device");
                    entry.source_device_path = Some(guest);
                }
                Ok(())
            })
            .await
    }

    async fn export_all(&mut self) -> Result<()> {
        let shell = self.host.shell().clone();
        let server = NbdServer::detect(shell.as_ref()).await?;

        let keys: Vec<String> = self.mapping.keys().cloned().collect();
        for key in keys {
            let port = self.ports.allocate().await?;
            let Some(entry) = self.mapping.get_mut(&key) else {
                continue;
            };
            entry.export_port = Some(port);

            let device = entry.source_device_path.clone().ok_or_else(|| {
                Error::Inconsistency(format!("{key} has no device on {}", shell.host()))
            })?;
            let url = server
                .start(shell.as_ref(), port, &self.transfer_uuid, &device)
                .await?;
            entry.export_url = Some(url.clone());

            nbd::wait_ready(shell.as_ref(), &url, &self.config.timeouts).await?;
        }
        Ok(())
    }
}
