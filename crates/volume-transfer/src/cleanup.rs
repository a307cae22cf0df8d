//! Teardown of temporary state on either side of a migration
//!
//! Both procedures work from whatever state a migration reached and can be
//! repeated: resources that are already gone or already in place are
//! skipped. A failing step does not stop the remaining ones; all failures
//! are reported together at the end.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::cloud::CloudDriver;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::host::ConversionHost;
use crate::lock::AdvisoryLock;
use crate::mapping::{BOOT_DEVICE, VolumeEntry, VolumeMapping};
use crate::nbd;
use crate::ports::PortAllocator;

/// Collects failed steps while cleanup carries on
#[derive(Default)]
struct Failures(Vec<String>);

impl Failures {
    fn check<T>(&mut self, step: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(%step, error = %e, "cleanup step failed");
                self.0.push(format!("{step}: {e}"));
                None
            }
        }
    }

    fn finish(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup { failures: self.0 })
        }
    }
}

/// Undoes what an export or transfer left behind on one conversion host
pub struct CleanupOrchestrator {
    cloud: Arc<dyn CloudDriver>,
    host: ConversionHost,
    config: EngineConfig,
}

impl CleanupOrchestrator {
    /// Create a cleanup orchestrator for a conversion host and its cloud
    pub fn new(cloud: Arc<dyn CloudDriver>, host: ConversionHost, config: EngineConfig) -> Self {
        Self {
            cloud,
            host,
            config,
        }
    }

    /// Source side: stop exports, release ports, drop temporary boot disks
    /// and give the data volumes back to the VM
    #[instrument(skip_all, fields(server = %server_id, uuid = %transfer_uuid))]
    pub async fn cleanup_source(
        &self,
        server_id: &str,
        transfer_uuid: &str,
        mapping: &VolumeMapping,
    ) -> Result<()> {
        let shell = self.host.shell().clone();
        let mut failures = Failures::default();

        failures.check(
            "stop exports",
            nbd::kill_tagged(shell.as_ref(), transfer_uuid).await,
        );

        let ports: Vec<u16> = mapping.iter().filter_map(|(_, e)| e.export_port).collect();
        let allocator = PortAllocator::new(shell.clone(), &self.config);
        failures.check("release export ports", allocator.release(&ports).await);

        let lock = AdvisoryLock::new(
            shell.clone(),
            self.config.paths.source_attach_lock.clone(),
            self.config.timeouts.lock,
            self.config.timeouts.poll_interval,
        );
        let detached = lock
            .with_lock(async {
                let mut failures = Failures::default();
                for (device, entry) in mapping.iter() {
                    let step = format!("detach {device} from {}", self.host.name());
                    failures.check(&step, self.detach_from_host(&entry.source_volume_id).await);
                }
                failures.finish()
            })
            .await;
        if let Err(Error::Cleanup { failures: inner }) = detached {
            failures.0.extend(inner);
        } else {
            failures.check("source attach lock", detached);
        }

        if let Some(boot) = mapping.boot() {
            self.remove_boot_copy(boot, &mut failures).await;
        }

        for (device, entry) in mapping.iter() {
            if device == BOOT_DEVICE {
                continue;
            }
            let step = format!("re-attach {device} to {server_id}");
            failures.check(
                &step,
                self.reattach(server_id, &entry.source_volume_id, device).await,
            );
        }

        failures.finish()?;
        info!("source cleanup complete");
        Ok(())
    }

    /// Destination side, after a failed transfer: detach and delete the
    /// destination volumes that nothing else uses
    #[instrument(skip_all)]
    pub async fn cleanup_destination(&self, mapping: &VolumeMapping) -> Result<()> {
        let mut failures = Failures::default();
        let volumes: Vec<(String, String)> = mapping
            .iter()
            .filter_map(|(device, entry)| {
                entry
                    .destination_volume_id()
                    .map(|id| (device.clone(), id.to_string()))
            })
            .collect();

        let lock = AdvisoryLock::new(
            self.host.shell().clone(),
            self.config.paths.destination_attach_lock.clone(),
            self.config.timeouts.lock,
            self.config.timeouts.poll_interval,
        );
        let detached = lock
            .with_lock(async {
                let mut failures = Failures::default();
                for (device, volume_id) in &volumes {
                    let step = format!("detach {device} from {}", self.host.name());
                    failures.check(&step, self.detach_from_host(volume_id).await);
                }
                failures.finish()
            })
            .await;
        if let Err(Error::Cleanup { failures: inner }) = detached {
            failures.0.extend(inner);
        } else {
            failures.check("destination attach lock", detached);
        }

        for (device, volume_id) in &volumes {
            let step = format!("delete destination volume for {device}");
            failures.check(&step, self.delete_unattached(volume_id).await);
        }

        failures.finish()?;
        info!("destination cleanup complete");
        Ok(())
    }

    async fn detach_from_host(&self, volume_id: &str) -> Result<()> {
        let volume = match self.cloud.get_volume(volume_id).await {
            Ok(volume) => volume,
            Err(e) if e.is_not_found() => {
                debug!(volume = volume_id, "volume already gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if volume.attachment_to(self.host.server_id()).is_none() {
            debug!(volume = volume_id, "not attached to conversion host");
            return Ok(());
        }
        self.host
            .detach_volume(self.cloud.as_ref(), volume_id, &self.config.timeouts)
            .await
    }

    /// Delete a volume unless something still has it attached
    async fn delete_unattached(&self, volume_id: &str) -> Result<()> {
        let volume = match self.cloud.get_volume(volume_id).await {
            Ok(volume) => volume,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !volume.attachments.is_empty() {
            let servers: Vec<&str> = volume
                .attachments
                .iter()
                .map(|a| a.server_id.as_str())
                .collect();
            warn!(volume = volume_id, ?servers, "volume still attached, not deleting");
            return Ok(());
        }
        ignore_not_found(
            self.cloud
                .delete_volume(volume_id, self.config.timeouts.operation)
                .await,
        )?;
        info!(volume = volume_id, "volume deleted");
        Ok(())
    }

    async fn remove_boot_copy(&self, boot: &VolumeEntry, failures: &mut Failures) {
        if boot.snapshot_id.is_none() && boot.image_id.is_none() {
            return;
        }
        let timeout = self.config.timeouts.operation;

        failures.check(
            "delete boot volume copy",
            self.delete_unattached(&boot.source_volume_id).await,
        );
        if let Some(snapshot) = &boot.snapshot_id {
            let deleted = self.cloud.delete_volume_snapshot(snapshot, timeout).await;
            if failures.check("delete boot snapshot", ignore_not_found(deleted)).is_some() {
                debug!(%snapshot, "boot snapshot removed");
            }
        }
        if let Some(image) = &boot.image_id {
            let deleted = self.cloud.delete_image(image).await;
            if failures.check("delete boot image", ignore_not_found(deleted)).is_some() {
                debug!(%image, "boot image removed");
            }
        }
    }

    async fn reattach(&self, server_id: &str, volume_id: &str, device: &str) -> Result<()> {
        let volume = self.cloud.get_volume(volume_id).await?;
        if volume.attachment_to(server_id).is_some() {
            debug!(volume = volume_id, "already attached to source VM");
            return Ok(());
        }
        self.cloud
            .attach_volume(
                server_id,
                volume_id,
                Some(device),
                self.config.timeouts.operation,
            )
            .await?;
        info!(volume = volume_id, %device, "volume re-attached to source VM");
        Ok(())
    }
}

fn ignore_not_found(result: crate::cloud::CloudResult<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other.map_err(Error::from),
    }
}
