//! Conversion host: a cloud server reached through a shell
//!
//! Attach and detach go through the cloud API but are confirmed on the host
//! itself. An attach is only accepted when exactly one new block device
//! shows up in the guest.

use command_executor::Shell;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cloud::CloudDriver;
use crate::config::Timeouts;
use crate::error::{Error, Result};
use crate::poll::poll_until;

/// Lists whole block devices by path, one per line
pub const LIST_BLOCK_DEVICES: &str = "lsblk --noheadings --list --paths --nodeps --output NAME";

/// A conversion host: its cloud server id and a shell on it
#[derive(Clone)]
pub struct ConversionHost {
    shell: Arc<dyn Shell>,
    server_id: String,
}

impl std::fmt::Debug for ConversionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionHost")
            .field("host", &self.shell.host())
            .field("server_id", &self.server_id)
            .finish()
    }
}

impl ConversionHost {
    /// Create a conversion host
    pub fn new(shell: Arc<dyn Shell>, server_id: impl Into<String>) -> Self {
        Self {
            shell,
            server_id: server_id.into(),
        }
    }

    /// Shell on the host
    pub fn shell(&self) -> &Arc<dyn Shell> {
        &self.shell
    }

    /// Server id of the host in its cloud
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Host name for logs
    pub fn name(&self) -> &str {
        self.shell.host()
    }

    /// Block devices currently visible in the guest
    pub async fn block_devices(&self) -> Result<BTreeSet<String>> {
        let output = self.shell.run_checked(LIST_BLOCK_DEVICES).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Attach a volume and return the device path the guest observed
    ///
    /// Callers hold the host's attach lock so no other attach can add a
    /// device between the two listings.
    pub async fn attach_volume(
        &self,
        cloud: &dyn CloudDriver,
        volume_id: &str,
        timeouts: &Timeouts,
    ) -> Result<String> {
        let before = self.block_devices().await?;
        let record = cloud
            .attach_volume(&self.server_id, volume_id, None, timeouts.operation)
            .await?;
        debug!(host = self.name(), volume = volume_id, device = %record.device, "cloud reports attachment");

        let what = format!("volume {volume_id} to appear on {}", self.name());
        let appeared = poll_until(&what, timeouts.poll_interval, timeouts.operation, || {
            let before = &before;
            async move {
                let after = self.block_devices().await?;
                let new: Vec<String> = after.difference(before).cloned().collect();
                Ok((!new.is_empty()).then_some(new))
            }
        })
        .await;

        let new = match appeared {
            Ok(new) => new,
            Err(Error::Timeout { waited_secs, .. }) => {
                return Err(Error::Inconsistency(format!(
                    "no new block device appeared on {} within {waited_secs}s after attaching volume {volume_id}",
                    self.name()
                )));
            }
            Err(e) => return Err(e),
        };

        let [device] = new.as_slice() else {
            return Err(Error::Inconsistency(format!(
                "attaching volume {volume_id} to {} added {} block devices: {}",
                self.name(),
                new.len(),
                new.join(", ")
            )));
        };

        if *device != record.device {
            warn!(
                host = self.name(),
                volume = volume_id,
                cloud_device = %record.device,
                guest_device = %device,
                "cloud and guest disagree on device path, using guest path"
            );
        }
        info!(host = self.name(), volume = volume_id, %device, "volume attached");
        Ok(device.clone())
    }

    /// Detach a volume and wait until the cloud no longer reports it attached
    pub async fn detach_volume(
        &self,
        cloud: &dyn CloudDriver,
        volume_id: &str,
        timeouts: &Timeouts,
    ) -> Result<()> {
        detach_confirmed(cloud, &self.server_id, volume_id, timeouts).await
    }
}

/// Detach `volume_id` from `server_id`, polling until the detach is visible
pub async fn detach_confirmed(
    cloud: &dyn CloudDriver,
    server_id: &str,
    volume_id: &str,
    timeouts: &Timeouts,
) -> Result<()> {
    cloud
        .detach_volume(server_id, volume_id, timeouts.operation)
        .await?;

    let what = format!("volume {volume_id} to detach from {server_id}");
    poll_until(&what, timeouts.poll_interval, timeouts.operation, || async move {
        let volume = cloud.get_volume(volume_id).await?;
        Ok(volume.attachment_to(server_id).is_none().then_some(()))
    })
    .await?;

    info!(server = server_id, volume = volume_id, "volume detached");
    Ok(())
}
