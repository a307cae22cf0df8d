//! Cloud driver capability interface
//!
//! The engine never talks to a cloud API directly. Callers plug in a driver
//! for each side of the migration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::mapping::VolumeParams;

/// Power state of a server that is fully shut down
pub const SERVER_SHUTOFF: &str = "SHUTOFF";

/// Errors reported by a cloud driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// The resource does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Resource kind, e.g. `volume`
        kind: &'static str,
        /// Resource id
        id: String,
    },

    /// The API rejected or failed the request
    #[error("API error: {0}")]
    Api(String),

    /// The operation did not finish within its timeout
    #[error("{operation} did not finish within {waited_secs}s")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Seconds waited
        waited_secs: u64,
    },
}

impl CloudError {
    /// Whether this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }
}

/// Result type for cloud driver calls
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// A server as reported by the cloud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Server id
    pub id: String,
    /// Server name
    pub name: String,
    /// Power/lifecycle status, e.g. `SHUTOFF`
    pub status: String,
    /// Image the server booted from; `None` for boot-from-volume
    pub image_id: Option<String>,
    /// Root device reported by the cloud, e.g. `/dev/vda` or `/dev/sda`
    pub root_device_name: Option<String>,
    /// Root disk size of the flavor in GiB
    pub root_disk_gb: u64,
}

impl Server {
    /// Whether the server boots from an image rather than a volume
    pub fn boots_from_image(&self) -> bool {
        self.image_id.is_some()
    }
}

/// Binding of a volume to a server at a device path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// Attached volume
    pub volume_id: String,
    /// Server it is attached to
    pub server_id: String,
    /// Device path reported by the cloud
    pub device: String,
}

/// A volume as reported by the cloud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume id
    pub id: String,
    /// Volume name
    pub name: String,
    /// Size in GiB
    pub size_gb: u64,
    /// Whether the volume is bootable
    pub bootable: bool,
    /// Volume type name
    pub volume_type: Option<String>,
    /// Availability zone
    pub availability_zone: Option<String>,
    /// Description
    pub description: Option<String>,
    /// Metadata
    pub metadata: BTreeMap<String, String>,
    /// Current attachments
    pub attachments: Vec<AttachmentRecord>,
}

impl Volume {
    /// User-editable parameters to recreate this volume elsewhere
    pub fn params(&self) -> VolumeParams {
        VolumeParams {
            volume_type: self.volume_type.clone(),
            availability_zone: self.availability_zone.clone(),
            description: self.description.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Attachment to `server_id`, if any
    pub fn attachment_to(&self, server_id: &str) -> Option<&AttachmentRecord> {
        self.attachments.iter().find(|a| a.server_id == server_id)
    }
}

/// Where a new volume's content comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    /// Empty volume
    Blank,
    /// Volume snapshot id
    Snapshot(String),
    /// Image id
    Image(String),
}

/// Parameters for creating a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRequest {
    /// Volume name
    pub name: String,
    /// Size in GiB
    pub size_gb: u64,
    /// Whether the volume is bootable
    pub bootable: bool,
    /// Content source
    pub source: VolumeSource,
    /// Type, zone, description and metadata
    pub params: VolumeParams,
}

/// An image as reported by the cloud
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Image id
    pub id: String,
    /// Image name
    pub name: String,
    /// Image status, e.g. `active`
    pub status: String,
}

/// Cloud operations the engine needs
///
/// Mutating calls wait for the operation to finish, bounded by `timeout`.
/// Missing resources are reported as [`CloudError::NotFound`].
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// Get a server by id
    async fn get_server(&self, server_id: &str) -> CloudResult<Server>;

    /// Volumes attached to a server, with their device paths
    async fn server_volumes(&self, server_id: &str) -> CloudResult<Vec<AttachmentRecord>>;

    /// Get a volume by id
    async fn get_volume(&self, volume_id: &str) -> CloudResult<Volume>;

    /// Attach a volume; `device` is a hint the cloud may ignore
    async fn attach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        device: Option<&str>,
        timeout: Duration,
    ) -> CloudResult<AttachmentRecord>;

    /// Detach a volume; a missing attachment is `NotFound`
    async fn detach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        timeout: Duration,
    ) -> CloudResult<()>;

    /// Create a volume and wait until it is available
    async fn create_volume(&self, request: &VolumeRequest, timeout: Duration) -> CloudResult<Volume>;

    /// Delete a volume and wait until it is gone
    async fn delete_volume(&self, volume_id: &str, timeout: Duration) -> CloudResult<()>;

    /// Snapshot a volume, returning the snapshot id
    async fn create_volume_snapshot(
        &self,
        volume_id: &str,
        name: &str,
        timeout: Duration,
    ) -> CloudResult<String>;

    /// Delete a volume snapshot
    async fn delete_volume_snapshot(&self, snapshot_id: &str, timeout: Duration) -> CloudResult<()>;

    /// Snapshot a server into an image, returning the image id
    async fn create_server_image(
        &self,
        server_id: &str,
        name: &str,
        timeout: Duration,
    ) -> CloudResult<String>;

    /// Delete an image
    async fn delete_image(&self, image_id: &str) -> CloudResult<()>;

    /// Get an image by id
    async fn get_image(&self, image_id: &str) -> CloudResult<Image>;
}
