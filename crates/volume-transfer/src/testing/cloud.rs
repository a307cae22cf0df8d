//! In-memory cloud driver

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::cloud::{
    AttachmentRecord, CloudDriver, CloudError, CloudResult, Image, Server, Volume, VolumeRequest,
};

/// A mutating call made against [`MockCloud`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    /// Volume attached to a server
    Attach {
        /// Server id
        server: String,
        /// Volume id
        volume: String,
    },
    /// Volume detached from a server
    Detach {
        /// Server id
        server: String,
        /// Volume id
        volume: String,
    },
    /// Volume created
    CreateVolume(String),
    /// Volume deleted
    DeleteVolume(String),
    /// Volume snapshot created
    CreateSnapshot(String),
    /// Volume snapshot deleted
    DeleteSnapshot(String),
    /// Server image created
    CreateImage(String),
    /// Image deleted
    DeleteImage(String),
}

#[derive(Default)]
struct State {
    servers: BTreeMap<String, Server>,
    volumes: BTreeMap<String, Volume>,
    snapshots: BTreeMap<String, String>,
    images: BTreeMap<String, Image>,
    calls: Vec<CloudCall>,
    next_id: u32,
    fail_volume_creation: bool,
    stuck_detaches: BTreeSet<String>,
}

impl State {
    fn mint(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }
}

/// Cloud driver keeping servers, volumes, snapshots and images in memory
///
/// Attachments get the next free `/dev/vdX` on the server unless a device
/// is requested; `/dev/vda` is reserved for the root disk.
#[derive(Default)]
pub struct MockCloud {
    state: Mutex<State>,
}

impl MockCloud {
    /// Empty cloud
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server
    pub fn add_server(&self, server: Server) {
        let mut state = self.state.lock().unwrap();
        state.servers.insert(server.id.clone(), server);
    }

    /// Add a volume, optionally attached to a server at `device`
    pub fn add_volume(&self, id: &str, size_gb: u64, bootable: bool, attached: Option<(&str, &str)>) {
        let mut state = self.state.lock().unwrap();
        let attachments = attached
            .map(|(server, device)| {
                vec![AttachmentRecord {
                    volume_id: id.to_string(),
                    server_id: server.to_string(),
                    device: device.to_string(),
                }]
            })
            .unwrap_or_default();
        state.volumes.insert(
            id.to_string(),
            Volume {
                id: id.to_string(),
                name: format!("{id}-name"),
                size_gb,
                bootable,
                volume_type: Some("standard".to_string()),
                availability_zone: Some("nova".to_string()),
                description: None,
                metadata: BTreeMap::new(),
                attachments,
            },
        );
    }

    /// Make every following volume creation fail
    pub fn fail_volume_creation(&self, fail: bool) {
        self.state.lock().unwrap().fail_volume_creation = fail;
    }

    /// Accept detach requests for `volume_id` but never complete them
    pub fn stick_detach(&self, volume_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.stuck_detaches.insert(volume_id.to_string());
    }

    /// Mutating calls made so far
    pub fn calls(&self) -> Vec<CloudCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Current state of a volume
    pub fn volume(&self, id: &str) -> Option<Volume> {
        self.state.lock().unwrap().volumes.get(id).cloned()
    }

    /// Ids of all volumes
    pub fn volume_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().volumes.keys().cloned().collect()
    }

    /// Devices of volumes attached to `server_id`, sorted
    pub fn attached_devices(&self, server_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut devices: Vec<String> = state
            .volumes
            .values()
            .flat_map(|v| v.attachments.iter())
            .filter(|a| a.server_id == server_id)
            .map(|a| a.device.clone())
            .collect();
        devices.sort();
        devices
    }

    /// Whether an image exists
    pub fn has_image(&self, id: &str) -> bool {
        self.state.lock().unwrap().images.contains_key(id)
    }

    /// Whether a snapshot exists
    pub fn has_snapshot(&self, id: &str) -> bool {
        self.state.lock().unwrap().snapshots.contains_key(id)
    }
}

fn not_found(kind: &'static str, id: &str) -> CloudError {
    CloudError::NotFound {
        kind,
        id: id.to_string(),
    }
}

#[async_trait]
impl CloudDriver for MockCloud {
    async fn get_server(&self, server_id: &str) -> CloudResult<Server> {
        let state = self.state.lock().unwrap();
        state
            .servers
            .get(server_id)
            .cloned()
            .ok_or_else(|| not_found("server", server_id))
    }

    async fn server_volumes(&self, server_id: &str) -> CloudResult<Vec<AttachmentRecord>> {
        let state = self.state.lock().unwrap();
        if !state.servers.contains_key(server_id) {
            return Err(not_found("server", server_id));
        }
        Ok(state
            .volumes
            .values()
            .flat_map(|v| v.attachments.iter())
            .filter(|a| a.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn get_volume(&self, volume_id: &str) -> CloudResult<Volume> {
        let state = self.state.lock().unwrap();
        state
            .volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| not_found("volume", volume_id))
    }

    async fn attach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        device: Option<&str>,
        _timeout: Duration,
    ) -> CloudResult<AttachmentRecord> {
        let mut state = self.state.lock().unwrap();
        if !state.servers.contains_key(server_id) {
            return Err(not_found("server", server_id));
        }
        let used: Vec<String> = state
            .volumes
            .values()
            .flat_map(|v| v.attachments.iter())
            .filter(|a| a.server_id == server_id)
            .map(|a| a.device.clone())
            .collect();
        let device = match device {
            Some(device) if !used.iter().any(|d| d == device) => device.to_string(),
            _ => ('b'..='z')
                .map(|c| format!("/dev/vd{c}"))
                .find(|d| !used.contains(d))
                .ok_or_else(|| CloudError::Api(format!("no free device on {server_id}")))?,
        };

        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?;
        if volume.attachment_to(server_id).is_some() {
            return Err(CloudError::Api(format!(
                "volume {volume_id} is already attached to {server_id}"
            )));
        }
        let record = AttachmentRecord {
            volume_id: volume_id.to_string(),
            server_id: server_id.to_string(),
            device,
        };
        volume.attachments.push(record.clone());
        state.calls.push(CloudCall::Attach {
            server: server_id.to_string(),
            volume: volume_id.to_string(),
        });
        Ok(record)
    }

    async fn detach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        _timeout: Duration,
    ) -> CloudResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.stuck_detaches.contains(volume_id) {
            return Ok(());
        }
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?;
        let before = volume.attachments.len();
        volume.attachments.retain(|a| a.server_id != server_id);
        if volume.attachments.len() == before {
            return Err(not_found("attachment", volume_id));
        }
        state.calls.push(CloudCall::Detach {
            server: server_id.to_string(),
            volume: volume_id.to_string(),
        });
        Ok(())
    }

    async fn create_volume(&self, request: &VolumeRequest, _timeout: Duration) -> CloudResult<Volume> {
        let mut state = self.state.lock().unwrap();
        if state.fail_volume_creation {
            return Err(CloudError::Api("volume quota exceeded".to_string()));
        }
        let id = state.mint("vol");
        let volume = Volume {
            id: id.clone(),
            name: request.name.clone(),
            size_gb: request.size_gb,
            bootable: request.bootable,
            volume_type: request.params.volume_type.clone(),
            availability_zone: request.params.availability_zone.clone(),
            description: request.params.description.clone(),
            metadata: request.params.metadata.clone(),
            attachments: Vec::new(),
        };
        state.volumes.insert(id.clone(), volume.clone());
        state.calls.push(CloudCall::CreateVolume(id));
        Ok(volume)
    }

    async fn delete_volume(&self, volume_id: &str, _timeout: Duration) -> CloudResult<()> {
        let mut state = self.state.lock().unwrap();
        let volume = state
            .volumes
            .get(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?;
        if !volume.attachments.is_empty() {
            return Err(CloudError::Api(format!("volume {volume_id} is in use")));
        }
        state.volumes.remove(volume_id);
        state.calls.push(CloudCall::DeleteVolume(volume_id.to_string()));
        Ok(())
    }

    async fn create_volume_snapshot(
        &self,
        volume_id: &str,
        _name: &str,
        _timeout: Duration,
    ) -> CloudResult<String> {
        let mut state = self.state.lock().unwrap();
        if !state.volumes.contains_key(volume_id) {
            return Err(not_found("volume", volume_id));
        }
        let id = state.mint("snap");
        state.snapshots.insert(id.clone(), volume_id.to_string());
        state.calls.push(CloudCall::CreateSnapshot(id.clone()));
        Ok(id)
    }

    async fn delete_volume_snapshot(&self, snapshot_id: &str, _timeout: Duration) -> CloudResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .snapshots
            .remove(snapshot_id)
            .ok_or_else(|| not_found("snapshot", snapshot_id))?;
        state.calls.push(CloudCall::DeleteSnapshot(snapshot_id.to_string()));
        Ok(())
    }

    async fn create_server_image(
        &self,
        server_id: &str,
        name: &str,
        _timeout: Duration,
    ) -> CloudResult<String> {
        let mut state = self.state.lock().unwrap();
        if !state.servers.contains_key(server_id) {
            return Err(not_found("server", server_id));
        }
        let id = state.mint("img");
        state.images.insert(
            id.clone(),
            Image {
                id: id.clone(),
                name: name.to_string(),
                status: "active".to_string(),
            },
        );
        state.calls.push(CloudCall::CreateImage(id.clone()));
        Ok(id)
    }

    async fn delete_image(&self, image_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .images
            .remove(image_id)
            .ok_or_else(|| not_found("image", image_id))?;
        state.calls.push(CloudCall::DeleteImage(image_id.to_string()));
        Ok(())
    }

    async fn get_image(&self, image_id: &str) -> CloudResult<Image> {
        let state = self.state.lock().unwrap();
        state
            .images
            .get(image_id)
            .cloned()
            .ok_or_else(|| not_found("image", image_id))
    }
}
