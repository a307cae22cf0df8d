//! Per-volume transfer records keyed by the source VM's device path

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map;

use crate::error::{Error, Result};

/// Device path of the boot disk
pub const BOOT_DEVICE: &str = "/dev/vda";

/// User-editable volume parameters carried over to the destination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeParams {
    /// Volume type name
    pub volume_type: Option<String>,
    /// Availability zone
    pub availability_zone: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// Volume metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Transfer record for one volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeEntry {
    /// Device path inside the source conversion host once attached
    pub source_device_path: Option<String>,
    /// Source volume id, possibly a temporary boot disk copy
    pub source_volume_id: String,
    destination_device_path: Option<String>,
    destination_volume_id: Option<String>,
    /// Temporary snapshot behind a boot volume copy
    pub snapshot_id: Option<String>,
    /// Temporary server image behind a boot volume copy
    pub image_id: Option<String>,
    /// Volume name
    pub display_name: String,
    /// Size in GiB
    pub size_gb: u64,
    /// Whether the volume is bootable
    pub bootable: bool,
    /// NBD export port on the source conversion host
    pub export_port: Option<u16>,
    /// NBD URL of the export
    pub export_url: Option<String>,
    /// Last observed copy progress, 0 to 100
    pub progress_percent: Option<f64>,
    /// Parameters of the source volume; absent for synthesized boot disks
    pub volume_params: Option<VolumeParams>,
}

impl VolumeEntry {
    /// Create an entry for a source volume
    pub fn new(
        source_volume_id: impl Into<String>,
        display_name: impl Into<String>,
        size_gb: u64,
        bootable: bool,
    ) -> Result<Self> {
        let source_volume_id = source_volume_id.into();
        if source_volume_id.trim().is_empty() {
            return Err(Error::Inconsistency("volume entry without a volume id".into()));
        }
        if size_gb == 0 {
            return Err(Error::Inconsistency(format!(
                "volume {source_volume_id} reports a size of 0 GiB"
            )));
        }
        Ok(Self {
            source_device_path: None,
            source_volume_id,
            destination_device_path: None,
            destination_volume_id: None,
            snapshot_id: None,
            image_id: None,
            display_name: display_name.into(),
            size_gb,
            bootable,
            export_port: None,
            export_url: None,
            progress_percent: None,
            volume_params: None,
        })
    }

    /// Attach volume parameters
    pub fn with_params(mut self, params: VolumeParams) -> Self {
        self.volume_params = Some(params);
        self
    }

    /// Destination volume id, once created
    pub fn destination_volume_id(&self) -> Option<&str> {
        self.destination_volume_id.as_deref()
    }

    /// Device path inside the destination conversion host, once attached
    pub fn destination_device_path(&self) -> Option<&str> {
        self.destination_device_path.as_deref()
    }

    /// Record the destination volume id; it can be set only once
    pub fn set_destination_volume_id(&mut self, id: impl Into<String>) -> Result<()> {
        set_once(&mut self.destination_volume_id, id.into(), "destination volume id")
    }

    /// Record the destination device path; it can be set only once
    pub fn set_destination_device_path(&mut self, path: impl Into<String>) -> Result<()> {
        set_once(&mut self.destination_device_path, path.into(), "destination device path")
    }
}

fn set_once(slot: &mut Option<String>, value: String, what: &str) -> Result<()> {
    match slot {
        Some(existing) => Err(Error::Inconsistency(format!(
            "{what} already set to {existing}, refusing {value}"
        ))),
        None => {
            *slot = Some(value);
            Ok(())
        }
    }
}

/// One element of the boot-ordering descriptor for the new instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    /// Destination volume id
    pub uuid: String,
    /// Always `volume`
    pub source_type: String,
    /// Always `volume`
    pub destination_type: String,
    /// Device path key from the source VM
    pub device_name: String,
    /// 0 for the boot disk, -1 otherwise
    pub boot_index: i32,
    /// Whether the volume goes away with the instance
    pub delete_on_termination: bool,
}

/// Ordered transfer records keyed by the source VM's device path
///
/// Keys are never renamed or removed once inserted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeMapping {
    entries: BTreeMap<String, VolumeEntry>,
}

impl VolumeMapping {
    /// Empty mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry under `device`; an existing key is an inconsistency
    pub fn insert(&mut self, device: impl Into<String>, entry: VolumeEntry) -> Result<()> {
        match self.entries.entry(device.into()) {
            btree_map::Entry::Occupied(existing) => Err(Error::Inconsistency(format!(
                "device {} is already mapped to volume {}",
                existing.key(),
                existing.get().source_volume_id
            ))),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Entry for `device`
    pub fn get(&self, device: &str) -> Option<&VolumeEntry> {
        self.entries.get(device)
    }

    /// Mutable entry for `device`
    pub fn get_mut(&mut self, device: &str) -> Option<&mut VolumeEntry> {
        self.entries.get_mut(device)
    }

    /// The boot disk entry, if the boot disk is transferred
    pub fn boot(&self) -> Option<&VolumeEntry> {
        self.entries.get(BOOT_DEVICE)
    }

    /// Entries sorted by device path
    pub fn iter(&self) -> impl Iterator<Item = (&String, &VolumeEntry)> {
        self.entries.iter()
    }

    /// Mutable entries sorted by device path
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut VolumeEntry)> {
        self.entries.iter_mut()
    }

    /// Device path keys, sorted
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Source volume ids of all entries
    pub fn source_volume_ids(&self) -> Vec<String> {
        self.entries
            .values()
            .map(|entry| entry.source_volume_id.clone())
            .collect()
    }

    /// Boot-ordering descriptor for the destination instance
    ///
    /// Every entry must have a destination volume.
    pub fn boot_devices(&self) -> Result<Vec<BlockDeviceMapping>> {
        self.entries
            .iter()
            .map(|(device, entry)| {
                let uuid = entry.destination_volume_id().ok_or_else(|| {
                    Error::Inconsistency(format!("{device} has no destination volume"))
                })?;
                let boot = device == BOOT_DEVICE;
                Ok(BlockDeviceMapping {
                    uuid: uuid.to_string(),
                    source_type: "volume".to_string(),
                    destination_type: "volume".to_string(),
                    device_name: device.clone(),
                    boot_index: if boot { 0 } else { -1 },
                    delete_on_termination: boot,
                })
            })
            .collect()
    }

    /// Progress of every entry, for the progress file
    pub fn progress(&self) -> BTreeMap<String, Option<f64>> {
        self.entries
            .iter()
            .map(|(device, entry)| (device.clone(), entry.progress_percent))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> VolumeEntry {
        VolumeEntry::new(id, format!("{id}-name"), 10, false).unwrap()
    }

    #[test]
    fn test_entry_validation() {
        assert!(VolumeEntry::new("", "x", 1, false).is_err());
        assert!(VolumeEntry::new("v1", "x", 0, false).is_err());
        assert!(VolumeEntry::new("v1", "x", 1, true).is_ok());
    }

    #[test]
    fn test_duplicate_boot_key_rejected() {
        let mut mapping = VolumeMapping::new();
        mapping.insert(BOOT_DEVICE, entry("a")).unwrap();
        let err = mapping.insert(BOOT_DEVICE, entry("b")).unwrap_err();

        assert!(matches!(err, Error::Inconsistency(_)));
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.boot().unwrap().source_volume_id, "a");
    }

    #[test]
    fn test_destination_fields_are_write_once() {
        let mut e = entry("a");
        assert_eq!(e.destination_volume_id(), None);
        assert_eq!(e.destination_device_path(), None);

        e.set_destination_volume_id("d1").unwrap();
        e.set_destination_device_path("/dev/vdc").unwrap();
        assert!(e.set_destination_volume_id("d2").is_err());
        assert!(e.set_destination_device_path("/dev/vdd").is_err());

        assert_eq!(e.destination_volume_id(), Some("d1"));
        assert_eq!(e.destination_device_path(), Some("/dev/vdc"));
    }

    #[test]
    fn test_boot_devices_ordering() {
        let mut mapping = VolumeMapping::new();
        for (device, id) in [("/dev/vdc", "c"), (BOOT_DEVICE, "a"), ("/dev/vdb", "b")] {
            let mut e = entry(id);
            e.set_destination_volume_id(format!("dst-{id}")).unwrap();
            mapping.insert(device, e).unwrap();
        }

        let devices = mapping.boot_devices().unwrap();
        let names: Vec<_> = devices.iter().map(|d| d.device_name.as_str()).collect();
        assert_eq!(names, vec!["/dev/vda", "/dev/vdb", "/dev/vdc"]);

        let boot: Vec<_> = devices
            .iter()
            .filter(|d| d.boot_index == 0 && d.delete_on_termination)
            .collect();
        assert_eq!(boot.len(), 1);
        assert_eq!(boot[0].uuid, "dst-a");
        assert!(
            devices[1..]
                .iter()
                .all(|d| d.boot_index == -1 && !d.delete_on_termination)
        );
        assert!(devices.iter().all(|d| d.source_type == "volume" && d.destination_type == "volume"));
    }

    #[test]
    fn test_boot_devices_require_destination() {
        let mut mapping = VolumeMapping::new();
        mapping.insert("/dev/vdb", entry("b")).unwrap();
        assert!(mapping.boot_devices().is_err());
    }

    #[test]
    fn test_mapping_serializes_as_object() {
        let mut mapping = VolumeMapping::new();
        let mut e = entry("a");
        e.set_destination_volume_id("d").unwrap();
        mapping.insert("/dev/vdb", e).unwrap();

        let json = serde_json::to_value(&mapping).unwrap();
        assert_eq!(json["/dev/vdb"]["source_volume_id"], "a");
        assert_eq!(json["/dev/vdb"]["destination_volume_id"], "d");

        let back: VolumeMapping = serde_json::from_value(json).unwrap();
        assert_eq!(back, mapping);
    }
}
