//! Source-side export against a mock cloud and a simulated conversion host

mod common;

use common::{Fixture, SOURCE_HOST, VM};
use std::time::{Duration, Instant};
use volume_transfer::testing::CloudCall;
use volume_transfer::{BOOT_DEVICE, Error, Stage};

#[smol_potat::test]
async fn test_running_server_is_rejected() {
    let fixture = Fixture::boot_from_volume();
    fixture.source_cloud.add_server(volume_transfer::Server {
        id: VM.to_string(),
        name: "vm".to_string(),
        status: "ACTIVE".to_string(),
        image_id: None,
        root_device_name: Some("/dev/vda".to_string()),
        root_disk_gb: 20,
    });

    let mut export = fixture.exporter();
    let err = export
        .run(&fixture.export_request(&["boot-1", "data-1"], false))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Precondition));
    assert!(matches!(err.root(), Error::Precondition(m) if m.contains("ACTIVE")));
    assert!(fixture.source_cloud.calls().is_empty());
}

#[smol_potat::test]
async fn test_volume_drift_is_rejected() {
    let fixture = Fixture::boot_from_volume();

    let mut export = fixture.exporter();
    let err = export
        .run(&fixture.export_request(&["boot-1", "data-2"], false))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Validate));
    let Error::Precondition(message) = err.root() else {
        panic!("unexpected error: {err}");
    };
    assert!(message.contains("data-2"));
    assert!(message.contains("data-1"));
    assert!(fixture.source_cloud.calls().is_empty());
}

#[smol_potat::test]
async fn test_boot_from_volume_export() {
    let fixture = Fixture::boot_from_volume();

    let mut export = fixture.exporter();
    let outcome = export
        .run(&fixture.export_request(&["boot-1", "data-1"], false))
        .await
        .unwrap();

    let mapping = &outcome.mapping;
    assert_eq!(mapping.len(), 2);
    let boot = mapping.get(BOOT_DEVICE).unwrap();
    assert_ne!(boot.source_volume_id, "boot-1");
    assert!(boot.snapshot_id.is_some());
    assert!(boot.image_id.is_none());
    assert!(boot.bootable);

    // The original boot volume stays on the VM, the data volume moved over
    let original = fixture.source_cloud.volume("boot-1").unwrap();
    assert!(original.attachment_to(VM).is_some());
    let data = fixture.source_cloud.volume("data-1").unwrap();
    assert!(data.attachment_to(VM).is_none());
    assert!(data.attachment_to(SOURCE_HOST).is_some());

    for (_, entry) in mapping.iter() {
        let port = entry.export_port.unwrap();
        assert!(entry.source_device_path.is_some());
        assert_eq!(
            entry.export_url.as_deref(),
            Some(format!("nbd://127.0.0.1:{port}/{}", outcome.transfer_uuid).as_str())
        );
    }

    let mut ports: Vec<u16> = mapping.iter().filter_map(|(_, e)| e.export_port).collect();
    ports.sort();
    let mut registry = Fixture::registry(&fixture.source_dir);
    registry.sort();
    assert_eq!(ports, registry);

    let exports = fixture.source.scripts_starting_with("nbdkit ");
    assert_eq!(exports.len(), 2);
    assert!(exports.iter().all(|s| s.contains(&outcome.transfer_uuid)));
    assert!(
        exports
            .iter()
            .all(|s| s.contains("--readonly") && s.contains("--ipaddr 127.0.0.1"))
    );
}

#[smol_potat::test]
async fn test_boot_from_image_without_copy_skips_boot_disk() {
    let fixture = Fixture::boot_from_image();

    let mut export = fixture.exporter();
    let outcome = export
        .run(&fixture.export_request(&["data-1"], false))
        .await
        .unwrap();

    assert!(outcome.mapping.boot().is_none());
    assert_eq!(outcome.mapping.keys().collect::<Vec<_>>(), vec!["/dev/vdb"]);
    assert!(
        !fixture
            .source_cloud
            .calls()
            .iter()
            .any(|c| matches!(c, CloudCall::CreateImage(_)))
    );
}

#[smol_potat::test]
async fn test_falls_back_to_qemu_nbd() {
    let fixture = Fixture::boot_from_image();
    fixture.source.configure(|b| b.nbdkit = false);

    let mut export = fixture.exporter();
    export
        .run(&fixture.export_request(&["data-1"], false))
        .await
        .unwrap();

    assert!(fixture.source.scripts_starting_with("nbdkit ").is_empty());
    let exports = fixture.source.scripts_starting_with("qemu-nbd ");
    assert_eq!(exports.len(), 1);
    assert!(exports[0].contains("--fork"));
}

#[smol_potat::test]
async fn test_missing_nbd_tools_name_both() {
    let fixture = Fixture::boot_from_image();
    fixture.source.configure(|b| {
        b.nbdkit = false;
        b.qemu_nbd = false;
    });

    let mut export = fixture.exporter();
    let err = export
        .run(&fixture.export_request(&["data-1"], false))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Export));
    let Error::ToolUnavailable { tools, .. } = err.root() else {
        panic!("unexpected error: {err}");
    };
    assert!(tools.contains("nbdkit") && tools.contains("qemu-nbd"));
    // The volume was attached before the failure and is still mapped
    let entry = export.mapping().get("/dev/vdb").unwrap();
    assert!(entry.source_device_path.is_some());
}

#[smol_potat::test]
async fn test_two_new_devices_abort_attach() {
    let fixture = Fixture::boot_from_image();
    fixture
        .source
        .configure(|b| b.extra_device = Some("/dev/sdz".to_string()));

    let mut export = fixture.exporter();
    let err = export
        .run(&fixture.export_request(&["data-1"], false))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::AttachSource));
    let Error::Inconsistency(message) = err.root() else {
        panic!("unexpected error: {err}");
    };
    assert!(message.contains("2 block devices"));
    assert!(export.mapping().get("/dev/vdb").unwrap().source_device_path.is_none());
    // Attach lock released despite the failure
    assert!(!fixture.source_dir.path().join("source-volume.lock").exists());
}

#[smol_potat::test]
async fn test_no_new_device_aborts_attach() {
    let mut fixture = Fixture::boot_from_image();
    fixture.source_config.timeouts.operation = Duration::from_millis(200);
    fixture.source.configure(|b| b.hide_attached = true);

    let mut export = fixture.exporter();
    let err = export
        .run(&fixture.export_request(&["data-1"], false))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::AttachSource));
    assert!(matches!(err.root(), Error::Inconsistency(m) if m.contains("no new block device")));
}

#[smol_potat::test]
async fn test_failed_boot_copy_removes_snapshot() {
    let fixture = Fixture::boot_from_volume();
    fixture.source_cloud.fail_volume_creation(true);

    let mut export = fixture.exporter();
    let err = export
        .run(&fixture.export_request(&["boot-1", "data-1"], false))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::PrepareVolumes));
    let calls = fixture.source_cloud.calls();
    let snapshot = calls
        .iter()
        .find_map(|c| match c {
            CloudCall::CreateSnapshot(id) => Some(id.clone()),
            _ => None,
        })
        .unwrap();
    assert!(!fixture.source_cloud.has_snapshot(&snapshot));
    assert_eq!(
        export.mapping().get(BOOT_DEVICE).unwrap().source_volume_id,
        "boot-1"
    );
}

#[smol_potat::test]
async fn test_unconfirmed_detach_times_out() {
    let mut fixture = Fixture::boot_from_image();
    fixture.source_config.timeouts.operation = Duration::from_millis(300);
    fixture.source_cloud.stick_detach("data-1");

    let started = Instant::now();
    let mut export = fixture.exporter();
    let err = export
        .run(&fixture.export_request(&["data-1"], false))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(err.stage(), Some(Stage::PrepareVolumes));
    assert!(matches!(err.root(), Error::Timeout { what, .. } if what.contains("data-1")));
    // Nothing was attached to the conversion host
    assert!(fixture.source_cloud.attached_devices(SOURCE_HOST).is_empty());
    assert!(
        !fixture
            .source_cloud
            .calls()
            .iter()
            .any(|c| matches!(c, CloudCall::Attach { .. }))
    );
}

#[smol_potat::test]
async fn test_unreachable_export_times_out() {
    let mut fixture = Fixture::boot_from_image();
    fixture.source_config.timeouts.operation = Duration::from_millis(300);
    fixture.source.configure(|b| b.exports_unreachable = true);

    let started = Instant::now();
    let mut export = fixture.exporter();
    let err = export
        .run(&fixture.export_request(&["data-1"], false))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(err.stage(), Some(Stage::Export));
    assert!(matches!(err.root(), Error::Timeout { what, .. } if what.contains("nbd://")));
    // The port stays claimed in the mapping so cleanup can release it
    let entry = export.mapping().get("/dev/vdb").unwrap();
    let port = entry.export_port.unwrap();
    assert_eq!(Fixture::registry(&fixture.source_dir), vec![port]);
}

#[smol_potat::test]
async fn test_boot_copy_needs_a_root_disk_size() {
    let fixture = Fixture::boot_from_image();
    fixture.source_cloud.add_server(volume_transfer::Server {
        id: VM.to_string(),
        name: "vm".to_string(),
        status: "SHUTOFF".to_string(),
        image_id: Some("img-base".to_string()),
        root_device_name: Some("/dev/vda".to_string()),
        root_disk_gb: 0,
    });

    let mut export = fixture.exporter();
    let err = export
        .run(&fixture.export_request(&["data-1"], true))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::PrepareVolumes));
    assert!(matches!(err.root(), Error::Precondition(m) if m.contains("root disk")));
    assert!(
        !fixture
            .source_cloud
            .calls()
            .iter()
            .any(|c| matches!(c, CloudCall::CreateImage(_) | CloudCall::CreateVolume(_)))
    );
}
