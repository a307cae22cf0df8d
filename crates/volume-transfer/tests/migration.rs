//! End-to-end migrations: export, transfer and cleanup

mod common;

use common::{DESTINATION_HOST, Fixture, SOURCE_HOST, VM};
use volume_transfer::testing::CloudCall;
use volume_transfer::{BOOT_DEVICE, CloudDriver, Error, ProgressFile, Stage, VolumeParams};

#[smol_potat::test]
async fn test_boot_from_image_with_copy_round_trip() {
    let fixture = Fixture::boot_from_image();

    let mut export = fixture.exporter();
    let exported = export
        .run(&fixture.export_request(&["data-1"], true))
        .await
        .unwrap();

    assert_eq!(exported.mapping.len(), 2);
    let boot = exported.mapping.boot().unwrap();
    let image = boot.image_id.clone().unwrap();
    assert!(boot.volume_params.is_none());
    assert!(fixture.source_cloud.has_image(&image));

    let mut transfer = fixture.transferrer();
    let mut request = fixture.transfer_request(&exported.transfer_uuid, exported.mapping.clone());
    request.boot_volume_params = Some(VolumeParams {
        volume_type: Some("ssd".to_string()),
        ..Default::default()
    });
    let transferred = transfer.run(request).await.unwrap();

    // Keys survive the handover and destination fields are filled once
    assert_eq!(
        exported.mapping.keys().collect::<Vec<_>>(),
        transferred.mapping.keys().collect::<Vec<_>>()
    );
    for ((_, before), (_, after)) in exported.mapping.iter().zip(transferred.mapping.iter()) {
        assert!(before.destination_volume_id().is_none());
        assert!(before.destination_device_path().is_none());
        assert!(after.destination_volume_id().is_some());
        assert!(after.destination_device_path().is_some());
        assert_eq!(after.progress_percent, Some(100.0));
    }

    let boot_volume = transferred.mapping.boot().unwrap().destination_volume_id().unwrap();
    let boot_volume = fixture.destination_cloud.volume(boot_volume).unwrap();
    assert_eq!(boot_volume.volume_type.as_deref(), Some("ssd"));
    assert!(boot_volume.bootable);
    let data_volume = transferred.mapping.get("/dev/vdb").unwrap().destination_volume_id().unwrap();
    let data_volume = fixture.destination_cloud.volume(data_volume).unwrap();
    assert_eq!(data_volume.volume_type.as_deref(), Some("standard"));
    assert_eq!(data_volume.size_gb, 5);

    // Destination volumes are detached from the conversion host again
    assert!(fixture.destination_cloud.attached_devices(DESTINATION_HOST).is_empty());

    // Boot ordering
    let devices = &transferred.boot_devices;
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].device_name, BOOT_DEVICE);
    assert_eq!(devices[0].boot_index, 0);
    assert!(devices[0].delete_on_termination);
    assert_eq!(devices[1].device_name, "/dev/vdb");
    assert_eq!(devices[1].boot_index, -1);
    assert!(!devices[1].delete_on_termination);

    // Tunnel and export teardown
    assert_eq!(fixture.destination.scripts_starting_with("ssh -N ").len(), 1);
    assert!(Fixture::registry(&fixture.destination_dir).is_empty());
    assert!(Fixture::registry(&fixture.source_dir).is_empty());
    let key = fixture
        .destination_dir
        .path()
        .join(format!("{}.key", exported.transfer_uuid));
    assert!(!key.exists());

    // Source cleanup removes the temporary image and boot volume
    fixture
        .source_cleanup()
        .cleanup_source(VM, &exported.transfer_uuid, &exported.mapping)
        .await
        .unwrap();

    assert!(!fixture.source_cloud.has_image(&image));
    assert!(fixture.source_cloud.volume(&boot.source_volume_id).is_none());
    let data = fixture.source_cloud.volume("data-1").unwrap();
    assert_eq!(data.attachment_to(VM).unwrap().device, "/dev/vdb");
    assert!(data.attachment_to(SOURCE_HOST).is_none());
    assert!(Fixture::registry(&fixture.source_dir).is_empty());
}

#[smol_potat::test]
async fn test_source_cleanup_is_idempotent() {
    let fixture = Fixture::boot_from_volume();

    let mut export = fixture.exporter();
    let exported = export
        .run(&fixture.export_request(&["boot-1", "data-1"], false))
        .await
        .unwrap();
    let boot = exported.mapping.boot().unwrap().clone();

    let cleanup = fixture.source_cleanup();
    cleanup
        .cleanup_source(VM, &exported.transfer_uuid, &exported.mapping)
        .await
        .unwrap();
    let after_first = fixture.source_cloud.calls();

    assert!(fixture.source_cloud.volume(&boot.source_volume_id).is_none());
    assert!(!fixture.source_cloud.has_snapshot(boot.snapshot_id.as_deref().unwrap()));
    assert!(fixture.source_cloud.volume("boot-1").unwrap().attachment_to(VM).is_some());
    assert!(fixture.source_cloud.volume("data-1").unwrap().attachment_to(VM).is_some());

    cleanup
        .cleanup_source(VM, &exported.transfer_uuid, &exported.mapping)
        .await
        .unwrap();
    assert_eq!(fixture.source_cloud.calls(), after_first);
}

#[smol_potat::test]
async fn test_cleanup_after_failed_export_restores_vm() {
    let fixture = Fixture::boot_from_image();
    fixture.source.configure(|b| {
        b.nbdkit = false;
        b.qemu_nbd = false;
    });

    let mut export = fixture.exporter();
    export
        .run(&fixture.export_request(&["data-1"], true))
        .await
        .unwrap_err();
    let image = export.mapping().boot().unwrap().image_id.clone().unwrap();

    fixture
        .source_cleanup()
        .cleanup_source(VM, export.transfer_uuid(), export.mapping())
        .await
        .unwrap();

    assert!(!fixture.source_cloud.has_image(&image));
    let data = fixture.source_cloud.volume("data-1").unwrap();
    assert!(data.attachment_to(VM).is_some());
    assert!(fixture.source_cloud.attached_devices(SOURCE_HOST).is_empty());
}

#[smol_potat::test]
async fn test_sparsify_failure_falls_back_to_raw_export() {
    let fixture = Fixture::boot_from_image();
    fixture.destination.configure(|b| b.sparsify_fails = true);

    let exported = fixture
        .exporter()
        .run(&fixture.export_request(&["data-1"], false))
        .await
        .unwrap();
    let transferred = fixture
        .transferrer()
        .run(fixture.transfer_request(&exported.transfer_uuid, exported.mapping))
        .await
        .unwrap();

    let entry = transferred.mapping.get("/dev/vdb").unwrap();
    assert_eq!(entry.progress_percent, Some(100.0));

    let converts: Vec<String> = fixture
        .destination
        .scripts()
        .into_iter()
        .filter(|s| s.contains("qemu-img convert"))
        .collect();
    assert_eq!(converts.len(), 1);
    assert!(converts[0].contains("-f raw"));
    assert!(converts[0].contains("nbd://127.0.0.1:"));
    assert!(!converts[0].contains(".qcow2"));
}

#[smol_potat::test]
async fn test_sparsified_overlay_is_converted_as_qcow2() {
    let fixture = Fixture::boot_from_image();

    let exported = fixture
        .exporter()
        .run(&fixture.export_request(&["data-1"], false))
        .await
        .unwrap();
    fixture
        .transferrer()
        .run(fixture.transfer_request(&exported.transfer_uuid, exported.mapping))
        .await
        .unwrap();

    let scripts = fixture.destination.scripts();
    assert!(scripts.iter().any(|s| s.starts_with("qemu-img create -f qcow2 -b ")));
    assert!(scripts.iter().any(|s| s.starts_with("LIBGUESTFS_BACKEND=direct virt-sparsify --in-place ")));
    let convert = scripts
        .iter()
        .find(|s| s.contains("qemu-img convert"))
        .unwrap();
    assert!(convert.starts_with("bash -o pipefail -c "));
    assert!(convert.contains("-f qcow2"));
    assert!(convert.contains(&format!("{}-vdb.qcow2", exported.transfer_uuid)));
}

#[smol_potat::test]
async fn test_progress_file_tracks_conversion() {
    let mut fixture = Fixture::boot_from_image();
    let progress_path = fixture.destination_dir.path().join("progress.json");
    fixture.destination_config.progress_file = Some(progress_path.clone());

    let exported = fixture
        .exporter()
        .run(&fixture.export_request(&["data-1"], true))
        .await
        .unwrap();
    fixture
        .transferrer()
        .run(fixture.transfer_request(&exported.transfer_uuid, exported.mapping))
        .await
        .unwrap();

    let progress = ProgressFile::new(progress_path).read().await.unwrap();
    assert_eq!(progress.len(), 2);
    assert!(progress.values().all(|p| *p == Some(100.0)));
}

#[smol_potat::test]
async fn test_failed_copy_reports_output_and_cleans_destination() {
    let fixture = Fixture::boot_from_image();
    fixture.destination.configure(|b| b.convert_exit_code = 1);

    let exported = fixture
        .exporter()
        .run(&fixture.export_request(&["data-1"], false))
        .await
        .unwrap();
    assert_eq!(Fixture::registry(&fixture.source_dir).len(), 1);
    let mut transfer = fixture.transferrer();
    let err = transfer
        .run(fixture.transfer_request(&exported.transfer_uuid, exported.mapping.clone()))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Convert));
    let Error::CommandFailed { output, code, .. } = err.root() else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(*code, Some(1));
    assert!(output.contains("Input/output error"));
    assert!(output.contains("(75.50/100%)"));
    let entry = transfer.mapping().get("/dev/vdb").unwrap();
    assert_eq!(entry.progress_percent, Some(75.5));

    // Teardown still ran, on both hosts
    assert!(Fixture::registry(&fixture.destination_dir).is_empty());
    assert!(Fixture::registry(&fixture.source_dir).is_empty());
    let tag = &exported.transfer_uuid[1..];
    assert!(
        fixture
            .source
            .scripts_starting_with("pkill -f ")
            .iter()
            .any(|s| s.contains(tag))
    );

    let cleanup = fixture.destination_cleanup();
    cleanup.cleanup_destination(transfer.mapping()).await.unwrap();
    assert!(fixture.destination_cloud.volume_ids().is_empty());
    let after_first = fixture.destination_cloud.calls();

    cleanup.cleanup_destination(transfer.mapping()).await.unwrap();
    assert_eq!(fixture.destination_cloud.calls(), after_first);

    fixture
        .source_cleanup()
        .cleanup_source(VM, &exported.transfer_uuid, &exported.mapping)
        .await
        .unwrap();
    assert!(fixture.source_cloud.volume("data-1").unwrap().attachment_to(VM).is_some());
}

#[smol_potat::test]
async fn test_destination_cleanup_skips_volumes_in_use() {
    let fixture = Fixture::boot_from_image();
    fixture.destination.configure(|b| b.convert_exit_code = 1);

    let exported = fixture
        .exporter()
        .run(&fixture.export_request(&["data-1"], false))
        .await
        .unwrap();
    let mut transfer = fixture.transferrer();
    transfer
        .run(fixture.transfer_request(&exported.transfer_uuid, exported.mapping))
        .await
        .unwrap_err();

    // Someone else grabbed the volume in the meantime
    let volume = transfer
        .mapping()
        .get("/dev/vdb")
        .unwrap()
        .destination_volume_id()
        .unwrap()
        .to_string();
    fixture.destination_cloud.add_server(volume_transfer::Server {
        id: "other-vm".to_string(),
        name: "other".to_string(),
        status: "ACTIVE".to_string(),
        image_id: None,
        root_device_name: None,
        root_disk_gb: 1,
    });
    fixture
        .destination_cloud
        .attach_volume("other-vm", &volume, None, std::time::Duration::from_secs(1))
        .await
        .unwrap();

    fixture
        .destination_cleanup()
        .cleanup_destination(transfer.mapping())
        .await
        .unwrap();

    let remaining = fixture.destination_cloud.volume(&volume).unwrap();
    assert!(remaining.attachment_to("other-vm").is_some());
    assert!(remaining.attachment_to(DESTINATION_HOST).is_none());
    assert!(
        !fixture
            .destination_cloud
            .calls()
            .contains(&CloudCall::DeleteVolume(volume))
    );
}

#[smol_potat::test]
async fn test_second_transfer_of_same_mapping_is_rejected() {
    let fixture = Fixture::boot_from_image();

    let exported = fixture
        .exporter()
        .run(&fixture.export_request(&["data-1"], false))
        .await
        .unwrap();
    let transferred = fixture
        .transferrer()
        .run(fixture.transfer_request(&exported.transfer_uuid, exported.mapping))
        .await
        .unwrap();

    let err = fixture
        .transferrer()
        .run(fixture.transfer_request(&exported.transfer_uuid, transferred.mapping))
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::CreateVolumes));
    assert!(matches!(err.root(), Error::Inconsistency(m) if m.contains("already set")));
}
