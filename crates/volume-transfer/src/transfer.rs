//! Destination side of a migration: pull the exports through an SSH tunnel
//! and copy them onto new volumes
//!
//! Tunnel, copied key, overlays and tunnel ports are torn down on every exit
//! path, and so are the exports on the source host along with their ports.
//! A teardown failure is logged and never hides the error that stopped the
//! transfer.

use command_executor::{ProcessEventType, Shell, SpawnedProcess, shell_escape};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::cloud::{CloudDriver, VolumeRequest, VolumeSource};
use crate::config::EngineConfig;
use crate::error::{Error, Result, Stage};
use crate::host::ConversionHost;
use crate::lock::AdvisoryLock;
use crate::mapping::{BOOT_DEVICE, BlockDeviceMapping, VolumeMapping, VolumeParams};
use crate::nbd;
use crate::ports::PortAllocator;
use crate::progress::{ProgressFile, parse_progress};

/// SSH endpoint of the source conversion host as seen from the destination
#[derive(Debug, Clone)]
pub struct TunnelTarget {
    /// Address reachable from the destination conversion host
    pub address: String,
    /// Login user
    pub user: String,
    /// SSH port, if not 22
    pub port: Option<u16>,
    /// Local private key accepted by the source conversion host
    pub identity_file: PathBuf,
    /// Connection setup bound in seconds
    pub connect_timeout_secs: u64,
}

/// What to transfer
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Transfer uuid minted by the export
    pub transfer_uuid: String,
    /// Mapping produced by the export
    pub mapping: VolumeMapping,
    /// Where the exports live
    pub source: TunnelTarget,
    /// Parameters for a boot volume with no source counterpart
    pub boot_volume_params: Option<VolumeParams>,
}

/// Result of a successful transfer
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Mapping with destination volumes filled in
    pub mapping: VolumeMapping,
    /// Boot-ordering descriptor for the new instance
    pub boot_devices: Vec<BlockDeviceMapping>,
}

/// How a volume is read during conversion
struct CopySource {
    path: String,
    format: &'static str,
}

/// Drives the destination side of one migration
pub struct TransferOrchestrator {
    cloud: Arc<dyn CloudDriver>,
    host: ConversionHost,
    config: EngineConfig,
    ports: PortAllocator,
    source_ports: PortAllocator,
    attach_lock: AdvisoryLock,
    progress: Option<ProgressFile>,
    transfer_uuid: String,
    mapping: VolumeMapping,
    tunnel: Option<SpawnedProcess>,
    tunnel_ports: Vec<u16>,
    key_path: Option<String>,
    overlays: Vec<String>,
}

impl TransferOrchestrator {
    /// Create an orchestrator for the destination conversion host
    ///
    /// `source_ports` is the port registry of the source conversion host;
    /// its shell is used to stop the exports once the transfer is over.
    pub fn new(
        cloud: Arc<dyn CloudDriver>,
        host: ConversionHost,
        source_ports: PortAllocator,
        config: EngineConfig,
    ) -> Self {
        let ports = PortAllocator::new(host.shell().clone(), &config);
        let attach_lock = AdvisoryLock::new(
            host.shell().clone(),
            config.paths.destination_attach_lock.clone(),
            config.timeouts.lock,
            config.timeouts.poll_interval,
        );
        let progress = config.progress_file.clone().map(ProgressFile::new);
        Self {
            cloud,
            host,
            config,
            ports,
            source_ports,
            attach_lock,
            progress,
            transfer_uuid: String::new(),
            mapping: VolumeMapping::new(),
            tunnel: None,
            tunnel_ports: Vec::new(),
            key_path: None,
            overlays: Vec::new(),
        }
    }

    /// Mapping as updated so far
    pub fn mapping(&self) -> &VolumeMapping {
        &self.mapping
    }

    /// Run every transfer stage, then tear down the tunnel and the source exports
    #[instrument(skip_all, fields(uuid = %request.transfer_uuid))]
    pub async fn run(&mut self, request: TransferRequest) -> Result<TransferOutcome> {
        self.transfer_uuid = request.transfer_uuid.clone();
        self.mapping = request.mapping.clone();
        info!(volumes = self.mapping.len(), "starting transfer");

        let result = self.stages(&request).await;
        if let Err(e) = self.finalize().await {
            error!(error = %e, "transfer teardown incomplete");
        }
        let boot_devices = result?;

        info!("transfer complete");
        Ok(TransferOutcome {
            mapping: self.mapping.clone(),
            boot_devices,
        })
    }

    async fn stages(&mut self, request: &TransferRequest) -> Result<Vec<BlockDeviceMapping>> {
        self.host
            .shell()
            .self_test()
            .await
            .map_err(|e| Error::from(e).in_stage(Stage::SelfTest))?;
        self.forward(&request.source)
            .await
            .map_err(|e| e.in_stage(Stage::Forward))?;
        self.create_volumes(request.boot_volume_params.as_ref())
            .await
            .map_err(|e| e.in_stage(Stage::CreateVolumes))?;
        self.attach_all()
            .await
            .map_err(|e| e.in_stage(Stage::AttachDestination))?;
        self.convert_all()
            .await
            .map_err(|e| e.in_stage(Stage::Convert))?;
        self.detach_all()
            .await
            .map_err(|e| e.in_stage(Stage::DetachDestination))?;
        self.mapping.boot_devices()
    }

    async fn forward(&mut self, source: &TunnelTarget) -> Result<()> {
        let shell = self.host.shell().clone();
        let key = format!("{}/{}.key", self.config.paths.work_dir, self.transfer_uuid);
        self.key_path = Some(key.clone());
        shell.copy_to(&source.identity_file, &key).await?;
        shell
            .run_checked(&format!("chmod 600 {}", shell_escape(&key)))
            .await?;

        let mut forwards = Vec::new();
        let keys: Vec<String> = self.mapping.keys().cloned().collect();
        for device in &keys {
            let remote = self
                .mapping
                .get(device)
                .and_then(|entry| entry.export_port)
                .ok_or_else(|| Error::Inconsistency(format!("{device} has no export port")))?;
            let local = self.ports.allocate().await?;
            self.tunnel_ports.push(local);
            forwards.push((device.clone(), local, remote));
        }

        let script = tunnel_command(source, &key, &forwards);
        debug!(host = shell.host(), %script, "starting tunnel");
        self.tunnel = Some(shell.spawn(&script).await?);

        for (device, local, _) in &forwards {
            let url = nbd::nbd_url(*local, &self.transfer_uuid);
            if let Some(entry) = self.mapping.get_mut(device) {
                entry.export_url = Some(url.clone());
            }
            nbd::wait_ready(shell.as_ref(), &url, &self.config.timeouts).await?;
        }
        info!(tunnels = forwards.len(), "exports forwarded");
        Ok(())
    }

    async fn create_volumes(&mut self, boot_override: Option<&VolumeParams>) -> Result<()> {
        let timeout = self.config.timeouts.operation;
        for (device, entry) in self.mapping.iter() {
            if let Some(existing) = entry.destination_volume_id() {
                return Err(Error::Inconsistency(format!(
                    "{device} destination volume already set to {existing}"
                )));
            }
        }

        for (device, entry) in self.mapping.iter_mut() {
            let params = entry
                .volume_params
                .clone()
                .or_else(|| (device == BOOT_DEVICE).then(|| boot_override.cloned()).flatten())
                .unwrap_or_default();
            let request = VolumeRequest {
                name: entry.display_name.clone(),
                size_gb: entry.size_gb,
                bootable: entry.bootable,
                source: VolumeSource::Blank,
                params,
            };
            let volume = self.cloud.create_volume(&request, timeout).await?;
            info!(%device, volume = %volume.id, size_gb = volume.size_gb, "destination volume created");
            entry.set_destination_volume_id(volume.id)?;
        }
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
                    let volume_id = entry
                        .destination_volume_id()
                        .map(str::to_string)
                        .ok_or_else(|| {
                            Error::Inconsistency(format!("{device} has no destination volume"))
                        })?;
                    let guest = host.attach_volume(cloud.as_ref(), &volume_id, timeouts).await?;
                    entry.set_destination_device_path(guest)?;
                }
                Ok(())
            })
            .await
    }

    async fn convert_all(&mut self) -> Result<()> {
        let keys: Vec<String> = self.mapping.keys().cloned().collect();
        for device in keys {
            let (url, target) = {
                let entry = self
                    .mapping
                    .get(&device)
                    .ok_or_else(|| Error::Inconsistency(format!("{device} vanished")))?;
                let url = entry
                    .export_url
                    .clone()
                    .ok_or_else(|| Error::Inconsistency(format!("{device} has no export URL")))?;
                let target = entry.destination_device_path().map(str::to_string).ok_or_else(
                    || Error::Inconsistency(format!("{device} has no destination device")),
                )?;
                (url, target)
            };

            let source = self.prepare_source(&device, &url).await?;
            self.copy(&device, &source, &target).await?;
        }
        Ok(())
    }

    /// Sparsified overlay over the export, or the raw export if that fails
    async fn prepare_source(&mut self, device: &str, url: &str) -> Result<CopySource> {
        let shell = self.host.shell().clone();
        let name = device.rsplit('/').next().unwrap_or(device);
        let overlay = format!(
            "{}/{}-{name}.qcow2",
            self.config.paths.work_dir, self.transfer_uuid
        );
        self.overlays.push(overlay.clone());
        let raw = CopySource {
            path: url.to_string(),
            format: "raw",
        };

        let create = format!(
            "qemu-img create -f qcow2 -b {} -F raw {}",
            shell_escape(url),
            shell_escape(&overlay)
        );
        let created = shell.run(&create).await?;
        if !created.success() {
            warn!(%device, output = %created.output.trim(), "overlay creation failed, copying raw export");
            return Ok(raw);
        }

        let sparsify = format!(
            "LIBGUESTFS_BACKEND=direct virt-sparsify --in-place {}",
            shell_escape(&overlay)
        );
        let sparsified = shell.run(&sparsify).await?;
        if !sparsified.success() {
            warn!(%device, output = %sparsified.output.trim(), "sparsify failed, copying raw export");
            shell
                .run_checked(&format!("rm -f {}", shell_escape(&overlay)))
                .await?;
            return Ok(raw);
        }

        debug!(%device, %overlay, "overlay sparsified");
        Ok(CopySource {
            path: overlay,
            format: "qcow2",
        })
    }

    async fn copy(&mut self, device: &str, source: &CopySource, target: &str) -> Result<()> {
        let shell = self.host.shell().clone();
        let script = convert_script(source, target);
        info!(%device, from = %source.path, to = %target, "converting");

        let mut process = shell.spawn(&script).await?;
        let mut output = String::new();
        while let Some(event) = process.events.next().await {
            if matches!(event.event_type, ProcessEventType::Started { .. }) {
                continue;
            }
            let Some(line) = event.line() else { continue };
            output.push_str(line);
            output.push('\n');
            if let Some(percent) = parse_progress(line) {
                self.record_progress(device, percent).await;
            }
        }

        let status = process.handle.wait().await?;
        if !status.success() {
            return Err(Error::CommandFailed {
                what: format!("qemu-img convert of {device}"),
                host: shell.host().to_string(),
                code: status.code,
                output,
            });
        }

        self.record_progress(device, 100.0).await;
        info!(%device, "conversion finished");
        Ok(())
    }

    async fn record_progress(&mut self, device: &str, percent: f64) {
        let Some(entry) = self.mapping.get_mut(device) else {
            return;
        };
        if entry.progress_percent == Some(percent) {
            return;
        }
        entry.progress_percent = Some(percent);
        debug!(%device, percent, "progress");

        if let Some(file) = &self.progress {
            if let Err(e) = file.write(&self.mapping.progress()).await {
                warn!(path = %file.path().display(), error = %e, "failed to write progress file");
            }
        }
    }

    async fn detach_all(&mut self) -> Result<()> {
        let cloud = self.cloud.clone();
        let host = &self.host;
        let timeouts = &self.config.timeouts;
        let volumes: Vec<String> = self
            .mapping
            .iter()
            .filter_map(|(_, entry)| entry.destination_volume_id().map(str::to_string))
            .collect();

        self.attach_lock
            .with_lock(async move {
                for volume_id in &volumes {
                    host.detach_volume(cloud.as_ref(), volume_id, timeouts).await?;
                }
                Ok(())
            })
            .await
    }

    /// Stop the tunnel and remove everything this transfer left on the host
    async fn finalize(&mut self) -> Result<()> {
        let shell = self.host.shell().clone();
        let mut failures = Vec::new();

        if let Some(mut tunnel) = self.tunnel.take() {
            if let Err(e) = tunnel.handle.terminate().await {
                debug!(error = %e, "tunnel already gone");
            }
            if let Err(e) = tunnel.handle.wait().await {
                failures.push(format!("waiting for tunnel: {e}"));
            }
        }

        if !self.transfer_uuid.is_empty() {
            if let Err(e) = nbd::kill_tagged(shell.as_ref(), &self.transfer_uuid).await {
                failures.push(format!("killing tunnel processes: {e}"));
            }
        }

        let mut files: Vec<String> = self.key_path.take().into_iter().collect();
        files.append(&mut self.overlays);
        if !files.is_empty() {
            let escaped: Vec<String> = files.iter().map(|f| shell_escape(f)).collect();
            if let Err(e) = shell
                .run_checked(&format!("rm -f {}", escaped.join(" ")))
                .await
            {
                failures.push(format!("removing {}: {e}", files.join(", ")));
            }
        }

        let ports = std::mem::take(&mut self.tunnel_ports);
        if let Err(e) = self.ports.release(&ports).await {
            failures.push(format!("releasing tunnel ports {ports:?}: {e}"));
        }

        if !self.transfer_uuid.is_empty() {
            let source = self.source_ports.shell().clone();
            if let Err(e) = nbd::kill_tagged(source.as_ref(), &self.transfer_uuid).await {
                failures.push(format!("stopping exports on {}: {e}", source.host()));
            }
            let exports: Vec<u16> = self
                .mapping
                .iter()
                .filter_map(|(_, entry)| entry.export_port)
                .collect();
            if let Err(e) = self.source_ports.release(&exports).await {
                failures.push(format!("releasing export ports {exports:?}: {e}"));
            }
        }

        if failures.is_empty() {
            debug!("transfer teardown complete");
            Ok(())
        } else {
            for failure in &failures {
                warn!(%failure, "teardown step failed");
            }
            Err(Error::Cleanup { failures })
        }
    }
}

/// `qemu-img convert` with progress split into one line per update
fn convert_script(source: &CopySource, target: &str) -> String {
    let convert = format!(
        "qemu-img convert -p -f {} -O raw {} {}",
        source.format,
        shell_escape(&source.path),
        shell_escape(target)
    );
    // qemu-img redraws progress with carriage returns
    format!(
        "bash -o pipefail -c {}",
        shell_escape(&format!("{convert} 2>&1 | stdbuf -o0 tr '\\r' '\\n'"))
    )
}

/// Long-running `ssh -N` forwarding each local port to an export on the source host
fn tunnel_command(source: &TunnelTarget, key: &str, forwards: &[(String, u16, u16)]) -> String {
    let mut parts = vec![
        "ssh".to_string(),
        "-N".to_string(),
        "-o BatchMode=yes".to_string(),
        "-o StrictHostKeyChecking=no".to_string(),
        "-o UserKnownHostsFile=/dev/null".to_string(),
        "-o LogLevel=ERROR".to_string(),
        format!("-o ConnectTimeout={}", source.connect_timeout_secs.max(1)),
        "-o ExitOnForwardFailure=yes".to_string(),
        "-o ServerAliveInterval=30".to_string(),
        format!("-i {}", shell_escape(key)),
    ];
    if let Some(port) = source.port {
        parts.push(format!("-p {port}"));
    }
    for (_, local, remote) in forwards {
        parts.push(format!("-L 127.0.0.1:{local}:127.0.0.1:{remote}"));
    }
    parts.push(shell_escape(&format!("{}@{}", source.user, source.address)));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use command_executor::LocalShell;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// `qemu-img` stand-in that records its arguments and redraws progress
    /// the way the real tool does
    fn stub_qemu_img(dir: &Path, exit_code: i32) -> PathBuf {
        let bin = dir.join("bin");
        std::fs::create_dir(&bin).unwrap();
        let args = dir.join("args");
        let stub = bin.join("qemu-img");
        std::fs::write(
            &stub,
            format!(
                "#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\n\
                 printf '    (0.00/100%%)\\r    (50.00/100%%)\\r    (100.00/100%%)\\r\\n'\n\
                 exit {exit_code}\n",
                args.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        bin
    }

    fn run_convert(bin: &Path, source: &CopySource, target: &str) -> (Vec<f64>, bool) {
        let script = format!(
            "export PATH='{}':\"$PATH\"; {}",
            bin.display(),
            convert_script(source, target)
        );
        smol::block_on(async {
            let mut process = LocalShell::new().spawn(&script).await.unwrap();
            let mut progress = Vec::new();
            while let Some(event) = process.events.next().await {
                if let Some(percent) = event.line().and_then(parse_progress) {
                    progress.push(percent);
                }
            }
            let status = process.handle.wait().await.unwrap();
            (progress, status.success())
        })
    }

    #[test]
    fn test_convert_script_splits_progress_and_keeps_quoting() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_qemu_img(dir.path(), 0);
        let source = CopySource {
            path: "/var/tmp/v2v/disk one.qcow2".to_string(),
            format: "qcow2",
        };

        let (progress, success) = run_convert(&bin, &source, "/dev/vdb");

        assert!(success);
        assert_eq!(progress, vec![0.0, 50.0, 100.0]);
        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        assert_eq!(
            args.lines().collect::<Vec<_>>(),
            vec![
                "convert",
                "-p",
                "-f",
                "qcow2",
                "-O",
                "raw",
                "/var/tmp/v2v/disk one.qcow2",
                "/dev/vdb"
            ]
        );
    }

    #[test]
    fn test_convert_script_reports_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bin = stub_qemu_img(dir.path(), 1);
        let source = CopySource {
            path: "nbd://127.0.0.1:50001/uuid".to_string(),
            format: "raw",
        };

        let (progress, success) = run_convert(&bin, &source, "/dev/vdc");

        assert!(!success);
        assert_eq!(progress.last(), Some(&100.0));
    }

    #[test]
    fn test_tunnel_command() {
        let source = TunnelTarget {
            address: "10.1.0.4".to_string(),
            user: "cloud-user".to_string(),
            port: None,
            identity_file: PathBuf::from("/keys/src"),
            connect_timeout_secs: 10,
        };
        let forwards = vec![
            ("/dev/vda".to_string(), 50001, 49152),
            ("/dev/vdb".to_string(), 50002, 49153),
        ];
        let cmd = tunnel_command(&source, "/tmp/u.key", &forwards);

        assert!(cmd.starts_with("ssh -N -o BatchMode=yes"));
        assert!(cmd.contains("-o ExitOnForwardFailure=yes"));
        assert!(cmd.contains("-i /tmp/u.key"));
        assert!(cmd.contains("-L 127.0.0.1:50001:127.0.0.1:49152"));
        assert!(cmd.contains("-L 127.0.0.1:50002:127.0.0.1:49153"));
        assert!(!cmd.contains(" -p "));
        assert!(cmd.ends_with("cloud-user@10.1.0.4"));
    }
}
