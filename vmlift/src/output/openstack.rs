//! `-o openstack`: write disks into Cinder volumes attached to this
//! conversion appliance.
//!
//! One volume per disk, size rounded up to whole GiB. Each volume is
//! created, waited into the `available` state, attached to the
//! appliance server, and found under `/dev/disk/by-id` by a substring
//! of its id. The copy then writes straight into the block device.

use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::output::{MetadataParams, OutputOptions};
use crate::overlay::Overlay;
use crate::source::Source;
use crate::target::{Target, TargetLocation};
use crate::{Error, Result};

/// How long to wait for a volume to become `available`.
const VOLUME_TIMEOUT: Duration = Duration::from_secs(300);
/// Volume state poll interval.
const VOLUME_POLL: Duration = Duration::from_secs(5);
/// How long to wait for the attached device node.
const DEVICE_TIMEOUT: Duration = Duration::from_secs(60);
/// Device node poll interval.
const DEVICE_POLL: Duration = Duration::from_secs(1);
/// How much of the volume id appears in the by-id name. The serial is
/// truncated somewhere around here; 16 is known safe.
const BY_ID_PREFIX_LEN: usize = 16;

/// Output plugin for Cinder-backed OpenStack targets.
#[derive(Debug)]
pub struct OpenstackOutput {
    /// `-oo server-id`: the conversion appliance instance.
    server_id: String,
    /// `-oo guest-id`: optional value for the `guest_id` property.
    guest_id: Option<String>,
    /// `-oo dev-disk-by-id`: where attached devices appear.
    by_id_dir: PathBuf,
    /// Volumes created this run: `(volume id, attached)`.
    volumes: Vec<(String, bool)>,
}

impl OpenstackOutput {
    /// Builds the plugin; `-oo server-id` is required.
    pub fn new(opts: OutputOptions) -> Result<Self> {
        let server_id = opts
            .options
            .get("server-id")
            .cloned()
            .ok_or_else(|| {
                Error::InvalidArgument("-o openstack requires -oo server-id=<name|uuid>".into())
            })?;
        Ok(Self {
            server_id,
            guest_id: opts.options.get("guest-id").cloned(),
            by_id_dir: opts
                .options
                .get("dev-disk-by-id")
                .map_or_else(|| PathBuf::from("/dev/disk/by-id"), PathBuf::from),
            volumes: Vec::new(),
        })
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        format!("-o openstack -oo server-id={}", self.server_id)
    }

    /// The `openstack` client must be installed and authenticated.
    pub fn precheck(&self) -> Result<()> {
        which::which("openstack")
            .map_err(|_| Error::Output("the 'openstack' client is not installed".into()))?;
        if std::env::var_os("OS_AUTH_URL").is_none() && std::env::var_os("OS_CLOUD").is_none() {
            return Err(Error::Output(
                "no OpenStack authentication in the environment (OS_AUTH_URL/OS_CLOUD)".into(),
            ));
        }
        Ok(())
    }

    fn openstack(&self, args: &[&str]) -> Result<Value> {
        let out = Command::new("openstack")
            .args(args)
            .args(["-f", "json"])
            .output()
            .map_err(|e| Error::Output(format!("openstack: {e}")))?;
        if !out.status.success() {
            return Err(Error::from_command(Error::Output, "openstack", &out.stderr));
        }
        serde_json::from_slice(&out.stdout)
            .map_err(|e| Error::Output(format!("openstack returned unparseable JSON: {e}")))
    }

    fn openstack_quiet(&self, args: &[&str]) -> Result<()> {
        let out = Command::new("openstack")
            .args(args)
            .output()
            .map_err(|e| Error::Output(format!("openstack: {e}")))?;
        if !out.status.success() {
            return Err(Error::from_command(Error::Output, "openstack", &out.stderr));
        }
        Ok(())
    }

    /// Creates and attaches one volume per disk; targets are the
    /// attached block devices.
    pub fn prepare_targets(&mut self, source: &Source, overlays: &[Overlay]) -> Result<Vec<Target>> {
        let mut targets = Vec::with_capacity(overlays.len());
        for ov in overlays {
            let size_gib = ov.virtual_size.div_ceil(1 << 30).max(1);
            let name = format!("{}-{}", source.name, ov.device);

            let created = self.openstack(&[
                "volume",
                "create",
                "--size",
                &size_gib.to_string(),
                "--description",
                &format!("{} disk {} converted by vmlift", source.name, ov.disk_id),
                &name,
            ])?;
            let volume_id = created["id"]
                .as_str()
                .ok_or_else(|| Error::Output("volume create returned no id".into()))?
                .to_owned();
            info!(volume = %volume_id, size_gib, "created volume");
            self.volumes.push((volume_id.clone(), false));

            self.wait_volume_status(&volume_id, "available", VOLUME_TIMEOUT)?;

            self.openstack_quiet(&[
                "server",
                "add",
                "volume",
                &self.server_id,
                &volume_id,
            ])?;
            if let Some((_, attached)) = self.volumes.last_mut() {
                *attached = true;
            }

            let device = self.wait_device_node(&volume_id)?;
            targets.push(Target {
                location: TargetLocation::File(device),
                format: "raw".to_owned(),
                estimated_size: None,
                actual_size: None,
                overlay: ov.clone(),
            });
        }
        Ok(targets)
    }

    /// Polls `openstack volume show` until the wanted status.
    fn wait_volume_status(&self, volume_id: &str, wanted: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let shown = self.openstack(&["volume", "show", volume_id])?;
            let status = shown["status"].as_str().unwrap_or("");
            if status == wanted {
                return Ok(());
            }
            if status == "error" {
                return Err(Error::Output(format!("volume {volume_id} entered error state")));
            }
            if Instant::now() >= deadline {
                return Err(Error::Output(format!(
                    "timed out waiting for volume {volume_id} to become {wanted}"
                )));
            }
            debug!(volume = volume_id, status, "waiting for volume");
            std::thread::sleep(VOLUME_POLL);
        }
    }

    /// Waits for the attached volume's device node to appear under the
    /// by-id directory.
    fn wait_device_node(&self, volume_id: &str) -> Result<PathBuf> {
        let needle: String = volume_id.chars().take(BY_ID_PREFIX_LEN).collect();
        let deadline = Instant::now() + DEVICE_TIMEOUT;
        loop {
            if let Ok(entries) = std::fs::read_dir(&self.by_id_dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.contains(&needle) {
                        let resolved = std::fs::canonicalize(entry.path())?;
                        debug!(volume = volume_id, device = %resolved.display(), "volume attached");
                        return Ok(resolved);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Output(format!(
                    "timed out waiting for the device of volume {volume_id} under {}",
                    self.by_id_dir.display()
                )));
            }
            std::thread::sleep(DEVICE_POLL);
        }
    }

    /// Detaches the volumes and records the guest properties.
    pub fn create_metadata(&mut self, params: &MetadataParams<'_>) -> Result<()> {
        let volumes = std::mem::take(&mut self.volumes);
        for (i, (volume_id, attached)) in volumes.iter().enumerate() {
            if *attached {
                self.openstack_quiet(&[
                    "server",
                    "remove",
                    "volume",
                    &self.server_id,
                    volume_id,
                ])?;
                self.wait_volume_status(volume_id, "available", VOLUME_TIMEOUT)?;
            }

            let mut args: Vec<String> = vec![
                "volume".into(),
                "set".into(),
                "--property".into(),
                format!("virt_v2v_guest={}", params.source.name),
                "--property".into(),
                format!("virt_v2v_disk_index={i}"),
            ];
            if let Some(guest_id) = &self.guest_id {
                args.push("--property".into());
                args.push(format!("guest_id={guest_id}"));
            }
            if i == 0 {
                args.push("--bootable".into());
            }
            args.push(volume_id.clone());
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            self.openstack_quiet(&arg_refs)?;
        }
        info!(count = volumes.len(), "volumes detached and labelled");
        Ok(())
    }

    /// Failure path: detach whatever is attached, then delete all
    /// volumes created this run.
    pub fn delete_targets(&mut self) {
        let volumes = std::mem::take(&mut self.volumes);
        for (volume_id, attached) in volumes {
            if attached
                && let Err(e) = self.openstack_quiet(&[
                    "server",
                    "remove",
                    "volume",
                    &self.server_id,
                    &volume_id,
                ])
            {
                warn!(volume = %volume_id, error = %e, "failed to detach volume");
            }
            if let Err(e) = self.openstack_quiet(&["volume", "delete", &volume_id]) {
                warn!(volume = %volume_id, error = %e, "failed to delete volume");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn server_id_is_required() {
        assert!(OpenstackOutput::new(OutputOptions::default()).is_err());
        let opts = OutputOptions {
            options: [("server-id".to_owned(), "appliance".to_owned())].into(),
            ..OutputOptions::default()
        };
        let out = OpenstackOutput::new(opts).unwrap();
        assert_eq!(out.as_options(), "-o openstack -oo server-id=appliance");
        assert_eq!(out.by_id_dir, PathBuf::from("/dev/disk/by-id"));
    }

    #[test]
    fn by_id_prefix_is_sixteen_chars() {
        let id = "0123456789abcdef0123456789abcdef";
        let needle: String = id.chars().take(BY_ID_PREFIX_LEN).collect();
        assert_eq!(needle, "0123456789abcdef");
    }
}
