//! `-o glance`: upload converted disks to an OpenStack image service.
//!
//! Disks are converted into temporary local files, then pushed with the
//! `glance` CLI. The first disk is the bootable image and carries the
//! guest properties; further disks are uploaded as plain images.

use std::process::Command;

use tracing::info;

use crate::output::{MetadataParams, OutputOptions};
use crate::overlay::Overlay;
use crate::qemuimg;
use crate::source::{Firmware, Source};
use crate::target::{Machine, NetBus, Target, TargetLocation, TargetVideo};
use crate::{Error, Result};

/// Output plugin for Glance-style image services.
#[derive(Debug)]
pub struct GlanceOutput {
    /// Target format; default raw.
    format: String,
    /// Temporary conversion directory.
    tmpdir: Option<tempfile::TempDir>,
}

impl GlanceOutput {
    /// Builds the plugin.
    pub fn new(opts: OutputOptions) -> Self {
        Self {
            format: opts.format.unwrap_or_else(|| "raw".to_owned()),
            tmpdir: None,
        }
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        format!("-o glance -of {}", self.format)
    }

    /// The `glance` client must be installed and authenticated via the
    /// usual `OS_*` environment.
    pub fn precheck(&self) -> Result<()> {
        which::which("glance")
            .map_err(|_| Error::Output("the 'glance' client is not installed".into()))?;
        if std::env::var_os("OS_AUTH_URL").is_none() {
            return Err(Error::Output(
                "OS_AUTH_URL is not set; source your OpenStack RC file first".into(),
            ));
        }
        Ok(())
    }

    /// Conversion happens into temporary local files.
    pub fn prepare_targets(&mut self, source: &Source, overlays: &[Overlay]) -> Result<Vec<Target>> {
        let tmpdir = tempfile::Builder::new().prefix("vmlift-glance-").tempdir()?;
        let targets = overlays
            .iter()
            .map(|ov| Target {
                location: TargetLocation::File(
                    tmpdir.path().join(format!("{}-{}", source.name, ov.device)),
                ),
                format: self.format.clone(),
                estimated_size: None,
                actual_size: None,
                overlay: ov.clone(),
            })
            .collect();
        self.tmpdir = Some(tmpdir);
        Ok(targets)
    }

    /// Creates the local staging blob.
    pub fn disk_create(&self, target: &Target) -> Result<()> {
        let TargetLocation::File(path) = &target.location else {
            return Err(Error::Output("glance staging targets are files".into()));
        };
        let opts = qemuimg::CreateOpts {
            size: Some(target.overlay.virtual_size),
            ..qemuimg::CreateOpts::default()
        };
        qemuimg::create(path, &target.format, &opts).map_err(|e| Error::Output(e.to_string()))
    }

    /// Uploads every disk; the first gets the image properties.
    pub fn create_metadata(&mut self, params: &MetadataParams<'_>) -> Result<()> {
        for (i, target) in params.targets.iter().enumerate() {
            let TargetLocation::File(path) = &target.location else {
                continue;
            };
            let image_name = if i == 0 {
                params.source.name.clone()
            } else {
                format!("{}-disk{}", params.source.name, i + 1)
            };

            let mut cmd = Command::new("glance");
            cmd.args([
                "image-create",
                "--name",
                &image_name,
                "--disk-format",
                &target.format,
                "--container-format",
                "bare",
                "--file",
                &path.display().to_string(),
            ]);
            if i == 0 {
                let min_ram_mb = params.source.memory / (1 << 20);
                cmd.args(["--min-ram", &min_ram_mb.to_string()]);
                for (key, value) in first_disk_properties(params) {
                    cmd.args(["--property", &format!("{key}={value}")]);
                }
            }
            let out = cmd
                .output()
                .map_err(|e| Error::Output(format!("glance: {e}")))?;
            if !out.status.success() {
                return Err(Error::from_command(Error::Output, "glance image-create", &out.stderr));
            }
            info!(image = %image_name, "uploaded image");
        }
        Ok(())
    }
}

/// Image properties describing the converted guest.
fn first_disk_properties(params: &MetadataParams<'_>) -> Vec<(&'static str, String)> {
    let caps = params.caps;
    let inspect = params.inspect;
    let mut props: Vec<(&'static str, String)> = vec![
        (
            "hw_disk_bus",
            match caps.block_bus {
                crate::target::BlockBus::VirtioBlk => "virtio".into(),
                crate::target::BlockBus::VirtioScsi => "scsi".into(),
                crate::target::BlockBus::Ide => "ide".into(),
            },
        ),
        (
            "hw_vif_model",
            match caps.net_bus {
                NetBus::VirtioNet => "virtio".into(),
                NetBus::E1000 => "e1000".into(),
                NetBus::Rtl8139 => "rtl8139".into(),
            },
        ),
        (
            "hw_video_model",
            match caps.video {
                TargetVideo::Qxl => "qxl".into(),
                TargetVideo::Cirrus => "cirrus".into(),
            },
        ),
        (
            "hw_machine_type",
            match caps.machine {
                Machine::I440fx => "pc".into(),
                Machine::Q35 => "q35".into(),
                Machine::Virt => "virt".into(),
            },
        ),
        ("os_type", inspect.os_type.clone()),
        ("os_distro", glance_distro(&inspect.distro)),
        (
            "os_version",
            format!("{}.{}", inspect.major, inspect.minor),
        ),
        ("architecture", caps.arch.clone()),
        ("hypervisor_type", "kvm".into()),
        ("vm_mode", "hvm".into()),
    ];
    if caps.virtio_rng {
        props.push(("hw_rng_model", "virtio".into()));
    }
    if matches!(params.firmware, Firmware::Uefi { .. }) {
        props.push(("hw_firmware_type", "uefi".into()));
    }
    props
}

/// Glance has its own distro vocabulary; translate the few that
/// differ.
fn glance_distro(distro: &str) -> String {
    match distro {
        "sles" => "sled".to_owned(),
        "windows" => "windows".to_owned(),
        other => other.to_owned(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::output::domxml::tests::fixture;

    #[test]
    fn first_disk_properties_describe_the_guest() {
        let (source, targets, buses, caps, inspect) = fixture();
        let firmware = Firmware::Uefi {
            secure_boot_required: false,
        };
        let params = MetadataParams {
            source: &source,
            targets: &targets,
            buses: &buses,
            caps: &caps,
            inspect: &inspect,
            firmware: &firmware,
        };
        let props = first_disk_properties(&params);
        let get = |k: &str| {
            props
                .iter()
                .find(|(key, _)| *key == k)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("hw_disk_bus").as_deref(), Some("virtio"));
        assert_eq!(get("hypervisor_type").as_deref(), Some("kvm"));
        assert_eq!(get("vm_mode").as_deref(), Some("hvm"));
        assert_eq!(get("os_version").as_deref(), Some("35.0"));
        assert_eq!(get("hw_rng_model").as_deref(), Some("virtio"));
        assert_eq!(get("hw_firmware_type").as_deref(), Some("uefi"));
    }
}
