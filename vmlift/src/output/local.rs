//! `-o local`: converted disks plus a libvirt XML file in a directory.

use std::fs;
use std::path::PathBuf;

use tracing::info;

use crate::output::{Allocation, MetadataParams, OutputOptions, OutputPlugin, domxml};
use crate::overlay::Overlay;
use crate::qemuimg;
use crate::source::Source;
use crate::target::{Target, TargetLocation};
use crate::{Error, Result};

/// Output plugin writing into a plain directory.
#[derive(Debug)]
pub struct LocalOutput {
    /// Destination directory (`-os`).
    dir: PathBuf,
    /// Allocation policy.
    alloc: Allocation,
    /// Target format; default raw.
    format: String,
}

impl LocalOutput {
    /// Builds the plugin; `-os` is required.
    pub fn new(opts: OutputOptions) -> Result<Self> {
        let dir = opts
            .storage
            .ok_or_else(|| Error::InvalidArgument("-o local requires -os <directory>".into()))?;
        Ok(Self {
            dir: PathBuf::from(dir),
            alloc: opts.alloc,
            format: opts.format.unwrap_or_else(|| "raw".to_owned()),
        })
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        format!("-o local -os {} -of {}", self.dir.display(), self.format)
    }

    /// The destination directory must exist and be writable.
    pub fn precheck(&self) -> Result<()> {
        if !self.dir.is_dir() {
            return Err(Error::Output(format!(
                "output directory {} does not exist",
                self.dir.display()
            )));
        }
        let probe = self.dir.join(".vmlift-write-test");
        fs::write(&probe, b"").map_err(|e| {
            Error::Output(format!("output directory {} is not writable: {e}", self.dir.display()))
        })?;
        let _ = fs::remove_file(&probe);
        Ok(())
    }

    /// `<dir>/<name>-sda`, `<dir>/<name>-sdb`, …
    pub fn prepare_targets(
        &mut self,
        source: &Source,
        overlays: &[Overlay],
        estimates: &[Option<u64>],
    ) -> Result<Vec<Target>> {
        Ok(overlays
            .iter()
            .enumerate()
            .map(|(i, ov)| Target {
                location: TargetLocation::File(
                    self.dir.join(format!("{}-{}", source.name, ov.device)),
                ),
                format: self.format.clone(),
                estimated_size: estimates.get(i).copied().flatten(),
                actual_size: None,
                overlay: ov.clone(),
            })
            .collect())
    }

    /// Creates the target blob with `qemu-img create`.
    pub fn disk_create(&self, target: &Target) -> Result<()> {
        let TargetLocation::File(path) = &target.location else {
            return Err(Error::Output("local targets are files".into()));
        };
        let opts = qemuimg::CreateOpts {
            size: Some(target.overlay.virtual_size),
            preallocation: OutputPlugin::preallocation_for(self.alloc, &target.format),
            compat: (target.format == "qcow2").then(|| "1.1".to_owned()),
            ..qemuimg::CreateOpts::default()
        };
        qemuimg::create(path, &target.format, &opts).map_err(|e| Error::Output(e.to_string()))
    }

    /// Writes `<dir>/<name>.xml`.
    pub fn create_metadata(&mut self, params: &MetadataParams<'_>) -> Result<()> {
        let domain = domxml::build_domain(params);
        let path = self.dir.join(format!("{}.xml", params.source.name));
        fs::write(&path, domain.to_document())?;
        info!(path = %path.display(), "wrote libvirt XML");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::output::domxml::tests::fixture;
    use crate::source::Firmware;

    #[test]
    fn target_names_follow_device_letters() {
        let dir = tempfile::tempdir().unwrap();
        let opts = OutputOptions {
            storage: Some(dir.path().display().to_string()),
            ..OutputOptions::default()
        };
        let mut out = LocalOutput::new(opts).unwrap();
        out.precheck().unwrap();

        let (mut source, _, _, _, _) = fixture();
        source.name = "windows".into();
        let overlays = vec![
            Overlay {
                path: PathBuf::from("/c/o0.qcow2"),
                device: "sda".into(),
                virtual_size: 1 << 20,
                disk_id: 0,
            },
            Overlay {
                path: PathBuf::from("/c/o1.qcow2"),
                device: "sdb".into(),
                virtual_size: 1 << 20,
                disk_id: 1,
            },
        ];
        let targets = out
            .prepare_targets(&source, &overlays, &[Some(512), None])
            .unwrap();
        assert_eq!(
            targets[0].location,
            TargetLocation::File(dir.path().join("windows-sda"))
        );
        assert_eq!(
            targets[1].location,
            TargetLocation::File(dir.path().join("windows-sdb"))
        );
        assert_eq!(targets[0].estimated_size, Some(512));
        assert_eq!(targets[1].estimated_size, None);
    }

    #[test]
    fn metadata_lands_next_to_the_disks() {
        let dir = tempfile::tempdir().unwrap();
        let opts = OutputOptions {
            storage: Some(dir.path().display().to_string()),
            ..OutputOptions::default()
        };
        let mut out = LocalOutput::new(opts).unwrap();
        let (source, targets, buses, caps, inspect) = fixture();
        let firmware = Firmware::Bios;
        out.create_metadata(&MetadataParams {
            source: &source,
            targets: &targets,
            buses: &buses,
            caps: &caps,
            inspect: &inspect,
            firmware: &firmware,
        })
        .unwrap();

        let xml = fs::read_to_string(dir.path().join("guest.xml")).unwrap();
        assert!(xml.contains("<domain type=\"kvm\""));
        assert!(xml.contains("guest-sda"));
    }

    #[test]
    fn missing_directory_fails_precheck() {
        let opts = OutputOptions {
            storage: Some("/nonexistent/vmlift-out".to_owned()),
            ..OutputOptions::default()
        };
        assert!(LocalOutput::new(opts).unwrap().precheck().is_err());
    }
}
