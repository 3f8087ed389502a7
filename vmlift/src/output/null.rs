//! `-o null`: convert and throw the result away. Useful for testing
//! conversions without provisioning storage.

use std::path::PathBuf;

use crate::output::OutputOptions;
use crate::overlay::Overlay;
use crate::qemuimg;
use crate::source::Source;
use crate::target::{Target, TargetLocation};
use crate::{Error, Result};

/// The discarding output. Forces format raw and sparse allocation.
#[derive(Debug)]
pub struct NullOutput {
    /// Scratch directory holding the discarded files.
    dir: PathBuf,
}

impl NullOutput {
    /// Builds the plugin; all options are ignored.
    pub fn new(_opts: &OutputOptions) -> Self {
        Self {
            dir: std::env::temp_dir(),
        }
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        "-o null".to_owned()
    }

    /// Targets are temp files, deleted unconditionally at exit.
    pub fn prepare_targets(&mut self, source: &Source, overlays: &[Overlay]) -> Result<Vec<Target>> {
        Ok(overlays
            .iter()
            .map(|ov| Target {
                location: TargetLocation::File(self.dir.join(format!(
                    "vmlift-null-{}-{}-{}",
                    std::process::id(),
                    source.name,
                    ov.device
                ))),
                format: "raw".to_owned(),
                estimated_size: None,
                actual_size: None,
                overlay: ov.clone(),
            })
            .collect())
    }

    /// Creates a sparse raw file.
    pub fn disk_create(&self, target: &Target) -> Result<()> {
        let TargetLocation::File(path) = &target.location else {
            return Err(Error::Output("null targets are files".into()));
        };
        let opts = qemuimg::CreateOpts {
            size: Some(target.overlay.virtual_size),
            ..qemuimg::CreateOpts::default()
        };
        qemuimg::create(path, "raw", &opts).map_err(|e| Error::Output(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::source::tests::minimal_source;

    #[test]
    fn forces_raw_format() {
        let mut out = NullOutput::new(&OutputOptions {
            format: Some("qcow2".to_owned()),
            ..OutputOptions::default()
        });
        let overlays = vec![Overlay {
            path: PathBuf::from("/c/o0.qcow2"),
            device: "sda".into(),
            virtual_size: 1 << 20,
            disk_id: 0,
        }];
        let targets = out.prepare_targets(&minimal_source(), &overlays).unwrap();
        assert_eq!(targets[0].format, "raw");
    }
}
