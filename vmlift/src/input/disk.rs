//! `-i disk`: a single local disk image with synthetic guest metadata.

use std::path::PathBuf;

use crate::input::InputOptions;
use crate::qemuimg;
use crate::source::{Firmware, Hypervisor, Nic, Source, SourceDisk, VnetKind};
use crate::{Error, Result};

/// Defaults when converting a bare disk: 2048 MiB RAM, 1 vCPU.
const DEFAULT_MEMORY: u64 = 2048 * 1024 * 1024;

/// Input plugin for a bare disk image.
#[derive(Debug)]
pub struct DiskInput {
    /// The image path.
    path: PathBuf,
    /// Declared format (`-if`), probed if absent.
    format: Option<String>,
}

impl DiskInput {
    /// Creates the plugin from the positional path argument.
    pub fn new(path: &str, opts: InputOptions) -> Self {
        Self {
            path: PathBuf::from(path),
            format: opts.format,
        }
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        match &self.format {
            Some(f) => format!("-i disk -if {f} {}", self.path.display()),
            None => format!("-i disk {}", self.path.display()),
        }
    }

    /// Builds the synthetic source around the one disk.
    pub fn source(&mut self) -> Result<Source> {
        if !self.path.exists() {
            return Err(Error::Input(format!(
                "disk image does not exist: {}",
                self.path.display()
            )));
        }

        let format = match &self.format {
            Some(f) => f.clone(),
            None => {
                let info = qemuimg::info(&self.path.display().to_string())
                    .map_err(|e| Error::Input(e.to_string()))?;
                info.format
            }
        };
        if format == "unknown" {
            return Err(Error::Input(format!(
                "cannot detect the format of {}; use -if to declare it",
                self.path.display()
            )));
        }

        let name = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Input("cannot derive a guest name from the disk path".into()))?;

        Ok(Source {
            orig_name: name.clone(),
            name,
            memory: DEFAULT_MEMORY,
            vcpu: 1,
            cpu_vendor: None,
            cpu_model: None,
            topology: None,
            genid: None,
            firmware: Firmware::Unknown,
            features: Vec::new(),
            display: None,
            video: None,
            sound: None,
            disks: vec![SourceDisk {
                id: 0,
                uri: self.path.display().to_string(),
                format: Some(format),
                controller: None,
            }],
            removables: Vec::new(),
            nics: vec![Nic::new(
                None,
                None,
                "default".to_owned(),
                VnetKind::Network,
            )],
            hypervisor: Hypervisor::Other("disk".to_owned()),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn opts(format: Option<&str>) -> InputOptions {
        InputOptions {
            format: format.map(str::to_owned),
            conn: None,
            options: BTreeMap::new(),
            password_file: None,
            transport: None,
        }
    }

    #[test]
    fn declared_format_skips_probing() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("win7.img");
        std::fs::write(&img, b"not really a disk").unwrap();

        let mut input = DiskInput::new(&img.display().to_string(), opts(Some("raw")));
        let src = input.source().unwrap();
        assert_eq!(src.name, "win7");
        assert_eq!(src.memory, 2048 * 1024 * 1024);
        assert_eq!(src.vcpu, 1);
        assert_eq!(src.disks.len(), 1);
        assert_eq!(src.disks[0].format.as_deref(), Some("raw"));
        // One default network NIC.
        assert_eq!(src.nics.len(), 1);
        assert_eq!(src.nics[0].vnet, "default");
    }

    #[test]
    fn missing_file_is_an_input_error() {
        let mut input = DiskInput::new("/nonexistent/disk.img", opts(Some("raw")));
        assert!(matches!(input.source(), Err(Error::Input(_))));
    }

    #[test]
    fn as_options_is_reproducible() {
        let input = DiskInput::new("/tmp/d.img", opts(Some("qcow2")));
        assert_eq!(input.as_options(), "-i disk -if qcow2 /tmp/d.img");
    }
}
