//! `-i libvirtxml`: domain XML read from a local file.

use std::fs;
use std::path::PathBuf;

use crate::input::{InputOptions, domxml};
use crate::source::Source;
use crate::xml::Element;
use crate::{Error, Result};

/// Input plugin for a saved libvirt domain XML file.
#[derive(Debug)]
pub struct LibvirtXmlInput {
    /// Path to the XML file.
    path: PathBuf,
}

impl LibvirtXmlInput {
    /// Creates the plugin from the positional path argument.
    pub fn new(path: &str, _opts: InputOptions) -> Self {
        Self {
            path: PathBuf::from(path),
        }
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        format!("-i libvirtxml {}", self.path.display())
    }

    /// Parses the file. Relative disk paths resolve against the file's
    /// directory.
    pub fn source(&mut self) -> Result<Source> {
        let xml = fs::read_to_string(&self.path)
            .map_err(|e| Error::Input(format!("{}: {e}", self.path.display())))?;
        let root = Element::parse(&xml)?;
        let base_dir = self.path.parent().map(std::path::Path::to_path_buf);
        domxml::parse_domain(&root, base_dir.as_deref(), None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn relative_disks_resolve_against_the_xml_directory() {
        let dir = tempfile::tempdir().unwrap();
        let xml_path = dir.path().join("guest.xml");
        std::fs::write(
            &xml_path,
            r"<domain type='kvm'><name>g</name><memory>1048576</memory><devices>
                <disk type='file' device='disk'><source file='disks/root.qcow2'/></disk>
              </devices></domain>",
        )
        .unwrap();

        let mut input = LibvirtXmlInput::new(&xml_path.display().to_string(), InputOptions::default());
        let src = input.source().unwrap();
        assert_eq!(
            src.disks[0].uri,
            dir.path().join("disks/root.qcow2").display().to_string()
        );
    }
}
