//! Input plugins: read source metadata and expose the guest's disks.
//!
//! Each plugin yields a [`Source`] whose ordered disk list carries
//! QEMU-consumable URIs. Plugins are a closed set dispatched on the
//! variant tag; they own whatever scratch state (extracted archives,
//! nbdkit children) must stay alive until the copy completes.

pub mod disk;
mod domxml;
pub mod libvirt;
pub mod libvirtxml;
pub mod ova;
pub mod vddk;
pub mod vmx;

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::source::Source;
use crate::{Error, Result};

/// Options shared by all input plugins, straight from the CLI.
#[derive(Debug, Clone, Default)]
pub struct InputOptions {
    /// `-ic`: connection URI (libvirt) or `ssh://` URI (vmx).
    pub conn: Option<String>,
    /// `-if`: declared disk format.
    pub format: Option<String>,
    /// `-io key[=value]`, repeatable.
    pub options: BTreeMap<String, String>,
    /// `-ip`: password file.
    pub password_file: Option<PathBuf>,
    /// `-it`: transport (`ssh` or `vddk`).
    pub transport: Option<String>,
}

/// Context handed to `source()`: where scratch state may be created.
#[derive(Debug, Clone)]
pub struct InputContext {
    /// Cache directory for overlays, extracted archives and sockets.
    pub cache_dir: PathBuf,
}

/// The closed set of input plugins.
#[derive(Debug)]
#[non_exhaustive]
pub enum InputPlugin {
    /// `-i disk`: a single local disk image.
    Disk(disk::DiskInput),
    /// `-i libvirt`: fetch domain XML from a libvirt connection.
    Libvirt(libvirt::LibvirtInput),
    /// `-i libvirtxml`: domain XML from a local file.
    LibvirtXml(libvirtxml::LibvirtXmlInput),
    /// `-i ova`: an OVA tarball or unpacked directory.
    Ova(ova::OvaInput),
    /// `-i vmx`: a VMware VMX file, local or over SSH.
    Vmx(vmx::VmxInput),
    /// `-i libvirt -it vddk`: libvirt metadata, VDDK data path.
    Vddk(vddk::VddkInput),
}

/// Input module names reported by the capability dump.
pub const INPUT_NAMES: &[&str] = &["disk", "libvirt", "libvirtxml", "ova", "vmx"];

impl InputPlugin {
    /// Builds the plugin selected by `-i mode` (plus `-it transport`).
    pub fn from_cli(mode: &str, arg: &str, opts: InputOptions) -> Result<Self> {
        match (mode, opts.transport.as_deref()) {
            ("disk", _) => Ok(Self::Disk(disk::DiskInput::new(arg, opts))),
            ("libvirt", Some("vddk")) => Ok(Self::Vddk(vddk::VddkInput::new(arg, opts))),
            ("libvirt", _) => Ok(Self::Libvirt(libvirt::LibvirtInput::new(arg, opts))),
            ("libvirtxml", _) => Ok(Self::LibvirtXml(libvirtxml::LibvirtXmlInput::new(arg, opts))),
            ("ova", _) => Ok(Self::Ova(ova::OvaInput::new(arg, opts))),
            ("vmx", _) => Ok(Self::Vmx(vmx::VmxInput::new(arg, opts))),
            (other, _) => Err(Error::InvalidArgument(format!("unknown input mode '{other}'"))),
        }
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        match self {
            Self::Disk(p) => p.as_options(),
            Self::Libvirt(p) => p.as_options(),
            Self::LibvirtXml(p) => p.as_options(),
            Self::Ova(p) => p.as_options(),
            Self::Vmx(p) => p.as_options(),
            Self::Vddk(p) => p.as_options(),
        }
    }

    /// Reads the source. May block on the network; may spawn block-data
    /// children that live inside the plugin until it is dropped.
    pub fn source(&mut self, ctx: &InputContext) -> Result<Source> {
        let source = match self {
            Self::Disk(p) => p.source(),
            Self::Libvirt(p) => p.source(),
            Self::LibvirtXml(p) => p.source(),
            Self::Ova(p) => p.source(ctx),
            Self::Vmx(p) => p.source(ctx),
            Self::Vddk(p) => p.source(ctx),
        }?;
        source.validate()?;
        Ok(source)
    }

    /// The `-io ?` help text for one input mode.
    pub fn option_help(mode: &str) -> &'static str {
        match mode {
            "vmx" => "Input options for -i vmx:\n  -io ssh-agent=true    force ssh-agent authentication\n",
            "libvirt" => "Input options for -i libvirt (with -it vddk):\n  -io vddk-libdir=LIBDIR\n  -io vddk-thumbprint=xx:xx:xx:...\n  -io vddk-config=FILE\n  -io vddk-snapshot=SNAPSHOT-MOREF\n",
            _ => "No -io options for this input mode.\n",
        }
    }
}
