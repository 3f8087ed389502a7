//! Output plugins: provision targets and publish converted guests.
//!
//! Like the inputs, outputs are a closed set dispatched on the variant
//! tag. The controller calls them in a fixed order: `precheck`,
//! `prepare_targets`, `disk_create` per target, then (after the copy)
//! `create_metadata`. On failure `delete_targets` tears down whatever
//! was provisioned.

pub mod domxml;
pub mod glance;
pub mod libvirt;
pub mod local;
pub mod null;
pub mod openstack;
pub mod qemu;
pub mod vdsm;

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::inspect::Inspection;
use crate::overlay::Overlay;
use crate::source::{Firmware, Source};
use crate::target::{BusAssignment, GuestCaps, Target};
use crate::{Error, Result};

/// Target allocation policy (`-oa`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Allocation {
    /// Holes stay holes.
    #[default]
    Sparse,
    /// Fully allocated on creation.
    Preallocated,
}

/// Options shared by all output plugins, straight from the CLI.
#[derive(Debug, Clone, Default)]
pub struct OutputOptions {
    /// `-oa`: allocation policy.
    pub alloc: Allocation,
    /// `-of`: target format (`raw`/`qcow2`); plugins may force one.
    pub format: Option<String>,
    /// `-oc`: connection URI.
    pub conn: Option<String>,
    /// `-on`: rename the guest.
    pub name: Option<String>,
    /// `-oo key[=value]`, repeatable.
    pub options: BTreeMap<String, String>,
    /// `-op`: password file.
    pub password_file: Option<PathBuf>,
    /// `-os`: storage (directory, pool, storage domain, …).
    pub storage: Option<String>,
    /// `--qemu-boot`: boot the guest right after `-o qemu`.
    pub qemu_boot: bool,
}

/// Firmware kinds an output can host.
pub type FirmwareSet = &'static [&'static str];

/// Everything `create_metadata` needs to know.
#[derive(Debug)]
pub struct MetadataParams<'a> {
    /// The (possibly renamed) source description.
    pub source: &'a Source,
    /// Finished targets, one per disk, in disk order.
    pub targets: &'a [Target],
    /// The bus plan from the converter.
    pub buses: &'a BusAssignment,
    /// Capabilities of the converted guest.
    pub caps: &'a GuestCaps,
    /// Inspection facts.
    pub inspect: &'a Inspection,
    /// Effective target firmware.
    pub firmware: &'a Firmware,
}

/// The closed set of output plugins.
#[derive(Debug)]
#[non_exhaustive]
pub enum OutputPlugin {
    /// `-o local`: files plus libvirt XML in a directory.
    Local(local::LocalOutput),
    /// `-o libvirt`: a libvirt pool plus a defined domain.
    Libvirt(libvirt::LibvirtOutput),
    /// `-o null`: discard everything (testing).
    Null(null::NullOutput),
    /// `-o qemu`: files plus a runnable shell script.
    Qemu(qemu::QemuOutput),
    /// `-o rhv`/`-o vdsm`: oVirt/RHV storage-domain layout + OVF.
    Vdsm(vdsm::VdsmOutput),
    /// `-o glance`: image-service upload.
    Glance(glance::GlanceOutput),
    /// `-o openstack`: Cinder volumes attached to this appliance.
    Openstack(openstack::OpenstackOutput),
}

/// Output module names reported by the capability dump.
pub const OUTPUT_NAMES: &[&str] = &[
    "local", "libvirt", "null", "qemu", "glance", "openstack", "rhv", "vdsm",
];

/// OVF flavours reported by the capability dump.
pub const OVF_FLAVOURS: &[&str] = &["ovirt", "rhvexp4.2"];

impl OutputPlugin {
    /// Builds the plugin selected by `-o mode`.
    pub fn from_cli(mode: &str, opts: OutputOptions) -> Result<Self> {
        match mode {
            "local" => Ok(Self::Local(local::LocalOutput::new(opts)?)),
            "libvirt" => Ok(Self::Libvirt(libvirt::LibvirtOutput::new(opts))),
            "null" => Ok(Self::Null(null::NullOutput::new(&opts))),
            "qemu" => Ok(Self::Qemu(qemu::QemuOutput::new(opts)?)),
            "rhv" | "rhv-upload" | "vdsm" => Ok(Self::Vdsm(vdsm::VdsmOutput::new(opts)?)),
            "glance" => Ok(Self::Glance(glance::GlanceOutput::new(opts))),
            "openstack" => Ok(Self::Openstack(openstack::OpenstackOutput::new(opts)?)),
            other => Err(Error::InvalidArgument(format!(
                "unknown output mode '{other}'"
            ))),
        }
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        match self {
            Self::Local(p) => p.as_options(),
            Self::Libvirt(p) => p.as_options(),
            Self::Null(p) => p.as_options(),
            Self::Qemu(p) => p.as_options(),
            Self::Vdsm(p) => p.as_options(),
            Self::Glance(p) => p.as_options(),
            Self::Openstack(p) => p.as_options(),
        }
    }

    /// Firmware kinds this output can host.
    pub fn supported_firmware(&self) -> FirmwareSet {
        match self {
            Self::Local(_) | Self::Libvirt(_) | Self::Null(_) | Self::Qemu(_) => &["bios", "uefi"],
            Self::Vdsm(_) | Self::Glance(_) | Self::Openstack(_) => &["bios", "uefi"],
        }
    }

    /// Whether the Windows converter should queue the RHV agent.
    pub fn install_rhev_apt(&self) -> bool {
        matches!(self, Self::Vdsm(_))
    }

    /// Whether Linux converters must keep the serial console.
    pub fn keep_serial_console(&self) -> bool {
        !matches!(self, Self::Vdsm(_) | Self::Glance(_))
    }

    /// Verifies tooling and authentication before any work happens.
    pub fn precheck(&self) -> Result<()> {
        match self {
            Self::Local(p) => p.precheck(),
            Self::Libvirt(p) => p.precheck(),
            Self::Null(_) => Ok(()),
            Self::Qemu(p) => p.precheck(),
            Self::Vdsm(p) => p.precheck(),
            Self::Glance(p) => p.precheck(),
            Self::Openstack(p) => p.precheck(),
        }
    }

    /// Fails early when UEFI was requested but the host lacks firmware
    /// blobs for this output.
    pub fn check_target_firmware(&self, caps: &GuestCaps, firmware: &Firmware) -> Result<()> {
        if !matches!(firmware, Firmware::Uefi { .. }) {
            return Ok(());
        }
        match self {
            Self::Local(_) | Self::Libvirt(_) | Self::Qemu(_) => {
                if domxml::uefi_firmware(&caps.arch).is_none() {
                    return Err(Error::Output(
                        "the guest needs UEFI but no OVMF/AAVMF firmware is installed on this host"
                            .into(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Allocates destinations, one per overlay, in disk order.
    pub fn prepare_targets(
        &mut self,
        source: &Source,
        overlays: &[Overlay],
        estimates: &[Option<u64>],
    ) -> Result<Vec<Target>> {
        match self {
            Self::Local(p) => p.prepare_targets(source, overlays, estimates),
            Self::Libvirt(p) => p.prepare_targets(source, overlays, estimates),
            Self::Null(p) => p.prepare_targets(source, overlays),
            Self::Qemu(p) => p.prepare_targets(source, overlays, estimates),
            Self::Vdsm(p) => p.prepare_targets(source, overlays, estimates),
            Self::Glance(p) => p.prepare_targets(source, overlays),
            Self::Openstack(p) => p.prepare_targets(source, overlays),
        }
    }

    /// Creates one target blob with exact parameters.
    pub fn disk_create(&self, target: &Target) -> Result<()> {
        match self {
            Self::Local(p) => p.disk_create(target),
            Self::Libvirt(p) => p.disk_create(target),
            Self::Null(p) => p.disk_create(target),
            Self::Qemu(p) => p.disk_create(target),
            Self::Vdsm(p) => p.disk_create(target),
            Self::Glance(p) => p.disk_create(target),
            Self::Openstack(_) => Ok(()), // the attached volume is the blob
        }
    }

    /// Emits the target-side metadata after a successful copy.
    pub fn create_metadata(&mut self, params: &MetadataParams<'_>) -> Result<()> {
        match self {
            Self::Local(p) => p.create_metadata(params),
            Self::Libvirt(p) => p.create_metadata(params),
            Self::Null(_) => Ok(()),
            Self::Qemu(p) => p.create_metadata(params),
            Self::Vdsm(p) => p.create_metadata(params),
            Self::Glance(p) => p.create_metadata(params),
            Self::Openstack(p) => p.create_metadata(params),
        }
    }

    /// Deletes provisioned targets after a failed run. Errors are
    /// reported but deletion continues.
    pub fn delete_targets(&mut self, targets: &[Target]) {
        match self {
            Self::Openstack(p) => p.delete_targets(),
            _ => {
                for t in targets {
                    if let crate::target::TargetLocation::File(path) = &t.location
                        && let Err(e) = std::fs::remove_file(path)
                        && e.kind() != std::io::ErrorKind::NotFound
                    {
                        tracing::warn!(path = %path.display(), error = %e, "failed to delete target");
                    }
                }
            }
        }
    }

    /// The `-oo ?` help text for one output mode.
    pub fn option_help(mode: &str) -> &'static str {
        match mode {
            "openstack" => "Output options for -o openstack:\n  -oo server-id=NAME|UUID    conversion appliance instance\n  -oo guest-id=ID            set the guest_id volume property\n  -oo dev-disk-by-id=PATH    override the /dev/disk/by-id directory\n",
            "vdsm" | "rhv" => "Output options for -o rhv:\n  -oo vdsm-compat=0.10|1.1   qcow2 compat level for the data domain\n",
            _ => "No -oo options for this output mode.\n",
        }
    }

    /// Translates the allocation policy into a qemu-img preallocation
    /// mode for a given format.
    pub(crate) fn preallocation_for(alloc: Allocation, format: &str) -> Option<String> {
        match (alloc, format) {
            (Allocation::Sparse, _) => None,
            (Allocation::Preallocated, "raw") => Some("falloc".to_owned()),
            (Allocation::Preallocated, _) => Some("falloc".to_owned()),
        }
    }
}
