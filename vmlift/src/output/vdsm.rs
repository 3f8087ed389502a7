//! `-o rhv` / `-o vdsm`: oVirt/RHV export layout on a storage domain.
//!
//! Disks become volumes under
//! `<mount>/<SD_UUID>/images/<IMG_UUID>/<VOL_UUID>` with a `.meta`
//! sibling each; the VM descriptor is an OVF 0.9 document under
//! `master/vms/<VM_UUID>/`. On root-squashing NFS exports everything
//! must be owned by vdsm:kvm (36:36), so writes run under a temporary
//! uid/gid switch when we are root.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::output::{Allocation, MetadataParams, OutputOptions, OutputPlugin};
use crate::overlay::Overlay;
use crate::qemuimg;
use crate::source::{Hypervisor, Source};
use crate::target::{Target, TargetLocation};
use crate::{Error, Result};

/// The vdsm user/group on RHV storage domains.
const VDSM_UID: u32 = 36;
const KVM_GID: u32 = 36;

/// Output plugin for RHV storage domains.
#[derive(Debug)]
pub struct VdsmOutput {
    /// Storage-domain mount point (`-os`).
    mount: PathBuf,
    /// Allocation policy.
    alloc: Allocation,
    /// `raw` or `qcow2` (`RAW`/`COW` in the metadata).
    format: String,
    /// qcow2 compat for the data domain (`-oo vdsm-compat`).
    compat: String,
    /// Storage-domain UUID, found by `precheck`.
    sd_uuid: Option<Uuid>,
    /// Per-disk image/volume UUIDs, allocated in `prepare_targets`.
    disk_uuids: Vec<(Uuid, Uuid)>,
    /// VM UUID for the descriptor.
    vm_uuid: Uuid,
    /// Fresh snapshot id for this run.
    vm_snapshot_id: Uuid,
}

/// Temporarily assumes vdsm:kvm while in scope. A no-op (with a
/// warning) when not root.
#[derive(Debug)]
struct UidSwitch {
    active: bool,
}

impl UidSwitch {
    fn assume() -> Self {
        if nix::unistd::geteuid().is_root() {
            let ok = nix::unistd::setegid(nix::unistd::Gid::from_raw(KVM_GID)).is_ok()
                && nix::unistd::seteuid(nix::unistd::Uid::from_raw(VDSM_UID)).is_ok();
            if !ok {
                warn!("failed to switch to vdsm:kvm; NFS writes may be rejected");
            }
            Self { active: ok }
        } else {
            warn!("not running as root; files will not be owned by vdsm:kvm (36:36)");
            Self { active: false }
        }
    }
}

impl Drop for UidSwitch {
    fn drop(&mut self) {
        if self.active {
            let _ = nix::unistd::seteuid(nix::unistd::Uid::from_raw(0));
            let _ = nix::unistd::setegid(nix::unistd::Gid::from_raw(0));
        }
    }
}

impl VdsmOutput {
    /// Builds the plugin; `-os` is required.
    pub fn new(opts: OutputOptions) -> Result<Self> {
        let mount = opts
            .storage
            .clone()
            .ok_or_else(|| Error::InvalidArgument("-o rhv requires -os <storage-domain>".into()))?;
        let compat = opts
            .options
            .get("vdsm-compat")
            .cloned()
            .unwrap_or_else(|| "0.10".to_owned());
        if compat != "0.10" && compat != "1.1" {
            return Err(Error::InvalidArgument(format!(
                "-oo vdsm-compat must be 0.10 or 1.1, not '{compat}'"
            )));
        }
        Ok(Self {
            mount: PathBuf::from(mount),
            alloc: opts.alloc,
            format: opts.format.unwrap_or_else(|| "raw".to_owned()),
            compat,
            sd_uuid: None,
            disk_uuids: Vec::new(),
            vm_uuid: Uuid::new_v4(),
            vm_snapshot_id: Uuid::new_v4(),
        })
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        format!("-o rhv -os {} -of {}", self.mount.display(), self.format)
    }

    /// The mount must contain exactly one storage-domain UUID
    /// directory.
    pub fn precheck(&self) -> Result<()> {
        self.find_sd_uuid().map(|_| ())
    }

    fn find_sd_uuid(&self) -> Result<Uuid> {
        if let Some(sd) = self.sd_uuid {
            return Ok(sd);
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.mount).map_err(|e| {
            Error::Output(format!("cannot read storage domain {}: {e}", self.mount.display()))
        })? {
            let entry = entry?;
            if let Ok(uuid) = Uuid::parse_str(&entry.file_name().to_string_lossy())
                && entry.path().is_dir()
            {
                found.push(uuid);
            }
        }
        match found.as_slice() {
            [sd] => Ok(*sd),
            [] => Err(Error::Output(format!(
                "{} does not look like a storage domain (no UUID directory)",
                self.mount.display()
            ))),
            _ => Err(Error::Output(format!(
                "{} contains more than one storage-domain UUID",
                self.mount.display()
            ))),
        }
    }

    /// Allocates image/volume UUID pairs and their paths.
    pub fn prepare_targets(
        &mut self,
        _source: &Source,
        overlays: &[Overlay],
        estimates: &[Option<u64>],
    ) -> Result<Vec<Target>> {
        let sd = self.find_sd_uuid()?;
        self.sd_uuid = Some(sd);

        let _ids = UidSwitch::assume();
        let mut targets = Vec::with_capacity(overlays.len());
        for (i, ov) in overlays.iter().enumerate() {
            let image_uuid = Uuid::new_v4();
            let vol_uuid = Uuid::new_v4();
            self.disk_uuids.push((image_uuid, vol_uuid));

            let dir = self
                .mount
                .join(sd.to_string())
                .join("images")
                .join(image_uuid.to_string());
            fs::create_dir_all(&dir)?;
            targets.push(Target {
                location: TargetLocation::File(dir.join(vol_uuid.to_string())),
                format: self.format.clone(),
                estimated_size: estimates.get(i).copied().flatten(),
                actual_size: None,
                overlay: ov.clone(),
            });
        }
        Ok(targets)
    }

    /// Creates the volume and its `.meta` sibling.
    pub fn disk_create(&self, target: &Target) -> Result<()> {
        let TargetLocation::File(path) = &target.location else {
            return Err(Error::Output("vdsm targets are files".into()));
        };
        let _ids = UidSwitch::assume();

        let opts = qemuimg::CreateOpts {
            size: Some(target.overlay.virtual_size),
            preallocation: OutputPlugin::preallocation_for(self.alloc, &target.format),
            compat: (target.format == "qcow2").then(|| self.compat.clone()),
            ..qemuimg::CreateOpts::default()
        };
        qemuimg::create(path, &target.format, &opts).map_err(|e| Error::Output(e.to_string()))?;

        let sd = self.sd_uuid.ok_or_else(|| Error::Output("no storage domain".into()))?;
        let image_uuid = path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let meta = volume_metadata(
            sd,
            &image_uuid,
            target.overlay.virtual_size,
            &target.format,
            self.alloc,
        );
        fs::write(path.with_extension("meta"), meta)?;
        Ok(())
    }

    /// Writes the OVF descriptor under `master/vms/<VM_UUID>/`.
    pub fn create_metadata(&mut self, params: &MetadataParams<'_>) -> Result<()> {
        let sd = self.sd_uuid.ok_or_else(|| Error::Output("no storage domain".into()))?;
        let _ids = UidSwitch::assume();

        let ovf_params = crate::ovf::OvfParams {
            name: params.source.name.clone(),
            memory: params.source.memory,
            vcpus: params.source.vcpu,
            server: !params
                .inspect
                .product_variant
                .eq_ignore_ascii_case("client"),
            origin: origin_of(&params.source.hypervisor),
            os_token: os_token(params.inspect),
            firmware_efi: matches!(params.firmware, crate::source::Firmware::Uefi { .. }),
            sd_uuid: sd,
            vm_uuid: self.vm_uuid,
            vm_snapshot_id: self.vm_snapshot_id,
            disks: params
                .targets
                .iter()
                .zip(&self.disk_uuids)
                .enumerate()
                .map(|(i, (t, (image_uuid, vol_uuid)))| crate::ovf::OvfDiskOut {
                    image_uuid: *image_uuid,
                    vol_uuid: *vol_uuid,
                    virtual_size: t.overlay.virtual_size,
                    actual_size: t.actual_size,
                    format: if t.format == "qcow2" { "COW".into() } else { "RAW".into() },
                    bootable: i == 0,
                })
                .collect(),
            nics: params
                .source
                .nics
                .iter()
                .enumerate()
                .map(|(i, nic)| crate::ovf::OvfNicOut {
                    dev: format!("eth{i}"),
                    subtype: match params.caps.net_bus {
                        crate::target::NetBus::Rtl8139 => "1".into(),
                        crate::target::NetBus::E1000 => "2".into(),
                        crate::target::NetBus::VirtioNet => "3".into(),
                    },
                    network: nic.vnet.clone(),
                    mac: nic.mac.clone(),
                })
                .collect(),
            sound: params.source.sound.as_ref().map(|s| {
                match s {
                    crate::source::Sound::Ac97 => "ac97",
                    _ => "ich6",
                }
                .to_owned()
            }),
        };
        let envelope = crate::ovf::build_envelope(&ovf_params);

        let vm_dir = self
            .mount
            .join(sd.to_string())
            .join("master")
            .join("vms")
            .join(self.vm_uuid.to_string());
        fs::create_dir_all(&vm_dir)?;
        let path = vm_dir.join(format!("{}.ovf", self.vm_uuid));
        fs::write(&path, envelope.to_document())?;
        info!(path = %path.display(), "wrote OVF descriptor");
        Ok(())
    }
}

/// `Origin` tag for the source hypervisor.
fn origin_of(hypervisor: &Hypervisor) -> Option<u32> {
    match hypervisor {
        Hypervisor::VMware => Some(1),
        Hypervisor::Xen => Some(2),
        Hypervisor::QEmu | Hypervisor::Kvm => Some(7),
        Hypervisor::Physical => Some(8),
        Hypervisor::HyperV => Some(9),
        Hypervisor::Other(_) => None,
    }
}

/// Fixed-set OS token for the OperatingSystemSection.
fn os_token(inspect: &crate::inspect::Inspection) -> String {
    let x64 = inspect.arch == "x86_64";
    if inspect.os_type == "windows" {
        return match (inspect.major, inspect.minor, x64) {
            (5, 1, _) => "WindowsXP".into(),
            (5, 2, _) => "Windows2003".into(),
            (6, 0, false) => "Windows2008".into(),
            (6, 0, true) => "Windows2008x64".into(),
            (6, 1, false) => "Windows7".into(),
            (6, 1, true) if inspect.product_variant.eq_ignore_ascii_case("client") => {
                "Windows7x64".into()
            }
            (6, 1, true) => "Windows2008R2x64".into(),
            (6, 2 | 3, true) if !inspect.product_variant.eq_ignore_ascii_case("client") => {
                "Windows2012x64".into()
            }
            (10, 0, true) if !inspect.product_variant.eq_ignore_ascii_case("client") => {
                "Windows2016x64".into()
            }
            (10, 0, true) => "Windows10x64".into(),
            (10, 0, false) => "Windows10".into(),
            _ => "OtherWindows".into(),
        };
    }
    match (inspect.distro.as_str(), x64) {
        ("rhel" | "centos" | "fedora", true) => format!("RHEL{}x64", inspect.major),
        ("rhel" | "centos" | "fedora", false) => format!("RHEL{}", inspect.major),
        (_, true) => "OtherLinux".into(),
        (_, false) => "OtherLinux".into(),
    }
}

/// The `.meta` key/value block for one volume.
fn volume_metadata(
    sd_uuid: Uuid,
    image_uuid: &str,
    virtual_size: u64,
    format: &str,
    alloc: Allocation,
) -> String {
    let now = Utc::now().timestamp();
    let sectors = virtual_size / 512;
    let format = if format == "qcow2" { "COW" } else { "RAW" };
    let vol_type = match alloc {
        Allocation::Sparse => "SPARSE",
        Allocation::Preallocated => "PREALLOCATED",
    };
    format!(
        "DOMAIN={sd_uuid}\n\
         VOLTYPE=LEAF\n\
         CTIME={now}\n\
         MTIME={now}\n\
         IMAGE={image_uuid}\n\
         DISKTYPE=1\n\
         PUUID=00000000-0000-0000-0000-000000000000\n\
         LEGALITY=LEGAL\n\
         POOL_UUID=\n\
         SIZE={sectors}\n\
         FORMAT={format}\n\
         TYPE={vol_type}\n\
         DESCRIPTION=imported by vmlift\n\
         EOF\n"
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::inspect::{InspectedFirmware, Inspection};

    #[test]
    fn meta_block_is_complete_and_in_sectors() {
        let sd = Uuid::new_v4();
        let meta = volume_metadata(sd, "img-uuid", 10 << 30, "raw", Allocation::Sparse);
        assert!(meta.contains(&format!("DOMAIN={sd}")));
        assert!(meta.contains("PUUID=00000000-0000-0000-0000-000000000000"));
        assert!(meta.contains(&format!("SIZE={}", (10u64 << 30) / 512)));
        assert!(meta.contains("FORMAT=RAW"));
        assert!(meta.contains("TYPE=SPARSE"));
        assert!(meta.contains("LEGALITY=LEGAL"));
        assert!(meta.ends_with("EOF\n"));

        let meta = volume_metadata(sd, "img", 1 << 30, "qcow2", Allocation::Preallocated);
        assert!(meta.contains("FORMAT=COW"));
        assert!(meta.contains("TYPE=PREALLOCATED"));
    }

    #[test]
    fn storage_domain_discovery() {
        let mount = tempfile::tempdir().unwrap();
        let opts = OutputOptions {
            storage: Some(mount.path().display().to_string()),
            ..OutputOptions::default()
        };
        let out = VdsmOutput::new(opts).unwrap();
        // No UUID directory yet.
        assert!(out.precheck().is_err());

        let sd = Uuid::new_v4();
        fs::create_dir(mount.path().join(sd.to_string())).unwrap();
        assert!(out.precheck().is_ok());

        // A second UUID directory is ambiguous.
        fs::create_dir(mount.path().join(Uuid::new_v4().to_string())).unwrap();
        assert!(out.precheck().is_err());
    }

    #[test]
    fn vdsm_compat_is_validated() {
        let opts = OutputOptions {
            storage: Some("/tmp".into()),
            options: [("vdsm-compat".to_owned(), "2.0".to_owned())].into(),
            ..OutputOptions::default()
        };
        assert!(VdsmOutput::new(opts).is_err());
    }

    fn inspection_for(os_type: &str, distro: &str, major: i32, minor: i32, arch: &str, variant: &str) -> Inspection {
        Inspection {
            root: "/dev/sda2".into(),
            os_type: os_type.into(),
            distro: distro.into(),
            arch: arch.into(),
            major,
            minor,
            product_name: String::new(),
            product_variant: variant.into(),
            package_format: String::new(),
            package_management: String::new(),
            applications: Vec::new(),
            mountpoints: Vec::new(),
            windows: None,
            firmware: InspectedFirmware::Bios,
        }
    }

    #[test]
    fn os_tokens_for_common_guests() {
        assert_eq!(
            os_token(&inspection_for("windows", "windows", 6, 1, "x86_64", "Client")),
            "Windows7x64"
        );
        assert_eq!(
            os_token(&inspection_for("windows", "windows", 6, 1, "x86_64", "Server")),
            "Windows2008R2x64"
        );
        assert_eq!(
            os_token(&inspection_for("windows", "windows", 10, 0, "x86_64", "Server")),
            "Windows2016x64"
        );
        assert_eq!(
            os_token(&inspection_for("linux", "rhel", 7, 9, "x86_64", "unknown")),
            "RHEL7x64"
        );
        assert_eq!(
            os_token(&inspection_for("linux", "debian", 11, 0, "x86_64", "unknown")),
            "OtherLinux"
        );
    }
}
