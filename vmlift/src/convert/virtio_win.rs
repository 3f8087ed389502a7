//! virtio-win driver staging for Windows guests.
//!
//! Drivers come from `VIRTIO_WIN` (a directory tree or an ISO). Files
//! are selected by matching path components against the guest's
//! architecture, version and variant, copied into
//! `%SystemRoot%\Drivers\VirtIO`, and the storage driver is wired into
//! the registry so the guest can boot from a virtio disk.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use vmlift_hive::{Hive, NodeId, RegValue};

use crate::guest::{DriveOpts, GuestFs, Guestfish};
use crate::inspect::Inspection;
use crate::{Error, Result};

/// File extensions worth copying into the guest.
const DRIVER_EXTENSIONS: &[&str] = &["cat", "inf", "pdb", "sys"];

/// The virtio-blk PCI id as it appears in registry device paths.
const VIOSTOR_PCI_UPPER: &str = "PCI\\VEN_1AF4&DEV_1001&SUBSYS_00021AF4&REV_00";
const VIOSTOR_PCI_LOWER: &str = "pci#ven_1af4&dev_1001&subsys_00021af4&rev_00";

/// Storage class GUIDs.
const SCSI_ADAPTER_GUID_UPPER: &str = "{4D36E97B-E325-11CE-BFC1-08002BE10318}";
const SCSI_ADAPTER_GUID_LOWER: &str = "{4d36e97b-e325-11ce-bfc1-08002be10318}";

/// Opaque token embedded in DriverDatabase package paths. Its origin is
/// unknown; Windows matches it byte-for-byte.
const PKG_HASH: &str = "c86329aaeb0a7904";

/// Where the Windows virtio drivers come from.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DriverSource {
    /// An unpacked directory tree.
    Dir(PathBuf),
    /// A virtio-win ISO image.
    Iso(PathBuf),
}

impl DriverSource {
    /// Reads `VIRTIO_WIN` (or the legacy `VIRTIO_WIN_DIR`).
    pub fn from_env() -> Option<Self> {
        let path = std::env::var_os("VIRTIO_WIN")
            .or_else(|| std::env::var_os("VIRTIO_WIN_DIR"))
            .map(PathBuf::from)?;
        Some(if path.is_dir() {
            Self::Dir(path)
        } else {
            Self::Iso(path)
        })
    }

    /// Lists driver files as `(relative path, local file)` pairs. An
    /// ISO is unpacked through a dedicated read-only appliance into
    /// `scratch` first.
    pub fn materialize(&self, scratch: &Path) -> Result<Vec<(String, PathBuf)>> {
        match self {
            Self::Dir(dir) => {
                let mut out = Vec::new();
                walk_dir(dir, dir, &mut out)?;
                Ok(out)
            }
            Self::Iso(iso) => {
                let mut appliance = Guestfish::new()?;
                appliance.add_drive(
                    iso,
                    &DriveOpts {
                        format: Some("raw".to_owned()),
                        ..DriveOpts::default()
                    },
                )?;
                appliance.launch()?;
                appliance.mount("/dev/sda", "/")?;
                let mut out = Vec::new();
                for rel in appliance.find("/")? {
                    let local = scratch.join(&rel);
                    if let Some(parent) = local.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let remote = format!("/{rel}");
                    if !appliance.is_file(&remote)? {
                        continue;
                    }
                    appliance.download(&remote, &local)?;
                    out.push((rel, local));
                }
                appliance.shutdown()?;
                Ok(out)
            }
        }
    }
}

/// Recursive directory walk producing paths relative to `base`.
fn walk_dir(base: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_dir(base, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(base) {
            out.push((rel.display().to_string(), path.clone()));
        }
    }
    Ok(())
}

/// Which drivers actually landed in the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagedDrivers {
    /// `viostor.sys` + its inf: virtio-blk boot storage.
    pub block: bool,
    /// `netkvm.inf`: virtio-net (completed by PnP on first boot).
    pub net: bool,
    /// `qxl.inf`: QXL video.
    pub qxl: bool,
}

/// The OS-mapping rows: path components → (major, minor, client?).
/// `None` in the variant means the row matches either variant.
const OS_TABLE: &[(&[&str], i32, i32, Option<bool>)] = &[
    (&["xp", "winxp"], 5, 1, None),
    (&["2k3", "win2003"], 5, 2, None),
    (&["vista"], 6, 0, Some(true)),
    (&["2k8", "win2008"], 6, 0, Some(false)),
    (&["w7", "win7"], 6, 1, Some(true)),
    (&["2k8r2", "win2008r2"], 6, 1, Some(false)),
    (&["w8", "win8"], 6, 2, Some(true)),
    (&["2k12", "win2012"], 6, 2, Some(false)),
    (&["w8.1", "win8.1"], 6, 3, Some(true)),
    (&["2k12r2", "win2012r2"], 6, 3, Some(false)),
    (&["w10", "win10"], 10, 0, Some(true)),
    (&["2k16", "win2016"], 10, 0, Some(false)),
];

/// Whether a driver path belongs to the inspected guest: architecture,
/// OS version and Server/Client variant must all match.
pub(crate) fn path_matches_guest(
    path: &str,
    arch: &str,
    major: i32,
    minor: i32,
    is_client: bool,
) -> bool {
    let lc = path.to_ascii_lowercase();
    let comps: Vec<&str> = lc.split('/').collect();
    let has = |elem: &str| comps.contains(&elem);

    let arch_ok = match arch {
        "x86_64" => has("amd64"),
        a if a.starts_with('i') && a.ends_with("86") => has("x86") || has("i386"),
        _ => false,
    };
    if !arch_ok {
        return false;
    }

    OS_TABLE.iter().any(|(patterns, row_major, row_minor, variant)| {
        patterns.iter().any(|p| has(p))
            && *row_major == major
            && *row_minor == minor
            && variant.is_none_or(|wants_client| wants_client == is_client)
    })
}

/// Copies matching driver files into `%SystemRoot%\Drivers\VirtIO`
/// (lower-cased basenames) and reports what was staged.
pub fn copy_drivers(
    guest: &mut dyn GuestFs,
    inspect: &Inspection,
    files: &[(String, PathBuf)],
) -> Result<StagedDrivers> {
    let windows = inspect
        .windows
        .as_ref()
        .ok_or_else(|| Error::Conversion("not a Windows guest".into()))?;
    let driverdir = format!("{}/Drivers/VirtIO", windows.systemroot);
    guest.mkdir_p(&driverdir)?;

    let is_client = inspect.product_variant.eq_ignore_ascii_case("client");
    let mut staged = StagedDrivers::default();
    let mut seen_viostor_sys = false;
    let mut seen_viostor_inf = false;

    for (rel, local) in files {
        let ext = Path::new(rel)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        if !ext.as_deref().is_some_and(|e| DRIVER_EXTENSIONS.contains(&e)) {
            continue;
        }
        if !path_matches_guest(rel, &inspect.arch, inspect.major, inspect.minor, is_client) {
            continue;
        }
        let basename = Path::new(rel)
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        debug!(file = %rel, "staging virtio driver");
        guest.upload(local, &format!("{driverdir}/{basename}"))?;

        match basename.as_str() {
            "viostor.sys" => seen_viostor_sys = true,
            "viostor.inf" => seen_viostor_inf = true,
            "netkvm.inf" => staged.net = true,
            "qxl.inf" => staged.qxl = true,
            _ => {}
        }
    }
    staged.block = seen_viostor_sys && seen_viostor_inf;
    if !staged.block {
        warn!("no matching viostor driver found; the guest will use IDE emulation");
    }
    Ok(staged)
}

/// Wires viostor into the SYSTEM hive so Windows can boot from a
/// virtio disk: CriticalDeviceDatabase for ≤ 7, DriverDatabase for ≥ 8.
pub fn add_viostor_registry(
    hive: &mut Hive,
    control_set: &str,
    major: i32,
    minor: i32,
    arch: &str,
) -> Result<()> {
    if major > 6 || (major == 6 && minor >= 2) {
        add_driver_database(hive, control_set, arch)
    } else {
        add_critical_device_database(hive, control_set)
    }
}

/// The viostor service key values, shared by both registry layouts.
fn add_viostor_service(hive: &mut Hive, control_set: &str) -> Result<NodeId> {
    let svc = hive.ensure_path(&format!("{control_set}\\Services\\viostor"))?;
    hive.set_value(svc, "Type", RegValue::dword(1));
    hive.set_value(svc, "Start", RegValue::dword(0));
    hive.set_value(svc, "Group", RegValue::sz("SCSI miniport"));
    hive.set_value(svc, "ErrorControl", RegValue::dword(1));
    hive.set_value(
        svc,
        "ImagePath",
        RegValue::expand_sz(r"system32\drivers\viostor.sys"),
    );
    Ok(svc)
}

/// Windows ≤ 7: CriticalDeviceDatabase entry + service key.
fn add_critical_device_database(hive: &mut Hive, control_set: &str) -> Result<()> {
    let cdd = hive.ensure_path(&format!(
        "{control_set}\\Control\\CriticalDeviceDatabase\\{VIOSTOR_PCI_LOWER}"
    ))?;
    hive.set_value(cdd, "Service", RegValue::sz("viostor"));
    hive.set_value(cdd, "ClassGUID", RegValue::sz(SCSI_ADAPTER_GUID_UPPER));
    add_viostor_service(hive, control_set)?;
    Ok(())
}

/// Windows ≥ 8: DriverDatabase entries under a fresh `oem<N>.inf` name.
fn add_driver_database(hive: &mut Hive, control_set: &str, arch: &str) -> Result<()> {
    let arch_sfx = if arch == "x86_64" { "amd64" } else { "x86" };
    let pkg = format!("viostor.inf_{arch_sfx}_{PKG_HASH}");

    let oem = allocate_oem_inf(hive)?;
    debug!(oem = %oem, package = %pkg, "registering viostor driver package");

    add_viostor_service(hive, control_set)?;

    let inf_files = hive.ensure_path(&format!("DriverDatabase\\DriverInfFiles\\{oem}"))?;
    hive.set_value(inf_files, "", RegValue::multi_sz(&[&pkg]));
    hive.set_value(inf_files, "Active", RegValue::sz(&pkg));
    hive.set_value(inf_files, "Configurations", RegValue::multi_sz(&["rhelscsi_inst"]));

    // Class-keyed id: the oem name is a value below the class GUID key.
    let class_ids = hive.ensure_path(&format!(
        "DriverDatabase\\DeviceIds\\{SCSI_ADAPTER_GUID_LOWER}"
    ))?;
    hive.set_value(class_ids, &oem, RegValue::binary(&[0x01, 0xff, 0x00, 0x00]));

    // Device-keyed id: the oem name is a subkey below the PCI id.
    let dev_ids = hive.ensure_path(&format!(
        "DriverDatabase\\DeviceIds\\{VIOSTOR_PCI_UPPER}\\{oem}"
    ))?;
    hive.set_value(dev_ids, "Configuration", RegValue::sz("rhelscsi_inst"));

    let config = hive.ensure_path(&format!(
        "DriverDatabase\\DriverPackages\\{pkg}\\Configurations\\rhelscsi_inst"
    ))?;
    hive.set_value(config, "ConfigFlags", RegValue::dword(0));
    hive.set_value(config, "Service", RegValue::sz("viostor"));

    let msi = hive.ensure_path(&format!(
        "DriverDatabase\\DriverPackages\\{pkg}\\Configurations\\rhelscsi_inst\\Device\\Interrupt Management\\MessageSignaledInterruptProperties"
    ))?;
    hive.set_value(msi, "MSISupported", RegValue::dword(1));

    let pnp = hive.ensure_path(&format!(
        "DriverDatabase\\DriverPackages\\{pkg}\\Configurations\\rhelscsi_inst\\Services\\viostor\\Parameters\\PnpInterface"
    ))?;
    hive.set_value(pnp, "5", RegValue::dword(1));

    let descriptor = hive.ensure_path(&format!(
        "DriverDatabase\\Descriptors\\{VIOSTOR_PCI_UPPER}"
    ))?;
    hive.set_value(descriptor, "Configuration", RegValue::sz("rhelscsi_inst"));
    hive.set_value(
        descriptor,
        "Description",
        RegValue::sz("Red Hat VirtIO SCSI controller"),
    );

    Ok(())
}

/// Finds the first `oem<N>.inf` name not yet present below the SCSI
/// class key (checking both value and subkey names), starting at 1.
fn allocate_oem_inf(hive: &mut Hive) -> Result<String> {
    let class_ids = hive.ensure_path(&format!(
        "DriverDatabase\\DeviceIds\\{SCSI_ADAPTER_GUID_LOWER}"
    ))?;
    for n in 1u32.. {
        let candidate = format!("oem{n}.inf");
        let as_value = hive.value(class_ids, &candidate).is_some();
        let as_key = hive.child(class_ids, &candidate).is_some();
        if !as_value && !as_key {
            return Ok(candidate);
        }
    }
    unreachable!("u32 range exhausted")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn os_table_rows_match_expected_guests() {
        // (component, major, minor, client) for every table row.
        let cases: &[(&str, i32, i32, bool)] = &[
            ("xp", 5, 1, true),
            ("xp", 5, 1, false),
            ("winxp", 5, 1, true),
            ("2k3", 5, 2, false),
            ("win2003", 5, 2, true),
            ("vista", 6, 0, true),
            ("2k8", 6, 0, false),
            ("win2008", 6, 0, false),
            ("w7", 6, 1, true),
            ("win7", 6, 1, true),
            ("2k8r2", 6, 1, false),
            ("win2008r2", 6, 1, false),
            ("w8", 6, 2, true),
            ("win8", 6, 2, true),
            ("2k12", 6, 2, false),
            ("win2012", 6, 2, false),
            ("w8.1", 6, 3, true),
            ("win8.1", 6, 3, true),
            ("2k12r2", 6, 3, false),
            ("win2012r2", 6, 3, false),
            ("w10", 10, 0, true),
            ("win10", 10, 0, true),
            ("2k16", 10, 0, false),
            ("win2016", 10, 0, false),
        ];
        for &(component, major, minor, client) in cases {
            for (arch, arch_dir) in [("x86_64", "amd64"), ("i386", "x86")] {
                let path = format!("viostor/{component}/{arch_dir}/viostor.sys");
                assert!(
                    path_matches_guest(&path, arch, major, minor, client),
                    "{path} should match {arch} {major}.{minor} client={client}"
                );
            }
        }
    }

    #[test]
    fn variant_mismatch_is_rejected() {
        // w7 is a client row; a server guest must not take it.
        assert!(!path_matches_guest("viostor/w7/amd64/viostor.sys", "x86_64", 6, 1, false));
        // 2k8r2 is the non-client row for the same version.
        assert!(path_matches_guest("viostor/2k8r2/amd64/viostor.sys", "x86_64", 6, 1, false));
    }

    #[test]
    fn version_and_arch_mismatches_are_rejected() {
        assert!(!path_matches_guest("viostor/w10/amd64/viostor.sys", "x86_64", 6, 1, true));
        assert!(!path_matches_guest("viostor/w7/x86/viostor.sys", "x86_64", 6, 1, true));
        assert!(!path_matches_guest("viostor/w7/amd64/viostor.sys", "i686", 6, 1, true));
        // i386 accepts both /x86/ and /i386/ trees.
        assert!(path_matches_guest("viostor/w7/x86/viostor.sys", "i686", 6, 1, true));
        assert!(path_matches_guest("viostor/w7/i386/viostor.sys", "i386", 6, 1, true));
    }

    #[test]
    fn w8_component_does_not_leak_into_w81() {
        // Path components match exactly, not by substring.
        assert!(!path_matches_guest("viostor/w8.1/amd64/viostor.sys", "x86_64", 6, 2, true));
        assert!(path_matches_guest("viostor/w8.1/amd64/viostor.sys", "x86_64", 6, 3, true));
    }

    #[test]
    fn cdd_entries_for_windows_7() {
        let mut hive = Hive::create("SYSTEM");
        add_viostor_registry(&mut hive, "ControlSet001", 6, 1, "x86_64").unwrap();

        let cdd = hive
            .lookup(
                hive.root(),
                r"ControlSet001\Control\CriticalDeviceDatabase\pci#ven_1af4&dev_1001&subsys_00021af4&rev_00",
            )
            .unwrap();
        assert_eq!(hive.value(cdd, "Service").unwrap().as_string().unwrap(), "viostor");
        assert_eq!(
            hive.value(cdd, "ClassGUID").unwrap().as_string().unwrap(),
            "{4D36E97B-E325-11CE-BFC1-08002BE10318}"
        );

        let svc = hive.lookup(hive.root(), r"ControlSet001\Services\viostor").unwrap();
        assert_eq!(hive.value(svc, "Start").unwrap().as_dword(), Some(0));
        assert_eq!(
            hive.value(svc, "Group").unwrap().as_string().unwrap(),
            "SCSI miniport"
        );
        // Windows 7 must not get DriverDatabase entries.
        assert!(hive.lookup(hive.root(), "DriverDatabase").is_err());
    }

    #[test]
    fn driver_database_entries_for_windows_8() {
        let mut hive = Hive::create("SYSTEM");
        // Pre-existing oem1.inf forces allocation of oem2.inf.
        let class_ids = hive
            .ensure_path(r"DriverDatabase\DeviceIds\{4d36e97b-e325-11ce-bfc1-08002be10318}")
            .unwrap();
        hive.set_value(class_ids, "oem1.inf", RegValue::binary(&[1, 0xff, 0, 0]));

        add_viostor_registry(&mut hive, "ControlSet001", 6, 2, "x86_64").unwrap();

        let inf = hive
            .lookup(hive.root(), r"DriverDatabase\DriverInfFiles\oem2.inf")
            .unwrap();
        assert_eq!(
            hive.value(inf, "Active").unwrap().as_string().unwrap(),
            "viostor.inf_amd64_c86329aaeb0a7904"
        );

        // The opaque package token is preserved byte-for-byte.
        assert!(
            hive.lookup(
                hive.root(),
                r"DriverDatabase\DriverPackages\viostor.inf_amd64_c86329aaeb0a7904\Configurations\rhelscsi_inst"
            )
            .is_ok()
        );
        assert!(
            hive.lookup(
                hive.root(),
                r"DriverDatabase\DriverPackages\viostor.inf_amd64_c86329aaeb0a7904\Configurations\rhelscsi_inst\Device\Interrupt Management\MessageSignaledInterruptProperties"
            )
            .is_ok()
        );

        // 32-bit guests get the x86 package name.
        let mut hive32 = Hive::create("SYSTEM");
        add_viostor_registry(&mut hive32, "ControlSet001", 10, 0, "i386").unwrap();
        assert!(
            hive32
                .lookup(
                    hive32.root(),
                    r"DriverDatabase\DriverPackages\viostor.inf_x86_c86329aaeb0a7904"
                )
                .is_ok()
        );
    }
}
