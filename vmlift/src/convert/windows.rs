//! Windows conversion: registry surgery, virtio driver staging,
//! firstboot injection, NTFS geometry and UEFI BCD fixes.
//!
//! All registry work happens on downloaded hive files; each hive is
//! parsed, edited in memory and uploaded back in one piece.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};
use vmlift_hive::{Hive, RegValue};

use crate::convert::firstboot::{
    Firstboot, installer_script, pnp_wait_script, uninstaller_script,
};
use crate::convert::virtio_win::{self, DriverSource, StagedDrivers};
use crate::convert::{ConvertOptions, machine_type};
use crate::guest::GuestFs;
use crate::inspect::{InspectedFirmware, Inspection, WindowsMeta};
use crate::source::{Firmware, Source};
use crate::target::{BlockBus, GuestCaps, NetBus, TargetVideo};
use crate::{Error, Result};

/// Parallels guest services to disable (`Start = 4`).
const PARALLELS_SERVICES: &[&str] = &[
    "prl_boot", "prl_dd", "prl_eth5", "prl_fs", "prl_memdev", "prl_mouf", "prl_pv32", "prl_pv64",
    "prl_scsi", "prl_sound", "prl_strg", "prl_tg", "prl_time", "prl_uprof", "prl_va",
];

/// Known antivirus product names (case-insensitive substrings).
const ANTIVIRUS_NAMES: &[&str] = &[
    "mcafee", "norton", "sophos", "kaspersky", "symantec", "avg internet", "trend micro",
];

/// Disk-class GUID holding the `LowerFilters` list.
const DISK_CLASS_GUID: &str = "{4d36e967-e325-11ce-bfc1-08002be10318}";

/// Heads-byte thresholds for the NTFS BPB fix. Hard-coded in the
/// original tool; reproduced verbatim.
const HEADS_BOUNDARY_1: u64 = 2_114_445_312;
const HEADS_BOUNDARY_2: u64 = 4_228_374_780;

/// BCD well-known object holding the default-entry pointer.
const BCD_BOOTMGR: &str = "{9dea862c-5cdd-4e70-acc1-f32b344d4795}";

/// Suffix forced onto every Parallels/Virtuozzo uninstall command.
const PARALLELS_UNINSTALL_ARGS: &str = " /quiet /norestart /l*v+ \"%~dpn0.log\" \
                                        REBOOT=ReallySuppress REMOVE=ALL \
                                        PREVENT_REBOOT=Yes LAUNCHED_BY_SETUP_EXE=Yes";

/// `{hex-guid}` child names under the Group Policy history key.
fn gpo_child_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // pattern is a literal
        Regex::new(r"^\{[0-9A-Fa-f][0-9A-Fa-f-]*\}$").unwrap()
    })
}

/// Read-only findings from the SOFTWARE hive.
#[derive(Debug, Clone, Default)]
struct PreInspection {
    /// Group Policy history entries exist.
    group_policy: bool,
    /// A known antivirus product is installed.
    antivirus: bool,
    /// Xen PV driver uninstall command, prompt-free variant.
    xen_uninstall: Option<String>,
    /// Parallels/Virtuozzo tools uninstall commands, quiet flags added.
    parallels_uninstalls: Vec<String>,
}

/// Converts an inspected Windows guest using drivers from
/// `VIRTIO_WIN`/`VIRTIO_WIN_DIR`.
pub fn convert(
    guest: &mut dyn GuestFs,
    inspect: &Inspection,
    source: &Source,
    opts: &ConvertOptions,
) -> Result<GuestCaps> {
    let scratch = tempfile::Builder::new().prefix("vmlift-win-").tempdir()?;
    let driver_files = match DriverSource::from_env() {
        Some(src) => src.materialize(scratch.path())?,
        None => {
            warn!("VIRTIO_WIN is not set; no virtio drivers will be installed");
            Vec::new()
        }
    };
    convert_with_drivers(guest, inspect, source, opts, &driver_files)
}

/// Converts with an explicit driver file list (also the test entry).
pub fn convert_with_drivers(
    guest: &mut dyn GuestFs,
    inspect: &Inspection,
    source: &Source,
    opts: &ConvertOptions,
    driver_files: &[(String, std::path::PathBuf)],
) -> Result<GuestCaps> {
    let windows = inspect
        .windows
        .clone()
        .ok_or_else(|| Error::Conversion("inspection found no Windows metadata".into()))?;
    info!(
        product = %inspect.product_name,
        major = inspect.major,
        minor = inspect.minor,
        "converting Windows guest"
    );

    // -- SOFTWARE hive, read-only pass --------------------------------
    let software_path = guest.case_sensitive_path(&windows.software_hive)?;
    let mut software = Hive::from_bytes(&guest.read_file(&software_path)?)?;
    let pre = pre_inspect(&software, inspect);
    if pre.group_policy {
        warn!("Group Policy is in use; it may roll back registry changes on first boot");
    }
    if pre.antivirus {
        warn!("antivirus software detected; it may interfere with driver installation");
    }

    // -- virtio driver staging ----------------------------------------
    let staged = virtio_win::copy_drivers(guest, inspect, driver_files)?;
    if opts.require_virtio_block && !staged.block {
        return Err(Error::Conversion(
            "virtio block was required but no viostor driver matches this guest".into(),
        ));
    }
    if opts.require_virtio_net && !staged.net {
        return Err(Error::Conversion(
            "virtio net was required but no netkvm driver matches this guest".into(),
        ));
    }

    // -- SYSTEM hive edits --------------------------------------------
    let system_path = guest.case_sensitive_path(&windows.system_hive)?;
    let mut system = Hive::from_bytes(&guest.read_file(&system_path)?)?;
    disable_foreign_services(&mut system, &windows.current_control_set);
    scrub_lower_filters(&mut system, &windows.current_control_set)?;
    disable_crash_autoreboot(&mut system, &windows.current_control_set)?;
    if staged.block {
        virtio_win::add_viostor_registry(
            &mut system,
            &windows.current_control_set,
            inspect.major,
            inspect.minor,
            &inspect.arch,
        )?;
    }
    guest.write_file(&system_path, &system.to_bytes())?;

    // -- SOFTWARE hive edits ------------------------------------------
    append_device_path(&mut software)?;
    inject_firstboot(guest, &mut software, &windows, opts, &pre)?;
    guest.write_file(&software_path, &software.to_bytes())?;

    // -- byte-level fixes ---------------------------------------------
    fix_ntfs_heads(guest, &inspect.root)?;
    if let InspectedFirmware::Uefi(esps) = &inspect.firmware {
        fix_uefi_bcd(guest, esps)?;
    }

    let firmware = effective_firmware(source, inspect);
    Ok(GuestCaps {
        block_bus: if staged.block {
            BlockBus::VirtioBlk
        } else {
            BlockBus::Ide
        },
        net_bus: if staged.net {
            NetBus::VirtioNet
        } else {
            NetBus::Rtl8139
        },
        video: if staged.qxl {
            TargetVideo::Qxl
        } else {
            TargetVideo::Cirrus
        },
        virtio_rng: false,
        virtio_balloon: false,
        isa_pvpanic: false,
        acpi: true,
        arch: inspect.arch.clone(),
        machine: machine_type(&inspect.arch, &firmware),
    })
}

/// The firmware the target should use: the source's claim when it made
/// one, otherwise what the disks say.
pub fn effective_firmware(source: &Source, inspect: &Inspection) -> Firmware {
    match source.firmware {
        Firmware::Unknown => match inspect.firmware {
            InspectedFirmware::Bios => Firmware::Bios,
            InspectedFirmware::Uefi(_) => Firmware::Uefi {
                secure_boot_required: false,
            },
        },
        ref fw => fw.clone(),
    }
}

/// Read-only scan of the SOFTWARE hive.
fn pre_inspect(software: &Hive, inspect: &Inspection) -> PreInspection {
    let mut pre = PreInspection::default();

    if let Ok(history) = software.lookup(
        software.root(),
        r"Microsoft\Windows\CurrentVersion\Group Policy\History",
    ) {
        pre.group_policy = software
            .children(history)
            .into_iter()
            .any(|c| gpo_child_re().is_match(software.name(c)));
    }

    pre.antivirus = inspect.applications.iter().any(|app| {
        let name = app.name.to_ascii_lowercase();
        ANTIVIRUS_NAMES.iter().any(|av| name.contains(av))
    });

    if let Ok(xen) = software.lookup(
        software.root(),
        r"Microsoft\Windows\CurrentVersion\Uninstall\Red Hat Paravirtualized Xen Drivers for Windows(R)",
    ) && let Some(cmd) = software.value(xen, "UninstallString").and_then(|v| v.as_string())
    {
        // The stock uninstaller prompts; its `_uninst.exe` sibling
        // does not.
        let cmd = match cmd.strip_suffix("uninst.exe") {
            Some(prefix) if !prefix.ends_with('_') => format!("{prefix}_uninst.exe"),
            _ => cmd,
        };
        pre.xen_uninstall = Some(cmd);
    }

    if let Ok(uninstall) = software.lookup(
        software.root(),
        r"Microsoft\Windows\CurrentVersion\Uninstall",
    ) {
        for key in software.children(uninstall) {
            let display = software
                .value(key, "DisplayName")
                .and_then(|v| v.as_string())
                .unwrap_or_default();
            if display.contains("Parallels Tools") || display.contains("Virtuozzo Tools") {
                if let Some(cmd) = software
                    .value(key, "UninstallString")
                    .and_then(|v| v.as_string())
                {
                    pre.parallels_uninstalls
                        .push(format!("{cmd}{PARALLELS_UNINSTALL_ARGS}"));
                }
            }
        }
    }

    pre
}

/// Sets `Start = 4` (disabled) on Xen and Parallels services that
/// exist in the guest.
fn disable_foreign_services(system: &mut Hive, control_set: &str) {
    let mut disable = |service: &str| {
        let path = format!("{control_set}\\Services\\{service}");
        if let Ok(key) = system.lookup(system.root(), &path) {
            debug!(service, "disabling foreign paravirt service");
            system.set_value(key, "Start", RegValue::dword(4));
        }
    };
    disable("rhelscsi");
    for svc in PARALLELS_SERVICES {
        disable(svc);
    }
}

/// Removes `prl_strg` and empty entries from the disk-class
/// `LowerFilters` multi-string.
fn scrub_lower_filters(system: &mut Hive, control_set: &str) -> Result<()> {
    let path = format!("{control_set}\\Control\\Class\\{DISK_CLASS_GUID}");
    let Ok(class) = system.lookup(system.root(), &path) else {
        return Ok(());
    };
    let Some(filters) = system.value(class, "LowerFilters").and_then(|v| v.as_multi_sz()) else {
        return Ok(());
    };
    let kept: Vec<&str> = filters
        .iter()
        .filter(|f| !f.is_empty() && !f.eq_ignore_ascii_case("prl_strg"))
        .map(String::as_str)
        .collect();
    if kept.len() != filters.len() {
        debug!(?kept, "rewriting disk LowerFilters");
        system.set_value(class, "LowerFilters", RegValue::multi_sz(&kept));
    }
    Ok(())
}

/// `CrashControl\AutoReboot = 0`: keep the blue screen on the console
/// instead of reboot-looping a guest that cannot boot yet.
fn disable_crash_autoreboot(system: &mut Hive, control_set: &str) -> Result<()> {
    let key = system.ensure_path(&format!("{control_set}\\Control\\CrashControl"))?;
    system.set_value(key, "AutoReboot", RegValue::dword(0));
    Ok(())
}

/// Appends `;%SystemRoot%\Drivers\VirtIO` to `DevicePath` so PnP finds
/// the staged infs. Preserves existing content; skips when already
/// present or when the value does not exist.
fn append_device_path(software: &mut Hive) -> Result<()> {
    let Ok(cv) = software.lookup(software.root(), r"Microsoft\Windows\CurrentVersion") else {
        return Ok(());
    };
    let Some(current) = software.value(cv, "DevicePath").and_then(|v| v.as_string()) else {
        return Ok(());
    };
    if current.to_ascii_lowercase().contains(r"\drivers\virtio") {
        return Ok(());
    }
    let appended = format!("{current};%SystemRoot%\\Drivers\\VirtIO");
    software.set_value(cv, "DevicePath", RegValue::expand_sz(&appended));
    Ok(())
}

/// Builds and injects the firstboot batch.
fn inject_firstboot(
    guest: &mut dyn GuestFs,
    software: &mut Hive,
    windows: &WindowsMeta,
    opts: &ConvertOptions,
    pre: &PreInspection,
) -> Result<()> {
    let mut fb = Firstboot::new();

    let tools_dir = std::env::var_os("VIRT_TOOLS_DATA_DIR").map(std::path::PathBuf::from);
    let tool = |name: &str| {
        tools_dir
            .as_ref()
            .map(|d| d.join(name))
            .filter(|p| p.is_file())
    };

    // pnp_wait must run before anything that adds devices.
    if let Some(pnp) = tool("pnp_wait.exe") {
        fb.add_binary("pnp_wait.exe", &pnp);
        fb.add_script("pnp-wait", &pnp_wait_script());
    }
    if opts.install_rhev_apt
        && let Some(apt) = tool("rhev-apt.exe")
    {
        fb.add_binary("rhev-apt.exe", &apt);
        fb.add_script(
            "install-rhev-apt",
            &installer_script("rhev-apt.exe", "/S /v /qn"),
        );
    }
    if let Some(vmdp) = tool("vmdp.exe") {
        fb.add_binary("vmdp.exe", &vmdp);
        fb.add_script("install-vmdp", &installer_script("vmdp.exe", ""));
    }
    if let Some(xen) = &pre.xen_uninstall {
        fb.add_script("uninstall-xen-drivers", &uninstaller_script(xen, false));
    }
    for (i, cmd) in pre.parallels_uninstalls.iter().enumerate() {
        fb.add_script(
            &format!("uninstall-parallels-tools-{i}"),
            &uninstaller_script(cmd, true),
        );
    }

    fb.inject(guest, software, &windows.systemroot)
}

/// NTFS geometry fix: when the root is a partition whose BPB says NTFS,
/// rewrite the heads byte from the containing disk size. Windows'
/// bootloader divides by this value; zero or absurd geometry from the
/// source hypervisor makes the guest unbootable on KVM.
fn fix_ntfs_heads(guest: &mut dyn GuestFs, root: &str) -> Result<()> {
    let parent = guest.part_to_dev(root)?;
    if parent == root {
        return Ok(()); // whole-device filesystem, no BPB to fix
    }
    let oem = guest.pread_device(root, 8, 3)?;
    if oem != b"NTFS    " {
        return Ok(());
    }
    let disk_size = guest.blockdev_getsize64(&parent)?;
    let heads: u8 = if disk_size < HEADS_BOUNDARY_1 {
        0x40
    } else if disk_size < HEADS_BOUNDARY_2 {
        0x80
    } else {
        0xFF
    };
    debug!(disk_size, heads, "fixing NTFS BPB heads byte");
    guest.pwrite_device(root, &[heads], 0x1A)?;
    Ok(())
}

/// Removes the graphics-mode-disabled element from the default UEFI
/// boot entry on every ESP. Missing pieces are silently skipped.
fn fix_uefi_bcd(guest: &mut dyn GuestFs, esps: &[String]) -> Result<()> {
    for esp in esps {
        let mountpoint = "/vmlift-esp";
        guest.mkdir_p(mountpoint)?;
        guest.mount(esp, mountpoint)?;

        let bcd_path = format!("{mountpoint}/EFI/Microsoft/Boot/BCD");
        if guest.is_file(&bcd_path)? {
            let mut bcd = Hive::from_bytes(&guest.read_file(&bcd_path)?)?;
            if scrub_bcd(&mut bcd) {
                debug!(esp = %esp, "rewriting BCD");
                guest.write_file(&bcd_path, &bcd.to_bytes())?;
            }
        }

        // Unmount before the mountpoint goes away.
        guest.umount(mountpoint)?;
        let _ = guest.rmdir(mountpoint);
    }
    Ok(())
}

/// Follows `{bootmgr}\Elements\23000003` to the default boot entry and
/// deletes its `Elements\16000046` key. Returns whether anything
/// changed.
fn scrub_bcd(bcd: &mut Hive) -> bool {
    let Ok(pointer) = bcd.lookup(
        bcd.root(),
        &format!(r"Objects\{BCD_BOOTMGR}\Elements\23000003"),
    ) else {
        return false;
    };
    let Some(default_entry) = bcd.value(pointer, "Element").and_then(|v| v.as_string()) else {
        return false;
    };
    let Ok(graphics) = bcd.lookup(
        bcd.root(),
        &format!(r"Objects\{default_entry}\Elements\16000046"),
    ) else {
        return false;
    };
    bcd.delete_key(graphics);
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::guest::fake::{FakeGuest, FakeOs};
    use crate::inspect::RootPolicy;
    use crate::source::tests::minimal_source;

    const SYSTEM_PATH: &str = "/Windows/System32/config/SYSTEM";
    const SOFTWARE_PATH: &str = "/Windows/System32/config/SOFTWARE";

    fn seed_system_hive() -> Vec<u8> {
        let mut h = Hive::create("SYSTEM");
        let svc = h.ensure_path(r"ControlSet001\Services\prl_strg").unwrap();
        h.set_value(svc, "Start", RegValue::dword(2));
        let svc = h.ensure_path(r"ControlSet001\Services\rhelscsi").unwrap();
        h.set_value(svc, "Start", RegValue::dword(0));
        let class = h
            .ensure_path(&format!(r"ControlSet001\Control\Class\{DISK_CLASS_GUID}"))
            .unwrap();
        h.set_value(
            class,
            "LowerFilters",
            RegValue::multi_sz(&["PartMgr", "", "prl_strg"]),
        );
        h.to_bytes()
    }

    fn seed_software_hive() -> Vec<u8> {
        let mut h = Hive::create("SOFTWARE");
        let cv = h.ensure_path(r"Microsoft\Windows\CurrentVersion").unwrap();
        h.set_value(
            cv,
            "DevicePath",
            RegValue::expand_sz(r"%SystemRoot%\inf"),
        );
        let gpo = h
            .ensure_path(r"Microsoft\Windows\CurrentVersion\Group Policy\History")
            .unwrap();
        h.add_child(gpo, "{31B2F340-016D-11D2-945F-00C04FB984F9}");
        let xen = h
            .ensure_path(
                r"Microsoft\Windows\CurrentVersion\Uninstall\Red Hat Paravirtualized Xen Drivers for Windows(R)",
            )
            .unwrap();
        h.set_value(
            xen,
            "UninstallString",
            RegValue::sz(r"C:\Program Files\RedHat\uninst.exe"),
        );
        let prl = h
            .ensure_path(r"Microsoft\Windows\CurrentVersion\Uninstall\{PRL-1}")
            .unwrap();
        h.set_value(prl, "DisplayName", RegValue::sz("Parallels Tools 17"));
        h.set_value(
            prl,
            "UninstallString",
            RegValue::sz(r"MsiExec.exe /X{PRL-1}"),
        );
        h.to_bytes()
    }

    fn windows_guest(disk_size: u64) -> (FakeGuest, Inspection) {
        let mut g = FakeGuest::new().with_root(
            "/dev/sda2",
            FakeOs {
                os_type: "windows".into(),
                distro: "windows".into(),
                arch: "x86_64".into(),
                major: 6,
                minor: 1,
                product_name: "Windows 7 Enterprise".into(),
                product_variant: "Client".into(),
                format: "installed".into(),
                mountpoints: vec![("/".into(), "/dev/sda2".into())],
                systemroot: "/Windows".into(),
                system_hive: SYSTEM_PATH.into(),
                software_hive: SOFTWARE_PATH.into(),
                current_control_set: "ControlSet001".into(),
                ..FakeOs::default()
            },
        );
        g.files.insert(SYSTEM_PATH.into(), seed_system_hive());
        g.files.insert(SOFTWARE_PATH.into(), seed_software_hive());

        // NTFS partition on a disk below the first heads boundary.
        let mut part = vec![0u8; 512];
        part[3..11].copy_from_slice(b"NTFS    ");
        g.devices.insert("/dev/sda".into(), Vec::new());
        g.devices.insert("/dev/sda2".into(), part);
        g.device_sizes.insert("/dev/sda".into(), disk_size);
        g.part_parents.insert("/dev/sda2".into(), "/dev/sda".into());

        let insp =
            crate::inspect::inspect(&mut g, &RootPolicy::First, &mut std::io::Cursor::new(""))
                .unwrap();
        (g, insp)
    }

    fn driver_dir() -> (tempfile::TempDir, Vec<(String, std::path::PathBuf)>) {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for rel in [
            "viostor/w7/amd64/viostor.sys",
            "viostor/w7/amd64/viostor.inf",
            "viostor/w7/amd64/viostor.cat",
            "NetKVM/w7/amd64/netkvm.inf",
            "NetKVM/w7/amd64/netkvm.sys",
            "qxl/w7/amd64/qxl.inf",
            "viostor/2k12/amd64/viostor.sys",
            "Balloon/w7/amd64/balloon.doc",
        ] {
            let p = dir.path().join(rel);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(&p, b"driver bytes").unwrap();
            files.push((rel.to_owned(), p));
        }
        (dir, files)
    }

    #[test]
    fn full_conversion_performs_registry_surgery() {
        let (mut g, insp) = windows_guest(1 << 30);
        let (_keep, files) = driver_dir();
        let caps = convert_with_drivers(
            &mut g,
            &insp,
            &minimal_source(),
            &ConvertOptions::default(),
            &files,
        )
        .unwrap();

        assert_eq!(caps.block_bus, BlockBus::VirtioBlk);
        assert_eq!(caps.net_bus, NetBus::VirtioNet);
        assert_eq!(caps.video, TargetVideo::Qxl);

        let system = Hive::from_bytes(&g.files[SYSTEM_PATH]).unwrap();
        let svc = system
            .lookup(system.root(), r"ControlSet001\Services\prl_strg")
            .unwrap();
        assert_eq!(system.value(svc, "Start").unwrap().as_dword(), Some(4));
        let svc = system
            .lookup(system.root(), r"ControlSet001\Services\rhelscsi")
            .unwrap();
        assert_eq!(system.value(svc, "Start").unwrap().as_dword(), Some(4));

        let class = system
            .lookup(
                system.root(),
                &format!(r"ControlSet001\Control\Class\{DISK_CLASS_GUID}"),
            )
            .unwrap();
        assert_eq!(
            system.value(class, "LowerFilters").unwrap().as_multi_sz().unwrap(),
            vec!["PartMgr"]
        );

        let crash = system
            .lookup(system.root(), r"ControlSet001\Control\CrashControl")
            .unwrap();
        assert_eq!(system.value(crash, "AutoReboot").unwrap().as_dword(), Some(0));

        // viostor wired through the CDD path (Windows 7).
        assert!(
            system
                .lookup(system.root(), r"ControlSet001\Services\viostor")
                .is_ok()
        );

        // Drivers landed lower-cased in the guest.
        assert!(g.files.contains_key("/Windows/Drivers/VirtIO/viostor.sys"));
        assert!(g.files.contains_key("/Windows/Drivers/VirtIO/netkvm.inf"));
        // Non-matching OS trees and extensions were not copied.
        assert!(!g.files.keys().any(|k| k.contains("balloon.doc")));
    }

    #[test]
    fn software_hive_gets_device_path_and_firstboot() {
        let (mut g, insp) = windows_guest(1 << 30);
        let (_keep, files) = driver_dir();
        convert_with_drivers(
            &mut g,
            &insp,
            &minimal_source(),
            &ConvertOptions::default(),
            &files,
        )
        .unwrap();

        let software = Hive::from_bytes(&g.files[SOFTWARE_PATH]).unwrap();
        let cv = software
            .lookup(software.root(), r"Microsoft\Windows\CurrentVersion")
            .unwrap();
        let device_path = software.value(cv, "DevicePath").unwrap().as_string().unwrap();
        assert_eq!(device_path, r"%SystemRoot%\inf;%SystemRoot%\Drivers\VirtIO");

        // The uninstall scripts were queued: xen (prompt-free variant)
        // and parallels (quiet flags + 3010 tolerated).
        let scripts: Vec<String> = g
            .files
            .iter()
            .filter(|(k, _)| k.contains("/scripts/"))
            .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
            .collect();
        assert!(scripts.iter().any(|s| s.contains(r"_uninst.exe")));
        assert!(
            scripts
                .iter()
                .any(|s| s.contains("REBOOT=ReallySuppress") && s.contains("if errorlevel 3010"))
        );
    }

    #[test]
    fn device_path_append_is_idempotent() {
        let mut h = Hive::from_bytes(&seed_software_hive()).unwrap();
        append_device_path(&mut h).unwrap();
        append_device_path(&mut h).unwrap();
        let cv = h.lookup(h.root(), r"Microsoft\Windows\CurrentVersion").unwrap();
        let value = h.value(cv, "DevicePath").unwrap().as_string().unwrap();
        assert_eq!(value.matches("VirtIO").count(), 1);
    }

    #[test]
    fn ntfs_heads_byte_thresholds() {
        for (size, expected) in [
            (HEADS_BOUNDARY_1 - 1, 0x40u8),
            (HEADS_BOUNDARY_1, 0x80),
            (HEADS_BOUNDARY_2 - 1, 0x80),
            (HEADS_BOUNDARY_2, 0xFF),
        ] {
            let (mut g, insp) = windows_guest(size);
            let (_keep, files) = driver_dir();
            convert_with_drivers(
                &mut g,
                &insp,
                &minimal_source(),
                &ConvertOptions::default(),
                &files,
            )
            .unwrap();
            assert_eq!(
                g.devices["/dev/sda2"][0x1A], expected,
                "disk size {size} should yield heads {expected:#x}"
            );
        }
    }

    #[test]
    fn non_ntfs_partition_is_left_alone() {
        let (mut g, insp) = windows_guest(1 << 30);
        g.devices.get_mut("/dev/sda2").unwrap()[3..11].copy_from_slice(b"FAT32   ");
        let before = g.devices["/dev/sda2"].clone();
        let (_keep, files) = driver_dir();
        convert_with_drivers(
            &mut g,
            &insp,
            &minimal_source(),
            &ConvertOptions::default(),
            &files,
        )
        .unwrap();
        assert_eq!(g.devices["/dev/sda2"], before);
    }

    #[test]
    fn missing_drivers_downgrade_or_error() {
        let (mut g, insp) = windows_guest(1 << 30);
        let caps = convert_with_drivers(
            &mut g,
            &insp,
            &minimal_source(),
            &ConvertOptions::default(),
            &[],
        )
        .unwrap();
        assert_eq!(caps.block_bus, BlockBus::Ide);
        assert_eq!(caps.net_bus, NetBus::Rtl8139);
        assert_eq!(caps.video, TargetVideo::Cirrus);

        let (mut g, insp) = windows_guest(1 << 30);
        let opts = ConvertOptions {
            require_virtio_block: true,
            ..ConvertOptions::default()
        };
        assert!(convert_with_drivers(&mut g, &insp, &minimal_source(), &opts, &[]).is_err());
    }

    #[test]
    fn bcd_scrub_follows_default_entry() {
        let mut bcd = Hive::create("BCD");
        let ptr = bcd
            .ensure_path(&format!(r"Objects\{BCD_BOOTMGR}\Elements\23000003"))
            .unwrap();
        bcd.set_value(
            ptr,
            "Element",
            RegValue::sz("{deadbeef-0001-0002-0003-000000000004}"),
        );
        bcd.ensure_path(r"Objects\{deadbeef-0001-0002-0003-000000000004}\Elements\16000046")
            .unwrap();

        assert!(scrub_bcd(&mut bcd));
        assert!(
            bcd.lookup(
                bcd.root(),
                r"Objects\{deadbeef-0001-0002-0003-000000000004}\Elements\16000046"
            )
            .is_err()
        );
        // Idempotent: second scrub finds nothing.
        assert!(!scrub_bcd(&mut bcd));
    }

    #[test]
    fn missing_bcd_pieces_are_ignored() {
        let mut bcd = Hive::create("BCD");
        assert!(!scrub_bcd(&mut bcd));
    }
}
