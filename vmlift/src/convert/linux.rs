//! Linux conversion: virtio enablement, initramfs regeneration,
//! bootloader and fstab device renaming, hypervisor tool removal.

use regex::Regex;
use tracing::{debug, info, warn};

use crate::convert::{ConvertOptions, machine_type};
use crate::guest::GuestFs;
use crate::inspect::Inspection;
use crate::source::Source;
use crate::target::{BlockBus, GuestCaps, NetBus, TargetVideo};
use crate::{Error, Result};

/// Xen paravirt driver packages that must not survive conversion.
const XEN_PACKAGES: &[&str] = &["kmod-xenpv", "kmod-xenpv-x86_64", "xen-vnif", "xenpv"];

/// VMware guest tool packages.
const VMWARE_PACKAGES: &[&str] = &["vmware-tools", "open-vm-tools", "vmware-tools-libraries-nox"];

/// Parallels guest tool packages.
const PARALLELS_PACKAGES: &[&str] = &["parallels-tools", "prl-tools"];

/// Bootloader / fstab files that may name block devices directly.
const BOOT_CONFIG_FILES: &[&str] = &[
    "/etc/fstab",
    "/boot/grub2/grub.cfg",
    "/boot/grub/grub.cfg",
    "/boot/grub/grub.conf",
    "/boot/grub/menu.lst",
];

/// Converts an inspected Linux guest.
pub fn convert(
    guest: &mut dyn GuestFs,
    inspect: &Inspection,
    source: &Source,
    opts: &ConvertOptions,
) -> Result<GuestCaps> {
    info!(distro = %inspect.distro, major = inspect.major, "converting Linux guest");

    let kernel = latest_kernel(guest)?;
    let virtio = kernel
        .as_deref()
        .map(|k| virtio_support(guest, k))
        .transpose()?
        .unwrap_or_default();

    if opts.require_virtio_block && !virtio.block {
        return Err(Error::Conversion(
            "the guest kernel has no virtio-blk driver, but virtio block was required".into(),
        ));
    }
    if opts.require_virtio_net && !virtio.net {
        return Err(Error::Conversion(
            "the guest kernel has no virtio-net driver, but virtio net was required".into(),
        ));
    }
    if !virtio.block {
        warn!("guest kernel lacks virtio-blk; falling back to slower IDE emulation");
    }
    if !virtio.net {
        warn!("guest kernel lacks virtio-net; falling back to slower rtl8139 emulation");
    }

    remove_guest_tools(guest, inspect);

    if let Some(kernel) = &kernel {
        rebuild_initramfs(guest, kernel)?;
    }
    rename_block_devices(guest)?;
    if !opts.keep_serial_console {
        strip_serial_console(guest)?;
    }

    Ok(GuestCaps {
        block_bus: if virtio.block {
            BlockBus::VirtioBlk
        } else {
            BlockBus::Ide
        },
        net_bus: if virtio.net {
            NetBus::VirtioNet
        } else {
            NetBus::Rtl8139
        },
        video: TargetVideo::Qxl,
        virtio_rng: virtio.rng,
        virtio_balloon: virtio.balloon,
        isa_pvpanic: virtio.pvpanic,
        acpi: true,
        arch: inspect.arch.clone(),
        machine: machine_type(&inspect.arch, &source.firmware),
    })
}

/// Kernel module availability discovered under `/lib/modules`.
#[derive(Debug, Clone, Copy, Default)]
struct VirtioSupport {
    block: bool,
    net: bool,
    scsi: bool,
    balloon: bool,
    rng: bool,
    pvpanic: bool,
}

/// Picks the newest installed kernel by version-ish sort.
fn latest_kernel(guest: &mut dyn GuestFs) -> Result<Option<String>> {
    if !guest.is_dir("/lib/modules")? {
        return Ok(None);
    }
    let kernels: std::collections::BTreeSet<String> = guest
        .find("/lib/modules")?
        .iter()
        .filter_map(|p| p.split('/').next())
        .map(str::to_owned)
        .collect();
    Ok(kernels.into_iter().next_back())
}

/// Checks which virtio modules the kernel ships (built-in or loadable).
fn virtio_support(guest: &mut dyn GuestFs, kernel: &str) -> Result<VirtioSupport> {
    let mut find = |paths: &[String]| -> Result<bool> {
        for p in paths {
            if guest.is_file(p)? {
                return Ok(true);
            }
        }
        Ok(false)
    };
    let module = |subdir: &str, name: &str| -> Vec<String> {
        ["ko", "ko.xz", "ko.gz", "ko.zst"]
            .iter()
            .map(|ext| format!("/lib/modules/{kernel}/kernel/drivers/{subdir}/{name}.{ext}"))
            .collect()
    };
    Ok(VirtioSupport {
        block: find(&module("block", "virtio_blk"))?,
        net: find(&module("net", "virtio_net"))?,
        scsi: find(&module("scsi", "virtio_scsi"))?,
        balloon: find(&module("virtio", "virtio_balloon"))?,
        rng: find(&module("char/hw_random", "virtio-rng"))?,
        pvpanic: find(&module("misc", "pvpanic"))?,
    })
}

/// Uninstalls Xen/VMware/Parallels guest tooling by package.
fn remove_guest_tools(guest: &mut dyn GuestFs, inspect: &Inspection) {
    let doomed: Vec<String> = inspect
        .applications
        .iter()
        .filter(|app| {
            let name = app.name.to_ascii_lowercase();
            XEN_PACKAGES.iter().any(|p| name.starts_with(p))
                || VMWARE_PACKAGES.iter().any(|p| name.starts_with(p))
                || PARALLELS_PACKAGES.iter().any(|p| name.starts_with(p))
        })
        .map(|app| app.name.clone())
        .collect();

    for pkg in doomed {
        debug!(package = %pkg, "removing hypervisor guest tooling");
        let result = match inspect.package_format.as_str() {
            "rpm" => guest.command(&["rpm", "-e", "--nodeps", &pkg]),
            "deb" => guest.command(&["dpkg", "--purge", &pkg]),
            _ => {
                warn!(package = %pkg, "unknown package format; leaving package installed");
                continue;
            }
        };
        if let Err(e) = result {
            warn!(package = %pkg, error = %e, "failed to remove package");
        }
    }
}

/// Regenerates the initramfs with the virtio drivers included.
fn rebuild_initramfs(guest: &mut dyn GuestFs, kernel: &str) -> Result<()> {
    let drivers = "virtio_blk virtio_net virtio_scsi virtio_balloon virtio_pci";
    if guest.is_file("/usr/bin/dracut")? || guest.is_file("/sbin/dracut")? {
        guest.command(&[
            "dracut",
            "--force",
            "--add-drivers",
            drivers,
            &format!("/boot/initramfs-{kernel}.img"),
            kernel,
        ])?;
    } else if guest.is_file("/sbin/mkinitrd")? {
        guest.command(&[
            "mkinitrd",
            "-f",
            "--with=virtio_blk",
            "--with=virtio_net",
            "--with=virtio_pci",
            &format!("/boot/initrd-{kernel}.img"),
            kernel,
        ])?;
    } else if guest.is_file("/usr/sbin/update-initramfs")? {
        guest.command(&["update-initramfs", "-u", "-k", kernel])?;
    } else {
        warn!("no initramfs tool found; relying on built-in virtio drivers");
    }
    Ok(())
}

/// Rewrites `/dev/hdX` and `/dev/xvdX` references to `/dev/vdX` in the
/// bootloader configuration and fstab. UUID/LABEL entries are already
/// stable and left alone.
fn rename_block_devices(guest: &mut dyn GuestFs) -> Result<()> {
    #[allow(clippy::unwrap_used)] // pattern is a literal
    let re = Regex::new(r"/dev/(?:hd|xvd)([a-z]+[0-9]*)").unwrap();
    for path in BOOT_CONFIG_FILES {
        if !guest.is_file(path)? {
            continue;
        }
        let data = guest.read_file(path)?;
        let text = String::from_utf8_lossy(&data);
        let replaced = re.replace_all(&text, "/dev/vd$1");
        if replaced != text {
            debug!(file = path, "renamed block devices for virtio");
            guest.write_file(path, replaced.as_bytes())?;
        }
    }
    Ok(())
}

/// Drops `console=ttyS…` kernel arguments when the output has no
/// serial console.
fn strip_serial_console(guest: &mut dyn GuestFs) -> Result<()> {
    #[allow(clippy::unwrap_used)] // pattern is a literal
    let re = Regex::new(r" ?console=ttyS[0-9]+(?:,[0-9a-zA-Z]+)?").unwrap();
    for path in BOOT_CONFIG_FILES {
        if *path == "/etc/fstab" || !guest.is_file(path)? {
            continue;
        }
        let data = guest.read_file(path)?;
        let text = String::from_utf8_lossy(&data);
        let replaced = re.replace_all(&text, "");
        if replaced != text {
            debug!(file = path, "stripped serial console configuration");
            guest.write_file(path, replaced.as_bytes())?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::guest::Application;
    use crate::guest::fake::{FakeGuest, FakeOs};
    use crate::inspect::{InspectedFirmware, RootPolicy};
    use crate::source::Firmware;

    const KERNEL: &str = "5.14.0-70.el9.x86_64";

    fn fake_linux(with_virtio: bool) -> (FakeGuest, Inspection) {
        let mut g = FakeGuest::new().with_root(
            "/dev/sda2",
            FakeOs {
                os_type: "linux".into(),
                distro: "rhel".into(),
                arch: "x86_64".into(),
                major: 9,
                format: "installed".into(),
                package_format: "rpm".into(),
                package_management: "dnf".into(),
                mountpoints: vec![("/".into(), "/dev/sda2".into())],
                applications: vec![Application {
                    name: "open-vm-tools".into(),
                    version: "12.0".into(),
                }],
                ..FakeOs::default()
            },
        );
        g.files.insert(format!("/lib/modules/{KERNEL}/modules.dep"), Vec::new());
        if with_virtio {
            for m in [
                format!("/lib/modules/{KERNEL}/kernel/drivers/block/virtio_blk.ko.xz"),
                format!("/lib/modules/{KERNEL}/kernel/drivers/net/virtio_net.ko.xz"),
                format!("/lib/modules/{KERNEL}/kernel/drivers/virtio/virtio_balloon.ko.xz"),
            ] {
                g.files.insert(m, Vec::new());
            }
        }
        g.files.insert("/usr/bin/dracut".into(), Vec::new());
        g.files.insert(
            "/etc/fstab".into(),
            b"/dev/xvda1 / ext4 defaults 0 0\nUUID=abcd /boot ext4 defaults 0 0\n".to_vec(),
        );
        g.files.insert(
            "/boot/grub2/grub.cfg".into(),
            b"linux /vmlinuz root=/dev/hda2 console=ttyS0,115200 quiet\n".to_vec(),
        );

        let insp = crate::inspect::inspect(&mut g, &RootPolicy::First, &mut std::io::Cursor::new(""))
            .unwrap();
        assert_eq!(insp.firmware, InspectedFirmware::Bios);
        (g, insp)
    }

    fn src() -> Source {
        let mut s = crate::source::tests::minimal_source();
        s.firmware = Firmware::Unknown;
        s
    }

    #[test]
    fn virtio_kernel_yields_virtio_caps() {
        let (mut g, insp) = fake_linux(true);
        let caps = convert(&mut g, &insp, &src(), &ConvertOptions::default()).unwrap();
        assert_eq!(caps.block_bus, BlockBus::VirtioBlk);
        assert_eq!(caps.net_bus, NetBus::VirtioNet);
        assert!(caps.virtio_balloon);
        assert!(caps.acpi);
        // dracut was invoked for the latest kernel.
        assert!(g.commands.iter().any(|c| c[0] == "dracut" && c.contains(&KERNEL.to_owned())));
    }

    #[test]
    fn missing_virtio_downgrades_with_defaults() {
        let (mut g, insp) = fake_linux(false);
        let caps = convert(&mut g, &insp, &src(), &ConvertOptions::default()).unwrap();
        assert_eq!(caps.block_bus, BlockBus::Ide);
        assert_eq!(caps.net_bus, NetBus::Rtl8139);
    }

    #[test]
    fn missing_virtio_is_fatal_when_required() {
        let (mut g, insp) = fake_linux(false);
        let opts = ConvertOptions {
            require_virtio_block: true,
            ..ConvertOptions::default()
        };
        assert!(convert(&mut g, &insp, &src(), &opts).is_err());
    }

    #[test]
    fn fstab_and_grub_devices_are_renamed() {
        let (mut g, insp) = fake_linux(true);
        convert(&mut g, &insp, &src(), &ConvertOptions::default()).unwrap();
        let fstab = String::from_utf8(g.files["/etc/fstab"].clone()).unwrap();
        assert!(fstab.contains("/dev/vda1"));
        assert!(fstab.contains("UUID=abcd"), "UUID entries untouched");
        let grub = String::from_utf8(g.files["/boot/grub2/grub.cfg"].clone()).unwrap();
        assert!(grub.contains("root=/dev/vda2"));
    }

    #[test]
    fn serial_console_is_stripped_unless_kept() {
        let (mut g, insp) = fake_linux(true);
        convert(&mut g, &insp, &src(), &ConvertOptions::default()).unwrap();
        let grub = String::from_utf8(g.files["/boot/grub2/grub.cfg"].clone()).unwrap();
        assert!(!grub.contains("console=ttyS0"));

        let (mut g, insp) = fake_linux(true);
        let opts = ConvertOptions {
            keep_serial_console: true,
            ..ConvertOptions::default()
        };
        convert(&mut g, &insp, &src(), &opts).unwrap();
        let grub = String::from_utf8(g.files["/boot/grub2/grub.cfg"].clone()).unwrap();
        assert!(grub.contains("console=ttyS0"));
    }

    #[test]
    fn vmware_tools_package_is_removed() {
        let (mut g, insp) = fake_linux(true);
        convert(&mut g, &insp, &src(), &ConvertOptions::default()).unwrap();
        assert!(
            g.commands
                .iter()
                .any(|c| c[0] == "rpm" && c.contains(&"open-vm-tools".to_owned()))
        );
    }
}
