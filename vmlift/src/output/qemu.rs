//! `-o qemu`: converted disks plus a shell script that boots them with
//! plain `qemu-kvm`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::info;

use crate::output::{Allocation, MetadataParams, OutputOptions, OutputPlugin, domxml};
use crate::overlay::Overlay;
use crate::qemuimg;
use crate::source::{DisplayType, Firmware, Sound, Source};
use crate::target::{NetBus, Slot, Target, TargetLocation, TargetVideo};
use crate::{Error, Result};

/// qemu binaries probed in order.
const QEMU_BINARIES: &[&str] = &[
    "/usr/libexec/qemu-kvm",
    "/usr/bin/qemu-kvm",
];

/// Output plugin writing a boot script next to the disks.
#[derive(Debug)]
pub struct QemuOutput {
    /// Destination directory (`-os`).
    dir: PathBuf,
    /// Allocation policy.
    alloc: Allocation,
    /// Target format; default raw.
    format: String,
    /// Start the script once the metadata is written.
    boot: bool,
}

impl QemuOutput {
    /// Builds the plugin; `-os` is required.
    pub fn new(opts: OutputOptions) -> Result<Self> {
        let dir = opts
            .storage
            .ok_or_else(|| Error::InvalidArgument("-o qemu requires -os <directory>".into()))?;
        Ok(Self {
            dir: PathBuf::from(dir),
            alloc: opts.alloc,
            format: opts.format.unwrap_or_else(|| "raw".to_owned()),
            boot: opts.qemu_boot,
        })
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        format!("-o qemu -os {}", self.dir.display())
    }

    /// The destination directory must exist.
    pub fn precheck(&self) -> Result<()> {
        if !self.dir.is_dir() {
            return Err(Error::Output(format!(
                "output directory {} does not exist",
                self.dir.display()
            )));
        }
        Ok(())
    }

    /// Same file layout as `-o local`.
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

    /// Creates the target blob.
    pub fn disk_create(&self, target: &Target) -> Result<()> {
        let TargetLocation::File(path) = &target.location else {
            return Err(Error::Output("qemu targets are files".into()));
        };
        let opts = qemuimg::CreateOpts {
            size: Some(target.overlay.virtual_size),
            preallocation: OutputPlugin::preallocation_for(self.alloc, &target.format),
            compat: (target.format == "qcow2").then(|| "1.1".to_owned()),
            ..qemuimg::CreateOpts::default()
        };
        qemuimg::create(path, &target.format, &opts).map_err(|e| Error::Output(e.to_string()))
    }

    /// Writes `<dir>/<name>.sh` (and optionally boots it).
    pub fn create_metadata(&mut self, params: &MetadataParams<'_>) -> Result<()> {
        let script = build_script(params);
        let path = self.dir.join(format!("{}.sh", params.source.name));
        fs::write(&path, script)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        info!(path = %path.display(), "wrote qemu boot script");

        if self.boot {
            Command::new(&path)
                .spawn()
                .map_err(|e| Error::Output(format!("failed to boot {}: {e}", path.display())))?;
        }
        Ok(())
    }
}

/// The qemu binary to put in the script: qemu-kvm when installed,
/// otherwise the arch-specific system emulator.
fn qemu_binary(arch: &str) -> String {
    for candidate in QEMU_BINARIES {
        if Path::new(candidate).exists() {
            return (*candidate).to_owned();
        }
    }
    format!("qemu-system-{arch}")
}

/// Renders the boot script.
fn build_script(params: &MetadataParams<'_>) -> String {
    let MetadataParams {
        source,
        targets,
        buses,
        caps,
        inspect,
        firmware,
    } = params;

    let mut lines: Vec<String> = Vec::new();
    lines.push("#!/bin/sh -".to_owned());
    lines.push(String::new());

    let uefi = matches!(firmware, Firmware::Uefi { .. })
        .then(|| domxml::uefi_firmware(&caps.arch))
        .flatten();
    if let Some((_, vars)) = uefi {
        // Fresh writable vars on every boot; the template stays clean.
        lines.push("uefi_vars=\"$(mktemp)\"".to_owned());
        lines.push(format!("cp {vars} \"$uefi_vars\""));
        lines.push(String::new());
    }

    let mut args: Vec<String> = Vec::new();
    args.push(qemu_binary(&caps.arch));
    args.push("-no-user-config -nodefaults".to_owned());
    args.push(format!("-name {}", source.name));
    args.push(format!("-machine {},accel=kvm:tcg", caps.machine_name()));
    if let Some((code, _)) = uefi {
        args.push(format!(
            "-drive if=pflash,format=raw,file={code},readonly=on"
        ));
        args.push("-drive if=pflash,format=raw,file=\"$uefi_vars\"".to_owned());
    }
    args.push(format!("-m {}", source.memory / (1 << 20)));
    args.push(format!("-smp {}", source.vcpu));

    for (bus_name, slots) in buses.buses() {
        for slot in slots.iter() {
            match slot {
                Slot::Empty => {}
                Slot::Disk(id) => {
                    if let Some(t) = targets.iter().find(|t| t.overlay.disk_id == *id) {
                        let file = t.location.as_arg();
                        let interface = match bus_name {
                            "virtio" => "virtio",
                            "scsi" => "scsi",
                            _ => "ide",
                        };
                        args.push(format!(
                            "-drive file={file},format={},if={interface},index={},media=disk",
                            t.format, t.overlay.disk_id
                        ));
                    }
                }
                Slot::Removable(kind) => match kind {
                    crate::source::RemovableKind::Cdrom => {
                        args.push("-drive if=ide,media=cdrom".to_owned());
                    }
                    crate::source::RemovableKind::Floppy => {
                        args.push("-drive if=floppy".to_owned());
                    }
                },
            }
        }
    }

    let net_device = match caps.net_bus {
        NetBus::VirtioNet => "virtio-net-pci",
        NetBus::E1000 => "e1000",
        NetBus::Rtl8139 => "rtl8139",
    };
    for (i, nic) in source.nics.iter().enumerate() {
        args.push(format!("-netdev user,id=net{i}"));
        match &nic.mac {
            Some(mac) => args.push(format!("-device {net_device},netdev=net{i},mac={mac}")),
            None => args.push(format!("-device {net_device},netdev=net{i}")),
        }
    }
    if source.nics.is_empty() {
        args.push("-netdev user,id=net0".to_owned());
        args.push(format!("-device {net_device},netdev=net0"));
    }

    let video = match caps.video {
        TargetVideo::Qxl => "qxl-vga",
        TargetVideo::Cirrus => "cirrus-vga",
    };
    args.push(format!("-device {video}"));
    match source.display.as_ref().map(|d| d.display_type) {
        Some(DisplayType::Spice) => args.push("-spice port=5900,addr=127.0.0.1".to_owned()),
        Some(DisplayType::Vnc) => args.push("-display vnc=:0".to_owned()),
        Some(DisplayType::Window) | None => args.push("-display gtk".to_owned()),
    }

    if let Some(sound) = &source.sound {
        let device = match sound {
            Sound::Ac97 => Some("AC97"),
            Sound::Es1370 => Some("ES1370"),
            Sound::Ich6 => Some("intel-hda"),
            Sound::Ich9 => Some("ich9-intel-hda"),
            Sound::Sb16 => Some("sb16"),
            Sound::PcSpeaker | Sound::UsbAudio => None,
        };
        if let Some(device) = device {
            args.push(format!("-device {device}"));
        }
    }

    if caps.virtio_rng {
        args.push("-object rng-random,filename=/dev/urandom,id=rng0".to_owned());
        args.push("-device virtio-rng-pci,rng=rng0".to_owned());
    }
    if caps.virtio_balloon {
        args.push("-device virtio-balloon".to_owned());
    }
    if caps.isa_pvpanic {
        args.push("-device pvpanic,ioport=0x505".to_owned());
    }
    if inspect.os_type == "linux" {
        args.push("-serial stdio".to_owned());
    }

    lines.push(args.join(" \\\n    "));
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::output::domxml::tests::fixture;
    use crate::target::{BlockBus, Machine};

    #[test]
    fn bios_windows_script_shape() {
        let (mut source, mut targets, _, mut caps, mut inspect) = fixture();
        source.name = "windows".into();
        source.memory = 2048 << 20;
        source.vcpu = 1;
        source.nics.truncate(1);
        inspect.os_type = "windows".into();
        caps.block_bus = BlockBus::Ide;
        caps.net_bus = NetBus::Rtl8139;
        caps.video = TargetVideo::Cirrus;
        caps.virtio_rng = false;
        caps.virtio_balloon = false;
        caps.machine = Machine::I440fx;
        targets[0].location =
            TargetLocation::File(PathBuf::from("/tmp/d/windows-sda"));
        let buses = crate::convert::assign_buses(&source, &caps).unwrap();
        let firmware = Firmware::Bios;

        let script = build_script(&MetadataParams {
            source: &source,
            targets: &targets,
            buses: &buses,
            caps: &caps,
            inspect: &inspect,
            firmware: &firmware,
        });

        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("-m 2048"));
        assert!(script.contains("-smp 1"));
        assert!(script.contains("-netdev user,id=net0"));
        assert!(script.contains("if=ide"));
        assert!(script.contains("media=disk"));
        // BIOS guest: no pflash firmware.
        assert!(!script.contains("if=pflash"));
        // Windows guest: no serial console.
        assert!(!script.contains("-serial stdio"));
    }

    #[test]
    fn linux_guest_gets_serial_console() {
        let (source, targets, buses, caps, inspect) = fixture();
        let firmware = Firmware::Bios;
        let script = build_script(&MetadataParams {
            source: &source,
            targets: &targets,
            buses: &buses,
            caps: &caps,
            inspect: &inspect,
            firmware: &firmware,
        });
        assert!(script.contains("-serial stdio"));
        assert!(script.contains("if=virtio"));
    }
}
