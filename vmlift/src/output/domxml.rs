//! Libvirt domain XML generation for the converted guest.

use std::path::Path;

use crate::output::MetadataParams;
use crate::source::{DisplayListen, DisplayType, Firmware, Sound};
use crate::target::{NetBus, Slot, TargetLocation, TargetVideo};
use crate::xml::Element;

/// Features a KVM target can express; everything else from the source
/// is dropped.
const TARGET_FEATURES: &[&str] = &["acpi", "apic", "pae"];

/// Known UEFI firmware blob locations, per architecture:
/// `(code, vars-template)`.
const UEFI_FIRMWARE: &[(&str, &str, &str)] = &[
    (
        "x86_64",
        "/usr/share/OVMF/OVMF_CODE.secboot.fd",
        "/usr/share/OVMF/OVMF_VARS.fd",
    ),
    (
        "x86_64",
        "/usr/share/OVMF/OVMF_CODE.fd",
        "/usr/share/OVMF/OVMF_VARS.fd",
    ),
    (
        "x86_64",
        "/usr/share/edk2/ovmf/OVMF_CODE.fd",
        "/usr/share/edk2/ovmf/OVMF_VARS.fd",
    ),
    (
        "aarch64",
        "/usr/share/AAVMF/AAVMF_CODE.fd",
        "/usr/share/AAVMF/AAVMF_VARS.fd",
    ),
];

/// Finds installed UEFI firmware for an architecture.
pub fn uefi_firmware(arch: &str) -> Option<(&'static str, &'static str)> {
    UEFI_FIRMWARE
        .iter()
        .filter(|(a, _, _)| *a == arch)
        .find(|(_, code, vars)| Path::new(code).exists() && Path::new(vars).exists())
        .map(|(_, code, vars)| (*code, *vars))
}

/// Device-name prefix for a bus.
fn dev_prefix(bus: &str) -> &'static str {
    match bus {
        "virtio" => "vd",
        "ide" => "hd",
        "scsi" => "sd",
        _ => "fd",
    }
}

/// Letter suffix for a slot index (`a`, `b`, … `aa`).
fn dev_letter(index: usize) -> String {
    crate::overlay::drive_name(index)
        .strip_prefix("sd")
        .unwrap_or("a")
        .to_owned()
}

/// Builds the `<domain type='kvm'>` document for the converted guest.
pub fn build_domain(params: &MetadataParams<'_>) -> Element {
    let MetadataParams {
        source,
        targets,
        buses,
        caps,
        inspect,
        firmware,
    } = params;

    let mut domain = Element::new("domain").attr("type", "kvm");
    domain.push(Element::new("name").text(&source.name));
    if let Some(genid) = &source.genid {
        domain.push(Element::new("genid").text(genid));
    }

    let kib = source.memory / 1024;
    domain.push(
        Element::new("memory")
            .attr("unit", "KiB")
            .text(&kib.to_string()),
    );
    domain.push(
        Element::new("currentMemory")
            .attr("unit", "KiB")
            .text(&kib.to_string()),
    );
    domain.push(Element::new("vcpu").text(&source.vcpu.to_string()));

    if source.cpu_vendor.is_some() || source.cpu_model.is_some() || source.topology.is_some() {
        let mut cpu = Element::new("cpu").attr("match", "minimum");
        if let Some(vendor) = &source.cpu_vendor {
            cpu.push(Element::new("vendor").text(vendor));
        }
        if let Some(model) = &source.cpu_model {
            cpu.push(Element::new("model").attr("fallback", "allow").text(model));
        }
        if let Some(t) = &source.topology {
            cpu.push(
                Element::new("topology")
                    .attr("sockets", &t.sockets.to_string())
                    .attr("cores", &t.cores.to_string())
                    .attr("threads", &t.threads.to_string()),
            );
        }
        domain.push(cpu);
    }

    // <os> with machine type; pflash loader for UEFI guests.
    let mut os = Element::new("os");
    os.push(
        Element::new("type")
            .attr("arch", &caps.arch)
            .attr("machine", caps.machine_name())
            .text("hvm"),
    );
    if matches!(firmware, Firmware::Uefi { .. })
        && let Some((code, vars)) = uefi_firmware(&caps.arch)
    {
        os.push(
            Element::new("loader")
                .attr("readonly", "yes")
                .attr("type", "pflash")
                .text(code),
        );
        os.push(Element::new("nvram").attr("template", vars));
    }
    domain.push(os);

    // Features: source ∩ target, acpi per caps, apic/pae forced on x86,
    // smm for Secure Boot.
    let mut features = Element::new("features");
    let mut wanted: Vec<&str> = source
        .features
        .iter()
        .map(String::as_str)
        .filter(|f| TARGET_FEATURES.contains(f))
        .collect();
    if caps.acpi && !wanted.contains(&"acpi") {
        wanted.push("acpi");
    }
    if caps.arch.contains("86") {
        for forced in ["apic", "pae"] {
            if !wanted.contains(&forced) {
                wanted.push(forced);
            }
        }
    }
    if matches!(
        firmware,
        Firmware::Uefi {
            secure_boot_required: true
        }
    ) {
        wanted.push("smm");
    }
    for f in wanted {
        features.push(Element::new(f));
    }
    domain.push(features);

    let offset = if inspect.os_type == "windows" {
        "localtime"
    } else {
        "utc"
    };
    domain.push(Element::new("clock").attr("offset", offset));
    domain.push(Element::new("on_poweroff").text("destroy"));
    domain.push(Element::new("on_reboot").text("restart"));
    domain.push(Element::new("on_crash").text("restart"));

    let mut devices = Element::new("devices");

    for (bus_name, slots) in buses.buses() {
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                Slot::Empty => {}
                Slot::Disk(id) => {
                    if let Some(target) = targets.iter().find(|t| t.overlay.disk_id == *id) {
                        devices.push(disk_element(target, bus_name, i));
                    }
                }
                Slot::Removable(kind) => {
                    let device = match kind {
                        crate::source::RemovableKind::Cdrom => "cdrom",
                        crate::source::RemovableKind::Floppy => "floppy",
                    };
                    let mut disk = Element::new("disk")
                        .attr("type", "file")
                        .attr("device", device);
                    disk.push(Element::new("driver").attr("name", "qemu").attr("type", "raw"));
                    disk.push(
                        Element::new("target")
                            .attr("dev", &format!("{}{}", dev_prefix(bus_name), dev_letter(i)))
                            .attr("bus", bus_name),
                    );
                    devices.push(disk);
                }
            }
        }
    }

    let net_model = match caps.net_bus {
        NetBus::VirtioNet => "virtio",
        NetBus::E1000 => "e1000",
        NetBus::Rtl8139 => "rtl8139",
    };
    for nic in &source.nics {
        let (iface_type, source_attr) = match nic.kind {
            crate::source::VnetKind::Network => ("network", "network"),
            crate::source::VnetKind::Bridge => ("bridge", "bridge"),
        };
        let mut iface = Element::new("interface").attr("type", iface_type);
        if let Some(mac) = &nic.mac {
            iface.push(Element::new("mac").attr("address", mac));
        }
        iface.push(Element::new("source").attr(source_attr, &nic.vnet));
        iface.push(Element::new("model").attr("type", net_model));
        devices.push(iface);
    }

    // A standard display is always emitted.
    let graphics_type = match source.display.as_ref().map(|d| d.display_type) {
        Some(DisplayType::Spice) => "spice",
        Some(DisplayType::Window) | Some(DisplayType::Vnc) | None => "vnc",
    };
    let mut graphics = Element::new("graphics").attr("type", graphics_type);
    if let Some(display) = &source.display {
        if let Some(keymap) = &display.keymap {
            graphics = graphics.attr("keymap", keymap);
        }
        if let Some(password) = &display.password {
            graphics = graphics.attr("passwd", password);
        }
        match &display.listen {
            DisplayListen::Address(a) => {
                graphics.push(Element::new("listen").attr("type", "address").attr("address", a));
            }
            DisplayListen::Network(n) => {
                graphics.push(Element::new("listen").attr("type", "network").attr("network", n));
            }
            DisplayListen::Socket(s) => {
                let mut listen = Element::new("listen").attr("type", "socket");
                if let Some(path) = s {
                    listen = listen.attr("socket", path);
                }
                graphics.push(listen);
            }
            DisplayListen::NoListen => {
                graphics.push(Element::new("listen").attr("type", "none"));
            }
            DisplayListen::None => {}
        }
        match display.port {
            Some(port) => graphics = graphics.attr("port", &port.to_string()),
            None => graphics = graphics.attr("autoport", "yes"),
        }
    } else {
        graphics = graphics.attr("autoport", "yes");
    }
    devices.push(graphics);

    let video_model = match caps.video {
        TargetVideo::Qxl => "qxl",
        TargetVideo::Cirrus => "cirrus",
    };
    let mut video = Element::new("video");
    video.push(Element::new("model").attr("type", video_model).attr("vram", "16384"));
    devices.push(video);

    if let Some(sound) = &source.sound {
        let model = match sound {
            Sound::Ac97 => "ac97",
            Sound::Es1370 => "es1370",
            Sound::Ich6 => "ich6",
            Sound::Ich9 => "ich9",
            Sound::PcSpeaker => "pcspk",
            Sound::Sb16 => "sb16",
            Sound::UsbAudio => "usb",
        };
        devices.push(Element::new("sound").attr("model", model));
    }

    if caps.virtio_rng {
        let mut rng = Element::new("rng").attr("model", "virtio");
        rng.push(
            Element::new("backend")
                .attr("model", "random")
                .text("/dev/urandom"),
        );
        devices.push(rng);
    }
    if caps.virtio_balloon {
        devices.push(Element::new("memballoon").attr("model", "virtio"));
    }
    if caps.isa_pvpanic {
        devices.push(Element::new("panic").attr("model", "isa"));
    }

    domain.push(devices);
    domain
}

/// One fixed-disk `<disk>` element.
fn disk_element(target: &crate::target::Target, bus_name: &str, index: usize) -> Element {
    let mut disk = Element::new("disk").attr("device", "disk");
    match &target.location {
        TargetLocation::File(path) => {
            disk = disk.attr("type", "file");
            disk.push(
                Element::new("driver")
                    .attr("name", "qemu")
                    .attr("type", &target.format),
            );
            disk.push(Element::new("source").attr("file", &path.display().to_string()));
        }
        TargetLocation::Uri(uri) => {
            disk = disk.attr("type", "network");
            disk.push(
                Element::new("driver")
                    .attr("name", "qemu")
                    .attr("type", &target.format),
            );
            disk.push(Element::new("source").attr("name", uri));
        }
    }
    disk.push(
        Element::new("target")
            .attr("dev", &format!("{}{}", dev_prefix(bus_name), dev_letter(index)))
            .attr("bus", bus_name),
    );
    disk
}
