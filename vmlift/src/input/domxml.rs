//! Libvirt domain XML parsing shared by the libvirt-flavoured inputs.

use std::path::Path;
use std::process::Command;

use tracing::warn;

use crate::source::{
    Controller, CpuTopology, Display, DisplayListen, DisplayType, Firmware, Hypervisor, Nic,
    NicModel, Removable, RemovableKind, Sound, Source, SourceDisk, Video, VnetKind,
};
use crate::xml::Element;
use crate::{Error, Result};

/// Parses a `<domain>` document into a [`Source`].
///
/// `base_dir` resolves relative file paths (the libvirtxml input);
/// `conn` is used to resolve `<source pool= volume=>` disks through
/// `virsh vol-path`.
pub(crate) fn parse_domain(
    root: &Element,
    base_dir: Option<&Path>,
    conn: Option<&str>,
) -> Result<Source> {
    if root.name != "domain" {
        return Err(Error::Input(format!(
            "expected <domain> document, found <{}>",
            root.name
        )));
    }

    let hypervisor = match root.attr_value("type").unwrap_or("") {
        "kvm" => Hypervisor::Kvm,
        "qemu" => Hypervisor::QEmu,
        "xen" => Hypervisor::Xen,
        "vmware" => Hypervisor::VMware,
        "hyperv" => Hypervisor::HyperV,
        other => Hypervisor::Other(other.to_owned()),
    };

    let name = root
        .child_text("name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::Input("domain XML has no <name>".into()))?
        .to_owned();

    // <memory> is in KiB.
    let memory_kib: u64 = root
        .child_text("memory")
        .and_then(|m| m.parse().ok())
        .ok_or_else(|| Error::Input("domain XML has no parseable <memory>".into()))?;
    let memory = memory_kib * 1024;

    let vcpu = root
        .child_text("vcpu")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    let features = root
        .find("features")
        .map(|f| f.children.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default();

    let (cpu_vendor, cpu_model, topology) = parse_cpu(root);
    let genid = root.child_text("genid").map(str::to_owned);
    let firmware = parse_firmware(root);

    let devices = root.find("devices");
    let display = devices.and_then(parse_graphics);
    let video = devices.and_then(parse_video);
    let sound = devices.and_then(parse_sound);

    let virtio_scsi = devices.is_some_and(|d| {
        d.find_all("controller")
            .any(|c| c.attr_value("model") == Some("virtio-scsi"))
    });

    let mut disks = Vec::new();
    let mut removables = Vec::new();
    if let Some(devices) = devices {
        for disk_el in devices.find_all("disk") {
            parse_disk(disk_el, base_dir, conn, virtio_scsi, &mut disks, &mut removables)?;
        }
        if devices.find("hostdev").is_some() {
            warn!("source has passed-through host devices; they are dropped by conversion");
        }
    }

    let mut nics = Vec::new();
    if let Some(devices) = devices {
        for (index, iface) in devices.find_all("interface").enumerate() {
            if let Some(nic) = parse_interface(iface, index) {
                nics.push(nic);
            }
        }
    }

    Ok(Source {
        name: name.clone(),
        orig_name: name,
        memory,
        vcpu,
        cpu_vendor,
        cpu_model,
        topology,
        genid,
        firmware,
        features,
        display,
        video,
        sound,
        disks,
        removables,
        nics,
        hypervisor,
    })
}

fn parse_cpu(root: &Element) -> (Option<String>, Option<String>, Option<CpuTopology>) {
    let Some(cpu) = root.find("cpu") else {
        return (None, None, None);
    };
    let vendor = cpu.child_text("vendor").map(str::to_owned);
    let model = cpu.child_text("model").map(str::to_owned);
    let topology = cpu.find("topology").map(|t| CpuTopology {
        sockets: t.attr_value("sockets").and_then(|v| v.parse().ok()).unwrap_or(1),
        cores: t.attr_value("cores").and_then(|v| v.parse().ok()).unwrap_or(1),
        threads: t.attr_value("threads").and_then(|v| v.parse().ok()).unwrap_or(1),
    });
    (vendor, model, topology)
}

fn parse_firmware(root: &Element) -> Firmware {
    let Some(os) = root.find("os") else {
        return Firmware::Unknown;
    };
    if os.attr_value("firmware") == Some("efi") {
        return Firmware::Uefi {
            secure_boot_required: false,
        };
    }
    if let Some(loader) = os.find("loader") {
        if loader.attr_value("type") == Some("pflash") || loader.text.contains("OVMF") {
            let secure = loader.attr_value("secure") == Some("yes");
            return Firmware::Uefi {
                secure_boot_required: secure,
            };
        }
    }
    Firmware::Bios
}

fn parse_graphics(devices: &Element) -> Option<Display> {
    // Only the first <graphics> is considered.
    let g = devices.find("graphics")?;
    let display_type = match g.attr_value("type")? {
        "vnc" => DisplayType::Vnc,
        "spice" => DisplayType::Spice,
        "sdl" | "desktop" => DisplayType::Window,
        other => {
            warn!(graphics = other, "ignoring unknown graphics type");
            return None;
        }
    };
    let autoport = g.attr_value("autoport") == Some("yes");
    let port = if autoport {
        None
    } else {
        g.attr_value("port")
            .and_then(|p| p.parse::<i32>().ok())
            .filter(|p| *p > 0)
            .and_then(|p| u16::try_from(p).ok())
    };
    let listen = match g.find("listen") {
        Some(l) => match l.attr_value("type") {
            Some("address") => l
                .attr_value("address")
                .map_or(DisplayListen::None, |a| DisplayListen::Address(a.to_owned())),
            Some("network") => l
                .attr_value("network")
                .map_or(DisplayListen::None, |n| DisplayListen::Network(n.to_owned())),
            Some("socket") => DisplayListen::Socket(l.attr_value("socket").map(str::to_owned)),
            Some("none") => DisplayListen::NoListen,
            _ => DisplayListen::None,
        },
        None => g
            .attr_value("listen")
            .map_or(DisplayListen::None, |a| DisplayListen::Address(a.to_owned())),
    };
    Some(Display {
        display_type,
        keymap: g.attr_value("keymap").map(str::to_owned),
        password: g.attr_value("passwd").map(str::to_owned),
        listen,
        port,
    })
}

fn parse_video(devices: &Element) -> Option<Video> {
    let model = devices.find("video")?.find("model")?.attr_value("type")?;
    Some(match model {
        "qxl" => Video::Qxl,
        "cirrus" => Video::Cirrus,
        other => Video::Other(other.to_owned()),
    })
}

fn parse_sound(devices: &Element) -> Option<Sound> {
    match devices.find("sound")?.attr_value("model")? {
        "ac97" => Some(Sound::Ac97),
        "es1370" => Some(Sound::Es1370),
        "ich6" => Some(Sound::Ich6),
        "ich9" => Some(Sound::Ich9),
        "pcspk" => Some(Sound::PcSpeaker),
        "sb16" => Some(Sound::Sb16),
        "usb" => Some(Sound::UsbAudio),
        other => {
            warn!(sound = other, "ignoring unknown sound model");
            None
        }
    }
}

fn parse_disk(
    disk_el: &Element,
    base_dir: Option<&Path>,
    conn: Option<&str>,
    virtio_scsi: bool,
    disks: &mut Vec<SourceDisk>,
    removables: &mut Vec<Removable>,
) -> Result<()> {
    let device = disk_el.attr_value("device").unwrap_or("disk");
    let controller = disk_el
        .find("target")
        .and_then(|t| t.attr_value("bus"))
        .and_then(|bus| match bus {
            "ide" => Some(Controller::Ide),
            "sata" => Some(Controller::Sata),
            "scsi" => Some(if virtio_scsi {
                Controller::VirtioScsi
            } else {
                Controller::Scsi
            }),
            "virtio" => Some(Controller::VirtioBlk),
            _ => None,
        });

    match device {
        "cdrom" => {
            removables.push(Removable {
                kind: RemovableKind::Cdrom,
                controller,
                slot: disk_slot(disk_el),
            });
            return Ok(());
        }
        "floppy" => {
            removables.push(Removable {
                kind: RemovableKind::Floppy,
                controller,
                slot: disk_slot(disk_el),
            });
            return Ok(());
        }
        _ => {}
    }

    let source = disk_el.find("source");
    let uri = match disk_el.attr_value("type").unwrap_or("file") {
        "block" => source.and_then(|s| s.attr_value("dev")).map(str::to_owned),
        "file" => source
            .and_then(|s| s.attr_value("file"))
            .map(|f| resolve_path(f, base_dir)),
        "volume" => {
            let pool = source.and_then(|s| s.attr_value("pool"));
            let volume = source.and_then(|s| s.attr_value("volume"));
            match (pool, volume) {
                (Some(pool), Some(volume)) => Some(volume_path(conn, pool, volume)?),
                _ => None,
            }
        }
        "network" => source.map(network_uri),
        other => {
            warn!(disk_type = other, "ignoring disk with unsupported type");
            return Ok(());
        }
    };
    let Some(uri) = uri else {
        warn!("ignoring disk with no source");
        return Ok(());
    };

    // `aio` is an obsolete libvirt spelling of raw.
    let format = disk_el
        .find("driver")
        .and_then(|d| d.attr_value("type"))
        .map(|t| if t == "aio" { "raw".to_owned() } else { t.to_owned() });

    disks.push(SourceDisk {
        id: disks.len(),
        uri,
        format,
        controller,
    });
    Ok(())
}

/// Slot index from `<address unit=…>`, when present.
fn disk_slot(disk_el: &Element) -> Option<u32> {
    disk_el
        .find("address")
        .and_then(|a| a.attr_value("unit"))
        .and_then(|u| u.parse().ok())
}

fn resolve_path(file: &str, base_dir: Option<&Path>) -> String {
    match base_dir {
        Some(dir) if !file.starts_with('/') => dir.join(file).display().to_string(),
        _ => file.to_owned(),
    }
}

/// Resolves a pool/volume pair through `virsh vol-path`.
fn volume_path(conn: Option<&str>, pool: &str, volume: &str) -> Result<String> {
    let mut cmd = Command::new("virsh");
    if let Some(uri) = conn {
        cmd.args(["-c", uri]);
    }
    cmd.args(["vol-path", "--pool", pool, volume]);
    let out = cmd
        .output()
        .map_err(|e| Error::Input(format!("virsh vol-path: {e}")))?;
    if !out.status.success() {
        return Err(Error::from_command(Error::Input, "virsh vol-path", &out.stderr));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_owned())
}

/// Builds a qemu URI for a `<disk type='network'>` source.
fn network_uri(source: &Element) -> String {
    let protocol = source.attr_value("protocol").unwrap_or("nbd");
    let name = source.attr_value("name").unwrap_or("");
    let (host, port) = source
        .find("host")
        .map(|h| {
            (
                h.attr_value("name").unwrap_or("").to_owned(),
                h.attr_value("port").map(str::to_owned),
            )
        })
        .unwrap_or_default();
    match (protocol, port) {
        ("nbd", Some(port)) => format!("nbd:{host}:{port}"),
        ("nbd", None) => format!("nbd:{host}:10809"),
        (proto, Some(port)) => format!("{proto}://{host}:{port}/{name}"),
        (proto, None) => format!("{proto}://{host}/{name}"),
    }
}

fn parse_interface(iface: &Element, index: usize) -> Option<Nic> {
    let kind = match iface.attr_value("type") {
        Some("network") => VnetKind::Network,
        Some("bridge") => VnetKind::Bridge,
        other => {
            warn!(interface = ?other, "ignoring interface with unsupported type");
            return None;
        }
    };
    let mac = iface
        .find("mac")
        .and_then(|m| m.attr_value("address"))
        .map(str::to_owned);
    let model = iface
        .find("model")
        .and_then(|m| m.attr_value("type"))
        .map(|t| match t {
            "virtio" => NicModel::VirtioNet,
            "e1000" => NicModel::E1000,
            "rtl8139" => NicModel::Rtl8139,
            other => NicModel::Other(other.to_owned()),
        });
    let attr = match kind {
        VnetKind::Network => "network",
        VnetKind::Bridge => "bridge",
    };
    let vnet = iface
        .find("source")
        .and_then(|s| s.attr_value(attr))
        .unwrap_or("")
        .to_owned();
    // Some exporters write <source bridge=''/>; give each such NIC a
    // stable placeholder name so mapping rules can still address it.
    let vnet = if vnet.is_empty() {
        format!("eth{index}")
    } else {
        vnet
    };
    Some(Nic::new(mac, model, vnet, kind))
}
