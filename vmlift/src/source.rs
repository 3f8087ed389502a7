//! Canonical, hypervisor-neutral description of the guest to convert.
//!
//! Input plugins build a [`Source`] once; after network mapping it is
//! never mutated. Later stages reference disks by their dense integer
//! id rather than by pointer, so no cyclic ownership arises.

use std::fmt;

use serde::Serialize;

/// The hypervisor a guest is being converted from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum Hypervisor {
    /// VMware ESX/vCenter or Workstation.
    VMware,
    /// Xen (PV or HVM).
    Xen,
    /// Plain QEMU.
    QEmu,
    /// Already KVM (format conversion only).
    Kvm,
    /// Physical machine image.
    Physical,
    /// Microsoft Hyper-V.
    HyperV,
    /// Anything else; the tag is preserved for diagnostics.
    Other(String),
}

/// Guest firmware kind as declared by the source metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum Firmware {
    /// Legacy BIOS boot.
    Bios,
    /// UEFI boot. `secure_boot_required` forces a q35 machine with SMM.
    Uefi {
        /// The guest refuses to boot without Secure Boot.
        secure_boot_required: bool,
    },
    /// The source did not say; decided later from inspection.
    Unknown,
}

/// CPU topology when the source declares one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuTopology {
    /// Sockets exposed to the guest.
    pub sockets: u32,
    /// Cores per socket.
    pub cores: u32,
    /// Threads per core.
    pub threads: u32,
}

/// Guest display configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Display {
    /// Display transport.
    pub display_type: DisplayType,
    /// Keyboard map (e.g. `en-us`).
    pub keymap: Option<String>,
    /// Access password, when the source carried one.
    pub password: Option<String>,
    /// Listen configuration.
    pub listen: DisplayListen,
    /// TCP port, when fixed (not autoport).
    pub port: Option<u16>,
}

/// How the converted guest's display is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum DisplayType {
    /// A local SDL/GTK window.
    Window,
    /// VNC server.
    Vnc,
    /// SPICE server.
    Spice,
}

/// Display listen variants from the source metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum DisplayListen {
    /// No listen element present.
    None,
    /// Listen on an address.
    Address(String),
    /// Listen on a named libvirt network.
    Network(String),
    /// Listen on a UNIX socket (path optional).
    Socket(Option<String>),
    /// Explicit `listen type='none'`.
    NoListen,
}

/// Source video adapter model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum Video {
    /// QXL (SPICE-optimised).
    Qxl,
    /// Cirrus VGA.
    Cirrus,
    /// Anything else, tag preserved.
    Other(String),
}

/// Source sound device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum Sound {
    /// Intel AC'97.
    Ac97,
    /// Ensoniq ES1370.
    Es1370,
    /// Intel ICH6.
    Ich6,
    /// Intel ICH9.
    Ich9,
    /// PC speaker.
    PcSpeaker,
    /// Sound Blaster 16.
    Sb16,
    /// USB audio.
    UsbAudio,
}

/// Disk controller the source attached a disk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum Controller {
    /// Parallel ATA.
    Ide,
    /// SATA (treated as IDE-class for target placement).
    Sata,
    /// SCSI.
    Scsi,
    /// virtio-blk.
    VirtioBlk,
    /// virtio-scsi.
    VirtioScsi,
}

/// One source disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDisk {
    /// Dense id, unique per run: `0..n-1` in input order.
    pub id: usize,
    /// QEMU-consumable location: a path, an `nbd:unix:` URI, or a JSON
    /// `{…}` pseudo-URI.
    pub uri: String,
    /// Declared format (`raw`, `qcow2`, `vmdk`, …) when known.
    pub format: Option<String>,
    /// Controller hint from the source metadata.
    pub controller: Option<Controller>,
}

/// Removable device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum RemovableKind {
    /// CD-ROM drive.
    Cdrom,
    /// Floppy drive.
    Floppy,
}

/// One removable device (without medium).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Removable {
    /// CD-ROM or floppy.
    pub kind: RemovableKind,
    /// Controller hint, when declared.
    pub controller: Option<Controller>,
    /// Slot index on its controller, when declared.
    pub slot: Option<u32>,
}

/// NIC model requested by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum NicModel {
    /// virtio-net.
    VirtioNet,
    /// Intel e1000.
    E1000,
    /// Realtek RTL8139.
    Rtl8139,
    /// Anything else, tag preserved.
    Other(String),
}

/// What a NIC's `vnet` name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum VnetKind {
    /// A named (libvirt) network.
    Network,
    /// A host bridge.
    Bridge,
}

/// One guest NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Nic {
    /// MAC address; an all-zero MAC is normalised to `None`.
    pub mac: Option<String>,
    /// Requested device model, when the source declared one.
    pub model: Option<NicModel>,
    /// Current network/bridge name (mutated by network mapping).
    pub vnet: String,
    /// The pre-mapping name, kept for comment emission.
    pub vnet_orig: String,
    /// Whether `vnet` names a network or a bridge.
    pub kind: VnetKind,
}

impl Nic {
    /// Builds a NIC, normalising the MAC (the all-zero pattern means
    /// "unset" in several source hypervisors).
    pub fn new(mac: Option<String>, model: Option<NicModel>, vnet: String, kind: VnetKind) -> Self {
        Self {
            mac: normalize_mac(mac),
            model,
            vnet_orig: vnet.clone(),
            vnet,
            kind,
        }
    }
}

/// Drops MACs matching the all-zero pattern.
pub fn normalize_mac(mac: Option<String>) -> Option<String> {
    mac.filter(|m| {
        let stripped: String = m.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        !(stripped.len() == 12 && stripped.bytes().all(|b| b == b'0'))
    })
}

/// Canonical description of the guest built by the input plugin.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    /// Guest name used for target naming (possibly renamed via `-on`).
    pub name: String,
    /// Original name as found at the source.
    pub orig_name: String,
    /// RAM in bytes.
    pub memory: u64,
    /// Number of vCPUs.
    pub vcpu: u32,
    /// Declared CPU vendor, when any.
    pub cpu_vendor: Option<String>,
    /// Declared CPU model, when any.
    pub cpu_model: Option<String>,
    /// Declared topology, when any.
    pub topology: Option<CpuTopology>,
    /// Opaque generation id, when the source carried one.
    pub genid: Option<String>,
    /// Declared firmware.
    pub firmware: Firmware,
    /// Feature strings (`acpi`, `apic`, `pae`, …).
    pub features: Vec<String>,
    /// Display, when any.
    pub display: Option<Display>,
    /// Video adapter, when any.
    pub video: Option<Video>,
    /// Sound device, when any.
    pub sound: Option<Sound>,
    /// Fixed disks, in input order.
    pub disks: Vec<SourceDisk>,
    /// Removable devices, in input order.
    pub removables: Vec<Removable>,
    /// NICs, in input order.
    pub nics: Vec<Nic>,
    /// Source hypervisor.
    pub hypervisor: Hypervisor,
}

impl Source {
    /// Checks the structural invariants every input plugin must uphold.
    pub fn validate(&self) -> crate::Result<()> {
        if self.disks.is_empty() {
            return Err(crate::Error::Input("source has no disks".into()));
        }
        for (i, disk) in self.disks.iter().enumerate() {
            if disk.uri.is_empty() {
                return Err(crate::Error::Input(format!("disk {i} has an empty location")));
            }
            if disk.id != i {
                return Err(crate::Error::Input(format!(
                    "disk ids are not dense: expected {i}, found {}",
                    disk.id
                )));
            }
        }
        if self.memory == 0 {
            return Err(crate::Error::Input("source memory is zero".into()));
        }
        if self.vcpu == 0 {
            return Err(crate::Error::Input("source has no vCPUs".into()));
        }
        Ok(())
    }
}

impl fmt::Display for Source {
    /// Renders the `--print-source` report.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "source name: {}", self.orig_name)?;
        writeln!(f, "hypervisor type: {:?}", self.hypervisor)?;
        writeln!(f, "memory: {}", self.memory)?;
        writeln!(f, "nr vCPUs: {}", self.vcpu)?;
        if let Some(t) = &self.topology {
            writeln!(
                f,
                "CPU topology: sockets={} cores/socket={} threads/core={}",
                t.sockets, t.cores, t.threads
            )?;
        }
        writeln!(f, "firmware: {:?}", self.firmware)?;
        writeln!(f, "features: {}", self.features.join(" "))?;
        writeln!(f, "disks:")?;
        for d in &self.disks {
            writeln!(
                f,
                "\t{} [{}]",
                d.uri,
                d.format.as_deref().unwrap_or("autodetect")
            )?;
        }
        writeln!(f, "removable media:")?;
        for r in &self.removables {
            writeln!(f, "\t{:?}", r.kind)?;
        }
        writeln!(f, "NICs:")?;
        for n in &self.nics {
            writeln!(
                f,
                "\t{:?} \"{}\" mac: {}",
                n.kind,
                n.vnet,
                n.mac.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    }
}
