//! Guest conversion: make the inspected OS bootable on KVM.
//!
//! The converter matching the guest type mutates the mounted sandbox
//! and reports the capabilities the converted guest ends up with; those
//! capabilities drive the target bus plan and all emitted metadata.

pub mod firstboot;
pub mod linux;
pub mod virtio_win;
pub mod windows;

use crate::guest::GuestFs;
use crate::inspect::Inspection;
use crate::source::{Controller, Firmware, RemovableKind, Source};
use crate::target::{BusAssignment, GuestCaps, Machine, Slot};
use crate::{Error, Result};

/// What the surrounding pipeline asks of a converter.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertOptions {
    /// The output keeps the serial console (Linux only).
    pub keep_serial_console: bool,
    /// Run the RHV agent installer on first boot (Windows only).
    pub install_rhev_apt: bool,
    /// Hard-require virtio block; missing drivers become errors instead
    /// of IDE downgrades.
    pub require_virtio_block: bool,
    /// Hard-require virtio net.
    pub require_virtio_net: bool,
}

/// Converts the guest in place and reports its capabilities.
pub fn convert(
    guest: &mut dyn GuestFs,
    inspect: &Inspection,
    source: &Source,
    opts: &ConvertOptions,
) -> Result<GuestCaps> {
    match inspect.os_type.as_str() {
        "linux" => linux::convert(guest, inspect, source, opts),
        "windows" => windows::convert(guest, inspect, source, opts),
        other => Err(Error::Conversion(format!(
            "unable to convert guests of type '{other}'"
        ))),
    }
}

/// Machine type for the converted guest. Secure Boot forces q35; the
/// aarch64 target only has `virt`.
pub fn machine_type(arch: &str, firmware: &Firmware) -> Machine {
    if arch.starts_with("aarch64") || arch.starts_with("arm") {
        return Machine::Virt;
    }
    if matches!(
        firmware,
        Firmware::Uefi {
            secure_boot_required: true
        }
    ) {
        return Machine::Q35;
    }
    Machine::I440fx
}

/// Fills the target bus plan from the capability outcome: fixed disks
/// on the chosen block bus in input order, CD-ROMs on IDE (honouring
/// slot hints), floppies on the floppy bus.
pub fn assign_buses(source: &Source, caps: &GuestCaps) -> Result<BusAssignment> {
    let mut plan = BusAssignment::default();

    for disk in &source.disks {
        let bus = match caps.block_bus {
            crate::target::BlockBus::VirtioBlk | crate::target::BlockBus::VirtioScsi => {
                &mut plan.virtio_blk
            }
            crate::target::BlockBus::Ide => &mut plan.ide,
        };
        let index = bus.len();
        BusAssignment::insert(bus, index, Slot::Disk(disk.id));
    }

    for removable in &source.removables {
        match removable.kind {
            RemovableKind::Cdrom => {
                // CD-ROMs stay on IDE regardless of the disk bus; slot
                // hints from IDE sources are preserved.
                let index = match (removable.controller, removable.slot) {
                    (Some(Controller::Ide), Some(slot)) => slot as usize,
                    _ => plan.ide.len(),
                };
                BusAssignment::insert(&mut plan.ide, index, Slot::Removable(RemovableKind::Cdrom));
            }
            RemovableKind::Floppy => {
                let index = plan.floppy.len();
                BusAssignment::insert(&mut plan.floppy, index, Slot::Removable(RemovableKind::Floppy));
            }
        }
    }

    plan.validate(source.disks.len())?;
    Ok(plan)
}
