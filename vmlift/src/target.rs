//! Target-side model: converted-guest capabilities, bus slot plans and
//! per-disk copy targets.

use std::path::PathBuf;

use serde::Serialize;

use crate::overlay::Overlay;
use crate::source::RemovableKind;

/// Block bus the converted guest will use for its fixed disks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum BlockBus {
    /// virtio-blk (preferred).
    VirtioBlk,
    /// virtio-scsi.
    VirtioScsi,
    /// IDE fallback.
    Ide,
}

/// Network device model for the converted guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum NetBus {
    /// virtio-net (preferred).
    VirtioNet,
    /// Intel e1000 fallback.
    E1000,
    /// RTL8139 fallback.
    Rtl8139,
}

/// Video adapter for the converted guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum TargetVideo {
    /// QXL.
    Qxl,
    /// Cirrus fallback.
    Cirrus,
}

/// QEMU machine type for the converted guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum Machine {
    /// Legacy PC (`pc`).
    I440fx,
    /// Modern PC (`q35`).
    Q35,
    /// Aarch64 `virt`.
    Virt,
}

/// What the guest supports after conversion. Filled by the converter,
/// consumed by the copy engine and the output plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestCaps {
    /// Chosen block bus.
    pub block_bus: BlockBus,
    /// Chosen NIC model.
    pub net_bus: NetBus,
    /// Chosen video adapter.
    pub video: TargetVideo,
    /// Guest has a virtio-rng driver.
    pub virtio_rng: bool,
    /// Guest has a memory balloon driver.
    pub virtio_balloon: bool,
    /// Guest has an isa-pvpanic driver.
    pub isa_pvpanic: bool,
    /// Guest wants ACPI.
    pub acpi: bool,
    /// Effective architecture for the target.
    pub arch: String,
    /// Machine type.
    pub machine: Machine,
}

impl GuestCaps {
    /// QEMU machine name for the capability set.
    pub fn machine_name(&self) -> &'static str {
        match self.machine {
            Machine::I440fx => "pc",
            Machine::Q35 => "q35",
            Machine::Virt => "virt",
        }
    }
}

/// One slot of a bus in the target bus plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum Slot {
    /// Nothing at this position.
    Empty,
    /// A fixed disk, referenced by source-disk id.
    Disk(usize),
    /// A removable device (no medium after conversion).
    Removable(RemovableKind),
}

/// Slot arrays for each target bus. Filled by the converter, consumed
/// by output plugins when emitting metadata.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusAssignment {
    /// virtio-blk slots.
    pub virtio_blk: Vec<Slot>,
    /// IDE slots.
    pub ide: Vec<Slot>,
    /// SCSI slots.
    pub scsi: Vec<Slot>,
    /// Floppy slots.
    pub floppy: Vec<Slot>,
}

impl BusAssignment {
    /// Places `slot` at `index` on the given bus array, growing it with
    /// empty slots as needed. An occupied slot pushes to the end.
    pub fn insert(bus: &mut Vec<Slot>, index: usize, slot: Slot) {
        if bus.len() <= index {
            bus.resize(index + 1, Slot::Empty);
        }
        if bus[index] == Slot::Empty {
            bus[index] = slot;
        } else {
            bus.push(slot);
        }
    }

    /// All four bus arrays in a fixed order with their names.
    pub fn buses(&self) -> [(&'static str, &[Slot]); 4] {
        [
            ("virtio", &self.virtio_blk),
            ("ide", &self.ide),
            ("scsi", &self.scsi),
            ("floppy", &self.floppy),
        ]
    }

    /// Checks the slot invariants: every source disk id appears in
    /// exactly one `Disk` slot across all buses.
    pub fn validate(&self, disk_count: usize) -> crate::Result<()> {
        let mut seen = vec![0usize; disk_count];
        for (_, bus) in self.buses() {
            for slot in bus {
                if let Slot::Disk(id) = slot {
                    if *id >= disk_count {
                        return Err(crate::Error::Conversion(format!(
                            "bus plan references unknown disk {id}"
                        )));
                    }
                    seen[*id] += 1;
                }
            }
        }
        for (id, n) in seen.iter().enumerate() {
            if *n != 1 {
                return Err(crate::Error::Conversion(format!(
                    "disk {id} appears in {n} bus slots"
                )));
            }
        }
        Ok(())
    }
}

/// Where a converted disk is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum TargetLocation {
    /// A file on the local filesystem (possibly NFS-mounted).
    File(PathBuf),
    /// An opaque URI handed to `qemu-img` unchanged.
    Uri(String),
}

impl TargetLocation {
    /// The string form passed to `qemu-img convert`.
    pub fn as_arg(&self) -> String {
        match self {
            Self::File(p) => p.display().to_string(),
            Self::Uri(u) => u.clone(),
        }
    }
}

/// One copy target: destination, format and size accounting.
#[derive(Debug, Clone, Serialize)]
pub struct Target {
    /// Destination location.
    pub location: TargetLocation,
    /// Destination format (`raw` or `qcow2`).
    pub format: String,
    /// Estimated final size, filled before the copy when computable.
    pub estimated_size: Option<u64>,
    /// Actual size in on-disk blocks, filled after the copy.
    pub actual_size: Option<u64>,
    /// The overlay this target is copied from.
    pub overlay: Overlay,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn insert_grows_and_falls_back_on_collision() {
        let mut plan = BusAssignment::default();
        BusAssignment::insert(&mut plan.ide, 2, Slot::Disk(0));
        assert_eq!(plan.ide.len(), 3);
        assert_eq!(plan.ide[0], Slot::Empty);
        assert_eq!(plan.ide[2], Slot::Disk(0));

        BusAssignment::insert(&mut plan.ide, 2, Slot::Removable(RemovableKind::Cdrom));
        assert_eq!(plan.ide[3], Slot::Removable(RemovableKind::Cdrom));
    }

    #[test]
    fn validate_requires_each_disk_exactly_once() {
        let mut plan = BusAssignment::default();
        BusAssignment::insert(&mut plan.virtio_blk, 0, Slot::Disk(0));
        BusAssignment::insert(&mut plan.virtio_blk, 1, Slot::Disk(1));
        plan.validate(2).unwrap();

        // A duplicate reference fails.
        BusAssignment::insert(&mut plan.ide, 0, Slot::Disk(1));
        assert!(plan.validate(2).is_err());
    }

    #[test]
    fn validate_rejects_missing_disk() {
        let mut plan = BusAssignment::default();
        BusAssignment::insert(&mut plan.virtio_blk, 0, Slot::Disk(0));
        assert!(plan.validate(2).is_err());
    }
}
