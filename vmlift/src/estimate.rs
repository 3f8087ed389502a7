//! Free-space gating and target size estimation.
//!
//! Conversion needs working room inside the guest, so we gate on
//! per-mountpoint free space first. Size estimates are hints for output
//! plugins (quota checks, `--print-estimate`); copy correctness never
//! depends on them.

use tracing::debug;

use crate::guest::{GuestFs, StatVfs};
use crate::overlay::Overlay;
use crate::{Error, Result};

/// Filesystems fstrim can actually release space from; everything else
/// contributes nothing to the freeable estimate.
const TRIMMABLE: &[&str] = &["ext2", "ext3", "ext4", "xfs"];

/// Minimum free space on `/`.
const MIN_ROOT_FREE: u64 = 20 * 1024 * 1024;
/// Minimum free space on `/boot`.
const MIN_BOOT_FREE: u64 = 50 * 1024 * 1024;
/// Minimum free space anywhere else.
const MIN_OTHER_FREE: u64 = 10 * 1024 * 1024;
/// Filesystems smaller than this are ignored entirely.
const MIN_CHECKED_SIZE: u64 = 100 * 1024 * 1024;

/// `statvfs` plus filesystem type for one mounted filesystem.
#[derive(Debug, Clone)]
pub struct MountStats {
    /// Mountpoint path.
    pub mountpoint: String,
    /// Backing device.
    pub device: String,
    /// Filesystem type (`ext4`, `ntfs`, …).
    pub fstype: String,
    /// The statvfs numbers.
    pub stat: StatVfs,
}

/// Collects statvfs + fstype for every mounted filesystem.
pub fn collect_stats(
    guest: &mut dyn GuestFs,
    mountpoints: &[(String, String)],
) -> Result<Vec<MountStats>> {
    let mut out = Vec::with_capacity(mountpoints.len());
    for (mp, dev) in mountpoints {
        out.push(MountStats {
            mountpoint: mp.clone(),
            device: dev.clone(),
            fstype: guest.vfs_type(dev)?,
            stat: guest.statvfs(mp)?,
        });
    }
    Ok(out)
}

/// Fails when the guest lacks the working room conversion needs.
pub fn check_free_space(stats: &[MountStats]) -> Result<()> {
    for ms in stats {
        let total = ms.stat.blocks * ms.stat.bsize;
        if total < MIN_CHECKED_SIZE {
            continue;
        }
        let free = ms.stat.bfree * ms.stat.bsize;
        let needed = match ms.mountpoint.as_str() {
            "/" => MIN_ROOT_FREE,
            "/boot" => MIN_BOOT_FREE,
            _ => MIN_OTHER_FREE,
        };
        if free < needed {
            return Err(Error::Conversion(format!(
                "not enough free space for conversion on filesystem '{}': \
                 {free} bytes free, {needed} bytes needed",
                ms.mountpoint
            )));
        }
    }
    Ok(())
}

/// Estimates the final on-disk size of each overlay's target.
///
/// With `S` the sum of virtual sizes and `F` the sum of filesystem
/// capacities, each target is its virtual size minus its share of the
/// trimmable free space, scaled by `F/S`. Returns `None` per target
/// when `S` is zero.
pub fn estimate_sizes(overlays: &[Overlay], stats: &[MountStats]) -> Vec<Option<u64>> {
    let total_virtual: u64 = overlays.iter().map(|o| o.virtual_size).sum();
    if total_virtual == 0 {
        return vec![None; overlays.len()];
    }

    let fs_total: u64 = stats.iter().map(|m| m.stat.blocks * m.stat.bsize).sum();
    let freeable: u64 = stats
        .iter()
        .filter(|m| TRIMMABLE.contains(&m.fstype.as_str()))
        .map(|m| m.stat.bfree * m.stat.bsize)
        .sum();

    #[allow(clippy::cast_precision_loss)]
    let ratio = fs_total as f64 / total_virtual as f64;

    overlays
        .iter()
        .map(|ov| {
            #[allow(clippy::cast_precision_loss)]
            let share = ov.virtual_size as f64 / total_virtual as f64;
            #[allow(clippy::cast_precision_loss)]
            let cut = share * freeable as f64 * ratio;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let est = (ov.virtual_size as f64 - cut).max(0.0) as u64;
            debug!(disk = ov.disk_id, estimate = est, "size estimate");
            Some(est)
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ms(mountpoint: &str, fstype: &str, bsize: u64, blocks: u64, bfree: u64) -> MountStats {
        MountStats {
            mountpoint: mountpoint.into(),
            device: "/dev/sda1".into(),
            fstype: fstype.into(),
            stat: StatVfs {
                bsize,
                blocks,
                bfree,
                bavail: bfree,
            },
        }
    }

    fn ov(disk_id: usize, virtual_size: u64) -> Overlay {
        Overlay {
            path: PathBuf::from(format!("/cache/o{disk_id}.qcow2")),
            device: crate::overlay::drive_name(disk_id),
            virtual_size,
            disk_id,
        }
    }

    #[test]
    fn small_filesystems_are_ignored() {
        // 50 MiB filesystem, nearly full: ignored because < 100 MiB.
        let stats = vec![ms("/", "ext4", 4096, 12_800, 10)];
        check_free_space(&stats).unwrap();
    }

    #[test]
    fn root_needs_twenty_megabytes() {
        // 1 GiB root with 10 MiB free fails.
        let stats = vec![ms("/", "ext4", 4096, 262_144, 2_560)];
        assert!(check_free_space(&stats).is_err());
        // With 30 MiB free it passes.
        let stats = vec![ms("/", "ext4", 4096, 262_144, 7_680)];
        check_free_space(&stats).unwrap();
    }

    #[test]
    fn boot_needs_fifty_megabytes() {
        let mut stats = vec![ms("/", "ext4", 4096, 262_144, 100_000)];
        stats.push(ms("/boot", "ext4", 4096, 65_536, 10_240)); // 40 MiB free
        assert!(check_free_space(&stats).is_err());
        stats[1] = ms("/boot", "ext4", 4096, 65_536, 15_360); // 60 MiB free
        check_free_space(&stats).unwrap();
    }

    #[test]
    fn zero_virtual_size_leaves_estimates_unset() {
        let overlays = vec![ov(0, 0)];
        let stats = vec![ms("/", "ext4", 4096, 262_144, 1000)];
        assert_eq!(estimate_sizes(&overlays, &stats), vec![None]);
    }

    #[test]
    fn ntfs_contributes_no_freeable_space() {
        let overlays = vec![ov(0, 1 << 30)];
        let stats = vec![ms("/", "ntfs", 4096, 262_144, 131_072)];
        let est = estimate_sizes(&overlays, &stats)[0].unwrap();
        // Nothing trimmable, so the estimate equals the virtual size.
        assert_eq!(est, 1 << 30);
    }

    #[test]
    fn trimmable_free_space_reduces_estimate() {
        // One 1 GiB disk fully covered by one 1 GiB ext4 fs, half free.
        let overlays = vec![ov(0, 1 << 30)];
        let stats = vec![ms("/", "ext4", 4096, 262_144, 131_072)];
        let est = estimate_sizes(&overlays, &stats)[0].unwrap();
        // ratio = 1, freeable = 512 MiB, so the estimate is ~512 MiB.
        assert_eq!(est, 1 << 29);
    }

    #[test]
    fn estimate_splits_across_disks_by_share() {
        // 1 GiB + 3 GiB disks; one ext4 fs of 2 GiB with 1 GiB free.
        let overlays = vec![ov(0, 1 << 30), ov(1, 3 << 30)];
        let stats = vec![ms("/", "ext4", 4096, 524_288, 262_144)];
        let est = estimate_sizes(&overlays, &stats);
        let e0 = est[0].unwrap();
        let e1 = est[1].unwrap();
        // Total estimate shrinks by freeable * F/S = 1 GiB * 0.5.
        assert_eq!(e0 + e1, (4u64 << 30) - (1 << 29));
        // The larger disk absorbs proportionally more of the cut.
        assert!(e1 < 3 << 30);
        assert!(e0 > (1 << 30) - (1 << 29));
    }
}
