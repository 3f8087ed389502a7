//! The copy engine: trim the guest, shut the sandbox down, then
//! materialise every overlay into its provisioned target.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::guest::GuestFs;
use crate::inspect::Inspection;
use crate::qemuimg;
use crate::target::{Target, TargetLocation};
use crate::{Error, Result};

/// Filesystems fstrim cannot help with.
const NO_TRIM_FSTYPES: &[&str] = &["vfat", "msdos", "iso9660", "swap", "btrfs"];

/// Runs `fstrim` on every mounted filesystem outside the no-trim set,
/// so unused blocks become holes in the overlays and the following
/// copy can sparsify them. Trim failures are warnings.
pub fn trim_filesystems(guest: &mut dyn GuestFs, inspect: &Inspection) {
    for (mp, dev) in &inspect.mountpoints {
        let fstype = guest.vfs_type(dev).unwrap_or_default();
        if NO_TRIM_FSTYPES.contains(&fstype.as_str()) {
            debug!(mountpoint = %mp, fstype = %fstype, "skipping fstrim");
            continue;
        }
        if let Err(e) = guest.fstrim(mp) {
            warn!(mountpoint = %mp, error = %e, "fstrim failed (continuing)");
        }
    }
}

/// Copies one overlay into its (already provisioned) target with
/// `qemu-img convert -n`, then measures the actual on-disk size.
pub fn copy_target(target: &mut Target, compressed: bool) -> Result<()> {
    let dest = target.location.as_arg();
    let started = Utc::now();
    info!(
        overlay = %target.overlay.path.display(),
        dest = %dest,
        format = %target.format,
        "copying disk"
    );

    qemuimg::convert(&target.overlay.path, &dest, &target.format, compressed)
        .map_err(|e| Error::Copy(e.to_string()))?;

    let finished = Utc::now();
    if let TargetLocation::File(path) = &target.location {
        match qemuimg::allocated_size(path) {
            Ok(actual) => {
                target.actual_size = Some(actual);
                match target.estimated_size {
                    Some(estimate) => debug!(
                        estimate,
                        actual,
                        "estimated vs actual size"
                    ),
                    None => debug!(actual, "actual size"),
                }
            }
            Err(e) => warn!(error = %e, "could not measure the target size"),
        }
    }
    info!(
        disk = target.overlay.disk_id,
        seconds = (finished - started).num_seconds(),
        "disk copied"
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::guest::fake::{FakeGuest, FakeOs};
    use crate::inspect::RootPolicy;

    #[test]
    fn trim_skips_vfat_and_swap() {
        let mut g = FakeGuest::new().with_root(
            "/dev/sda2",
            FakeOs {
                os_type: "linux".into(),
                format: "installed".into(),
                mountpoints: vec![
                    ("/".into(), "/dev/sda2".into()),
                    ("/boot/efi".into(), "/dev/sda1".into()),
                    ("/home".into(), "/dev/sda3".into()),
                ],
                ..FakeOs::default()
            },
        );
        g.vfs_types.insert("/dev/sda1".into(), "vfat".into());
        g.vfs_types.insert("/dev/sda2".into(), "ext4".into());
        g.vfs_types.insert("/dev/sda3".into(), "xfs".into());

        let inspect =
            crate::inspect::inspect(&mut g, &RootPolicy::First, &mut std::io::Cursor::new(""))
                .unwrap();
        trim_filesystems(&mut g, &inspect);

        assert!(g.trimmed.contains(&"/".to_owned()));
        assert!(g.trimmed.contains(&"/home".to_owned()));
        assert!(!g.trimmed.contains(&"/boot/efi".to_owned()));
    }
}
