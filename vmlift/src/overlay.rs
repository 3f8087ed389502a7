//! Copy-on-write overlays backed by the source disks.
//!
//! Every source disk gets a local qcow2 file whose backing file is the
//! (possibly NBD-rewritten) source URI. All guest mutation happens in
//! the overlays; the source is never written. Overlays live in the
//! cache directory and are unlinked at process exit unless
//! `--debug-overlays` keeps them for post-mortem.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::guest::{DriveOpts, GuestFs};
use crate::qemuimg;
use crate::source::SourceDisk;
use crate::{Error, Result};

/// One created overlay attached to the sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct Overlay {
    /// The local qcow2 file.
    pub path: PathBuf,
    /// Device name inside the sandbox (`sda`, `sdb`, …).
    pub device: String,
    /// Virtual size in bytes, as measured through the sandbox.
    pub virtual_size: u64,
    /// The source disk this overlay shadows.
    pub disk_id: usize,
}

/// Device name for the disk at `index` in input order: `sda`, `sdb`, …
/// `sdz`, `sdaa`, and so on.
pub fn drive_name(index: usize) -> String {
    let mut suffix = String::new();
    let mut i = index;
    loop {
        suffix.insert(0, (b'a' + (i % 26) as u8) as char);
        if i < 26 {
            break;
        }
        i = i / 26 - 1;
    }
    format!("sd{suffix}")
}

/// Creates the qcow2 overlay file for one source disk and verifies it
/// has a backing file.
pub fn create_overlay(cache_dir: &Path, disk: &SourceDisk) -> Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("vmlift-overlay-")
        .suffix(".qcow2")
        .tempfile_in(cache_dir)
        .map_err(|e| Error::Overlay(format!("cannot create overlay file: {e}")))?;
    let path = file
        .into_temp_path()
        .keep()
        .map_err(|e| Error::Overlay(format!("cannot keep overlay file: {e}")))?;

    let opts = qemuimg::CreateOpts {
        compat: Some("1.1".to_owned()),
        backing_file: Some(disk.uri.clone()),
        backing_format: disk.format.clone(),
        ..qemuimg::CreateOpts::default()
    };
    qemuimg::create(&path, "qcow2", &opts)
        .map_err(|e| Error::Overlay(format!("disk {}: {e}", disk.id)))?;

    // The overlay must reference its source; a bare qcow2 would read
    // as an empty disk and silently convert nothing.
    let info = qemuimg::info(&path.display().to_string())
        .map_err(|e| Error::Overlay(format!("disk {}: {e}", disk.id)))?;
    if info.backing_filename.is_none() {
        return Err(Error::Overlay(format!(
            "overlay {} has no backing file",
            path.display()
        )));
    }

    debug!(disk = disk.id, overlay = %path.display(), "created overlay");
    Ok(path)
}

/// Creates an overlay per disk and attaches them all to the sandbox in
/// input order. The sandbox is not yet launched.
pub fn create_and_attach(
    guest: &mut dyn GuestFs,
    cache_dir: &Path,
    disks: &[SourceDisk],
) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(disks.len());
    for disk in disks {
        let path = create_overlay(cache_dir, disk)?;
        guest.add_drive(
            &path,
            &DriveOpts {
                format: Some("qcow2".to_owned()),
                cachemode: Some("unsafe".to_owned()),
                discard: Some("besteffort".to_owned()),
                copyonread: true,
            },
        )?;
        paths.push(path);
    }
    Ok(paths)
}

/// After launch: measures virtual sizes and assigns device letters in
/// input order.
pub fn measure(
    guest: &mut dyn GuestFs,
    paths: &[PathBuf],
    disks: &[SourceDisk],
) -> Result<Vec<Overlay>> {
    let devices = guest.list_devices()?;
    if devices.len() < paths.len() {
        return Err(Error::Overlay(format!(
            "sandbox exposes {} devices for {} overlays",
            devices.len(),
            paths.len()
        )));
    }
    let mut overlays = Vec::with_capacity(paths.len());
    for (i, (path, disk)) in paths.iter().zip(disks).enumerate() {
        let virtual_size = guest.blockdev_getsize64(&devices[i])?;
        overlays.push(Overlay {
            path: path.clone(),
            device: drive_name(i),
            virtual_size,
            disk_id: disk.id,
        });
    }
    Ok(overlays)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::guest::fake::FakeGuest;
    use crate::source::Controller;

    #[test]
    fn drive_names_follow_input_order() {
        assert_eq!(drive_name(0), "sda");
        assert_eq!(drive_name(1), "sdb");
        assert_eq!(drive_name(25), "sdz");
        assert_eq!(drive_name(26), "sdaa");
        assert_eq!(drive_name(27), "sdab");
    }

    #[test]
    fn measure_assigns_letters_and_sizes() {
        let mut guest = FakeGuest::new();
        guest.devices.insert("/dev/sda".into(), vec![0u8; 4096]);
        guest.devices.insert("/dev/sdb".into(), vec![0u8; 8192]);

        let disks = vec![
            SourceDisk {
                id: 0,
                uri: "a".into(),
                format: None,
                controller: Some(Controller::Ide),
            },
            SourceDisk {
                id: 1,
                uri: "b".into(),
                format: None,
                controller: None,
            },
        ];
        let paths = vec![PathBuf::from("/cache/o0.qcow2"), PathBuf::from("/cache/o1.qcow2")];
        let overlays = measure(&mut guest, &paths, &disks).unwrap();

        assert_eq!(overlays[0].device, "sda");
        assert_eq!(overlays[0].virtual_size, 4096);
        assert_eq!(overlays[0].disk_id, 0);
        assert_eq!(overlays[1].device, "sdb");
        assert_eq!(overlays[1].virtual_size, 8192);
    }

    #[test]
    fn measure_rejects_missing_devices() {
        let mut guest = FakeGuest::new();
        guest.devices.insert("/dev/sda".into(), vec![0u8; 4096]);
        let disks = vec![
            SourceDisk {
                id: 0,
                uri: "a".into(),
                format: None,
                controller: None,
            },
            SourceDisk {
                id: 1,
                uri: "b".into(),
                format: None,
                controller: None,
            },
        ];
        let paths = vec![PathBuf::from("/o0"), PathBuf::from("/o1")];
        assert!(measure(&mut guest, &paths, &disks).is_err());
    }
}
