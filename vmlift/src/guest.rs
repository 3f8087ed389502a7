//! The guest-filesystem sandbox contract and its guestfish backend.
//!
//! Conversion mutates the guest through a mounted appliance. The core
//! codes against the [`GuestFs`] trait; the shipped backend drives a
//! long-lived `guestfish --listen` session and issues `--remote`
//! commands, so no C library binding is needed. Tests use
//! [`fake::FakeGuest`], an in-memory implementation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::{Error, Result};

/// Options for attaching a disk to the sandbox.
#[derive(Debug, Clone, Default)]
pub struct DriveOpts {
    /// Image format (`qcow2` for overlays).
    pub format: Option<String>,
    /// Cache mode; overlays use `unsafe` (they are disposable).
    pub cachemode: Option<String>,
    /// Discard mode; overlays use `besteffort` so fstrim punches holes.
    pub discard: Option<String>,
    /// Copy-on-read, so re-read blocks land in the overlay.
    pub copyonread: bool,
}

/// `statvfs` numbers for one mounted filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatVfs {
    /// Block size in bytes.
    pub bsize: u64,
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Blocks available to unprivileged users.
    pub bavail: u64,
}

/// One installed application, as reported by inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    /// Package or product name.
    pub name: String,
    /// Version string, when known.
    pub version: String,
}

/// The sandboxed guest filesystem: attach, inspect, mutate, trim.
///
/// This is the inspection library's surface as the pipeline consumes
/// it. All methods may block.
pub trait GuestFs {
    /// Attaches a disk image before launch.
    fn add_drive(&mut self, path: &Path, opts: &DriveOpts) -> Result<()>;
    /// Boots the appliance. Must be called after all drives are added.
    fn launch(&mut self) -> Result<()>;
    /// Cleanly shuts the appliance down.
    fn shutdown(&mut self) -> Result<()>;

    /// Lists attached block devices in attach order (`/dev/sda`, …).
    fn list_devices(&mut self) -> Result<Vec<String>>;
    /// Size of a block device in bytes.
    fn blockdev_getsize64(&mut self, device: &str) -> Result<u64>;

    /// Runs OS inspection; returns root filesystems found.
    fn inspect_os(&mut self) -> Result<Vec<String>>;
    /// OS type (`linux`, `windows`, …) for a root.
    fn inspect_type(&mut self, root: &str) -> Result<String>;
    /// Distro identifier for a root.
    fn inspect_distro(&mut self, root: &str) -> Result<String>;
    /// Architecture (`x86_64`, `i386`, …) for a root.
    fn inspect_arch(&mut self, root: &str) -> Result<String>;
    /// Major version.
    fn inspect_major_version(&mut self, root: &str) -> Result<i32>;
    /// Minor version.
    fn inspect_minor_version(&mut self, root: &str) -> Result<i32>;
    /// Human product name.
    fn inspect_product_name(&mut self, root: &str) -> Result<String>;
    /// Product variant (`Client`, `Server`, or `unknown`).
    fn inspect_product_variant(&mut self, root: &str) -> Result<String>;
    /// Package format (`rpm`, `deb`, …).
    fn inspect_package_format(&mut self, root: &str) -> Result<String>;
    /// Package manager (`yum`, `dnf`, `apt`, …).
    fn inspect_package_management(&mut self, root: &str) -> Result<String>;
    /// Install status (`installed`, `live`, …).
    fn inspect_format(&mut self, root: &str) -> Result<String>;
    /// `(mountpoint, device)` pairs for a root, unsorted.
    fn inspect_mountpoints(&mut self, root: &str) -> Result<Vec<(String, String)>>;
    /// Installed applications.
    fn inspect_applications(&mut self, root: &str) -> Result<Vec<Application>>;
    /// Windows `%SystemRoot%` path (e.g. `/Windows`).
    fn inspect_windows_systemroot(&mut self, root: &str) -> Result<String>;
    /// Path of the SYSTEM hive inside the guest.
    fn inspect_windows_system_hive(&mut self, root: &str) -> Result<String>;
    /// Path of the SOFTWARE hive inside the guest.
    fn inspect_windows_software_hive(&mut self, root: &str) -> Result<String>;
    /// Current control set name (e.g. `ControlSet001`).
    fn inspect_windows_current_control_set(&mut self, root: &str) -> Result<String>;

    /// Mounts a device on a path.
    fn mount(&mut self, device: &str, mountpoint: &str) -> Result<()>;
    /// Unmounts one mountpoint.
    fn umount(&mut self, mountpoint: &str) -> Result<()>;
    /// Unmounts everything.
    fn umount_all(&mut self) -> Result<()>;
    /// `statvfs` for a mounted path.
    fn statvfs(&mut self, path: &str) -> Result<StatVfs>;
    /// Filesystem type of a device (`ext4`, `ntfs`, …).
    fn vfs_type(&mut self, device: &str) -> Result<String>;

    /// Whether a path exists.
    fn exists(&mut self, path: &str) -> Result<bool>;
    /// Whether a path is a regular file.
    fn is_file(&mut self, path: &str) -> Result<bool>;
    /// Whether a path is a directory.
    fn is_dir(&mut self, path: &str) -> Result<bool>;
    /// Resolves a path case-insensitively (for NTFS).
    fn case_sensitive_path(&mut self, path: &str) -> Result<String>;
    /// Creates a directory and parents.
    fn mkdir_p(&mut self, path: &str) -> Result<()>;
    /// Removes an empty directory.
    fn rmdir(&mut self, path: &str) -> Result<()>;
    /// Reads a whole file.
    fn read_file(&mut self, path: &str) -> Result<Vec<u8>>;
    /// Writes a whole file.
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()>;
    /// Uploads a host file into the guest.
    fn upload(&mut self, local: &Path, remote: &str) -> Result<()>;
    /// Downloads a guest file to the host.
    fn download(&mut self, remote: &str, local: &Path) -> Result<()>;
    /// Removes a file, ignoring absence.
    fn rm_f(&mut self, path: &str) -> Result<()>;
    /// Recursively lists all paths below a directory (relative names).
    fn find(&mut self, dir: &str) -> Result<Vec<String>>;
    /// Runs a command inside the guest, returning stdout.
    fn command(&mut self, args: &[&str]) -> Result<String>;
    /// Trims unused blocks on a mounted filesystem.
    fn fstrim(&mut self, mountpoint: &str) -> Result<()>;

    /// Maps a partition (`/dev/sda2`) to its containing device.
    fn part_to_dev(&mut self, partition: &str) -> Result<String>;
    /// Index of a device in attach order (0 for `/dev/sda`).
    fn device_index(&mut self, device: &str) -> Result<usize>;
    /// Reads raw bytes from a device or partition.
    fn pread_device(&mut self, device: &str, count: usize, offset: u64) -> Result<Vec<u8>>;
    /// Writes raw bytes to a device or partition.
    fn pwrite_device(&mut self, device: &str, data: &[u8], offset: u64) -> Result<()>;
    /// EFI system partitions found on the attached disks.
    fn list_esp_devices(&mut self) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// guestfish backend
// ---------------------------------------------------------------------------

/// Backend that drives a `guestfish --listen` session.
#[derive(Debug)]
pub struct Guestfish {
    /// Remote session id (the `GUESTFISH_PID`).
    pid: u32,
    /// Scratch directory for upload/download staging.
    scratch: tempfile::TempDir,
    /// Whether the appliance has been launched.
    launched: bool,
}

impl Guestfish {
    /// Starts a listening guestfish session (appliance not yet booted).
    pub fn new() -> Result<Self> {
        which::which("guestfish")
            .map_err(|_| Error::Inspection("guestfish is not installed".into()))?;

        let out = Command::new("guestfish")
            .arg("--listen")
            .output()
            .map_err(|e| Error::Inspection(format!("guestfish --listen: {e}")))?;
        if !out.status.success() {
            return Err(Error::from_command(
                Error::Inspection,
                "guestfish --listen",
                &out.stderr,
            ));
        }
        // Prints `GUESTFISH_PID=1234; export GUESTFISH_PID`.
        let text = String::from_utf8_lossy(&out.stdout);
        let pid = text
            .split(['=', ';'])
            .nth(1)
            .and_then(|p| p.trim().parse().ok())
            .ok_or_else(|| {
                Error::Inspection(format!("cannot parse guestfish pid from '{}'", text.trim()))
            })?;

        Ok(Self {
            pid,
            scratch: tempfile::Builder::new()
                .prefix("vmlift-guestfs")
                .tempdir()?,
            launched: false,
        })
    }

    /// Runs one remote guestfish command, returning trimmed stdout.
    fn run(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "guestfish");
        let out = Command::new("guestfish")
            .arg(format!("--remote={}", self.pid))
            .arg("--")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::Inspection(format!("guestfish: {e}")))?;
        if !out.status.success() {
            return Err(Error::from_command(
                Error::Inspection,
                &format!("guestfish {}", args.first().unwrap_or(&"")),
                &out.stderr,
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim_end().to_owned())
    }

    /// Runs a remote command and splits its output into lines.
    fn run_lines(&self, args: &[&str]) -> Result<Vec<String>> {
        Ok(self
            .run(args)?
            .lines()
            .map(str::to_owned)
            .filter(|l| !l.is_empty())
            .collect())
    }
}

impl GuestFs for Guestfish {
    fn add_drive(&mut self, path: &Path, opts: &DriveOpts) -> Result<()> {
        let path = path.display().to_string();
        let mut args = vec!["add-drive", &path];
        let format = opts.format.as_ref().map(|f| format!("format:{f}"));
        let cache = opts.cachemode.as_ref().map(|c| format!("cachemode:{c}"));
        let discard = opts.discard.as_ref().map(|d| format!("discard:{d}"));
        let cor = opts.copyonread.then_some("copyonread:true".to_owned());
        let optargs: Vec<&String> = [&format, &cache, &discard, &cor]
            .into_iter()
            .flatten()
            .collect();
        args.extend(optargs.iter().map(|s| s.as_str()));
        self.run(&args)?;
        Ok(())
    }

    fn launch(&mut self) -> Result<()> {
        self.run(&["run"])?;
        self.launched = true;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.launched {
            self.run(&["shutdown"])?;
            self.launched = false;
        }
        self.run(&["exit"]).ok();
        Ok(())
    }

    fn list_devices(&mut self) -> Result<Vec<String>> {
        self.run_lines(&["list-devices"])
    }

    fn blockdev_getsize64(&mut self, device: &str) -> Result<u64> {
        self.run(&["blockdev-getsize64", device])?
            .parse()
            .map_err(|e| Error::Inspection(format!("bad device size: {e}")))
    }

    fn inspect_os(&mut self) -> Result<Vec<String>> {
        self.run_lines(&["inspect-os"])
    }

    fn inspect_type(&mut self, root: &str) -> Result<String> {
        self.run(&["inspect-get-type", root])
    }

    fn inspect_distro(&mut self, root: &str) -> Result<String> {
        self.run(&["inspect-get-distro", root])
    }

    fn inspect_arch(&mut self, root: &str) -> Result<String> {
        self.run(&["inspect-get-arch", root])
    }

    fn inspect_major_version(&mut self, root: &str) -> Result<i32> {
        self.run(&["inspect-get-major-version", root])?
            .parse()
            .map_err(|e| Error::Inspection(format!("bad major version: {e}")))
    }

    fn inspect_minor_version(&mut self, root: &str) -> Result<i32> {
        self.run(&["inspect-get-minor-version", root])?
            .parse()
            .map_err(|e| Error::Inspection(format!("bad minor version: {e}")))
    }

    fn inspect_product_name(&mut self, root: &str) -> Result<String> {
        self.run(&["inspect-get-product-name", root])
    }

    fn inspect_product_variant(&mut self, root: &str) -> Result<String> {
        self.run(&["inspect-get-product-variant", root])
    }

    fn inspect_package_format(&mut self, root: &str) -> Result<String> {
        self.run(&["inspect-get-package-format", root])
    }

    fn inspect_package_management(&mut self, root: &str) -> Result<String> {
        self.run(&["inspect-get-package-management", root])
    }

    fn inspect_format(&mut self, root: &str) -> Result<String> {
        self.run(&["inspect-get-format", root])
    }

    fn inspect_mountpoints(&mut self, root: &str) -> Result<Vec<(String, String)>> {
        // Output is `mountpoint: device` per line.
        let lines = self.run_lines(&["inspect-get-mountpoints", root])?;
        let mut out = Vec::new();
        for line in lines {
            if let Some((mp, dev)) = line.split_once(':') {
                out.push((mp.trim().to_owned(), dev.trim().to_owned()));
            }
        }
        Ok(out)
    }

    fn inspect_applications(&mut self, root: &str) -> Result<Vec<Application>> {
        // `inspect-list-applications2` prints indented records; the
        // fields we need are `app2_name` and `app2_version`.
        let lines = self.run_lines(&["inspect-list-applications2", root])?;
        let mut out = Vec::new();
        let mut name: Option<String> = None;
        for line in lines {
            let line = line.trim();
            if let Some(v) = line.strip_prefix("app2_name:") {
                name = Some(v.trim().to_owned());
            } else if let Some(v) = line.strip_prefix("app2_version:")
                && let Some(n) = name.take()
            {
                out.push(Application {
                    name: n,
                    version: v.trim().to_owned(),
                });
            }
        }
        Ok(out)
    }

    fn inspect_windows_systemroot(&mut self, root: &str) -> Result<String> {
        self.run(&["inspect-get-windows-systemroot", root])
    }

    fn inspect_windows_system_hive(&mut self, root: &str) -> Result<String> {
        self.run(&["inspect-get-windows-system-hive", root])
    }

    fn inspect_windows_software_hive(&mut self, root: &str) -> Result<String> {
        self.run(&["inspect-get-windows-software-hive", root])
    }

    fn inspect_windows_current_control_set(&mut self, root: &str) -> Result<String> {
        self.run(&["inspect-get-windows-current-control-set", root])
    }

    fn mount(&mut self, device: &str, mountpoint: &str) -> Result<()> {
        self.run(&["mount", device, mountpoint])?;
        Ok(())
    }

    fn umount(&mut self, mountpoint: &str) -> Result<()> {
        self.run(&["umount", mountpoint])?;
        Ok(())
    }

    fn umount_all(&mut self) -> Result<()> {
        self.run(&["umount-all"])?;
        Ok(())
    }

    fn statvfs(&mut self, path: &str) -> Result<StatVfs> {
        // `statvfs` prints `field: value` lines.
        let mut st = StatVfs::default();
        for line in self.run_lines(&["statvfs", path])? {
            let Some((k, v)) = line.split_once(':') else {
                continue;
            };
            let v: u64 = v.trim().parse().unwrap_or(0);
            match k.trim() {
                "bsize" => st.bsize = v,
                "blocks" => st.blocks = v,
                "bfree" => st.bfree = v,
                "bavail" => st.bavail = v,
                _ => {}
            }
        }
        Ok(st)
    }

    fn vfs_type(&mut self, device: &str) -> Result<String> {
        self.run(&["vfs-type", device])
    }

    fn exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.run(&["exists", path])? == "true")
    }

    fn is_file(&mut self, path: &str) -> Result<bool> {
        Ok(self.run(&["is-file", path])? == "true")
    }

    fn is_dir(&mut self, path: &str) -> Result<bool> {
        Ok(self.run(&["is-dir", path])? == "true")
    }

    fn case_sensitive_path(&mut self, path: &str) -> Result<String> {
        self.run(&["case-sensitive-path", path])
    }

    fn mkdir_p(&mut self, path: &str) -> Result<()> {
        self.run(&["mkdir-p", path])?;
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> Result<()> {
        self.run(&["rmdir", path])?;
        Ok(())
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let local = self.scratch.path().join("download");
        self.download(path, &local)?;
        Ok(fs::read(&local)?)
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let local = self.scratch.path().join("upload");
        let mut f = fs::File::create(&local)?;
        f.write_all(data)?;
        drop(f);
        self.upload(&local, path)
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<()> {
        self.run(&["upload", &local.display().to_string(), remote])?;
        Ok(())
    }

    fn download(&mut self, remote: &str, local: &Path) -> Result<()> {
        self.run(&["download", remote, &local.display().to_string()])?;
        Ok(())
    }

    fn rm_f(&mut self, path: &str) -> Result<()> {
        self.run(&["rm-f", path])?;
        Ok(())
    }

    fn find(&mut self, dir: &str) -> Result<Vec<String>> {
        self.run_lines(&["find", dir])
    }

    fn command(&mut self, args: &[&str]) -> Result<String> {
        let joined = args.join(" ");
        self.run(&["command", &joined])
    }

    fn fstrim(&mut self, mountpoint: &str) -> Result<()> {
        self.run(&["fstrim", mountpoint])?;
        Ok(())
    }

    fn part_to_dev(&mut self, partition: &str) -> Result<String> {
        self.run(&["part-to-dev", partition])
    }

    fn device_index(&mut self, device: &str) -> Result<usize> {
        self.run(&["device-index", device])?
            .parse()
            .map_err(|e| Error::Inspection(format!("bad device index: {e}")))
    }

    fn pread_device(&mut self, device: &str, count: usize, offset: u64) -> Result<Vec<u8>> {
        let local = self.scratch.path().join("pread");
        self.run(&[
            "download-offset",
            device,
            &local.display().to_string(),
            &offset.to_string(),
            &count.to_string(),
        ])?;
        Ok(fs::read(&local)?)
    }

    fn pwrite_device(&mut self, device: &str, data: &[u8], offset: u64) -> Result<()> {
        let local = self.scratch.path().join("pwrite");
        fs::write(&local, data)?;
        self.run(&[
            "upload-offset",
            &local.display().to_string(),
            device,
            &offset.to_string(),
        ])?;
        Ok(())
    }

    fn list_esp_devices(&mut self) -> Result<Vec<String>> {
        // An ESP is a GPT partition with the EFI system partition type
        // GUID. Walk every device's partitions and collect matches.
        let mut esps = Vec::new();
        for device in self.list_devices()? {
            let parttype = match self.run(&["part-get-parttype", &device]) {
                Ok(t) => t,
                Err(_) => continue, // unpartitioned device
            };
            if parttype != "gpt" {
                continue;
            }
            for line in self.run_lines(&["part-list", &device])? {
                let Some(num) = line
                    .trim()
                    .strip_prefix("part_num:")
                    .and_then(|n| n.trim().parse::<u32>().ok())
                else {
                    continue;
                };
                let guid = self.run(&["part-get-gpt-type", &device, &num.to_string()])?;
                if guid.eq_ignore_ascii_case("C12A7328-F81F-11D2-BA4B-00A0C93EC93B") {
                    esps.push(format!("{device}{num}"));
                }
            }
        }
        Ok(esps)
    }
}

impl Drop for Guestfish {
    fn drop(&mut self) {
        let _ = self.run(&["exit"]);
    }
}

// ---------------------------------------------------------------------------
// In-memory fake for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory [`GuestFs`] used by converter and inspector tests.

    use std::collections::BTreeMap;

    use super::*;

    /// Per-root inspection facts the fake serves.
    #[derive(Debug, Clone, Default)]
    pub struct FakeOs {
        pub os_type: String,
        pub distro: String,
        pub arch: String,
        pub major: i32,
        pub minor: i32,
        pub product_name: String,
        pub product_variant: String,
        pub package_format: String,
        pub package_management: String,
        pub format: String,
        pub mountpoints: Vec<(String, String)>,
        pub applications: Vec<Application>,
        pub systemroot: String,
        pub system_hive: String,
        pub software_hive: String,
        pub current_control_set: String,
    }

    /// In-memory guest: files, devices, inspection data, call log.
    #[derive(Debug, Default)]
    pub struct FakeGuest {
        pub files: BTreeMap<String, Vec<u8>>,
        pub devices: BTreeMap<String, Vec<u8>>,
        /// Size overrides so tests can model multi-GiB devices without
        /// allocating them.
        pub device_sizes: BTreeMap<String, u64>,
        pub roots: BTreeMap<String, FakeOs>,
        pub statvfs: BTreeMap<String, StatVfs>,
        pub vfs_types: BTreeMap<String, String>,
        pub part_parents: BTreeMap<String, String>,
        pub esp_devices: Vec<String>,
        pub drives: Vec<PathBuf>,
        pub mounts: Vec<(String, String)>,
        pub trimmed: Vec<String>,
        pub commands: Vec<Vec<String>>,
        pub launched: bool,
        pub shut_down: bool,
        /// Mount errors to inject, keyed by device.
        pub mount_errors: BTreeMap<String, String>,
    }

    impl FakeGuest {
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers a root with its inspection facts.
        pub fn with_root(mut self, root: &str, os: FakeOs) -> Self {
            self.roots.insert(root.to_owned(), os);
            self
        }
    }

    impl GuestFs for FakeGuest {
        fn add_drive(&mut self, path: &Path, _opts: &DriveOpts) -> Result<()> {
            self.drives.push(path.to_owned());
            Ok(())
        }

        fn launch(&mut self) -> Result<()> {
            self.launched = true;
            Ok(())
        }

        fn shutdown(&mut self) -> Result<()> {
            self.shut_down = true;
            Ok(())
        }

        fn list_devices(&mut self) -> Result<Vec<String>> {
            Ok(self.devices.keys().cloned().collect())
        }

        fn blockdev_getsize64(&mut self, device: &str) -> Result<u64> {
            if let Some(size) = self.device_sizes.get(device) {
                return Ok(*size);
            }
            self.devices
                .get(device)
                .map(|d| d.len() as u64)
                .ok_or_else(|| Error::Inspection(format!("no device {device}")))
        }

        fn inspect_os(&mut self) -> Result<Vec<String>> {
            Ok(self.roots.keys().cloned().collect())
        }

        fn inspect_type(&mut self, root: &str) -> Result<String> {
            Ok(self.roots[root].os_type.clone())
        }

        fn inspect_distro(&mut self, root: &str) -> Result<String> {
            Ok(self.roots[root].distro.clone())
        }

        fn inspect_arch(&mut self, root: &str) -> Result<String> {
            Ok(self.roots[root].arch.clone())
        }

        fn inspect_major_version(&mut self, root: &str) -> Result<i32> {
            Ok(self.roots[root].major)
        }

        fn inspect_minor_version(&mut self, root: &str) -> Result<i32> {
            Ok(self.roots[root].minor)
        }

        fn inspect_product_name(&mut self, root: &str) -> Result<String> {
            Ok(self.roots[root].product_name.clone())
        }

        fn inspect_product_variant(&mut self, root: &str) -> Result<String> {
            Ok(self.roots[root].product_variant.clone())
        }

        fn inspect_package_format(&mut self, root: &str) -> Result<String> {
            Ok(self.roots[root].package_format.clone())
        }

        fn inspect_package_management(&mut self, root: &str) -> Result<String> {
            Ok(self.roots[root].package_management.clone())
        }

        fn inspect_format(&mut self, root: &str) -> Result<String> {
            Ok(self.roots[root].format.clone())
        }

        fn inspect_mountpoints(&mut self, root: &str) -> Result<Vec<(String, String)>> {
            Ok(self.roots[root].mountpoints.clone())
        }

        fn inspect_applications(&mut self, root: &str) -> Result<Vec<Application>> {
            Ok(self.roots[root].applications.clone())
        }

        fn inspect_windows_systemroot(&mut self, root: &str) -> Result<String> {
            Ok(self.roots[root].systemroot.clone())
        }

        fn inspect_windows_system_hive(&mut self, root: &str) -> Result<String> {
            Ok(self.roots[root].system_hive.clone())
        }

        fn inspect_windows_software_hive(&mut self, root: &str) -> Result<String> {
            Ok(self.roots[root].software_hive.clone())
        }

        fn inspect_windows_current_control_set(&mut self, root: &str) -> Result<String> {
            Ok(self.roots[root].current_control_set.clone())
        }

        fn mount(&mut self, device: &str, mountpoint: &str) -> Result<()> {
            if let Some(msg) = self.mount_errors.get(device) {
                return Err(Error::Inspection(msg.clone()));
            }
            self.mounts.push((device.to_owned(), mountpoint.to_owned()));
            Ok(())
        }

        fn umount(&mut self, mountpoint: &str) -> Result<()> {
            self.mounts.retain(|(_, mp)| mp != mountpoint);
            Ok(())
        }

        fn umount_all(&mut self) -> Result<()> {
            self.mounts.clear();
            Ok(())
        }

        fn statvfs(&mut self, path: &str) -> Result<StatVfs> {
            Ok(self.statvfs.get(path).copied().unwrap_or_default())
        }

        fn vfs_type(&mut self, device: &str) -> Result<String> {
            Ok(self
                .vfs_types
                .get(device)
                .cloned()
                .unwrap_or_else(|| "ext4".to_owned()))
        }

        fn exists(&mut self, path: &str) -> Result<bool> {
            Ok(self.files.contains_key(path)
                || self.files.keys().any(|k| k.starts_with(&format!("{path}/"))))
        }

        fn is_file(&mut self, path: &str) -> Result<bool> {
            Ok(self.files.contains_key(path))
        }

        fn is_dir(&mut self, path: &str) -> Result<bool> {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            Ok(self.files.keys().any(|k| k.starts_with(&prefix)))
        }

        fn case_sensitive_path(&mut self, path: &str) -> Result<String> {
            // Resolve each component against stored keys, ignoring case.
            if let Some(k) = self.files.keys().find(|k| k.eq_ignore_ascii_case(path)) {
                return Ok(k.clone());
            }
            Ok(path.to_owned())
        }

        fn mkdir_p(&mut self, _path: &str) -> Result<()> {
            Ok(())
        }

        fn rmdir(&mut self, _path: &str) -> Result<()> {
            Ok(())
        }

        fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| Error::Inspection(format!("no such file {path}")))
        }

        fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
            self.files.insert(path.to_owned(), data.to_vec());
            Ok(())
        }

        fn upload(&mut self, local: &Path, remote: &str) -> Result<()> {
            let data = fs::read(local)?;
            self.files.insert(remote.to_owned(), data);
            Ok(())
        }

        fn download(&mut self, remote: &str, local: &Path) -> Result<()> {
            let data = self.read_file(remote)?;
            fs::write(local, data)?;
            Ok(())
        }

        fn rm_f(&mut self, path: &str) -> Result<()> {
            self.files.remove(path);
            Ok(())
        }

        fn find(&mut self, dir: &str) -> Result<Vec<String>> {
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            Ok(self
                .files
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix))
                .map(str::to_owned)
                .collect())
        }

        fn command(&mut self, args: &[&str]) -> Result<String> {
            self.commands.push(args.iter().map(|s| (*s).to_owned()).collect());
            Ok(String::new())
        }

        fn fstrim(&mut self, mountpoint: &str) -> Result<()> {
            self.trimmed.push(mountpoint.to_owned());
            Ok(())
        }

        fn part_to_dev(&mut self, partition: &str) -> Result<String> {
            Ok(self
                .part_parents
                .get(partition)
                .cloned()
                .unwrap_or_else(|| partition.to_owned()))
        }

        fn device_index(&mut self, device: &str) -> Result<usize> {
            self.devices
                .keys()
                .position(|d| d == device)
                .ok_or_else(|| Error::Inspection(format!("no device {device}")))
        }

        fn pread_device(&mut self, device: &str, count: usize, offset: u64) -> Result<Vec<u8>> {
            let data = self
                .devices
                .get(device)
                .ok_or_else(|| Error::Inspection(format!("no device {device}")))?;
            let start = offset as usize;
            Ok(data[start..(start + count).min(data.len())].to_vec())
        }

        fn pwrite_device(&mut self, device: &str, data: &[u8], offset: u64) -> Result<()> {
            let dev = self
                .devices
                .get_mut(device)
                .ok_or_else(|| Error::Inspection(format!("no device {device}")))?;
            let start = offset as usize;
            dev[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn list_esp_devices(&mut self) -> Result<Vec<String>> {
            Ok(self.esp_devices.clone())
        }
    }
}
