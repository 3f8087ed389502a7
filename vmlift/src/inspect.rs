//! Guest inspection: root selection, deterministic mounting, and fact
//! collection.

use std::io::BufRead;
use std::str::FromStr;

use tracing::warn;

use crate::guest::{Application, GuestFs};
use crate::{Error, Result};

/// How to pick the root filesystem on a multi-boot guest.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RootPolicy {
    /// Ask interactively (1-based index; `exit`/`q`/`quit` aborts).
    Ask,
    /// Fail if the guest is multi-boot.
    Single,
    /// Take the first root in inspection order.
    First,
    /// Require this device to be one of the roots.
    Dev(String),
}

impl FromStr for RootPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ask" => Ok(Self::Ask),
            "single" => Ok(Self::Single),
            "first" => Ok(Self::First),
            dev if dev.starts_with("/dev/") => Ok(Self::Dev(dev.to_owned())),
            other => Err(Error::InvalidArgument(format!(
                "unknown --root option '{other}'"
            ))),
        }
    }
}

/// Windows-specific inspection facts.
#[derive(Debug, Clone)]
pub struct WindowsMeta {
    /// `%SystemRoot%` path, e.g. `/Windows`.
    pub systemroot: String,
    /// SYSTEM hive path inside the guest.
    pub system_hive: String,
    /// SOFTWARE hive path inside the guest.
    pub software_hive: String,
    /// Current control set key name, e.g. `ControlSet001`.
    pub current_control_set: String,
}

/// Firmware as determined from the disks themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InspectedFirmware {
    /// No EFI system partition: BIOS boot.
    Bios,
    /// EFI system partitions found on these devices.
    Uefi(Vec<String>),
}

/// Everything later stages need to know about the guest OS.
#[derive(Debug, Clone)]
pub struct Inspection {
    /// The selected root filesystem device.
    pub root: String,
    /// `linux`, `windows`, …
    pub os_type: String,
    /// Distro identifier.
    pub distro: String,
    /// Guest architecture.
    pub arch: String,
    /// OS major version.
    pub major: i32,
    /// OS minor version.
    pub minor: i32,
    /// Human product name.
    pub product_name: String,
    /// Product variant (`Client`, `Server`, `unknown`).
    pub product_variant: String,
    /// Package format (`rpm`, `deb`, …).
    pub package_format: String,
    /// Package manager.
    pub package_management: String,
    /// Installed applications.
    pub applications: Vec<Application>,
    /// `(mountpoint, device)` pairs, sorted shortest path first.
    pub mountpoints: Vec<(String, String)>,
    /// Windows details, when the guest is Windows.
    pub windows: Option<WindowsMeta>,
    /// Firmware determined from the disks.
    pub firmware: InspectedFirmware,
}

/// Inspects the attached guest: selects a root under `policy`, mounts
/// its filesystems (shortest mountpoint first) and collects facts.
///
/// `input` feeds the interactive `Ask` loop; the CLI passes stdin.
pub fn inspect(
    guest: &mut dyn GuestFs,
    policy: &RootPolicy,
    input: &mut dyn BufRead,
) -> Result<Inspection> {
    let roots = guest.inspect_os()?;
    if roots.is_empty() {
        return Err(Error::Inspection(
            "no operating systems were found on the source disks".into(),
        ));
    }
    let root = select_root(&roots, policy, input)?.to_owned();

    let format = guest.inspect_format(&root)?;
    if format != "installed" {
        return Err(Error::Inspection(format!(
            "root {root} is not an installed operating system (found '{format}')"
        )));
    }

    // Deterministic mount order: shortest mountpoint path first, so
    // parents mount before children.
    let mut mountpoints = guest.inspect_mountpoints(&root)?;
    mountpoints.sort_by_key(|(mp, _)| (mp.len(), mp.clone()));

    for (i, (mp, dev)) in mountpoints.iter().enumerate() {
        match guest.mount(dev, mp) {
            Ok(()) => {}
            Err(e) if i == 0 => {
                let msg = e.to_string();
                if msg.contains("NTFS partition is in an unsafe state") {
                    return Err(Error::Inspection(format!(
                        "unable to mount the disk image for writing. This has probably \
                         happened because Windows Hibernation or Fast Restart is being \
                         used in this guest. Shut the guest down fully and retry. \
                         Original error: {msg}"
                    )));
                }
                return Err(e);
            }
            Err(e) => {
                warn!(mountpoint = %mp, device = %dev, error = %e, "ignoring unmountable filesystem");
            }
        }
    }

    let os_type = guest.inspect_type(&root)?;
    let windows = if os_type == "windows" {
        Some(WindowsMeta {
            systemroot: guest.inspect_windows_systemroot(&root)?,
            system_hive: guest.inspect_windows_system_hive(&root)?,
            software_hive: guest.inspect_windows_software_hive(&root)?,
            current_control_set: guest.inspect_windows_current_control_set(&root)?,
        })
    } else {
        None
    };

    let esps = guest.list_esp_devices()?;
    let firmware = if esps.is_empty() {
        InspectedFirmware::Bios
    } else {
        InspectedFirmware::Uefi(esps)
    };

    Ok(Inspection {
        os_type,
        distro: guest.inspect_distro(&root)?,
        arch: guest.inspect_arch(&root)?,
        major: guest.inspect_major_version(&root)?,
        minor: guest.inspect_minor_version(&root)?,
        product_name: guest.inspect_product_name(&root)?,
        product_variant: guest.inspect_product_variant(&root)?,
        package_format: guest.inspect_package_format(&root)?,
        package_management: guest.inspect_package_management(&root)?,
        applications: guest.inspect_applications(&root)?,
        mountpoints,
        windows,
        firmware,
        root,
    })
}

/// Applies the root-selection policy.
#[allow(clippy::print_stdout)] // the Ask loop is interactive by design
fn select_root<'a>(
    roots: &'a [String],
    policy: &RootPolicy,
    input: &mut dyn BufRead,
) -> Result<&'a str> {
    match policy {
        RootPolicy::First => Ok(&roots[0]),
        RootPolicy::Single => {
            if roots.len() > 1 {
                return Err(Error::Inspection(format!(
                    "multi-boot operating system: {} roots found; use --root to select one",
                    roots.len()
                )));
            }
            Ok(&roots[0])
        }
        RootPolicy::Dev(dev) => roots
            .iter()
            .find(|r| *r == dev)
            .map(String::as_str)
            .ok_or_else(|| {
                Error::Inspection(format!(
                    "root device {dev} not found; roots are: {}",
                    roots.join(" ")
                ))
            }),
        RootPolicy::Ask => {
            if roots.len() == 1 {
                return Ok(&roots[0]);
            }
            println!("Dual- or multi-boot operating system detected. Choose the root filesystem");
            println!("that contains the main operating system being converted.");
            for (i, r) in roots.iter().enumerate() {
                println!(" [{}] {}", i + 1, r);
            }
            loop {
                println!("Enter a number between 1 and {} (or 'exit'):", roots.len());
                let mut line = String::new();
                if input.read_line(&mut line)? == 0 {
                    return Err(Error::Inspection("end of input while selecting root".into()));
                }
                let line = line.trim();
                if matches!(line, "exit" | "q" | "quit") {
                    return Err(Error::Inspection("root selection aborted".into()));
                }
                if let Ok(n) = line.parse::<usize>()
                    && (1..=roots.len()).contains(&n)
                {
                    return Ok(&roots[n - 1]);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::guest::fake::{FakeGuest, FakeOs};

    fn linux_guest() -> FakeGuest {
        FakeGuest::new().with_root(
            "/dev/sda2",
            FakeOs {
                os_type: "linux".into(),
                distro: "fedora".into(),
                arch: "x86_64".into(),
                major: 35,
                format: "installed".into(),
                mountpoints: vec![
                    ("/boot".into(), "/dev/sda1".into()),
                    ("/".into(), "/dev/sda2".into()),
                    ("/home".into(), "/dev/sda3".into()),
                ],
                ..FakeOs::default()
            },
        )
    }

    #[test]
    fn mounts_shortest_path_first() {
        let mut g = linux_guest();
        let insp = inspect(&mut g, &RootPolicy::Single, &mut Cursor::new("")).unwrap();
        let mps: Vec<&str> = insp.mountpoints.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(mps, vec!["/", "/boot", "/home"]);
        // Path lengths are non-decreasing.
        assert!(mps.windows(2).all(|w| w[0].len() <= w[1].len()));
        // The fake recorded mounts in the same order.
        assert_eq!(g.mounts[0].1, "/");
    }

    #[test]
    fn single_policy_rejects_multiboot() {
        let mut g = linux_guest().with_root(
            "/dev/sdb1",
            FakeOs {
                os_type: "linux".into(),
                format: "installed".into(),
                ..FakeOs::default()
            },
        );
        let err = inspect(&mut g, &RootPolicy::Single, &mut Cursor::new("")).unwrap_err();
        assert!(err.to_string().contains("multi-boot"));
    }

    #[test]
    fn ask_policy_reads_one_based_index() {
        let mut g = linux_guest().with_root(
            "/dev/sdb1",
            FakeOs {
                os_type: "linux".into(),
                format: "installed".into(),
                ..FakeOs::default()
            },
        );
        let insp = inspect(&mut g, &RootPolicy::Ask, &mut Cursor::new("junk\n1\n")).unwrap();
        assert_eq!(insp.root, "/dev/sda2");
    }

    #[test]
    fn ask_policy_quit_aborts() {
        let mut g = linux_guest().with_root(
            "/dev/sdb1",
            FakeOs {
                format: "installed".into(),
                ..FakeOs::default()
            },
        );
        assert!(inspect(&mut g, &RootPolicy::Ask, &mut Cursor::new("quit\n")).is_err());
    }

    #[test]
    fn dev_policy_requires_membership() {
        let mut g = linux_guest();
        let err = inspect(
            &mut g,
            &RootPolicy::Dev("/dev/sdz9".into()),
            &mut Cursor::new(""),
        )
        .unwrap_err();
        assert!(err.to_string().contains("/dev/sdz9"));

        let mut g = linux_guest();
        let insp = inspect(
            &mut g,
            &RootPolicy::Dev("/dev/sda2".into()),
            &mut Cursor::new(""),
        )
        .unwrap();
        assert_eq!(insp.root, "/dev/sda2");
    }

    #[test]
    fn live_media_is_rejected() {
        let mut g = FakeGuest::new().with_root(
            "/dev/sda1",
            FakeOs {
                format: "live".into(),
                ..FakeOs::default()
            },
        );
        let err = inspect(&mut g, &RootPolicy::First, &mut Cursor::new("")).unwrap_err();
        assert!(err.to_string().contains("installed"));
    }

    #[test]
    fn hibernated_ntfs_gets_specific_diagnostic() {
        let mut g = FakeGuest::new().with_root(
            "/dev/sda2",
            FakeOs {
                os_type: "windows".into(),
                format: "installed".into(),
                mountpoints: vec![("/".into(), "/dev/sda2".into())],
                systemroot: "/Windows".into(),
                ..FakeOs::default()
            },
        );
        g.mount_errors.insert(
            "/dev/sda2".into(),
            "mount: NTFS partition is in an unsafe state".into(),
        );
        let err = inspect(&mut g, &RootPolicy::First, &mut Cursor::new("")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Hibernation"), "{msg}");
        assert!(msg.contains("Fast Restart"), "{msg}");
    }

    #[test]
    fn root_policy_parses() {
        assert_eq!("ask".parse::<RootPolicy>().unwrap(), RootPolicy::Ask);
        assert_eq!(
            "/dev/sda2".parse::<RootPolicy>().unwrap(),
            RootPolicy::Dev("/dev/sda2".into())
        );
        assert!("zeroth".parse::<RootPolicy>().is_err());
    }
}
