//! `-i vmx`: import from a VMware VMX guest definition, read locally or
//! fetched over SSH.
//!
//! Disks, CD-ROMs and NICs are discovered by walking the `scsiX:Y`,
//! `ideX:Y` and `ethernetN` key namespaces. With the SSH transport the
//! VMX file is copied with `scp`, remote files are probed with
//! `ssh … test -f`, and disk URIs become qemu `json:` pseudo-URIs that
//! `qemu-img` consumes unchanged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::json;
use tracing::warn;

use crate::input::{InputContext, InputOptions};
use crate::source::{
    Controller, Firmware, Hypervisor, Nic, NicModel, Removable, RemovableKind, Sound, Source,
    SourceDisk, VnetKind,
};
use crate::{Error, Result};

/// Highest SCSI controller/target numbers worth probing.
const SCSI_CONTROLLERS: u32 = 4;
const SCSI_TARGETS: u32 = 16;
/// IDE: two channels, two units.
const IDE_CONTROLLERS: u32 = 2;
const IDE_TARGETS: u32 = 2;
/// Ethernet devices worth probing.
const ETHERNETS: u32 = 10;

/// Input plugin for VMX files.
#[derive(Debug)]
pub struct VmxInput {
    /// The path argument: a local path or an `ssh://` URI.
    arg: String,
    /// Scratch directory for the fetched VMX (SSH transport).
    scratch: Option<tempfile::TempDir>,
}

/// A parsed `ssh://[user@]host[:port]/path` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SshUri {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

/// Where the VMX (and its disks) live.
#[derive(Debug, Clone)]
enum VmxLocation {
    /// Local filesystem; the directory of the VMX file.
    Local(PathBuf),
    /// Remote over SSH.
    Ssh(SshUri),
}

/// The flat key/value content of a VMX file (keys lowercased; VMX keys
/// are case-insensitive).
#[derive(Debug, Clone, Default)]
pub(crate) struct VmxFile {
    entries: BTreeMap<String, String>,
}

impl VmxFile {
    /// Parses `key = "value"` lines, skipping comments and blanks.
    pub(crate) fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('.') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            entries.insert(key.trim().to_ascii_lowercase(), value.to_owned());
        }
        Self { entries }
    }

    /// Raw value lookup (key case-insensitive).
    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// VMX-style boolean (`TRUE`/`true`); absent means false.
    pub(crate) fn get_bool(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

/// Rewrites `name.vmdk` to `name-flat.vmdk`.
fn flat_variant(path: &str) -> Option<String> {
    path.strip_suffix(".vmdk").map(|base| format!("{base}-flat.vmdk"))
}

/// Parses an `ssh://` URI.
fn parse_ssh_uri(uri: &str) -> Result<SshUri> {
    let rest = uri
        .strip_prefix("ssh://")
        .ok_or_else(|| Error::InvalidArgument(format!("not an ssh:// URI: {uri}")))?;
    let (authority, path) = rest
        .split_once('/')
        .ok_or_else(|| Error::InvalidArgument(format!("ssh URI has no path: {uri}")))?;
    let (user, hostport) = match authority.rsplit_once('@') {
        Some((user, hostport)) => (Some(user.to_owned()), hostport),
        None => (None, authority),
    };
    let (host, port) = match hostport.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| {
                Error::InvalidArgument(format!("bad port in ssh URI: {uri}"))
            })?;
            (host.to_owned(), Some(port))
        }
        None => (hostport.to_owned(), None),
    };
    if host.is_empty() {
        return Err(Error::InvalidArgument(format!("ssh URI has no host: {uri}")));
    }
    Ok(SshUri {
        user,
        host,
        port,
        path: format!("/{path}"),
    })
}

impl SshUri {
    /// `user@host` or plain `host` for ssh/scp.
    fn login(&self) -> String {
        match &self.user {
            Some(u) => format!("{u}@{}", self.host),
            None => self.host.clone(),
        }
    }

    /// Probes a remote path with `ssh … test -f`.
    fn remote_file_exists(&self, path: &str) -> Result<bool> {
        let mut cmd = Command::new("ssh");
        if let Some(port) = self.port {
            cmd.args(["-p", &port.to_string()]);
        }
        cmd.arg(self.login());
        cmd.arg("test").arg("-f").arg(shell_quote(path));
        let status = cmd
            .status()
            .map_err(|e| Error::Input(format!("ssh: {e}")))?;
        Ok(status.success())
    }

    /// Copies a remote file to a local path with `scp`.
    fn fetch(&self, remote: &str, local: &Path) -> Result<()> {
        let mut cmd = Command::new("scp");
        if let Some(port) = self.port {
            cmd.args(["-P", &port.to_string()]);
        }
        cmd.arg(format!("{}:{}", self.login(), shell_quote(remote)));
        cmd.arg(local);
        let out = cmd
            .output()
            .map_err(|e| Error::Input(format!("scp: {e}")))?;
        if !out.status.success() {
            return Err(Error::from_command(Error::Input, "scp", &out.stderr));
        }
        Ok(())
    }

    /// Builds the qemu `json:` pseudo-URI for one remote file.
    fn json_uri(&self, path: &str) -> String {
        let mut obj = serde_json::Map::new();
        obj.insert("file.driver".into(), json!("ssh"));
        obj.insert("file.path".into(), json!(path));
        obj.insert("file.host".into(), json!(self.host));
        obj.insert("file.host_key_check".into(), json!("no"));
        if let Some(port) = self.port {
            obj.insert("file.port".into(), json!(port));
        }
        if let Some(user) = &self.user {
            obj.insert("file.user".into(), json!(user));
        }
        format!("json:{}", serde_json::Value::Object(obj))
    }
}

/// Minimal single-argument shell quoting for remote paths.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl VmxInput {
    /// Creates the plugin from the positional argument.
    pub fn new(arg: &str, _opts: InputOptions) -> Self {
        Self {
            arg: arg.to_owned(),
            scratch: None,
        }
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        format!("-i vmx {}", self.arg)
    }

    /// Reads the VMX (locally or over SSH) and builds the source.
    pub fn source(&mut self, ctx: &InputContext) -> Result<Source> {
        let (text, location) = if self.arg.starts_with("ssh://") {
            if std::env::var_os("SSH_AUTH_SOCK").is_none() {
                return Err(Error::Input(
                    "the ssh transport requires ssh-agent (SSH_AUTH_SOCK is not set)".into(),
                ));
            }
            let uri = parse_ssh_uri(&self.arg)?;
            let scratch = tempfile::Builder::new()
                .prefix("vmlift-vmx-")
                .tempdir_in(&ctx.cache_dir)?;
            let local = scratch.path().join("guest.vmx");
            uri.fetch(&uri.path, &local)?;
            self.scratch = Some(scratch);
            let text = std::fs::read_to_string(&local)?;
            (text, VmxLocation::Ssh(uri))
        } else {
            let path = PathBuf::from(&self.arg);
            let text = std::fs::read_to_string(&path)
                .map_err(|e| Error::Input(format!("{}: {e}", path.display())))?;
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (text, VmxLocation::Local(dir))
        };

        let vmx = VmxFile::parse(&text);
        build_source(&vmx, &location)
    }
}

/// Builds the [`Source`] from parsed VMX keys.
fn build_source(vmx: &VmxFile, location: &VmxLocation) -> Result<Source> {
    let name = vmx
        .get("displayname")
        .map(str::to_owned)
        .ok_or_else(|| Error::Input("VMX has no displayName".into()))?;

    let memory_mb: u64 = vmx
        .get("memsize")
        .and_then(|m| m.parse().ok())
        .ok_or_else(|| Error::Input("VMX has no parseable memsize".into()))?;
    let vcpu = vmx
        .get("numvcpus")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    let firmware = if vmx.get("firmware") == Some("efi") {
        Firmware::Uefi {
            secure_boot_required: vmx.get_bool("uefi.secureboot.enabled"),
        }
    } else {
        Firmware::Bios
    };

    let mut disks = Vec::new();
    let mut removables = Vec::new();
    // SCSI devices first (that is VMware's boot order), then IDE.
    for c in 0..SCSI_CONTROLLERS {
        for t in 0..SCSI_TARGETS {
            collect_device(
                vmx,
                location,
                &format!("scsi{c}:{t}"),
                Controller::Scsi,
                t,
                &mut disks,
                &mut removables,
            )?;
        }
    }
    for c in 0..IDE_CONTROLLERS {
        for t in 0..IDE_TARGETS {
            collect_device(
                vmx,
                location,
                &format!("ide{c}:{t}"),
                Controller::Ide,
                c * IDE_TARGETS + t,
                &mut disks,
                &mut removables,
            )?;
        }
    }
    if vmx.get_bool("floppy0.present") {
        removables.push(Removable {
            kind: RemovableKind::Floppy,
            controller: None,
            slot: None,
        });
    }

    let mut nics = Vec::new();
    for n in 0..ETHERNETS {
        let ns = format!("ethernet{n}");
        if !vmx.get_bool(&format!("{ns}.present")) {
            continue;
        }
        let mac = match vmx.get(&format!("{ns}.addresstype")) {
            Some("generated") | Some("vpx") => vmx.get(&format!("{ns}.generatedaddress")),
            _ => vmx.get(&format!("{ns}.address")),
        }
        .map(str::to_owned);
        let model = vmx
            .get(&format!("{ns}.virtualdev"))
            .map(|d| match d.to_ascii_lowercase().as_str() {
                "e1000" | "e1000e" => NicModel::E1000,
                other => NicModel::Other(other.to_owned()),
            });
        let kind = match vmx.get(&format!("{ns}.connectiontype")) {
            Some("bridged") | None => VnetKind::Bridge,
            Some(_) => VnetKind::Network,
        };
        let vnet = vmx
            .get(&format!("{ns}.networkname"))
            .unwrap_or("VM Network")
            .to_owned();
        nics.push(Nic::new(mac, model, vnet, kind));
    }

    let sound = if vmx.get_bool("sound.present") {
        match vmx.get("sound.virtualdev") {
            Some("es1371") => Some(Sound::Es1370),
            Some("sb16") => Some(Sound::Sb16),
            Some(other) => {
                warn!(sound = other, "ignoring unsupported sound device");
                None
            }
            None => None,
        }
    } else {
        None
    };

    Ok(Source {
        orig_name: name.clone(),
        name,
        memory: memory_mb * (1 << 20),
        vcpu,
        cpu_vendor: None,
        cpu_model: None,
        topology: None,
        genid: None,
        firmware,
        features: Vec::new(),
        display: None,
        video: None,
        sound,
        disks,
        removables,
        nics,
        hypervisor: Hypervisor::VMware,
    })
}

/// Examines one `scsiX:Y` / `ideX:Y` namespace and records the disk or
/// removable it describes.
fn collect_device(
    vmx: &VmxFile,
    location: &VmxLocation,
    ns: &str,
    controller: Controller,
    slot: u32,
    disks: &mut Vec<SourceDisk>,
    removables: &mut Vec<Removable>,
) -> Result<()> {
    if !vmx.get_bool(&format!("{ns}.present")) {
        return Ok(());
    }
    let device_type = vmx
        .get(&format!("{ns}.devicetype"))
        .unwrap_or("disk")
        .to_ascii_lowercase();
    if device_type.contains("cdrom") {
        removables.push(Removable {
            kind: RemovableKind::Cdrom,
            controller: Some(controller),
            slot: Some(slot),
        });
        return Ok(());
    }
    if !device_type.contains("disk") {
        return Ok(());
    }
    let Some(filename) = vmx.get(&format!("{ns}.filename")) else {
        warn!(namespace = ns, "disk has no fileName; skipped");
        return Ok(());
    };

    let (uri, format) = match location {
        VmxLocation::Local(dir) => {
            let path = if filename.starts_with('/') {
                PathBuf::from(filename)
            } else {
                dir.join(filename)
            };
            (path.display().to_string(), Some("vmdk".to_owned()))
        }
        VmxLocation::Ssh(ssh) => {
            let remote = if filename.starts_with('/') {
                filename.to_owned()
            } else {
                let base = Path::new(&ssh.path)
                    .parent()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                format!("{base}/{filename}")
            };
            // A remote VMDK descriptor is unreadable through the ssh
            // block driver; prefer the flat extent when it exists.
            match flat_variant(&remote) {
                Some(flat) if ssh.remote_file_exists(&flat)? => {
                    (ssh.json_uri(&flat), Some("raw".to_owned()))
                }
                _ => (ssh.json_uri(&remote), None),
            }
        }
    };

    disks.push(SourceDisk {
        id: disks.len(),
        uri,
        format,
        controller: Some(controller),
    });
    Ok(())
}
