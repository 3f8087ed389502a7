//! Thin wrappers around the `qemu-img` binary.
//!
//! All functions return plain [`io::Result`]; callers map failures into
//! their own error kind (`Overlay` for overlay creation, `Copy` for the
//! data move, `Input` for format probing).

use std::io;
use std::path::Path;
use std::process::Command;

use serde::Deserialize;
use tracing::debug;

/// Parsed output of `qemu-img info --output json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    /// Guest-visible size in bytes.
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    /// Detected container format.
    pub format: String,
    /// Backing file, when the image has one.
    #[serde(rename = "backing-filename")]
    pub backing_filename: Option<String>,
}

/// Runs `qemu-img info --output json` on a path or URI.
pub fn info(image: &str) -> io::Result<ImageInfo> {
    let out = Command::new("qemu-img")
        .args(["info", "--output", "json", "--", image])
        .output()?;
    if !out.status.success() {
        return Err(command_error("qemu-img info", &out.stderr));
    }
    serde_json::from_slice(&out.stdout)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Options for `qemu-img create`.
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    /// Virtual size in bytes; omitted when a backing file supplies it.
    pub size: Option<u64>,
    /// Backing file path or URI (qcow2 only).
    pub backing_file: Option<String>,
    /// Backing file format, when declared.
    pub backing_format: Option<String>,
    /// qcow2 compat level (`1.1` or `0.10`).
    pub compat: Option<String>,
    /// Preallocation mode (`off`, `falloc`, `full`).
    pub preallocation: Option<String>,
    /// qcow2 cluster size in bytes.
    pub cluster_size: Option<u64>,
}

/// Runs `qemu-img create -f <format>` with the given options.
pub fn create(path: &Path, format: &str, opts: &CreateOpts) -> io::Result<()> {
    let mut cmd = Command::new("qemu-img");
    cmd.args(["create", "-q", "-f", format]);

    let mut features = Vec::new();
    if let Some(c) = &opts.compat {
        features.push(format!("compat={c}"));
    }
    if let Some(b) = &opts.backing_file {
        features.push(format!("backing_file={b}"));
    }
    if let Some(bf) = &opts.backing_format {
        features.push(format!("backing_fmt={bf}"));
    }
    if let Some(p) = &opts.preallocation {
        features.push(format!("preallocation={p}"));
    }
    if let Some(cs) = opts.cluster_size {
        features.push(format!("cluster_size={cs}"));
    }
    if !features.is_empty() {
        cmd.arg("-o").arg(features.join(","));
    }

    cmd.arg("--").arg(path);
    if let Some(size) = opts.size {
        cmd.arg(size.to_string());
    }

    debug!(?cmd, "qemu-img create");
    let out = cmd.output()?;
    if !out.status.success() {
        return Err(command_error("qemu-img create", &out.stderr));
    }
    Ok(())
}

/// Runs `qemu-img convert -n` from a qcow2 overlay into an existing
/// target. The target must already be provisioned (`-n` never creates).
pub fn convert(overlay: &Path, dest: &str, out_format: &str, compressed: bool) -> io::Result<()> {
    let mut cmd = Command::new("qemu-img");
    cmd.args(["convert", "-n", "-f", "qcow2", "-O", out_format]);
    if compressed {
        cmd.arg("-c");
    }
    cmd.arg("--").arg(overlay).arg(dest);

    debug!(?cmd, "qemu-img convert");
    let out = cmd.output()?;
    if !out.status.success() {
        return Err(command_error("qemu-img convert", &out.stderr));
    }
    Ok(())
}

/// Size of a file in on-disk blocks — what `du --block-size=1` reports,
/// not the apparent length.
pub fn allocated_size(path: &Path) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path)?;
    Ok(meta.blocks() * 512)
}

/// Formats a failed command's stderr tail into an [`io::Error`].
fn command_error(tool: &str, stderr: &[u8]) -> io::Error {
    let tail = String::from_utf8_lossy(stderr);
    let tail = tail.trim();
    if tail.is_empty() {
        io::Error::other(format!("{tool} failed"))
    } else {
        io::Error::other(format!("{tool}: {tail}"))
    }
}
