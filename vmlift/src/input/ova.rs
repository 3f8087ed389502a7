//! `-i ova`: import from an OVA tarball or an unpacked OVA directory.
//!
//! The archive is unpacked into a scratch directory, per-file manifest
//! digests are verified, gzip-compressed VMDK extents are uncompressed,
//! and the OVF descriptor drives the synthesised [`Source`].

use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use flate2::read::GzDecoder;
use regex::Regex;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::input::{InputContext, InputOptions};
use crate::ovf;
use crate::source::{
    Firmware, Hypervisor, Nic, NicModel, Removable, RemovableKind, Source, SourceDisk, VnetKind,
};
use crate::xml::Element;
use crate::{Error, Result};

/// Input plugin for OVA archives.
#[derive(Debug)]
pub struct OvaInput {
    /// The `.ova` file or unpacked directory.
    path: PathBuf,
    /// Scratch directory holding extracted/uncompressed files. Kept
    /// alive until the plugin drops (after the copy).
    scratch: Option<tempfile::TempDir>,
}

/// `SHA1(file)= hex` / `SHA256(file)= hex` manifest line.
fn manifest_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // pattern is a literal
        Regex::new(r"^\s*(SHA1|SHA256)\s*\(([^)]+)\)\s*=\s*([0-9a-fA-F]+)\s*$").unwrap()
    })
}

impl OvaInput {
    /// Creates the plugin from the positional path argument.
    pub fn new(path: &str, _opts: InputOptions) -> Self {
        Self {
            path: PathBuf::from(path),
            scratch: None,
        }
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        format!("-i ova {}", self.path.display())
    }

    /// Unpacks, verifies and parses the OVA.
    pub fn source(&mut self, ctx: &InputContext) -> Result<Source> {
        let dir = if self.path.is_dir() {
            self.path.clone()
        } else {
            let scratch = tempfile::Builder::new()
                .prefix("vmlift-ova-")
                .tempdir_in(&ctx.cache_dir)
                .map_err(|e| Error::Input(format!("cannot create scratch directory: {e}")))?;
            extract_tar(&self.path, scratch.path())?;
            let dir = scratch.path().to_path_buf();
            self.scratch = Some(scratch);
            dir
        };

        verify_manifests(&dir)?;

        let ovf_path = find_with_extension(&dir, "ovf")?.ok_or_else(|| {
            Error::Input(format!("no OVF file found in {}", self.path.display()))
        })?;
        let xml = fs::read_to_string(&ovf_path)
            .map_err(|e| Error::Input(format!("{}: {e}", ovf_path.display())))?;
        let parsed = ovf::parse_ovf(&Element::parse(&xml)?)?;

        let mut disks = Vec::new();
        for d in &parsed.disks {
            let Some(href) = &d.href else {
                warn!(disk = %d.disk_id, "OVF disk has no file reference; skipped");
                continue;
            };
            let extent = dir.join(href);
            if !extent.exists() {
                return Err(Error::Input(format!(
                    "OVF references missing file {href}"
                )));
            }
            let extent = self.uncompress_if_gzip(&extent, &ctx.cache_dir)?;
            let format = d
                .format
                .as_deref()
                .is_some_and(|f| f.contains("vmdk"))
                .then(|| "vmdk".to_owned());
            disks.push(SourceDisk {
                id: disks.len(),
                uri: extent.display().to_string(),
                format,
                controller: None,
            });
        }

        let removables = (0..parsed.cdroms)
            .map(|_| Removable {
                kind: RemovableKind::Cdrom,
                controller: None,
                slot: None,
            })
            .chain((0..parsed.floppies).map(|_| Removable {
                kind: RemovableKind::Floppy,
                controller: None,
                slot: None,
            }))
            .collect();

        let nics = parsed
            .nics
            .iter()
            .map(|n| {
                let model = n.subtype.as_deref().map(|s| match s.to_ascii_lowercase().as_str() {
                    "e1000" => NicModel::E1000,
                    "virtio" | "3" => NicModel::VirtioNet,
                    "pcnet32" | "vmxnet" | "vmxnet3" => NicModel::Other(s.to_owned()),
                    _ => NicModel::Other(s.to_owned()),
                });
                Nic::new(n.mac.clone(), model, n.network.clone(), VnetKind::Network)
            })
            .collect();

        Ok(Source {
            name: parsed.name.clone(),
            orig_name: parsed.name.clone(),
            memory: parsed.memory_mb * (1 << 20),
            vcpu: parsed.vcpus,
            cpu_vendor: None,
            cpu_model: None,
            topology: None,
            genid: None,
            firmware: if parsed.firmware_efi {
                Firmware::Uefi {
                    secure_boot_required: false,
                }
            } else {
                Firmware::Unknown
            },
            features: Vec::new(),
            display: None,
            video: None,
            sound: None,
            disks,
            removables,
            nics,
            hypervisor: Hypervisor::VMware,
        })
    }

    /// Uncompresses a gzip'd extent to the scratch area, or returns the
    /// path unchanged for plain files.
    fn uncompress_if_gzip(&mut self, extent: &Path, cache_dir: &Path) -> Result<PathBuf> {
        let mut magic = [0u8; 2];
        let mut f = fs::File::open(extent)?;
        let is_gzip = f.read(&mut magic)? == 2 && magic == [0x1f, 0x8b];
        if !is_gzip {
            return Ok(extent.to_path_buf());
        }

        if self.scratch.is_none() {
            self.scratch = Some(
                tempfile::Builder::new()
                    .prefix("vmlift-ova-")
                    .tempdir_in(cache_dir)
                    .map_err(|e| Error::Input(format!("cannot create scratch directory: {e}")))?,
            );
        }
        #[allow(clippy::unwrap_used)] // just assigned above
        let scratch = self.scratch.as_ref().unwrap();
        let out_path = scratch.path().join(
            extent
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "extent".to_owned())
                .trim_end_matches(".gz"),
        );
        debug!(extent = %extent.display(), to = %out_path.display(), "uncompressing gzip extent");

        let mut decoder = GzDecoder::new(BufReader::new(fs::File::open(extent)?));
        let mut out = fs::File::create(&out_path)?;
        std::io::copy(&mut decoder, &mut out)
            .map_err(|e| Error::Input(format!("uncompressing {}: {e}", extent.display())))?;
        Ok(out_path)
    }
}

/// Extracts a tar archive (OVAs are plain ustar) into `dest`.
fn extract_tar(path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(path)
        .map_err(|e| Error::Input(format!("{}: {e}", path.display())))?;
    let mut archive = tar::Archive::new(BufReader::new(file));
    archive.set_preserve_permissions(false);
    archive
        .unpack(dest)
        .map_err(|e| Error::Input(format!("unpacking {}: {e}", path.display())))?;
    Ok(())
}

/// Finds the first file with the given extension in a directory.
fn find_with_extension(dir: &Path, ext: &str) -> Result<Option<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ext))
        .collect();
    entries.sort();
    Ok(entries.into_iter().next())
}

/// Verifies every `.mf` manifest in the directory. Digest mismatches
/// are fatal; unparseable lines warn and are skipped.
fn verify_manifests(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("mf") {
            continue;
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| Error::Input(format!("{}: {e}", path.display())))?;
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Some(caps) = manifest_re().captures(line) else {
                warn!(
                    manifest = %path.display(),
                    "unable to parse line '{line}' in manifest; ignoring it"
                );
                continue;
            };
            let target = dir.join(&caps[2]);
            let expected = caps[3].to_ascii_lowercase();
            let actual = match &caps[1] {
                "SHA1" => hex_digest::<Sha1>(&target)?,
                _ => hex_digest::<Sha256>(&target)?,
            };
            if actual != expected {
                return Err(Error::Input(format!(
                    "checksum mismatch for {} (expected {expected}, found {actual})",
                    &caps[2]
                )));
            }
            debug!(file = &caps[2], "manifest digest ok");
        }
    }
    Ok(())
}

/// Streams a file through a digest, returning lowercase hex.
fn hex_digest<D: Digest>(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| Error::Input(format!("{}: {e}", path.display())))?;
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}
