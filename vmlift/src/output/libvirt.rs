//! `-o libvirt`: write disks into a directory-type storage pool and
//! define the domain.

use std::path::PathBuf;
use std::process::Command;

use tracing::info;

use crate::output::{Allocation, MetadataParams, OutputOptions, OutputPlugin, domxml};
use crate::overlay::Overlay;
use crate::qemuimg;
use crate::source::Source;
use crate::target::{Target, TargetLocation};
use crate::xml::Element;
use crate::{Error, Result};

/// Output plugin targeting a libvirt connection.
#[derive(Debug)]
pub struct LibvirtOutput {
    /// Connection URI (`-oc`).
    conn: Option<String>,
    /// Pool name (`-os`), default `default`.
    pool: String,
    /// Allocation policy.
    alloc: Allocation,
    /// Target format; default raw.
    format: String,
    /// Resolved pool path, filled by `precheck`.
    pool_path: Option<PathBuf>,
}

impl LibvirtOutput {
    /// Builds the plugin.
    pub fn new(opts: OutputOptions) -> Self {
        Self {
            conn: opts.conn,
            pool: opts.storage.unwrap_or_else(|| "default".to_owned()),
            alloc: opts.alloc,
            format: opts.format.unwrap_or_else(|| "raw".to_owned()),
            pool_path: None,
        }
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        match &self.conn {
            Some(c) => format!("-o libvirt -oc {c} -os {}", self.pool),
            None => format!("-o libvirt -os {}", self.pool),
        }
    }

    fn virsh(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("virsh");
        if let Some(uri) = &self.conn {
            cmd.args(["-c", uri]);
        }
        cmd.args(args);
        let out = cmd
            .output()
            .map_err(|e| Error::Output(format!("virsh: {e}")))?;
        if !out.status.success() {
            return Err(Error::from_command(Error::Output, "virsh", &out.stderr));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Resolves the pool to a directory path; only dir-type pools can
    /// receive files from this process.
    pub fn precheck(&self) -> Result<()> {
        let xml = self.virsh(&["pool-dumpxml", &self.pool])?;
        let root = Element::parse(&xml)?;
        if root.attr_value("type") != Some("dir") {
            return Err(Error::Output(format!(
                "pool '{}' is not a directory-type pool",
                self.pool
            )));
        }
        Ok(())
    }

    /// Pool path lookup (cached after the first call).
    fn pool_path(&mut self) -> Result<PathBuf> {
        if let Some(p) = &self.pool_path {
            return Ok(p.clone());
        }
        let xml = self.virsh(&["pool-dumpxml", &self.pool])?;
        let root = Element::parse(&xml)?;
        let path = root
            .find("target")
            .and_then(|t| t.child_text("path"))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Output(format!("pool '{}' has no target path", self.pool)))?;
        let path = PathBuf::from(path);
        self.pool_path = Some(path.clone());
        Ok(path)
    }

    /// Files inside the pool's backing directory.
    pub fn prepare_targets(
        &mut self,
        source: &Source,
        overlays: &[Overlay],
        estimates: &[Option<u64>],
    ) -> Result<Vec<Target>> {
        let dir = self.pool_path()?;
        Ok(overlays
            .iter()
            .enumerate()
            .map(|(i, ov)| Target {
                location: TargetLocation::File(dir.join(format!("{}-{}", source.name, ov.device))),
                format: self.format.clone(),
                estimated_size: estimates.get(i).copied().flatten(),
                actual_size: None,
                overlay: ov.clone(),
            })
            .collect())
    }

    /// Creates the target blob with `qemu-img create`.
    pub fn disk_create(&self, target: &Target) -> Result<()> {
        let TargetLocation::File(path) = &target.location else {
            return Err(Error::Output("libvirt targets are files".into()));
        };
        let opts = qemuimg::CreateOpts {
            size: Some(target.overlay.virtual_size),
            preallocation: OutputPlugin::preallocation_for(self.alloc, &target.format),
            compat: (target.format == "qcow2").then(|| "1.1".to_owned()),
            ..qemuimg::CreateOpts::default()
        };
        qemuimg::create(path, &target.format, &opts).map_err(|e| Error::Output(e.to_string()))
    }

    /// Refreshes the pool and defines the domain.
    pub fn create_metadata(&mut self, params: &MetadataParams<'_>) -> Result<()> {
        let domain = domxml::build_domain(params);

        let xml_file = tempfile::Builder::new()
            .prefix("vmlift-domain-")
            .suffix(".xml")
            .tempfile()?;
        std::fs::write(xml_file.path(), domain.to_document())?;

        self.virsh(&["pool-refresh", &self.pool])?;
        self.virsh(&["define", &xml_file.path().display().to_string()])?;
        info!(name = %params.source.name, "defined libvirt domain");
        Ok(())
    }
}
