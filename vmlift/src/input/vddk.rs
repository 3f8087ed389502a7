//! `-i libvirt -it vddk`: libvirt metadata with a VDDK data path.
//!
//! Metadata still comes from the libvirt domain XML, which must carry
//! the vCenter managed-object reference (`<vmware:moref>`). Disk data
//! is served by one nbdkit `vddk` instance per disk; each source disk
//! URI is rewritten to the instance's NBD UNIX socket.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use tracing::info;

use crate::input::{InputContext, InputOptions, domxml, libvirt::LibvirtInput};
use crate::nbdsrv::{NbdKit, NbdKitHandle, Password};
use crate::source::Source;
use crate::xml::Element;
use crate::{Error, Result};

/// Input plugin for the VDDK transport.
#[derive(Debug)]
pub struct VddkInput {
    /// The underlying libvirt metadata reader.
    libvirt: LibvirtInput,
    /// `-io vddk-*` options.
    opts: InputOptions,
    /// Running nbdkit children; alive until the plugin drops.
    handles: Vec<NbdKitHandle>,
    /// Scratch directory holding sockets and the password copy.
    scratch: Option<tempfile::TempDir>,
}

impl VddkInput {
    /// Creates the plugin from the positional guest-name argument.
    pub fn new(guest: &str, opts: InputOptions) -> Self {
        Self {
            libvirt: LibvirtInput::new(guest, opts.clone()),
            opts,
            handles: Vec::new(),
            scratch: None,
        }
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        let mut s = format!("{} -it vddk", self.libvirt.as_options());
        for (k, v) in &self.opts.options {
            s.push_str(&format!(" -io {k}={v}"));
        }
        s
    }

    /// Fetches the domain, requires the moref, and publishes every disk
    /// over NBD.
    pub fn source(&mut self, ctx: &InputContext) -> Result<Source> {
        let xml = self
            .libvirt
            .virsh(&["dumpxml", "--security-info", self.libvirt.guest()])?;
        let root = Element::parse(&xml)?;

        // The moref element only appears in libvirt ≥ 3.7; without it
        // the VDDK plugin cannot address the disk on the server.
        let moref = root
            .find_local("moref")
            .map(|m| m.text.clone())
            .filter(|m| !m.is_empty())
            .ok_or_else(|| {
                Error::Input(
                    "the VDDK transport needs <vmware:moref> in the domain XML, which \
                     requires libvirt ≥ 3.7"
                        .into(),
                )
            })?;

        let mut source = domxml::parse_domain(&root, None, self.libvirt.conn())?;

        let server = self
            .libvirt
            .conn()
            .and_then(uri_host)
            .ok_or_else(|| Error::Input("the VDDK transport needs -ic with a server".into()))?;

        // One scratch directory for all instances, world-readable so an
        // unprivileged qemu can traverse to the sockets.
        let scratch = tempfile::Builder::new()
            .prefix("vmlift-nbdkit-")
            .tempdir_in(&ctx.cache_dir)?;
        fs::set_permissions(scratch.path(), fs::Permissions::from_mode(0o755))?;

        let password = match &self.opts.password_file {
            Some(path) => {
                // Keep a private copy with tight permissions for the
                // lifetime of the children.
                let copy = scratch.path().join("password");
                fs::copy(path, &copy)?;
                fs::set_permissions(&copy, fs::Permissions::from_mode(0o600))?;
                Password::PasswordFile(copy)
            }
            None => Password::AskForPassword,
        };

        NbdKit::new("vddk").preflight()?;

        for disk in &mut source.disks {
            let mut kit = NbdKit::new("vddk")
                .param("file", &disk.uri)
                .param("server", &server)
                .param("vm", &format!("moref={moref}"))
                .password(password.clone());
            if let Some(user) = self.libvirt.conn().and_then(uri_user) {
                kit = kit.param("user", &user);
            }
            if let Some(thumbprint) = self.opts.options.get("vddk-thumbprint") {
                kit = kit.param("thumbprint", thumbprint);
            }
            if let Some(libdir) = self.opts.options.get("vddk-libdir") {
                kit = kit.param("libdir", libdir);
            }
            if let Some(config) = self.opts.options.get("vddk-config") {
                kit = kit.param("config", config);
            }
            if let Some(snapshot) = self.opts.options.get("vddk-snapshot") {
                kit = kit.param("snapshot", snapshot);
            }

            let handle = kit.start(scratch.path())?;
            info!(disk = disk.id, uri = handle.qemu_uri(), "disk published over NBD");
            disk.uri = handle.qemu_uri().to_owned();
            disk.format = Some("raw".to_owned());
            self.handles.push(handle);
        }

        self.scratch = Some(scratch);
        Ok(source)
    }
}

/// Extracts the host from a `scheme://[user@]host[:port]/…` URI.
fn uri_host(uri: &str) -> Option<String> {
    let rest = uri.split_once("://")?.1;
    let authority = rest.split(['/', '?']).next()?;
    let hostport = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = hostport.rsplit_once(':').map_or(hostport, |(h, _)| h);
    (!host.is_empty()).then(|| host.to_owned())
}

/// Extracts the user from a `scheme://user@host/…` URI.
fn uri_user(uri: &str) -> Option<String> {
    let rest = uri.split_once("://")?.1;
    let authority = rest.split(['/', '?']).next()?;
    authority
        .rsplit_once('@')
        .map(|(user, _)| user.to_owned())
        .filter(|u| !u.is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn uri_host_and_user_parse_vpx_uris() {
        let uri = "vpx://administrator%40vsphere.local@vcenter.example.com/DC/esxi?no_verify=1";
        assert_eq!(uri_host(uri).as_deref(), Some("vcenter.example.com"));
        assert_eq!(
            uri_user(uri).as_deref(),
            Some("administrator%40vsphere.local")
        );
        assert_eq!(uri_host("esx://host/"), Some("host".into()));
        assert_eq!(uri_user("esx://host/"), None);
        assert_eq!(uri_host("not-a-uri"), None);
    }

    #[test]
    fn missing_moref_names_minimum_libvirt() {
        // Build the error path without touching virsh: parse + lookup.
        let root = Element::parse(
            "<domain type='vmware'><name>g</name><memory>1024</memory></domain>",
        )
        .unwrap();
        let moref = root.find_local("moref");
        assert!(moref.is_none());
        // The message the plugin raises cites the minimum version.
        let err = Error::Input(
            "the VDDK transport needs <vmware:moref> in the domain XML, which \
             requires libvirt ≥ 3.7"
                .into(),
        );
        assert!(err.to_string().contains("libvirt ≥ 3.7"));
    }
}
