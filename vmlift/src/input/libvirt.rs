//! `-i libvirt`: fetch the domain XML from a libvirt connection.
//!
//! The metadata path shells out to `virsh`; no libvirt C binding is
//! linked.

use std::process::Command;

use crate::input::{InputOptions, domxml};
use crate::source::Source;
use crate::xml::Element;
use crate::{Error, Result};

/// Input plugin for a guest defined in libvirt.
#[derive(Debug)]
pub struct LibvirtInput {
    /// Guest name.
    guest: String,
    /// Connection URI (`-ic`), when not the default.
    conn: Option<String>,
}

impl LibvirtInput {
    /// Creates the plugin from the positional guest-name argument.
    pub fn new(guest: &str, opts: InputOptions) -> Self {
        Self {
            guest: guest.to_owned(),
            conn: opts.conn,
        }
    }

    /// Reproducible option string for diagnostics.
    pub fn as_options(&self) -> String {
        match &self.conn {
            Some(c) => format!("-i libvirt -ic {c} {}", self.guest),
            None => format!("-i libvirt {}", self.guest),
        }
    }

    /// Fetches and parses the domain. Running domains are rejected:
    /// converting a live guest corrupts the copy.
    pub fn source(&mut self) -> Result<Source> {
        let state = self.virsh(&["domstate", &self.guest])?;
        if state.trim() == "running" {
            return Err(Error::Input(format!(
                "guest '{}' is running; shut it down before converting",
                self.guest
            )));
        }

        let xml = self.virsh(&["dumpxml", "--security-info", &self.guest])?;
        let root = Element::parse(&xml)?;
        domxml::parse_domain(&root, None, self.conn.as_deref())
    }

    /// Runs one `virsh` command against the configured connection.
    pub(crate) fn virsh(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("virsh");
        if let Some(uri) = &self.conn {
            cmd.args(["-c", uri]);
        }
        cmd.args(args);
        let out = cmd
            .output()
            .map_err(|e| Error::Input(format!("virsh: {e}")))?;
        if !out.status.success() {
            return Err(Error::from_command(Error::Input, "virsh", &out.stderr));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// The guest name this plugin reads.
    pub(crate) fn guest(&self) -> &str {
        &self.guest
    }

    /// The connection URI, when set.
    pub(crate) fn conn(&self) -> Option<&str> {
        self.conn.as_deref()
    }
}
