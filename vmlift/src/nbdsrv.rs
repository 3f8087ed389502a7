//! Supervisor for nbdkit child processes.
//!
//! Each supervised instance exposes one source disk as newstyle NBD
//! over a UNIX socket. The child runs `--foreground --exit-with-parent`,
//! so it is bound to our lifetime; the scratch directory holding its
//! socket and pidfile is removed by the at-exit stack.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{Error, Result};

/// Minimum nbdkit version with `--exit-with-parent` and newstyle
/// defaults we rely on.
const MIN_VERSION: (u32, u32) = (1, 12);

/// How long to wait for the pidfile before declaring startup failed.
const PIDFILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pidfile poll interval.
const PIDFILE_POLL: Duration = Duration::from_secs(1);

/// SELinux label for sockets an svirt-confined qemu must connect to.
const SOCKET_LABEL: &str = "system_u:object_r:svirt_socket_t:s0";

/// SELinux label applied to the created socket file.
const IMAGE_LABEL: &str = "system_u:object_r:svirt_image_t:s0";

/// Monotonic per-process instance counter.
static INSTANCE: AtomicU32 = AtomicU32::new(0);

/// How the nbdkit plugin receives its password.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Password {
    /// No password parameter at all.
    NoPassword,
    /// The child prompts on its controlling terminal.
    AskForPassword,
    /// Password read from a file (created mode 0600 by the caller).
    PasswordFile(PathBuf),
}

/// Configuration for one nbdkit instance.
#[derive(Debug, Clone)]
pub struct NbdKit {
    /// Plugin name (`vddk`, `ssh`, `curl`, …).
    plugin: String,
    /// `key=value` plugin parameters, in insertion order.
    params: Vec<(String, String)>,
    /// Password handling.
    password: Password,
}

/// A running nbdkit child serving one disk.
#[derive(Debug)]
pub struct NbdKitHandle {
    /// The supervised child process.
    child: Child,
    /// Socket path inside the scratch directory.
    socket: PathBuf,
    /// URI callers pass to `qemu-img`.
    qemu_uri: String,
}

impl NbdKit {
    /// Starts building an instance for the given plugin.
    pub fn new(plugin: &str) -> Self {
        Self {
            plugin: plugin.to_owned(),
            params: Vec::new(),
            password: Password::NoPassword,
        }
    }

    /// Adds a `key=value` plugin parameter.
    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.params.push((key.to_owned(), value.to_owned()));
        self
    }

    /// Sets the password mode.
    pub fn password(mut self, password: Password) -> Self {
        self.password = password;
        self
    }

    /// Verifies nbdkit is installed, recent enough, can load the plugin,
    /// and supports SELinux labelling if the host enforces it.
    pub fn preflight(&self) -> Result<()> {
        which::which("nbdkit")
            .map_err(|_| Error::Supervisor("nbdkit is not installed".into()))?;

        let out = Command::new("nbdkit")
            .arg("--version")
            .output()
            .map_err(|e| Error::Supervisor(format!("nbdkit --version: {e}")))?;
        let text = String::from_utf8_lossy(&out.stdout);
        let version = parse_version(&text).ok_or_else(|| {
            Error::Supervisor(format!("cannot parse nbdkit version from '{}'", text.trim()))
        })?;
        if version < MIN_VERSION {
            return Err(Error::Supervisor(format!(
                "nbdkit is too old: {}.{} < {}.{}",
                version.0, version.1, MIN_VERSION.0, MIN_VERSION.1
            )));
        }

        let out = Command::new("nbdkit")
            .args([self.plugin.as_str(), "--dump-plugin"])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| Error::Supervisor(format!("nbdkit --dump-plugin: {e}")))?;
        if !out.status.success() {
            return Err(Error::Supervisor(format!(
                "nbdkit '{}' plugin is not installed or failed to load: {}",
                self.plugin,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        if selinux_enforcing() && !selinux_label_supported() {
            return Err(Error::Supervisor(
                "host is SELinux-enforcing but nbdkit lacks --selinux-label".into(),
            ));
        }
        Ok(())
    }

    /// Starts the child, waits for the pidfile and returns a handle.
    ///
    /// `scratch` must be a 0755 directory scheduled for removal at
    /// process exit; an unprivileged qemu needs to traverse it.
    pub fn start(&self, scratch: &Path) -> Result<NbdKitHandle> {
        let id = INSTANCE.fetch_add(1, Ordering::Relaxed);
        let socket = scratch.join(format!("nbdkit{id}.sock"));
        let pidfile = scratch.join(format!("nbdkit{id}.pid"));

        let args = self.build_args(&socket, &pidfile);
        debug!(plugin = %self.plugin, ?args, "starting nbdkit");

        let mut cmd = Command::new("nbdkit");
        cmd.args(&args);
        if self.password == Password::AskForPassword {
            cmd.stdin(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null());
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Supervisor(format!("failed to run nbdkit: {e}")))?;

        // Startup is complete once the pidfile appears.
        let deadline = Instant::now() + PIDFILE_TIMEOUT;
        while !pidfile.exists() {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| Error::Supervisor(e.to_string()))?
            {
                return Err(Error::Supervisor(format!(
                    "nbdkit exited during startup ({status})"
                )));
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                return Err(Error::Supervisor(format!(
                    "nbdkit did not create its pidfile within {} s",
                    PIDFILE_TIMEOUT.as_secs()
                )));
            }
            std::thread::sleep(PIDFILE_POLL);
        }

        // qemu may run as another UID.
        fs::set_permissions(&socket, fs::Permissions::from_mode(0o777))?;
        if selinux_enforcing() {
            relabel(&socket, IMAGE_LABEL);
        }

        let qemu_uri = format!("nbd:unix:{}:exportname=/", socket.display());
        Ok(NbdKitHandle {
            child,
            socket,
            qemu_uri,
        })
    }

    /// Assembles the full nbdkit argument list.
    fn build_args(&self, socket: &Path, pidfile: &Path) -> Vec<String> {
        let mut args = vec![
            "--foreground".to_owned(),
            "--readonly".to_owned(),
            "--newstyle".to_owned(),
            "--exportname=/".to_owned(),
            "--exit-with-parent".to_owned(),
            "--unix".to_owned(),
            socket.display().to_string(),
            "--pidfile".to_owned(),
            pidfile.display().to_string(),
        ];
        if selinux_enforcing() {
            args.push("--selinux-label".to_owned());
            args.push(SOCKET_LABEL.to_owned());
        }
        args.push(self.plugin.clone());
        for (k, v) in &self.params {
            args.push(format!("{k}={v}"));
        }
        match &self.password {
            Password::NoPassword => {}
            Password::AskForPassword => args.push("password=-".to_owned()),
            Password::PasswordFile(path) => {
                args.push(format!("password=+{}", path.display()));
            }
        }
        args
    }
}

impl NbdKitHandle {
    /// The `nbd:unix:<path>:exportname=/` URI for `qemu-img`.
    pub fn qemu_uri(&self) -> &str {
        &self.qemu_uri
    }

    /// Socket path (for diagnostics).
    pub fn socket(&self) -> &Path {
        &self.socket
    }
}

impl Drop for NbdKitHandle {
    fn drop(&mut self) {
        // --exit-with-parent is the backstop; be prompt about it anyway.
        if let Err(e) = self.child.kill() {
            warn!(error = %e, "failed to kill nbdkit child");
        }
        let _ = self.child.wait();
    }
}

/// Extracts `(major, minor)` from `nbdkit --version` output.
fn parse_version(text: &str) -> Option<(u32, u32)> {
    let word = text.split_whitespace().find(|w| w.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
    let mut parts = word.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: u32 = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Whether the host runs SELinux in enforcing mode.
fn selinux_enforcing() -> bool {
    Command::new("getenforce")
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "Enforcing")
        .unwrap_or(false)
}

/// Whether nbdkit understands `--selinux-label`.
fn selinux_label_supported() -> bool {
    Command::new("nbdkit")
        .arg("--help")
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).contains("--selinux-label"))
        .unwrap_or(false)
}

/// Relabels a file, warning on failure (qemu may still connect if the
/// policy is permissive about the default label).
fn relabel(path: &Path, label: &str) {
    let status = Command::new("chcon").arg(label).arg(path).status();
    match status {
        Ok(s) if s.success() => {}
        Ok(_) | Err(_) => warn!(path = %path.display(), label, "chcon failed"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_version_strings() {
        assert_eq!(parse_version("nbdkit 1.33.2"), Some((1, 33)));
        assert_eq!(parse_version("nbdkit 1.12.7 (built …)"), Some((1, 12)));
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn build_args_order_and_uri_shape() {
        let kit = NbdKit::new("vddk")
            .param("server", "vcenter.example.com")
            .param("thumbprint", "ab:cd")
            .password(Password::PasswordFile(PathBuf::from("/tmp/pw")));
        let args = kit.build_args(Path::new("/scratch/nbdkit0.sock"), Path::new("/scratch/nbdkit0.pid"));

        // Mode flags come before the plugin name, parameters after.
        let plugin_pos = args.iter().position(|a| a == "vddk").unwrap();
        for flag in ["--foreground", "--readonly", "--newstyle", "--exportname=/", "--exit-with-parent"] {
            assert!(args.iter().position(|a| a == flag).unwrap() < plugin_pos, "{flag}");
        }
        assert!(args.iter().position(|a| a == "server=vcenter.example.com").unwrap() > plugin_pos);
        assert_eq!(args.last().unwrap(), "password=+/tmp/pw");
    }

    #[test]
    fn ask_for_password_uses_dash() {
        let kit = NbdKit::new("ssh").password(Password::AskForPassword);
        let args = kit.build_args(Path::new("/s/nbdkit1.sock"), Path::new("/s/nbdkit1.pid"));
        assert_eq!(args.last().unwrap(), "password=-");
    }
}
