//! Firstboot script injection for Windows guests.
//!
//! Scripts run in numeric order the first time the converted guest
//! boots, then delete themselves. `pnp_wait.exe` must run first: it
//! suppresses the PnP "new hardware" prompts that would otherwise
//! steal focus from the remaining scripts.

use std::path::{Path, PathBuf};

use tracing::debug;
use vmlift_hive::{Hive, RegValue};

use crate::guest::GuestFs;
use crate::Result;

/// Guest-side directory (below `%SystemRoot%`) holding the scripts.
const FIRSTBOOT_DIR: &str = "Temp/vmlift-firstboot";

/// An ordered batch of firstboot payloads.
#[derive(Debug, Default)]
pub struct Firstboot {
    /// `(name, content)` batch scripts, in run order.
    scripts: Vec<(String, String)>,
    /// `(name, host path)` binaries uploaded next to the scripts.
    binaries: Vec<(String, PathBuf)>,
}

impl Firstboot {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing was queued (injection becomes a no-op).
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty() && self.binaries.is_empty()
    }

    /// Queues a batch script. Scripts run in insertion order.
    pub fn add_script(&mut self, name: &str, content: &str) {
        self.scripts.push((name.to_owned(), content.to_owned()));
    }

    /// Queues a binary to upload next to the scripts.
    pub fn add_binary(&mut self, name: &str, host_path: &Path) {
        self.binaries.push((name.to_owned(), host_path.to_owned()));
    }

    /// Uploads everything and registers the master script under the
    /// `RunOnce` key of the SOFTWARE hive.
    pub fn inject(
        &self,
        guest: &mut dyn GuestFs,
        software: &mut Hive,
        systemroot: &str,
    ) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let dir = format!("{systemroot}/{FIRSTBOOT_DIR}");
        let scripts_dir = format!("{dir}/scripts");
        guest.mkdir_p(&scripts_dir)?;

        for (name, host_path) in &self.binaries {
            debug!(binary = %name, "uploading firstboot binary");
            guest.upload(host_path, &format!("{dir}/{name}"))?;
        }
        for (i, (name, content)) in self.scripts.iter().enumerate() {
            let filename = format!("{i:04}-{name}.bat");
            debug!(script = %filename, "writing firstboot script");
            // Windows batch wants CRLF.
            let crlf = content.replace('\n', "\r\n");
            guest.write_file(&format!("{scripts_dir}/{filename}"), crlf.as_bytes())?;
        }

        guest.write_file(
            &format!("{dir}/firstboot.bat"),
            master_script().replace('\n', "\r\n").as_bytes(),
        )?;

        // RunOnce entries are removed by Windows after they run; the
        // master script then removes its own directory.
        let runonce =
            software.ensure_path(r"Microsoft\Windows\CurrentVersion\RunOnce")?;
        software.set_value(
            runonce,
            "vmlift-firstboot",
            RegValue::sz(&format!(
                "cmd.exe /c %systemroot%\\{}\\firstboot.bat",
                FIRSTBOOT_DIR.replace('/', "\\")
            )),
        );
        Ok(())
    }
}

/// The master script: run each numbered script in order, deleting it
/// afterwards, then remove the whole firstboot directory.
fn master_script() -> String {
    let dir = FIRSTBOOT_DIR.replace('/', "\\");
    format!(
        "@echo off\n\
         setlocal\n\
         set FIRSTBOOT=%systemroot%\\{dir}\n\
         for /f \"delims=\" %%f in ('dir /b /o:n \"%FIRSTBOOT%\\scripts\\*.bat\"') do (\n\
         \x20 call \"%FIRSTBOOT%\\scripts\\%%f\"\n\
         \x20 del /f /q \"%FIRSTBOOT%\\scripts\\%%f\"\n\
         )\n\
         rd /s /q \"%FIRSTBOOT%\"\n"
    )
}

/// Script that starts `pnp_wait.exe` in the background. Must be the
/// first script of every batch that installs devices.
pub fn pnp_wait_script() -> String {
    format!(
        "@echo off\n\
         start \"\" /b \"%systemroot%\\{}\\pnp_wait.exe\"\n",
        FIRSTBOOT_DIR.replace('/', "\\")
    )
}

/// Script that runs an agent installer shipped in the firstboot
/// directory (`rhev-apt.exe`, `vmdp.exe`).
pub fn installer_script(binary: &str, args: &str) -> String {
    format!(
        "@echo off\n\
         \"%systemroot%\\{}\\{binary}\" {args}\n",
        FIRSTBOOT_DIR.replace('/', "\\")
    )
}

/// Script that runs an uninstaller command. `tolerate_3010` treats the
/// "reboot required" exit code as success.
pub fn uninstaller_script(command: &str, tolerate_3010: bool) -> String {
    let mut s = format!("@echo off\n{command}\n");
    if tolerate_3010 {
        s.push_str("if errorlevel 3011 exit /b %errorlevel%\nif errorlevel 3010 exit /b 0\n");
    }
    s
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::guest::fake::FakeGuest;

    #[test]
    fn scripts_are_numbered_in_insertion_order() {
        let mut g = FakeGuest::new();
        let mut hive = Hive::create("SOFTWARE");

        let mut fb = Firstboot::new();
        fb.add_script("pnp-wait", &pnp_wait_script());
        fb.add_script("uninstall-xen", "echo xen\n");
        fb.inject(&mut g, &mut hive, "/Windows").unwrap();

        let names: Vec<&String> = g
            .files
            .keys()
            .filter(|k| k.contains("/scripts/"))
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with("0000-pnp-wait.bat"));
        assert!(names[1].ends_with("0001-uninstall-xen.bat"));
        // The pnp_wait starter sorts (and therefore runs) first.
        assert!(
            String::from_utf8(g.files[names[0].as_str()].clone())
                .unwrap()
                .contains("pnp_wait.exe")
        );
    }

    #[test]
    fn master_script_is_registered_in_runonce() {
        let mut g = FakeGuest::new();
        let mut hive = Hive::create("SOFTWARE");

        let mut fb = Firstboot::new();
        fb.add_script("noop", "@echo off\n");
        fb.inject(&mut g, &mut hive, "/Windows").unwrap();

        assert!(g.files.contains_key("/Windows/Temp/vmlift-firstboot/firstboot.bat"));
        let runonce = hive
            .lookup(hive.root(), r"Microsoft\Windows\CurrentVersion\RunOnce")
            .unwrap();
        let cmd = hive
            .value(runonce, "vmlift-firstboot")
            .unwrap()
            .as_string()
            .unwrap();
        assert!(cmd.contains("firstboot.bat"));
    }

    #[test]
    fn scripts_use_crlf_line_endings() {
        let mut g = FakeGuest::new();
        let mut hive = Hive::create("SOFTWARE");
        let mut fb = Firstboot::new();
        fb.add_script("x", "line1\nline2\n");
        fb.inject(&mut g, &mut hive, "/Windows").unwrap();
        let content = g.files["/Windows/Temp/vmlift-firstboot/scripts/0000-x.bat"].clone();
        assert!(String::from_utf8(content).unwrap().contains("line1\r\nline2\r\n"));
    }

    #[test]
    fn uninstaller_tolerates_reboot_required() {
        let s = uninstaller_script("\"C:\\Parallels\\uninstall.exe\" /quiet", true);
        assert!(s.contains("if errorlevel 3010 exit /b 0"));
        assert!(s.contains("if errorlevel 3011 exit /b %errorlevel%"));
        let s = uninstaller_script("xen_uninstall.exe", false);
        assert!(!s.contains("3010"));
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut g = FakeGuest::new();
        let mut hive = Hive::create("SOFTWARE");
        Firstboot::new().inject(&mut g, &mut hive, "/Windows").unwrap();
        assert!(g.files.is_empty());
        assert!(hive.lookup(hive.root(), r"Microsoft").is_err());
    }
}
