//! The conversion controller.
//!
//! Single-threaded and fail-fast: each stage runs to completion before
//! the next starts, any error aborts the run, and the at-exit stack
//! (plus plugin-owned scratch state) cleans up in reverse order of
//! acquisition. Partial targets are deleted unless the run fully
//! succeeds.

use std::io::BufRead;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::atexit::CleanupStack;
use crate::convert::{self, ConvertOptions};
use crate::guest::{GuestFs, Guestfish};
use crate::inspect::RootPolicy;
use crate::input::{InputContext, InputPlugin};
use crate::netmap::NetworkMap;
use crate::output::{MetadataParams, OutputPlugin};
use crate::source::Source;
use crate::{Result, copy, estimate, overlay};

/// Modes and mappings for one run.
#[derive(Debug)]
pub struct PipelineOptions {
    /// Root selection policy (`--root`).
    pub root_policy: RootPolicy,
    /// Convert the source disks in place; no copy, no output metadata.
    pub in_place: bool,
    /// Stop after conversion; do not copy.
    pub no_copy: bool,
    /// Compress qcow2 targets (`-c`).
    pub compressed: bool,
    /// Keep overlays for post-mortem debugging.
    pub debug_overlays: bool,
    /// Print per-disk size estimates and stop before the copy.
    pub print_estimate: bool,
    /// Print the parsed source and stop.
    pub print_source: bool,
    /// NIC mapping rules.
    pub network_map: NetworkMap,
    /// Rename the guest (`-on`).
    pub rename: Option<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            root_policy: RootPolicy::Ask,
            in_place: false,
            no_copy: false,
            compressed: false,
            debug_overlays: false,
            print_estimate: false,
            print_source: false,
            network_map: NetworkMap::new(),
            rename: None,
        }
    }
}

/// Applies post-input source fixups: network mapping and renaming.
/// After this the source is never mutated again.
pub(crate) fn finish_source(source: &mut Source, opts: &PipelineOptions) {
    opts.network_map.apply(&mut source.nics);
    if let Some(name) = &opts.rename {
        source.name = name.clone();
    }
}

/// Directory for overlays and scratch state: `LIBGUESTFS_CACHEDIR`
/// when set (the inspection library uses the same), `/var/tmp`
/// otherwise (`/tmp` is commonly a small tmpfs; overlays are large).
fn cache_base() -> PathBuf {
    std::env::var_os("LIBGUESTFS_CACHEDIR")
        .map_or_else(|| PathBuf::from("/var/tmp"), PathBuf::from)
}

/// Runs the whole pipeline. `ask_input` feeds interactive root
/// selection (the CLI passes stdin).
#[allow(clippy::print_stdout)] // --print-source/--print-estimate write to stdout by contract
pub fn run(
    input: &mut InputPlugin,
    output: &mut OutputPlugin,
    opts: &PipelineOptions,
    ask_input: &mut dyn BufRead,
) -> Result<()> {
    info!(input = %input.as_options(), output = %output.as_options(), "starting conversion");

    let mut cleanup = CleanupStack::new();
    let run_dir = tempfile::Builder::new()
        .prefix("vmlift-")
        .tempdir_in(cache_base())?;

    // ---- input -------------------------------------------------------
    let ctx = InputContext {
        cache_dir: run_dir.path().to_path_buf(),
    };
    let mut source = input.source(&ctx)?;
    finish_source(&mut source, opts);
    debug!(name = %source.name, disks = source.disks.len(), "source ready");

    if opts.print_source {
        println!("{source}");
        return Ok(());
    }

    output.precheck()?;

    // ---- overlays + sandbox -----------------------------------------
    let mut guest = Guestfish::new()?;
    let overlay_paths = if opts.in_place {
        // In-place conversion mutates the source disks directly.
        for disk in &source.disks {
            guest.add_drive(
                std::path::Path::new(&disk.uri),
                &crate::guest::DriveOpts {
                    format: disk.format.clone(),
                    discard: Some("besteffort".to_owned()),
                    ..crate::guest::DriveOpts::default()
                },
            )?;
        }
        source.disks.iter().map(|d| PathBuf::from(&d.uri)).collect()
    } else {
        overlay::create_and_attach(&mut guest, run_dir.path(), &source.disks)?
    };
    guest.launch()?;
    let overlays = overlay::measure(&mut guest, &overlay_paths, &source.disks)?;

    // ---- inspection + conversion ------------------------------------
    let inspection = crate::inspect::inspect(&mut guest, &opts.root_policy, ask_input)?;
    info!(
        os = %inspection.os_type,
        distro = %inspection.distro,
        product = %inspection.product_name,
        "guest inspected"
    );

    let stats = estimate::collect_stats(&mut guest, &inspection.mountpoints)?;
    estimate::check_free_space(&stats)?;
    let estimates = estimate::estimate_sizes(&overlays, &stats);

    let convert_opts = ConvertOptions {
        keep_serial_console: output.keep_serial_console(),
        install_rhev_apt: output.install_rhev_apt(),
        ..ConvertOptions::default()
    };
    let caps = convert::convert(&mut guest, &inspection, &source, &convert_opts)?;
    let buses = convert::assign_buses(&source, &caps)?;
    let firmware = convert::windows::effective_firmware(&source, &inspection);
    let firmware_kind = match firmware {
        crate::source::Firmware::Uefi { .. } => "uefi",
        _ => "bios",
    };
    if !output.supported_firmware().contains(&firmware_kind) {
        return Err(crate::Error::Output(format!(
            "this output cannot host {firmware_kind} guests"
        )));
    }
    output.check_target_firmware(&caps, &firmware)?;

    // ---- trim + shutdown --------------------------------------------
    copy::trim_filesystems(&mut guest, &inspection);
    guest.umount_all()?;
    guest.shutdown()?;

    if opts.print_estimate {
        for (disk, est) in source.disks.iter().zip(&estimates) {
            match est {
                Some(est) => println!("disk {}: {est}", disk.id),
                None => println!("disk {}: unknown", disk.id),
            }
        }
        return Ok(());
    }
    if opts.in_place || opts.no_copy {
        info!("conversion finished (no copy requested)");
        return Ok(());
    }

    // ---- copy --------------------------------------------------------
    let mut targets = output.prepare_targets(&source, &overlays, &estimates)?;

    // Provisioned targets are deleted by the at-exit stack unless the
    // run completes; the success path disarms these actions.
    let mut delete_actions = Vec::with_capacity(targets.len());
    for target in &targets {
        if let crate::target::TargetLocation::File(path) = &target.location {
            let path = path.clone();
            let id = cleanup.push(format!("delete target {}", path.display()), move || {
                match std::fs::remove_file(&path) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                }
            });
            delete_actions.push(id);
        }
    }

    let copy_result = (|| -> Result<()> {
        for target in &mut targets {
            output.disk_create(target)?;
            copy::copy_target(target, opts.compressed)?;
        }
        Ok(())
    })();
    if let Err(e) = copy_result {
        output.delete_targets(&targets);
        return Err(e);
    }

    // ---- metadata ----------------------------------------------------
    let meta = MetadataParams {
        source: &source,
        targets: &targets,
        buses: &buses,
        caps: &caps,
        inspect: &inspection,
        firmware: &firmware,
    };
    if let Err(e) = output.create_metadata(&meta) {
        output.delete_targets(&targets);
        return Err(e);
    }

    // Success: targets stay, scratch goes.
    for id in delete_actions {
        cleanup.disarm(id);
    }
    if opts.debug_overlays {
        let kept = run_dir.keep();
        info!(dir = %kept.display(), "overlays kept for debugging");
    }
    cleanup.run();
    info!(name = %source.name, "conversion finished successfully");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::source::VnetKind;
    use crate::source::tests::minimal_source;

    #[test]
    fn finish_source_maps_networks_and_renames() {
        let mut source = minimal_source();
        source.nics.push(crate::source::Nic::new(
            None,
            None,
            "VM Network".into(),
            VnetKind::Network,
        ));

        let mut map = NetworkMap::new();
        map.add_network("VM Network:default").unwrap();
        let opts = PipelineOptions {
            network_map: map,
            rename: Some("renamed".into()),
            ..PipelineOptions::default()
        };

        finish_source(&mut source, &opts);
        assert_eq!(source.name, "renamed");
        assert_eq!(source.orig_name, "guest");
        assert_eq!(source.nics[0].vnet, "default");
        assert_eq!(source.nics[0].vnet_orig, "VM Network");
    }
}
