//! CLI for the vmlift guest conversion tool.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vmlift::inspect::RootPolicy;
use vmlift::input::{INPUT_NAMES, InputOptions, InputPlugin};
use vmlift::netmap::NetworkMap;
use vmlift::output::{
    Allocation, OUTPUT_NAMES, OVF_FLAVOURS, OutputOptions, OutputPlugin,
};
use vmlift::pipeline::{self, PipelineOptions};

#[derive(Parser)]
#[command(
    name = "vmlift",
    version,
    about = "Convert a guest from a foreign hypervisor to run on KVM",
    after_help = "Example:\n  vmlift --ic qemu:///system -i libvirt guest -o local --os /var/tmp"
)]
struct Cli {
    /// Input mode.
    #[arg(short = 'i', value_name = "disk|libvirt|libvirtxml|ova|vmx", default_value = "libvirt")]
    input: String,

    /// Input connection URI (libvirt URI, or ssh:// for -i vmx).
    #[arg(long = "ic", value_name = "URI")]
    input_conn: Option<String>,

    /// Input disk format when it cannot be detected.
    #[arg(long = "if", value_name = "FORMAT")]
    input_format: Option<String>,

    /// Input-mode option, repeatable. `--io ?` lists them.
    #[arg(long = "io", value_name = "KEY[=VALUE]")]
    input_options: Vec<String>,

    /// File containing the input-side password.
    #[arg(long = "ip", value_name = "FILE")]
    input_password: Option<PathBuf>,

    /// Input transport.
    #[arg(long = "it", value_name = "ssh|vddk")]
    input_transport: Option<String>,

    /// Output mode.
    #[arg(
        short = 'o',
        value_name = "local|libvirt|null|qemu|glance|openstack|rhv|vdsm",
        default_value = "libvirt"
    )]
    output: String,

    /// Output allocation policy.
    #[arg(long = "oa", value_name = "sparse|preallocated")]
    output_alloc: Option<String>,

    /// Output connection URI.
    #[arg(long = "oc", value_name = "URI")]
    output_conn: Option<String>,

    /// Output disk format.
    #[arg(long = "of", value_name = "raw|qcow2")]
    output_format: Option<String>,

    /// Rename the guest at the target.
    #[arg(long = "on", value_name = "NAME")]
    output_name: Option<String>,

    /// Output-mode option, repeatable. `--oo ?` lists them.
    #[arg(long = "oo", value_name = "KEY[=VALUE]")]
    output_options: Vec<String>,

    /// File containing the output-side password.
    #[arg(long = "op", value_name = "FILE")]
    output_password: Option<PathBuf>,

    /// Output storage (directory, pool name, storage domain, …).
    #[arg(long = "os", value_name = "STORAGE")]
    output_storage: Option<String>,

    /// Map a source bridge: `in:out`, or a bare default `out`.
    #[arg(long, value_name = "IN:OUT")]
    bridge: Vec<String>,

    /// Map a source network: `in:out`, or a bare default `out`.
    #[arg(short = 'n', long, value_name = "IN:OUT")]
    network: Vec<String>,

    /// Pin one NIC by MAC: `HH:HH:HH:HH:HH:HH:{network|bridge}:out`.
    #[arg(long, value_name = "MAC:KIND:OUT")]
    mac: Vec<String>,

    /// Convert the source disks in place (no copy, no output metadata).
    #[arg(long)]
    in_place: bool,

    /// Stop after conversion; do not copy the disks.
    #[arg(long)]
    no_copy: bool,

    /// Compress qcow2 output files.
    #[arg(long)]
    compressed: bool,

    /// Keep the overlay files for debugging.
    #[arg(long, alias = "debug-overlay")]
    debug_overlays: bool,

    /// Print estimated target sizes and exit before copying.
    #[arg(long)]
    print_estimate: bool,

    /// Print the parsed source description and exit.
    #[arg(long)]
    print_source: bool,

    /// Root filesystem choice on multi-boot guests.
    #[arg(long, value_name = "ask|single|first|/dev/X", default_value = "ask")]
    root: String,

    /// Boot the guest right after `-o qemu` finishes.
    #[arg(long)]
    qemu_boot: bool,

    /// Machine-readable output; with no positional arguments, print
    /// the capability list and exit.
    #[arg(long)]
    machine_readable: bool,

    /// Verbose (debug) logging.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Accepted for backwards compatibility; has no effect.
    #[arg(long, value_name = "all|mp[,mp...]", hide = true)]
    no_trim: Option<String>,

    /// Accepted for backwards compatibility; has no effect.
    #[arg(long, value_name = "TYPE", hide = true)]
    vmtype: Option<String>,

    /// Guest name (libvirt) or path (disk/libvirtxml/ova/vmx).
    #[arg(value_name = "GUEST|FILE")]
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(cli) {
        eprintln!("vmlift: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let default = if cli.quiet {
        "warn"
    } else if cli.verbose > 0 {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vmlift={default},vmlift_cli={default}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    // Capability listing: `--machine-readable` with no work to do.
    if cli.machine_readable && cli.args.is_empty() {
        println!("virt-v2v");
        println!("vmlift {}", env!("CARGO_PKG_VERSION"));
        for name in INPUT_NAMES {
            println!("input:{name}");
        }
        for name in OUTPUT_NAMES {
            println!("output:{name}");
        }
        for flavour in OVF_FLAVOURS {
            println!("ovf:{flavour}");
        }
        return Ok(());
    }

    // `--io ?` / `--oo ?` list the mode-specific options.
    if cli.input_options.iter().any(|o| o == "?") {
        print!("{}", InputPlugin::option_help(&cli.input));
        return Ok(());
    }
    if cli.output_options.iter().any(|o| o == "?") {
        print!("{}", OutputPlugin::option_help(&cli.output));
        return Ok(());
    }

    let [arg] = cli.args.as_slice() else {
        bail!("expected exactly one guest name or file argument (see --help)");
    };

    let input_opts = InputOptions {
        conn: cli.input_conn.clone(),
        format: cli.input_format.clone(),
        options: parse_kv(&cli.input_options)?,
        password_file: cli.input_password.clone(),
        transport: cli.input_transport.clone(),
    };
    let mut input = InputPlugin::from_cli(&cli.input, arg, input_opts)?;

    let alloc = match cli.output_alloc.as_deref() {
        None | Some("sparse") => Allocation::Sparse,
        Some("preallocated") => Allocation::Preallocated,
        Some(other) => bail!("invalid -oa '{other}': expected sparse or preallocated"),
    };
    if let Some(format) = cli.output_format.as_deref()
        && format != "raw"
        && format != "qcow2"
    {
        bail!("invalid -of '{format}': expected raw or qcow2");
    }
    let output_opts = OutputOptions {
        alloc,
        format: cli.output_format.clone(),
        conn: cli.output_conn.clone(),
        name: cli.output_name.clone(),
        options: parse_kv(&cli.output_options)?,
        password_file: cli.output_password.clone(),
        storage: cli.output_storage.clone(),
        qemu_boot: cli.qemu_boot,
    };
    let mut output = OutputPlugin::from_cli(&cli.output, output_opts)?;

    let mut network_map = NetworkMap::new();
    for rule in &cli.mac {
        network_map.add_mac(rule)?;
    }
    for rule in &cli.network {
        network_map.add_network(rule)?;
    }
    for rule in &cli.bridge {
        network_map.add_bridge(rule)?;
    }

    let opts = PipelineOptions {
        root_policy: cli.root.parse::<RootPolicy>()?,
        in_place: cli.in_place,
        no_copy: cli.no_copy,
        compressed: cli.compressed,
        debug_overlays: cli.debug_overlays,
        print_estimate: cli.print_estimate,
        print_source: cli.print_source,
        network_map,
        rename: cli.output_name.clone(),
    };

    let stdin = std::io::stdin();
    let mut locked: Box<dyn BufRead> = Box::new(stdin.lock());
    pipeline::run(&mut input, &mut output, &opts, &mut locked)?;
    Ok(())
}

/// Parses repeated `key[=value]` options; a bare key means `true`.
fn parse_kv(options: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for opt in options {
        let (key, value) = match opt.split_once('=') {
            Some((k, v)) => (k, v),
            None => (opt.as_str(), "true"),
        };
        if key.is_empty() {
            bail!("empty option key in '{opt}'");
        }
        if map.insert(key.to_owned(), value.to_owned()).is_some() {
            bail!("option '{key}' given more than once");
        }
    }
    Ok(map)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_kv_handles_bare_keys_and_duplicates() {
        let map = parse_kv(&["a=1".into(), "flag".into()]).unwrap();
        assert_eq!(map["a"], "1");
        assert_eq!(map["flag"], "true");
        assert!(parse_kv(&["a=1".into(), "a=2".into()]).is_err());
    }

    #[test]
    fn cli_parses_the_documented_surface() {
        let cli = Cli::parse_from([
            "vmlift",
            "-i",
            "libvirt",
            "--ic",
            "qemu:///system",
            "win7",
            "-o",
            "qemu",
            "--os",
            "/tmp/d",
            "--oa",
            "preallocated",
            "--of",
            "qcow2",
            "-n",
            "VM Network:default",
            "--mac",
            "52:54:00:00:00:01:bridge:br0",
            "--root",
            "first",
            "--print-source",
        ]);
        assert_eq!(cli.input, "libvirt");
        assert_eq!(cli.output, "qemu");
        assert_eq!(cli.output_storage.as_deref(), Some("/tmp/d"));
        assert_eq!(cli.output_alloc.as_deref(), Some("preallocated"));
        assert_eq!(cli.network, vec!["VM Network:default"]);
        assert_eq!(cli.args, vec!["win7"]);
        assert!(cli.print_source);
    }

    #[test]
    fn back_compat_flags_are_accepted() {
        let cli = Cli::parse_from([
            "vmlift", "-i", "disk", "/tmp/a.img", "--no-trim", "all", "--vmtype", "server",
        ]);
        assert_eq!(cli.no_trim.as_deref(), Some("all"));
        assert_eq!(cli.vmtype.as_deref(), Some("server"));
    }
}
