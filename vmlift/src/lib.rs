//! Convert foreign hypervisor guests so they boot on KVM/QEMU.
//!
//! `vmlift` reads a guest (metadata plus disk images) from one of
//! several source hypervisor representations, rewrites the guest
//! through a copy-on-write overlay so it boots on KVM, and publishes
//! the converted disks plus target-side metadata.
//!
//! The pipeline, end to end:
//!
//! ```text
//! input plugin ──> Source + disk URIs
//!       │                 │ (nbdkit children for remote disks)
//!       ▼                 ▼
//! qcow2 overlays ──> sandboxed guest ──> inspect ──> convert
//!       │                                               │
//!       ▼                                               ▼
//! qemu-img convert ──> output plugin targets + metadata (XML/OVF/…)
//! ```
//!
//! The crate is a library; the `vmlift` binary in `vmlift-cli` maps the
//! command line onto [`input::InputPlugin`], [`output::OutputPlugin`]
//! and [`pipeline::run`].

pub mod atexit;
pub mod convert;
pub mod copy;
pub mod error;
pub mod estimate;
pub mod guest;
pub mod input;
pub mod inspect;
pub mod netmap;
pub mod nbdsrv;
pub mod output;
pub mod overlay;
pub mod ovf;
pub mod pipeline;
pub mod qemuimg;
pub mod source;
pub mod target;
pub mod xml;

pub use error::{Error, Result};
