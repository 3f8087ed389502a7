//! Error types for the conversion pipeline.
//!
//! The pipeline is fail-fast: every variant except [`Error::Cleanup`]
//! aborts the run. Cleanup failures are downgraded to logged warnings by
//! the at-exit machinery.

/// Alias for `Result<T, vmlift::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the conversion pipeline.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad command line: unknown mode, malformed mapping rule, duplicate
    /// single-use option.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The source could not be read: unreachable origin, malformed
    /// XML/VMX/OVF, manifest digest mismatch.
    #[error("input: {0}")]
    Input(String),

    /// The block-data server failed: tool missing or too old, plugin
    /// load failure, startup timeout.
    #[error("block server: {0}")]
    Supervisor(String),

    /// Overlay creation failed or produced a file with no backing file.
    #[error("overlay: {0}")]
    Overlay(String),

    /// Guest inspection failed: no roots, multi-boot under `single`,
    /// invalid root device, OS not installed.
    #[error("inspection: {0}")]
    Inspection(String),

    /// The guest could not be converted: unknown guest type, missing
    /// driver under a caller-mandated capability.
    #[error("conversion: {0}")]
    Conversion(String),

    /// `qemu-img convert` (or equivalent) failed.
    #[error("copy: {0}")]
    Copy(String),

    /// The output side failed: target tooling missing, auth failure,
    /// quota exceeded, state-wait timeout.
    #[error("output: {0}")]
    Output(String),

    /// A cleanup action failed. Never fatal; logged and swallowed.
    #[error("cleanup: {0}")]
    Cleanup(String),

    /// Registry hive parse/edit failure during Windows conversion.
    #[error("registry hive: {0}")]
    Hive(#[from] vmlift_hive::Error),

    /// An I/O error from file or process handling.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Formats the stderr tail of a failed external command into an
    /// error message.
    pub(crate) fn from_command(kind: fn(String) -> Self, tool: &str, stderr: &[u8]) -> Self {
        let tail = String::from_utf8_lossy(stderr);
        let tail = tail.trim();
        if tail.is_empty() {
            kind(format!("{tool} failed"))
        } else {
            kind(format!("{tool} failed: {tail}"))
        }
    }
}
