//! Core error types.
//!
//! Library-level code returns `Result<T, LpmdError>`; the binary and the
//! event loop glue code use `anyhow::Result` at the call site, the same
//! split the teacher daemon uses between its typed module errors and
//! `anyhow::Result` in `main.rs`/`qemu/supervisor.rs`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LpmdError {
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("failed to open {path}: {source}")]
    SysfsOpen { path: PathBuf, source: io::Error },

    #[error("failed to read {path}: {source}")]
    SysfsRead { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    SysfsWrite { path: PathBuf, source: io::Error },

    #[error("malformed cpu list: {0}")]
    MalformedCpuList(String),

    #[error("malformed config: {0}")]
    MalformedConfig(String),

    #[error("netlink init failed: {0}")]
    NetlinkInit(String),

    #[error("dbus call failed: {0}")]
    DbusCall(String),

    #[error("perf_event_open failed: {0}")]
    PerfEventOpen(String),

    #[error("msr io failed on {path}: {source}")]
    MsrIo { path: PathBuf, source: io::Error },

    #[error("cpumask size mismatch: expected {expected}, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    /// Used to skip a tick without aborting the event loop (spec.md §7).
    #[error("transient error, tick skipped")]
    Transient,
}

impl LpmdError {
    /// True for errors that should abort startup rather than be logged and
    /// skipped at tick time (spec.md §7 propagation policy).
    pub fn is_fatal_at_init(&self) -> bool {
        matches!(
            self,
            LpmdError::UnsupportedPlatform(_)
                | LpmdError::MalformedConfig(_)
                | LpmdError::SizeMismatch { .. }
        )
    }
}
