//! Typed errors for the topology pipeline

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the scan/aggregate/publish pipeline.
///
/// Transport and store failures abandon the current cycle; the next trigger
/// retries implicitly. Only setup errors (notify-file path, sysfs layout) are
/// allowed to abort startup.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("pod resources call {call} failed: {message}")]
    PodResources { call: &'static str, message: String },

    #[error("pod resources call {call} timed out after {timeout:?}")]
    Timeout {
        call: &'static str,
        timeout: Duration,
    },

    #[error("zone {zone} is missing a distance entry for {dest}")]
    MissingDistance { zone: String, dest: String },

    #[error("notify file {path}: {reason}")]
    NotifyFile { path: PathBuf, reason: String },

    #[error("failed to read sysfs entry {path}: {source}")]
    Sysfs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed sysfs data in {path}: {reason}")]
    SysfsParse { path: PathBuf, reason: String },

    #[error("filesystem watch setup failed: {0}")]
    Watch(#[from] notify::Error),

    #[error("object store {op} failed: {message}")]
    Store { op: &'static str, message: String },

    #[error("event stream already taken")]
    EventStreamTaken,
}
