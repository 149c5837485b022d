//! Error types for vmshare

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the vmshare Error
pub type Result<T> = std::result::Result<T, Error>;

/// vmshare error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Unknown OS profile: {0}")]
    UnknownProfile(String),

    #[error("Profile {0} is installer-only and has no overlay fields")]
    ProfileIsInstallerOnly(String),

    #[error("Image missing: {0}")]
    ImageMissing(PathBuf),

    #[error("Installer image not found: {0}")]
    ImageNotFound(String),

    #[error("Not a bootable image: {0}")]
    NotABootableImage(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Hypervisor launch failed (exit {status}): {stderr}")]
    LaunchFailed { status: i32, stderr: String },

    #[error("Pidfile {path} did not appear within {seconds}s")]
    PidfileMissing { path: PathBuf, seconds: u64 },

    #[error("QMP error: {0}")]
    Qmp(String),

    #[error("No writable block device eligible for backup")]
    NoBackupDevice,

    #[error("VM {0} is not running")]
    VmNotRunning(String),

    #[error("No running VM for user {0}")]
    NoRunningVm(String),

    #[error("Snapshot quota exceeded: stored {stored_mb} MB + {requested_mb} MB > capacity {capacity_mb} MB")]
    QuotaExceeded {
        requested_mb: u64,
        stored_mb: u64,
        capacity_mb: u64,
    },

    #[error("Display already attached for instance {0}")]
    AlreadyAttached(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
