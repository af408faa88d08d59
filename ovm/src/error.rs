//! Error types surfaced by the VM store, disk operations, and the runner.
//!
//! Subsystem-local errors (`SocketError`, `TerminalError`, `GuestAgentError`,
//! console errors) live next to their modules.

use std::path::PathBuf;

/// Errors raised by VM store preconditions and configuration I/O.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ManagerError {
    /// No VM with the given name exists.
    #[error("VM '{0}' not found")]
    VmNotFound(String),

    /// A VM with the given name already exists.
    #[error("VM '{0}' already exists")]
    VmAlreadyExists(String),

    /// The name does not match `^[A-Za-z0-9][A-Za-z0-9_-]*$`.
    #[error("invalid VM name '{0}'")]
    InvalidVmName(String),

    /// A configuration value violates an invariant, or the VM is in a
    /// state that forbids the operation.
    #[error("{0}")]
    ConfigurationError(String),

    /// An underlying filesystem operation failed.
    #[error("filesystem error: {0}")]
    FileSystemError(#[from] std::io::Error),
}

/// Errors raised by disk image operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DiskError {
    /// The referenced image file does not exist.
    #[error("disk image not found: {0}")]
    FileNotFound(PathBuf),

    /// A disk image already exists at the target path.
    #[error("disk image already exists: {0}")]
    DiskAlreadyExists(PathBuf),

    /// Creating the image failed.
    #[error("failed to create disk image: {0}")]
    CreationFailed(std::io::Error),

    /// The requested size is malformed or below the minimum.
    #[error("invalid disk size: {0}")]
    InvalidSize(String),

    /// Copying an imported image failed.
    #[error("failed to copy disk image: {0}")]
    CopyFailed(std::io::Error),

    /// The resize request was rejected (shrinking) or the resize failed.
    #[error("failed to resize disk image: {0}")]
    ResizeFailed(String),
}

/// Errors raised by the daemon, spawner, and engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The runtime setup is inconsistent (missing files, bad flags).
    #[error("{0}")]
    ConfigurationError(String),

    /// The VM failed to boot; the message carries the log path when known.
    #[error("{0}")]
    BootError(String),

    /// The engine or daemon failed while the VM was running.
    #[error("{0}")]
    RuntimeError(String),

    /// A daemon for this VM is already running.
    #[error("VM '{0}' is already running")]
    AlreadyRunning(String),
}
