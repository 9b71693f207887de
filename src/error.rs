// ============================================
// ImageSmith - error.rs
// ============================================
// Typed errors for the servicing core.
//
// Every failure a caller can react to gets its own variant. Batch
// processing relies on this: a mount failure must be distinguishable
// from a policy violation or a hive that is still loaded.
// ============================================

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for servicing operations.
pub type Result<T> = std::result::Result<T, ServicingError>;

/// Errors that can occur while servicing an offline image.
#[derive(Error, Debug)]
pub enum ServicingError {
    /// I/O error from the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The container file is missing, corrupt, or not a WIM/ESD.
    #[error("Cannot read image container {path}: {detail}")]
    ContainerUnreadable { path: PathBuf, detail: String },

    /// An ISO (or other unsupported format) was passed directly.
    /// ISOs must be extracted or mounted externally first.
    #[error("Unsupported container format: {path} (extract the WIM/ESD from the ISO first)")]
    UnsupportedContainerFormat { path: PathBuf },

    /// A mount directory could not be created, validated, or reserved.
    #[error("Mount directory unavailable: {path}: {detail}")]
    DirectoryUnavailable { path: PathBuf, detail: String },

    /// The OS mount primitive failed.
    #[error("Failed to mount image at {path}: {detail}")]
    MountFailed { path: PathBuf, detail: String },

    /// The OS unmount primitive failed.
    #[error("Failed to dismount image at {path}: {detail}")]
    DismountFailed { path: PathBuf, detail: String },

    /// A policy violation: save on a read-only mount, write through a
    /// read-only hive handle, dismount with hives still loaded.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The offline hive file could not be loaded into the registry.
    #[error("Failed to load hive {hive}: {detail}")]
    HiveLoadFailed { hive: String, detail: String },

    /// The hive file is currently loaded and cannot be copied raw.
    #[error("Hive {hive} is currently loaded; unload it before backing it up")]
    HiveBusy { hive: String },

    /// Some but not all items of a batch failed.
    #[error("Batch finished with failures: {failed} of {total} item(s) failed")]
    PartialBatchFailure { failed: usize, total: usize },

    /// Configuration file or validation problem. Fatal for the run.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ServicingError {
    /// Creates a container-unreadable error with context.
    pub fn container_unreadable(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::ContainerUnreadable {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Creates a directory-unavailable error with context.
    pub fn directory_unavailable(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::DirectoryUnavailable {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Creates a mount-failed error with context.
    pub fn mount_failed(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::MountFailed {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Creates a dismount-failed error with context.
    pub fn dismount_failed(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::DismountFailed {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Creates a hive-load error with context.
    pub fn hive_load_failed(hive: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::HiveLoadFailed {
            hive: hive.into(),
            detail: detail.into(),
        }
    }
}
