//! Error types for storage operations

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the storage components
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Symlink target does not exist: {target} (link {link})")]
    TargetMissing { link: PathBuf, target: PathBuf },

    #[error("Path exists but is not a symlink: {0}")]
    NotASymlink(PathBuf),

    #[error("Copy failed for {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Verification failed for {path}: {reason}")]
    VerificationFailure { path: PathBuf, reason: String },

    #[error("Device query failed for {device}: {reason}")]
    DeviceQuery { device: String, reason: String },

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Another process holds the lock at {0}")]
    LockHeld(PathBuf),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Wrap an I/O error with the path it occurred on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Attach a path to `std::io::Result` values
pub(crate) trait IoResultExt<T> {
    fn at(self, path: impl Into<PathBuf>) -> StorageResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> StorageResult<T> {
        self.map_err(|e| StorageError::io(path, e))
    }
}
