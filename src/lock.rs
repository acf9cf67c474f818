//! Advisory file locks guarding a storage root against concurrent writers

use crate::error::{IoResultExt, StorageError, StorageResult};
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Lock file name used for backup create/cleanup under `backup_root`
pub const BACKUP_LOCK: &str = ".backup.lock";
/// Lock file name used for symlink create/repair under `app_root`
pub const SYMLINK_LOCK: &str = ".symlinks.lock";

/// Exclusive lock held for the lifetime of the value
#[derive(Debug)]
pub struct StorageLock {
    file: File,
    path: PathBuf,
}

impl StorageLock {
    /// Take the lock without waiting; fails with [`StorageError::LockHeld`] when another
    /// process already owns it
    pub fn try_acquire(dir: &Path, name: &str) -> StorageResult<Self> {
        std::fs::create_dir_all(dir).at(dir)?;
        let path = dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .at(&path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Lock acquired");
                Ok(Self { file, path })
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(StorageError::LockHeld(path)),
            Err(err) => Err(StorageError::io(path, err)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}
