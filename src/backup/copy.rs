//! Tree copy with hard-link deduplication against a previous backup

use super::checksum::{copy_with_digest, sha256_file};
use crate::error::{StorageError, StorageResult};
use nix::unistd::{Gid, Uid, chown, geteuid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{Metadata, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Running counters for a copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyStats {
    /// Regular files seen, whether copied or linked
    pub files_processed: u64,
    /// Logical size of every processed file
    pub bytes_processed: u64,
    /// Bytes physically written; hard-linked files contribute nothing
    pub bytes_written: u64,
    pub files_linked: u64,
}

/// A completed backup used as the hard-link source
#[derive(Debug, Clone)]
pub struct LinkBase {
    pub dir: PathBuf,
    /// Digests from the base backup's manifest, keyed by relative path
    pub checksums: BTreeMap<String, String>,
}

impl LinkBase {
    /// Digest of the base copy if it matches `source_meta` by size, modification time and mode,
    /// and by ownership when `check_owner` is set
    fn unchanged(
        &self,
        rel: &Path,
        key: &str,
        source_meta: &Metadata,
        check_owner: bool,
    ) -> Option<String> {
        let prior = self.dir.join(rel);
        let prior_meta = std::fs::symlink_metadata(&prior).ok()?;
        if !prior_meta.is_file() || prior_meta.len() != source_meta.len() {
            return None;
        }
        if prior_meta.modified().ok()? != source_meta.modified().ok()? {
            return None;
        }
        if prior_meta.mode() != source_meta.mode() {
            return None;
        }
        if check_owner
            && (prior_meta.uid() != source_meta.uid() || prior_meta.gid() != source_meta.gid())
        {
            return None;
        }

        match self.checksums.get(key) {
            Some(digest) => Some(digest.clone()),
            None => sha256_file(&prior).ok(),
        }
    }
}

/// Copies `source` into `dest`, preserving permissions, modification times and symlinks
pub struct TreeCopier {
    source: PathBuf,
    dest: PathBuf,
    base: Option<LinkBase>,
    progress_interval: u64,
    /// Only root can give copies the source's owner
    preserve_owner: bool,
    stats: CopyStats,
    checksums: BTreeMap<String, String>,
}

impl TreeCopier {
    pub fn new(source: &Path, dest: &Path, base: Option<LinkBase>, progress_interval: u64) -> Self {
        Self {
            source: source.to_path_buf(),
            dest: dest.to_path_buf(),
            base,
            progress_interval: progress_interval.max(1),
            preserve_owner: geteuid().is_root(),
            stats: CopyStats::default(),
            checksums: BTreeMap::new(),
        }
    }

    pub fn stats(&self) -> CopyStats {
        self.stats
    }

    /// Per-file digests of everything copied or linked so far
    pub fn into_checksums(self) -> BTreeMap<String, String> {
        self.checksums
    }

    /// Copy the whole tree; stops at the first failure, leaving partial data in place
    pub fn run(&mut self) -> StorageResult<CopyStats> {
        std::fs::create_dir_all(&self.dest).map_err(copy_err(&self.dest))?;

        // Directory modes are applied last so read-only directories can still be filled
        let mut dir_modes: Vec<(PathBuf, Permissions)> = Vec::new();

        let walker = WalkDir::new(&self.source)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.source.clone());
                StorageError::Copy {
                    path,
                    source: io::Error::from(e),
                }
            })?;
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(&self.source) else {
                continue;
            };
            let target = self.dest.join(rel);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                std::fs::create_dir(&target).map_err(copy_err(&target))?;
                let meta = entry.metadata().map_err(|e| StorageError::Copy {
                    path: path.to_path_buf(),
                    source: io::Error::from(e),
                })?;
                // Snapshots stay owner-writable so retention can delete them
                let mode = meta.permissions().mode() | 0o200;
                dir_modes.push((target, Permissions::from_mode(mode)));
            } else if file_type.is_symlink() {
                let link = std::fs::read_link(path).map_err(copy_err(path))?;
                std::os::unix::fs::symlink(&link, &target).map_err(copy_err(&target))?;
            } else if file_type.is_file() {
                self.copy_file(path, rel, &target)?;
            } else {
                tracing::warn!(path = %path.display(), "Skipping special file");
            }
        }

        for (dir, perms) in dir_modes.into_iter().rev() {
            std::fs::set_permissions(&dir, perms).map_err(copy_err(&dir))?;
        }

        Ok(self.stats)
    }

    fn copy_file(&mut self, src: &Path, rel: &Path, target: &Path) -> StorageResult<()> {
        let meta = std::fs::metadata(src).map_err(copy_err(src))?;
        let key = rel.to_string_lossy().into_owned();

        let check_owner = self.preserve_owner;
        let linked = self.base.as_ref().and_then(|base| {
            base.unchanged(rel, &key, &meta, check_owner)
                .map(|d| (base.dir.join(rel), d))
        });

        let digest = match linked {
            Some((prior, digest)) => {
                std::fs::hard_link(&prior, target).map_err(copy_err(target))?;
                self.stats.files_linked += 1;
                digest
            }
            None => {
                let (bytes, digest) = copy_with_digest(src, target).map_err(copy_err(src))?;
                let modified = meta.modified().map_err(copy_err(src))?;
                OpenOptions::new()
                    .write(true)
                    .open(target)
                    .and_then(|f| f.set_modified(modified))
                    .map_err(copy_err(target))?;
                if self.preserve_owner {
                    chown(
                        target,
                        Some(Uid::from_raw(meta.uid())),
                        Some(Gid::from_raw(meta.gid())),
                    )
                    .map_err(|e| StorageError::Copy {
                        path: target.to_path_buf(),
                        source: io::Error::from(e),
                    })?;
                }
                std::fs::set_permissions(target, meta.permissions()).map_err(copy_err(target))?;
                self.stats.bytes_written += bytes;
                digest
            }
        };

        self.checksums.insert(key, digest);
        self.stats.files_processed += 1;
        self.stats.bytes_processed += meta.len();

        if self.stats.files_processed % self.progress_interval == 0 {
            tracing::info!(
                files = self.stats.files_processed,
                bytes = self.stats.bytes_processed,
                linked = self.stats.files_linked,
                "Backup progress"
            );
        }

        Ok(())
    }
}

fn copy_err(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Copy {
        path: path.to_path_buf(),
        source,
    }
}
