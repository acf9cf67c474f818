//! SHA-256 digests and per-backup checksum manifests

use crate::error::{IoResultExt, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const BUF_SIZE: usize = 1024 * 1024;

/// Hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Copy `src` to `dst`, hashing the bytes as they are read
///
/// Returns the number of bytes copied and the hex digest of the source data.
pub fn copy_with_digest(src: &Path, dst: &Path) -> std::io::Result<(u64, String)> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    let mut copied = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        copied += n as u64;
    }
    writer.sync_all()?;

    Ok((copied, hex::encode(hasher.finalize())))
}

/// Digest over every `(relative path, file digest)` pair, in path order
pub fn summary_digest(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, digest) in files {
        hasher.update(digest.as_bytes());
        hasher.update(b"  ");
        hasher.update(path.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Checksums of every regular file in a backup, keyed by path relative to the backup root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub files: BTreeMap<String, String>,
    pub summary: String,
}

impl Manifest {
    pub fn new(backup_id: &str, files: BTreeMap<String, String>) -> Self {
        let summary = summary_digest(&files);
        Self {
            backup_id: backup_id.to_string(),
            created_at: Utc::now(),
            files,
            summary,
        }
    }

    pub fn path_for(manifest_dir: &Path, backup_id: &str) -> PathBuf {
        manifest_dir.join(format!("{}.json", backup_id))
    }

    /// Load the manifest for `backup_id`, or `None` if it was never written
    pub fn load(manifest_dir: &Path, backup_id: &str) -> StorageResult<Option<Self>> {
        let path = Self::path_for(manifest_dir, backup_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(path, e)),
        };
        let manifest = serde_json::from_str(&content)
            .map_err(std::io::Error::other)
            .at(&path)?;
        Ok(Some(manifest))
    }

    /// Write atomically under `manifest_dir`
    pub fn save(&self, manifest_dir: &Path) -> StorageResult<PathBuf> {
        std::fs::create_dir_all(manifest_dir).at(manifest_dir)?;
        let path = Self::path_for(manifest_dir, &self.backup_id);
        let json = serde_json::to_vec_pretty(self)
            .map_err(std::io::Error::other)
            .at(&path)?;

        let temp_file = path.with_extension("json.tmp");
        {
            let mut file = File::create(&temp_file).at(&temp_file)?;
            file.write_all(&json).at(&temp_file)?;
            file.sync_all().at(&temp_file)?;
        }
        std::fs::rename(&temp_file, &path).at(&path)?;
        Ok(path)
    }

    pub fn remove(manifest_dir: &Path, backup_id: &str) -> StorageResult<()> {
        let path = Self::path_for(manifest_dir, backup_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // sha256("hello world")
    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), HELLO);
    }

    #[test]
    fn test_copy_with_digest_matches_hash() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::write(&src, b"hello world").unwrap();

        let (bytes, digest) = copy_with_digest(&src, &dst).unwrap();
        assert_eq!(bytes, 11);
        assert_eq!(digest, HELLO);
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello world");
    }

    #[test]
    fn test_summary_depends_on_paths_and_contents() {
        let a = BTreeMap::from([("a.bin".to_string(), HELLO.to_string())]);
        let b = BTreeMap::from([("b.bin".to_string(), HELLO.to_string())]);
        assert_ne!(summary_digest(&a), summary_digest(&b));
        assert_eq!(summary_digest(&a), summary_digest(&a.clone()));
    }

    #[test]
    fn test_manifest_save_load_remove() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("manifests");
        let manifest = Manifest::new(
            "active_full_20250101_000000_ab12",
            BTreeMap::from([("model.safetensors".to_string(), HELLO.to_string())]),
        );

        manifest.save(&dir).unwrap();
        let loaded = Manifest::load(&dir, &manifest.backup_id).unwrap().unwrap();
        assert_eq!(loaded, manifest);

        Manifest::remove(&dir, &manifest.backup_id).unwrap();
        assert!(Manifest::load(&dir, &manifest.backup_id).unwrap().is_none());
        // Removing twice is fine
        Manifest::remove(&dir, &manifest.backup_id).unwrap();
    }
}
