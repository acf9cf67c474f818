//! Filesystem capacity, mount table, and block device discovery

use crate::error::{StorageError, StorageResult};
use nix::sys::statvfs::statvfs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Byte and inode counters for the filesystem containing a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilesystemStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// Bytes available to unprivileged users
    pub free_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

impl FilesystemStats {
    pub fn query(path: &Path) -> StorageResult<Self> {
        let st = statvfs(path).map_err(|e| StorageError::io(path, std::io::Error::from(e)))?;
        let frsize = st.fragment_size() as u64;
        let blocks = st.blocks() as u64;
        let blocks_free = st.blocks_free() as u64;

        Ok(Self {
            total_bytes: blocks * frsize,
            used_bytes: blocks.saturating_sub(blocks_free) * frsize,
            free_bytes: st.blocks_available() as u64 * frsize,
            total_inodes: st.files() as u64,
            free_inodes: st.files_free() as u64,
        })
    }

    pub fn used_inodes(&self) -> u64 {
        self.total_inodes.saturating_sub(self.free_inodes)
    }

    /// Used fraction of capacity in `[0, 1]`
    pub fn usage_fraction(&self) -> f64 {
        ratio(self.used_bytes, self.total_bytes)
    }

    /// Used fraction of inodes in `[0, 1]`; filesystems without fixed inode tables report 0
    pub fn inode_usage_fraction(&self) -> f64 {
        ratio(self.used_inodes(), self.total_inodes)
    }
}

fn ratio(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64
    }
}

/// A mounted filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub device: String,
    pub mount_point: PathBuf,
    pub filesystem: String,
}

/// Parse `/proc/mounts` content
pub fn parse_mounts(content: &str) -> Vec<MountInfo> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let filesystem = fields.next()?;
            Some(MountInfo {
                device: unescape_mount_field(device),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                filesystem: filesystem.to_string(),
            })
        })
        .collect()
}

/// The mount with the longest mount point containing `path`
pub fn find_mount<'a>(mounts: &'a [MountInfo], path: &Path) -> Option<&'a MountInfo> {
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.components().count())
}

/// Look up the mount containing `path` using the live mount table
pub fn mount_for(path: &Path) -> Option<MountInfo> {
    let content = std::fs::read_to_string("/proc/mounts").ok()?;
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mounts = parse_mounts(&content);
    find_mount(&mounts, &resolved).cloned()
}

// Mount fields escape space, tab, newline and backslash as \ooo
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let code = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(code as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whole-disk block devices under `dev_dir`: NVMe namespaces (`nvme0n1`) and SCSI/SATA
/// disks (`sda`), excluding partitions
pub fn enumerate_devices(dev_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dev_dir) else {
        tracing::warn!(dir = %dev_dir.display(), "Could not enumerate storage devices");
        return Vec::new();
    };

    let mut devices: Vec<String> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|name| is_nvme_namespace(name) || is_sata_disk(name))
        .map(|name| dev_dir.join(name).display().to_string())
        .collect();

    devices.sort();
    devices
}

fn is_nvme_namespace(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("nvme") else {
        return false;
    };
    let Some((controller, namespace)) = rest.split_once('n') else {
        return false;
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(controller) && digits(namespace)
}

fn is_sata_disk(name: &str) -> bool {
    name.len() == 3
        && name.starts_with("sd")
        && name.as_bytes()[2].is_ascii_lowercase()
}
