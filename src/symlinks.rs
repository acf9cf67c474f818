//! Symlink lifecycle between the application tree and model storage
//!
//! The manager owns a declarative set of links:
//! ```text
//! /opt/citadel/models           -> /mnt/citadel-models/active        (primary)
//! /opt/citadel/downloads        -> /mnt/citadel-models/downloads     (primary)
//! /opt/citadel/staging          -> /mnt/citadel-models/staging       (primary)
//! /opt/citadel/model-links/phi3 -> /mnt/citadel-models/active/Phi-3… (convenience)
//! ~/.cache/huggingface          -> /mnt/citadel-models/cache         (cache)
//! ```
//! and can create, verify, and repair them.

use crate::config::StorageConfig;
use crate::error::{IoResultExt, StorageError, StorageResult};
use crate::layout::create_dir_with_mode;
use crate::lock::{SYMLINK_LOCK, StorageLock};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which part of the layout a link belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Application directories redirected into model storage
    Primary,
    /// Short per-model aliases under `model-links/`
    Convenience,
    /// User cache directories redirected into the cache root
    Cache,
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Convenience => write!(f, "convenience"),
            Self::Cache => write!(f, "cache"),
        }
    }
}

/// Observed state of a link on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkHealth {
    /// Not inspected yet
    Unchecked,
    Healthy,
    /// Nothing exists at the link path
    Missing,
    /// A regular file or directory occupies the link path
    NotSymlink,
    /// The link exists but its target does not
    TargetMissing,
    /// The link resolves to an existing path other than the configured target
    Misdirected { actual: PathBuf },
}

/// A configured link and its last observed health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkEntry {
    pub link_path: PathBuf,
    pub target_path: PathBuf,
    pub kind: LinkKind,
    pub health: LinkHealth,
}

impl SymlinkEntry {
    pub fn new(link_path: PathBuf, target_path: PathBuf, kind: LinkKind) -> Self {
        Self {
            link_path,
            target_path,
            kind,
            health: LinkHealth::Unchecked,
        }
    }

    /// Whether the entry needs repair
    ///
    /// A user cache directory that already holds real data is left alone and is not
    /// considered broken.
    pub fn is_broken(&self) -> bool {
        match self.health {
            LinkHealth::Missing | LinkHealth::TargetMissing => true,
            LinkHealth::NotSymlink => self.kind != LinkKind::Cache,
            LinkHealth::Unchecked | LinkHealth::Healthy | LinkHealth::Misdirected { .. } => false,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health == LinkHealth::Healthy
    }

    /// Human-readable problem description, if any
    pub fn issue(&self) -> Option<String> {
        let link = self.link_path.display();
        match &self.health {
            LinkHealth::Healthy | LinkHealth::Unchecked => None,
            LinkHealth::Missing => Some(format!("Missing symlink: {}", link)),
            LinkHealth::NotSymlink => Some(format!("Not a symlink: {}", link)),
            LinkHealth::TargetMissing => Some(format!(
                "Broken symlink: {} -> {}",
                link,
                self.target_path.display()
            )),
            LinkHealth::Misdirected { actual } => Some(format!(
                "Symlink {} points to {} instead of {}",
                link,
                actual.display(),
                self.target_path.display()
            )),
        }
    }
}

/// What `create_symlinks` did for a single entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkAction {
    Created,
    Replaced,
    Unchanged,
    Skipped,
}

/// Result of a repair pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairOutcome {
    /// Links removed and recreated
    pub repaired: Vec<PathBuf>,
    /// Broken links that could not be fixed, with the reason
    pub unrepaired: Vec<(PathBuf, String)>,
}

impl RepairOutcome {
    pub fn repaired_count(&self) -> usize {
        self.repaired.len()
    }
}

/// Creates, verifies, and repairs the configured link set
pub struct SymlinkManager {
    config: Arc<StorageConfig>,
}

impl SymlinkManager {
    pub fn new(config: Arc<StorageConfig>) -> Self {
        Self { config }
    }

    /// The declarative link set derived from configuration
    pub fn planned_entries(&self) -> Vec<SymlinkEntry> {
        let paths = &self.config.paths;
        let mut entries = vec![
            SymlinkEntry::new(
                paths.app_models.clone(),
                paths.models_active.clone(),
                LinkKind::Primary,
            ),
            SymlinkEntry::new(
                paths.app_root.join("downloads"),
                paths.downloads_root.clone(),
                LinkKind::Primary,
            ),
            SymlinkEntry::new(
                paths.app_root.join("staging"),
                paths.models_staging.clone(),
                LinkKind::Primary,
            ),
        ];

        let links_dir = paths.model_links_dir();
        for alias in self.config.models.convenience_links.keys() {
            if let Some(dir) = self.config.models.resolve_alias(alias) {
                entries.push(SymlinkEntry::new(
                    links_dir.join(alias),
                    paths.models_active.join(dir),
                    LinkKind::Convenience,
                ));
            }
        }

        if self.config.symlinks.link_user_caches
            && let Some(home) = self.config.symlinks.cache_home()
        {
            let cache = home.join(".cache");
            entries.push(SymlinkEntry::new(
                cache.join("huggingface"),
                paths.hf_cache.clone(),
                LinkKind::Cache,
            ));
            entries.push(SymlinkEntry::new(
                cache.join("torch"),
                paths.torch_cache.clone(),
                LinkKind::Cache,
            ));
        }

        entries
    }

    /// Create every configured link
    ///
    /// Existing links to the right target are left as they are. Links pointing to another
    /// existing path are replaced only when `force_recreate` is set; dangling links are always
    /// replaced. Fails on the first link that cannot be
    /// created; links created before the failure are kept.
    pub fn create_symlinks(&self) -> StorageResult<Vec<SymlinkEntry>> {
        let _lock = StorageLock::try_acquire(&self.config.paths.app_root, SYMLINK_LOCK)?;

        let entries = self.planned_entries();
        let mut created = 0;
        for entry in &entries {
            let action = self.create_one(entry, self.config.symlinks.force_recreate)?;
            if matches!(action, LinkAction::Created | LinkAction::Replaced) {
                created += 1;
            }
        }

        tracing::info!(
            total = entries.len(),
            created = created,
            "Symlinks created"
        );

        Ok(verify_symlinks(&entries))
    }

    /// Verify the configured link set
    pub fn verify_all(&self) -> Vec<SymlinkEntry> {
        verify_symlinks(&self.planned_entries())
    }

    /// Remove and recreate every broken entry; healthy entries are untouched
    pub fn repair_symlinks(&self, entries: &[SymlinkEntry]) -> StorageResult<RepairOutcome> {
        let _lock = StorageLock::try_acquire(&self.config.paths.app_root, SYMLINK_LOCK)?;

        let mut outcome = RepairOutcome::default();

        for entry in verify_symlinks(entries) {
            if !entry.is_broken() {
                continue;
            }

            match self.repair_one(&entry) {
                Ok(()) => {
                    tracing::info!(
                        link = %entry.link_path.display(),
                        target = %entry.target_path.display(),
                        "Repaired symlink"
                    );
                    outcome.repaired.push(entry.link_path.clone());
                }
                Err(reason) => {
                    tracing::warn!(
                        link = %entry.link_path.display(),
                        reason = %reason,
                        "Symlink left unrepaired"
                    );
                    outcome.unrepaired.push((entry.link_path.clone(), reason));
                }
            }
        }

        crate::metrics::record_symlink_repairs(outcome.repaired.len());
        tracing::info!(
            repaired = outcome.repaired.len(),
            unrepaired = outcome.unrepaired.len(),
            "Symlink repair complete"
        );

        Ok(outcome)
    }

    /// Repair the configured link set
    pub fn repair_all(&self) -> StorageResult<RepairOutcome> {
        self.repair_symlinks(&self.planned_entries())
    }

    fn repair_one(&self, entry: &SymlinkEntry) -> Result<(), String> {
        // Model directories are populated by downloads, never by repair
        if entry.kind == LinkKind::Convenience && !entry.target_path.exists() {
            return Err(format!(
                "model directory {} does not exist",
                entry.target_path.display()
            ));
        }

        match entry.health {
            LinkHealth::TargetMissing => {
                std::fs::remove_file(&entry.link_path).map_err(|e| e.to_string())?;
            }
            LinkHealth::NotSymlink => {
                // Only an empty directory may be replaced; real data is never deleted
                std::fs::remove_dir(&entry.link_path).map_err(|e| {
                    format!("refusing to replace non-symlink path: {}", e)
                })?;
            }
            _ => {}
        }

        self.create_one(entry, true)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn create_one(&self, entry: &SymlinkEntry, force: bool) -> StorageResult<LinkAction> {
        let settings = &self.config.symlinks;
        let link = &entry.link_path;
        let target = &entry.target_path;

        if settings.verify_targets && !target.exists() {
            if settings.create_missing_targets {
                create_dir_with_mode(target, settings.directory_mode()?)?;
                tracing::info!(target = %target.display(), "Created missing target");
            } else {
                return Err(StorageError::TargetMissing {
                    link: link.clone(),
                    target: target.clone(),
                });
            }
        }

        match std::fs::symlink_metadata(link) {
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(link, e)),
            Ok(meta) if meta.file_type().is_symlink() => {
                let current = std::fs::read_link(link).at(link)?;
                if &current == target {
                    return Ok(LinkAction::Unchanged);
                }
                let dangling = !resolve_link(link, &current).exists();
                if !force && !dangling {
                    tracing::warn!(
                        link = %link.display(),
                        current = %current.display(),
                        expected = %target.display(),
                        "Symlink points elsewhere, leaving it (force_recreate disabled)"
                    );
                    return Ok(LinkAction::Skipped);
                }
                std::fs::remove_file(link).at(link)?;
                make_link(target, link)?;
                tracing::info!(
                    link = %link.display(),
                    target = %target.display(),
                    dangling = dangling,
                    "Replaced symlink"
                );
                return Ok(LinkAction::Replaced);
            }
            Ok(meta) => {
                if entry.kind == LinkKind::Cache {
                    tracing::warn!(
                        link = %link.display(),
                        "User cache directory already exists, not linking"
                    );
                    return Ok(LinkAction::Skipped);
                }
                if force && meta.is_dir() && std::fs::remove_dir(link).is_ok() {
                    make_link(target, link)?;
                    return Ok(LinkAction::Replaced);
                }
                return Err(StorageError::NotASymlink(link.clone()));
            }
        }

        if let Some(parent) = link.parent() {
            create_dir_with_mode(parent, settings.directory_mode()?)?;
        }
        make_link(target, link)?;
        tracing::info!(link = %link.display(), target = %target.display(), "Created symlink");

        Ok(LinkAction::Created)
    }
}

fn make_link(target: &Path, link: &Path) -> StorageResult<()> {
    std::os::unix::fs::symlink(target, link).at(link)
}

/// Classify each entry against the filesystem without modifying anything
pub fn verify_symlinks(entries: &[SymlinkEntry]) -> Vec<SymlinkEntry> {
    entries
        .iter()
        .map(|entry| SymlinkEntry {
            health: inspect_link(&entry.link_path, &entry.target_path),
            ..entry.clone()
        })
        .collect()
}

// Relative link contents are resolved against the link's directory
fn resolve_link(link: &Path, raw: &Path) -> PathBuf {
    match link.parent() {
        Some(parent) if raw.is_relative() => parent.join(raw),
        _ => raw.to_path_buf(),
    }
}

fn inspect_link(link: &Path, expected: &Path) -> LinkHealth {
    let meta = match std::fs::symlink_metadata(link) {
        Ok(meta) => meta,
        Err(_) => return LinkHealth::Missing,
    };
    if !meta.file_type().is_symlink() {
        return LinkHealth::NotSymlink;
    }

    let raw = match std::fs::read_link(link) {
        Ok(raw) => raw,
        Err(_) => return LinkHealth::TargetMissing,
    };
    let resolved = resolve_link(link, &raw);

    if !resolved.exists() {
        return LinkHealth::TargetMissing;
    }

    let same = match (resolved.canonicalize(), expected.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };

    if same {
        LinkHealth::Healthy
    } else {
        LinkHealth::Misdirected { actual: raw }
    }
}
