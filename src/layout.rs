//! Directory layout creation and mount prerequisites

use crate::config::StorageConfig;
use crate::error::{IoResultExt, StorageResult};
use nix::unistd::{AccessFlags, access};
use serde::Serialize;
use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Outcome of the prerequisite check
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrerequisiteReport {
    pub missing_mounts: Vec<PathBuf>,
    pub permission_issues: Vec<PathBuf>,
}

impl PrerequisiteReport {
    pub fn is_ok(&self) -> bool {
        self.missing_mounts.is_empty() && self.permission_issues.is_empty()
    }
}

/// Check that the storage mounts exist and the roots are readable and writable
pub fn verify_prerequisites(config: &StorageConfig) -> PrerequisiteReport {
    let paths = &config.paths;
    let mut report = PrerequisiteReport::default();

    for mount in [&paths.models_root, &paths.backup_root] {
        if !mount.exists() {
            report.missing_mounts.push(mount.clone());
        }
    }

    for root in [&paths.app_root, &paths.models_root] {
        if root.exists() && access(root.as_path(), AccessFlags::R_OK | AccessFlags::W_OK).is_err()
        {
            report.permission_issues.push(root.clone());
        }
    }

    if report.is_ok() {
        tracing::info!("Storage prerequisites verified");
    } else {
        tracing::warn!(
            missing_mounts = ?report.missing_mounts,
            permission_issues = ?report.permission_issues,
            "Storage prerequisites not met"
        );
    }

    report
}

/// Every directory the layout requires, in creation order
pub fn required_directories(config: &StorageConfig) -> Vec<PathBuf> {
    let p = &config.paths;
    let mut dirs = vec![
        p.models_active.clone(),
        p.models_archive.clone(),
        p.cache_root.clone(),
        p.downloads_root.clone(),
        p.models_staging.clone(),
        p.models_archive.join("monthly"),
        p.models_archive.join("weekly"),
        p.models_archive.join("daily"),
        p.cache_root.join("tokenizers"),
        p.cache_root.join("compiled"),
        p.cache_root.join("temporary"),
        p.hf_cache.clone(),
        p.torch_cache.clone(),
        p.vllm_cache.clone(),
        p.transformers_cache.clone(),
        p.backup_models.clone(),
        p.backup_system.clone(),
        p.app_scripts.clone(),
        p.app_configs.clone(),
        p.app_logs.clone(),
    ];

    dirs.extend(
        config
            .models
            .model_directories
            .values()
            .map(|name| p.models_active.join(name)),
    );

    let mut seen = HashSet::new();
    dirs.retain(|d| seen.insert(d.clone()));
    dirs
}

/// Create the directory layout; returns the directories that did not exist before
pub fn create_directory_structure(config: &StorageConfig) -> StorageResult<Vec<PathBuf>> {
    let mode = config.symlinks.directory_mode()?;
    let mut created = Vec::new();

    for dir in required_directories(config) {
        created.extend(create_dir_with_mode(&dir, mode)?);
    }

    tracing::info!(count = created.len(), "Directory structure created");
    Ok(created)
}

/// `create_dir_all` that applies `mode` to each directory it creates and reports them
pub fn create_dir_with_mode(dir: &Path, mode: u32) -> StorageResult<Vec<PathBuf>> {
    let missing: Vec<PathBuf> = dir
        .ancestors()
        .take_while(|p| !p.exists())
        .map(Path::to_path_buf)
        .collect();

    if missing.is_empty() {
        return Ok(missing);
    }

    std::fs::create_dir_all(dir).at(dir)?;

    // Outermost first so the listing reads top-down
    let mut created = missing;
    created.reverse();
    for path in &created {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).at(path)?;
        tracing::debug!(path = %path.display(), mode = format!("{:o}", mode), "Created directory");
    }

    Ok(created)
}
