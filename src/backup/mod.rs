//! Backups of model storage
//!
//! Each backup is a full directory snapshot under `backup_models/<backup_id>`. Incremental
//! backups hard-link files that are unchanged since the most recent completed backup of the
//! same source, so every snapshot is complete while only changed data takes new space.
//!
//! Bookkeeping lives next to the snapshots:
//! ```text
//! backup_root/
//!   .backup.lock             exclusive while a backup or cleanup runs
//!   backup_index.jsonl       one record per finished job
//!   manifests/<id>.json      per-file SHA-256 of each backup
//!   models/<id>/...          snapshots
//! ```

pub mod checksum;
pub mod copy;
pub mod index;

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::lock::{BACKUP_LOCK, StorageLock};
use checksum::{Manifest, sha256_file};
use chrono::{DateTime, Utc};
use copy::{LinkBase, TreeCopier};
use index::BackupIndex;
use rand::Rng;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use walkdir::WalkDir;

const MANIFEST_DIR: &str = "manifests";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    /// Copy every file
    Full,
    /// Hard-link files unchanged since the last completed backup
    Incremental,
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A single backup operation and its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    /// Also the snapshot directory name
    pub backup_id: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub bytes_written: u64,
    pub files_linked: u64,
    /// Backup the unchanged files were linked against
    pub base_backup: Option<String>,
    pub errors: Vec<String>,
    /// Summary digest of the manifest
    pub checksum: Option<String>,
}

impl BackupJob {
    pub fn new(
        backup_id: String,
        source_path: PathBuf,
        destination_path: PathBuf,
        backup_type: BackupType,
    ) -> Self {
        Self {
            backup_id,
            source_path,
            destination_path,
            backup_type,
            status: BackupStatus::Pending,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            files_processed: 0,
            bytes_processed: 0,
            bytes_written: 0,
            files_linked: 0,
            base_backup: None,
            errors: Vec::new(),
            checksum: None,
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Outcome of checking a backup against its manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub backup_path: PathBuf,
    pub is_valid: bool,
    pub sample_rate: f64,
    /// Files recorded in the manifest (or found on disk when there is none)
    pub files_total: usize,
    pub files_checked: usize,
    pub files_failed: usize,
    /// Every checked file matched its recorded digest and, on a full check, no files were
    /// added or removed
    pub checksum_matches: bool,
    /// Relative paths whose digest differs from the manifest
    pub mismatches: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub verification_time: DateTime<Utc>,
    pub duration_seconds: f64,
}

impl VerificationResult {
    fn new(backup_path: &Path, sample_rate: f64) -> Self {
        Self {
            backup_path: backup_path.to_path_buf(),
            is_valid: false,
            sample_rate,
            files_total: 0,
            files_checked: 0,
            files_failed: 0,
            checksum_matches: false,
            mismatches: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            verification_time: Utc::now(),
            duration_seconds: 0.0,
        }
    }
}

/// Aggregate view of the backup history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStatusReport {
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub latest: Option<BackupJob>,
    pub jobs: Vec<BackupJob>,
}

/// Number of files to check out of `total` at `sample_rate`
///
/// At least one file is checked when any exist; a rate of 1.0 or more checks everything.
pub fn sample_size(total: usize, sample_rate: f64) -> usize {
    if total == 0 {
        0
    } else if sample_rate >= 1.0 {
        total
    } else {
        ((total as f64 * sample_rate.max(0.0)).floor() as usize).clamp(1, total)
    }
}

fn new_backup_id(source_name: &str, backup_type: BackupType, now: DateTime<Utc>) -> String {
    let name: String = source_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let suffix: u16 = rand::rng().random();
    format!(
        "{}_{}_{}_{:04x}",
        name,
        backup_type,
        now.format("%Y%m%d_%H%M%S"),
        suffix
    )
}

/// Creates, verifies, and expires backups
pub struct BackupManager {
    config: Arc<StorageConfig>,
    index: BackupIndex,
}

impl BackupManager {
    pub fn new(config: Arc<StorageConfig>) -> Self {
        let index = BackupIndex::new(&config.paths.backup_root);
        Self { config, index }
    }

    pub fn index(&self) -> &BackupIndex {
        &self.index
    }

    fn manifest_dir(&self) -> PathBuf {
        self.config.paths.backup_root.join(MANIFEST_DIR)
    }

    /// Type used when none is requested
    pub fn default_backup_type(&self) -> BackupType {
        if self.config.backup.incremental_backup {
            BackupType::Incremental
        } else {
            BackupType::Full
        }
    }

    /// Back up `source` into a new snapshot
    ///
    /// Copy failures are recorded on the returned job with status `failed` and the partial
    /// snapshot is left on disk. Post-backup verification errors are added to `errors` of a
    /// completed job before it is indexed. An `Err` means the job could not be run or recorded at all,
    /// for example because another backup holds the lock.
    pub fn create_backup(&self, source: &Path, backup_type: BackupType) -> StorageResult<BackupJob> {
        let _lock = StorageLock::try_acquire(&self.config.paths.backup_root, BACKUP_LOCK)?;

        let source = source.canonicalize().unwrap_or_else(|_| source.to_path_buf());
        let source_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("root");
        let backup_id = new_backup_id(source_name, backup_type, Utc::now());
        let destination = self.config.paths.backup_models.join(&backup_id);

        let mut job = BackupJob::new(backup_id, source.clone(), destination, backup_type);
        tracing::info!(
            backup_id = %job.backup_id,
            source = %job.source_path.display(),
            backup_type = %backup_type,
            "Starting backup"
        );

        job.status = BackupStatus::Running;
        job.start_time = Some(Utc::now());

        match self.execute(&mut job) {
            Ok(()) => job.status = BackupStatus::Completed,
            Err(e) => {
                tracing::error!(backup_id = %job.backup_id, error = %e, "Backup failed");
                job.status = BackupStatus::Failed;
                job.errors.push(e.to_string());
            }
        }
        job.end_time = Some(Utc::now());

        // Verification problems are kept on the job but do not fail it
        if job.status == BackupStatus::Completed && self.config.backup.verify_backups {
            let result = self.verify_backup(&job.destination_path, None);
            if !result.is_valid {
                tracing::warn!(
                    backup_id = %job.backup_id,
                    errors = ?result.errors,
                    "Post-backup verification failed"
                );
                job.errors.extend(result.errors);
            }
        }

        self.index.append(&job)?;

        match job.status {
            BackupStatus::Completed => {
                crate::metrics::record_backup_completed(
                    &backup_type.to_string(),
                    job.bytes_written,
                    job.files_linked,
                );
                tracing::info!(
                    backup_id = %job.backup_id,
                    files = job.files_processed,
                    bytes = job.bytes_processed,
                    bytes_written = job.bytes_written,
                    files_linked = job.files_linked,
                    duration_secs = job.duration_seconds().unwrap_or_default(),
                    "Backup completed"
                );
            }
            _ => crate::metrics::record_backup_failed(&backup_type.to_string()),
        }

        Ok(job)
    }

    fn execute(&self, job: &mut BackupJob) -> StorageResult<()> {
        if !job.source_path.is_dir() {
            return Err(StorageError::Copy {
                path: job.source_path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "source directory does not exist",
                ),
            });
        }

        let base = match job.backup_type {
            BackupType::Full => None,
            BackupType::Incremental => self.link_base(job)?,
        };

        let mut copier = TreeCopier::new(
            &job.source_path,
            &job.destination_path,
            base,
            self.config.backup.progress_log_interval,
        );
        let result = copier.run();

        let stats = copier.stats();
        job.files_processed = stats.files_processed;
        job.bytes_processed = stats.bytes_processed;
        job.bytes_written = stats.bytes_written;
        job.files_linked = stats.files_linked;
        result?;

        let manifest = Manifest::new(&job.backup_id, copier.into_checksums());
        manifest.save(&self.manifest_dir())?;
        job.checksum = Some(manifest.summary);

        Ok(())
    }

    fn link_base(&self, job: &mut BackupJob) -> StorageResult<Option<LinkBase>> {
        let Some(prior) = self.index.last_completed(&job.source_path)? else {
            tracing::info!(
                source = %job.source_path.display(),
                "No previous backup of this source, copying everything"
            );
            return Ok(None);
        };

        let checksums = Manifest::load(&self.manifest_dir(), &prior.backup_id)?
            .map(|m| m.files)
            .unwrap_or_default();
        tracing::info!(
            backup_id = %job.backup_id,
            base = %prior.backup_id,
            "Linking unchanged files against previous backup"
        );
        job.base_backup = Some(prior.backup_id);

        Ok(Some(LinkBase {
            dir: prior.destination_path,
            checksums,
        }))
    }

    /// Recompute digests for a random sample of files and compare with the manifest
    ///
    /// `sample_rate` defaults to `backup.verification_sample_rate`; `1.0` checks every file and
    /// also detects files added to or removed from the snapshot.
    pub fn verify_backup(&self, path: &Path, sample_rate: Option<f64>) -> VerificationResult {
        let start = Instant::now();
        let rate = sample_rate
            .unwrap_or(self.config.backup.verification_sample_rate)
            .clamp(0.0, 1.0);
        let mut result = VerificationResult::new(path, rate);

        tracing::info!(path = %path.display(), sample_rate = rate, "Verifying backup");

        if !path.is_dir() {
            result
                .errors
                .push(StorageError::BackupNotFound(path.display().to_string()).to_string());
        } else {
            let backup_id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match Manifest::load(&self.manifest_dir(), &backup_id) {
                Ok(Some(manifest)) => verify_against_manifest(path, &manifest, rate, &mut result),
                Ok(None) => verify_readable(path, rate, &mut result),
                Err(e) => result.errors.push(format!("Cannot read manifest: {}", e)),
            }
        }

        result.is_valid =
            result.errors.is_empty() && result.files_failed == 0 && result.mismatches.is_empty();
        result.verification_time = Utc::now();
        result.duration_seconds = start.elapsed().as_secs_f64();

        if result.is_valid {
            tracing::info!(
                path = %path.display(),
                files_checked = result.files_checked,
                "Backup verified"
            );
        } else {
            tracing::warn!(
                path = %path.display(),
                files_checked = result.files_checked,
                files_failed = result.files_failed,
                "Backup verification failed"
            );
        }

        result
    }

    /// Delete backups older than `retention_days` (default `backup.retention_days`)
    pub fn cleanup_old_backups(&self, retention_days: Option<u32>) -> StorageResult<Vec<String>> {
        let days = retention_days.unwrap_or(self.config.backup.retention_days);
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        self.cleanup_before(cutoff)
    }

    /// Delete every backup created strictly before `cutoff`; returns the removed ids
    ///
    /// Indexed backups are aged by their recorded creation time. Directories under
    /// `backup_models` that the index does not know are aged by modification time.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<String>> {
        let _lock = StorageLock::try_acquire(&self.config.paths.backup_root, BACKUP_LOCK)?;

        let records = self.index.load()?;
        let indexed: HashSet<PathBuf> =
            records.iter().map(|j| j.destination_path.clone()).collect();
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(records.len());

        for job in records {
            if job.created_at >= cutoff {
                kept.push(job);
                continue;
            }
            match remove_snapshot(&job.destination_path) {
                Ok(()) => {
                    if let Err(e) = Manifest::remove(&self.manifest_dir(), &job.backup_id) {
                        tracing::warn!(backup_id = %job.backup_id, error = %e, "Failed to remove manifest");
                    }
                    tracing::info!(backup_id = %job.backup_id, "Removed old backup");
                    removed.push(job.backup_id);
                }
                Err(e) => {
                    tracing::error!(backup_id = %job.backup_id, error = %e, "Failed to remove backup");
                    kept.push(job);
                }
            }
        }

        let backup_models = &self.config.paths.backup_models;
        if let Ok(entries) = std::fs::read_dir(backup_models) {
            for entry in entries.flatten() {
                let path = entry.path();
                if indexed.contains(&path) || !path.is_dir() {
                    continue;
                }
                let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                    continue;
                };
                if DateTime::<Utc>::from(modified) >= cutoff {
                    continue;
                }
                match remove_snapshot(&path) {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), "Removed unindexed old backup");
                        removed.push(entry.file_name().to_string_lossy().into_owned());
                    }
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "Failed to remove backup");
                    }
                }
            }
        }

        if !removed.is_empty() {
            self.index.rewrite(&kept)?;
        }
        crate::metrics::record_backups_removed(removed.len());
        tracing::info!(removed = removed.len(), cutoff = %cutoff, "Backup cleanup complete");

        Ok(removed)
    }

    /// Counts and history from the index
    pub fn status(&self) -> StorageResult<BackupStatusReport> {
        let jobs = self.index.load()?;
        let count = |status| jobs.iter().filter(|j| j.status == status).count();
        let completed_jobs = count(BackupStatus::Completed);
        let failed_jobs = count(BackupStatus::Failed);

        Ok(BackupStatusReport {
            total_jobs: jobs.len(),
            completed_jobs,
            failed_jobs,
            latest: latest_of(&jobs),
            jobs,
        })
    }

    /// Most recently created job of any status
    pub fn latest_job(&self) -> StorageResult<Option<BackupJob>> {
        Ok(latest_of(&self.index.load()?))
    }
}

fn latest_of(jobs: &[BackupJob]) -> Option<BackupJob> {
    jobs.iter()
        .fold(None::<&BackupJob>, |best, job| match best {
            Some(b) if b.created_at > job.created_at => Some(b),
            _ => Some(job),
        })
        .cloned()
}

fn remove_snapshot(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn verify_against_manifest(
    root: &Path,
    manifest: &Manifest,
    rate: f64,
    result: &mut VerificationResult,
) {
    result.files_total = manifest.files.len();
    let count = sample_size(manifest.files.len(), rate);
    let full = count == manifest.files.len();

    let mut picked: Vec<(&String, &String)> = if full {
        manifest.files.iter().collect()
    } else {
        manifest
            .files
            .iter()
            .choose_multiple(&mut rand::rng(), count)
    };
    picked.sort();

    for (rel, expected) in picked {
        result.files_checked += 1;
        let file = root.join(rel);
        match sha256_file(&file) {
            Ok(actual) if &actual == expected => {}
            Ok(_) => {
                result.files_failed += 1;
                result.mismatches.push(rel.clone());
                result.errors.push(
                    StorageError::VerificationFailure {
                        path: file,
                        reason: "checksum mismatch".to_string(),
                    }
                    .to_string(),
                );
            }
            Err(e) => {
                result.files_failed += 1;
                result.errors.push(
                    StorageError::VerificationFailure {
                        path: file,
                        reason: e.to_string(),
                    }
                    .to_string(),
                );
            }
        }
    }

    let mut extra = false;
    if full {
        for rel in regular_files(root) {
            if !manifest.files.contains_key(&rel) {
                extra = true;
                result.errors.push(
                    StorageError::VerificationFailure {
                        path: root.join(&rel),
                        reason: "file not recorded in manifest".to_string(),
                    }
                    .to_string(),
                );
            }
        }
    }

    result.checksum_matches = result.files_failed == 0 && !extra;
}

// No manifest: confirm sampled files can be read end to end
fn verify_readable(root: &Path, rate: f64, result: &mut VerificationResult) {
    result.warnings.push(format!(
        "No checksum manifest for {}; checked readability only",
        root.display()
    ));

    let files = regular_files(root);
    result.files_total = files.len();
    let count = sample_size(files.len(), rate);
    let picked = if count == files.len() {
        files
    } else {
        files.into_iter().choose_multiple(&mut rand::rng(), count)
    };

    for rel in picked {
        result.files_checked += 1;
        let file = root.join(&rel);
        let readable = std::fs::File::open(&file)
            .and_then(|mut f| std::io::copy(&mut f, &mut std::io::sink()));
        if let Err(e) = readable {
            result.files_failed += 1;
            result.errors.push(format!("Cannot read file {}: {}", file.display(), e));
        }
    }
}

fn regular_files(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoragePaths;
    use chrono::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        source: PathBuf,
        manager: BackupManager,
        config: Arc<StorageConfig>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut config = StorageConfig {
            paths: StoragePaths::from_roots(
                tmp.path().join("app"),
                tmp.path().join("models"),
                tmp.path().join("backup"),
            ),
            ..Default::default()
        };
        config.backup.verify_backups = false;
        let config = Arc::new(config);

        let source = tmp.path().join("active");
        std::fs::create_dir_all(source.join("phi3")).unwrap();
        std::fs::write(source.join("phi3/config.json"), b"{}").unwrap();
        std::fs::write(source.join("phi3/model.safetensors"), vec![1u8; 64 * 1024]).unwrap();
        std::fs::write(source.join("README.md"), b"models").unwrap();

        Fixture {
            manager: BackupManager::new(config.clone()),
            config,
            source,
            _tmp: tmp,
        }
    }

    #[test]
    fn test_backup_id_format() {
        let now = DateTime::parse_from_rfc3339("2025-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = new_backup_id("active models", BackupType::Incremental, now);
        assert!(id.starts_with("active_models_incremental_20250304_050607_"));
        assert_eq!(id.len(), "active_models_incremental_20250304_050607_".len() + 4);
    }

    #[test]
    fn test_sample_size() {
        assert_eq!(sample_size(0, 0.5), 0);
        assert_eq!(sample_size(10, 0.1), 1);
        assert_eq!(sample_size(10, 0.0), 1);
        assert_eq!(sample_size(3, 0.1), 1);
        assert_eq!(sample_size(100, 0.25), 25);
        assert_eq!(sample_size(7, 1.0), 7);
    }

    #[test]
    fn test_full_backup_completes_and_verifies() {
        let f = fixture();
        let job = f.manager.create_backup(&f.source, BackupType::Full).unwrap();

        assert_eq!(job.status, BackupStatus::Completed, "{:?}", job.errors);
        assert_eq!(job.files_processed, 3);
        assert_eq!(job.bytes_processed, 64 * 1024 + 2 + 6);
        assert_eq!(job.bytes_written, job.bytes_processed);
        assert!(job.checksum.is_some());
        assert!(job.destination_path.starts_with(&f.config.paths.backup_models));
        assert!(job.destination_path.join("phi3/model.safetensors").is_file());

        let result = f.manager.verify_backup(&job.destination_path, Some(1.0));
        assert!(result.is_valid, "{:?}", result.errors);
        assert_eq!(result.files_checked, 3);
        assert!(result.mismatches.is_empty());
        assert!(result.checksum_matches);
    }

    #[test]
    fn test_incremental_links_unchanged_files() {
        let f = fixture();
        let first = f.manager.create_backup(&f.source, BackupType::Full).unwrap();
        let second = f
            .manager
            .create_backup(&f.source, BackupType::Incremental)
            .unwrap();

        assert_eq!(second.status, BackupStatus::Completed);
        assert_eq!(second.files_processed, 3);
        assert_eq!(second.files_linked, 3);
        assert_eq!(second.bytes_written, 0);
        assert_eq!(second.base_backup.as_deref(), Some(first.backup_id.as_str()));
        assert_eq!(second.checksum, first.checksum);
    }

    #[test]
    fn test_incremental_without_prior_copies_everything() {
        let f = fixture();
        let job = f
            .manager
            .create_backup(&f.source, BackupType::Incremental)
            .unwrap();
        assert_eq!(job.status, BackupStatus::Completed);
        assert!(job.base_backup.is_none());
        assert_eq!(job.bytes_written, job.bytes_processed);
    }

    #[test]
    fn test_verification_errors_are_indexed() {
        let f = fixture();
        let mut config = (*f.config).clone();
        config.backup.verify_backups = true;
        config.backup.verification_sample_rate = 1.0;
        let manager = BackupManager::new(Arc::new(config));

        let base = manager.create_backup(&f.source, BackupType::Full).unwrap();
        assert!(base.errors.is_empty(), "{:?}", base.errors);

        // Corrupt the base copy without changing size or mtime, so the next snapshot links it
        let corrupted = base.destination_path.join("README.md");
        let mtime = std::fs::metadata(f.source.join("README.md"))
            .unwrap()
            .modified()
            .unwrap();
        std::fs::write(&corrupted, b"MODELS").unwrap();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&corrupted)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let job = manager
            .create_backup(&f.source, BackupType::Incremental)
            .unwrap();
        assert_eq!(job.status, BackupStatus::Completed);
        assert!(!job.errors.is_empty());

        let indexed = manager.latest_job().unwrap().unwrap();
        assert_eq!(indexed.backup_id, job.backup_id);
        assert_eq!(indexed.errors, job.errors);
    }

    #[test]
    fn test_missing_source_records_failed_job() {
        let f = fixture();
        let job = f
            .manager
            .create_backup(&f.source.join("nope"), BackupType::Full)
            .unwrap();
        assert_eq!(job.status, BackupStatus::Failed);
        assert_eq!(job.errors.len(), 1);
        assert!(job.end_time.is_some());

        let status = f.manager.status().unwrap();
        assert_eq!(status.failed_jobs, 1);
        assert_eq!(status.completed_jobs, 0);
    }

    #[test]
    fn test_failed_backup_is_never_a_link_base() {
        let f = fixture();
        f.manager
            .create_backup(&f.source.join("nope"), BackupType::Full)
            .unwrap();
        assert!(f.manager.index().last_completed(&f.source).unwrap().is_none());
    }

    #[test]
    fn test_verify_detects_modified_file() {
        let f = fixture();
        let job = f.manager.create_backup(&f.source, BackupType::Full).unwrap();
        std::fs::write(job.destination_path.join("README.md"), b"tampered").unwrap();

        let result = f.manager.verify_backup(&job.destination_path, Some(1.0));
        assert!(!result.is_valid);
        assert_eq!(result.mismatches, vec!["README.md"]);
        assert!(!result.checksum_matches);
    }

    #[test]
    fn test_verify_detects_added_file_on_full_check() {
        let f = fixture();
        let job = f.manager.create_backup(&f.source, BackupType::Full).unwrap();
        std::fs::write(job.destination_path.join("extra.bin"), b"x").unwrap();

        let result = f.manager.verify_backup(&job.destination_path, Some(1.0));
        assert!(!result.is_valid);
        assert!(result.mismatches.is_empty());
        assert!(!result.checksum_matches);
    }

    #[test]
    fn test_sampled_verification_checks_subset() {
        let f = fixture();
        let job = f.manager.create_backup(&f.source, BackupType::Full).unwrap();

        let result = f.manager.verify_backup(&job.destination_path, Some(0.1));
        assert!(result.is_valid);
        assert_eq!(result.files_total, 3);
        assert_eq!(result.files_checked, 1);
    }

    #[test]
    fn test_verify_without_manifest_checks_readability() {
        let f = fixture();
        let job = f.manager.create_backup(&f.source, BackupType::Full).unwrap();
        Manifest::remove(&f.manager.manifest_dir(), &job.backup_id).unwrap();

        let result = f.manager.verify_backup(&job.destination_path, Some(1.0));
        assert!(result.is_valid);
        assert_eq!(result.files_checked, 3);
        assert_eq!(result.warnings.len(), 1);
        assert!(!result.checksum_matches);
    }

    #[test]
    fn test_verify_missing_directory() {
        let f = fixture();
        let result = f
            .manager
            .verify_backup(&f.config.paths.backup_models.join("nope"), None);
        assert!(!result.is_valid);
        assert_eq!(result.files_checked, 0);
    }

    #[test]
    fn test_cleanup_removes_only_older_backups() {
        let f = fixture();
        let old = f.manager.create_backup(&f.source, BackupType::Full).unwrap();
        let cutoff = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let recent = f.manager.create_backup(&f.source, BackupType::Full).unwrap();

        let removed = f.manager.cleanup_before(cutoff).unwrap();
        assert_eq!(removed, vec![old.backup_id.clone()]);
        assert!(!old.destination_path.exists());
        assert!(recent.destination_path.exists());

        let remaining: Vec<_> = f
            .manager
            .index()
            .load()
            .unwrap()
            .into_iter()
            .map(|j| j.backup_id)
            .collect();
        assert_eq!(remaining, vec![recent.backup_id]);
        assert!(Manifest::load(&f.manager.manifest_dir(), &old.backup_id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_cleanup_with_retention_keeps_recent() {
        let f = fixture();
        let job = f.manager.create_backup(&f.source, BackupType::Full).unwrap();
        assert!(f.manager.cleanup_old_backups(Some(30)).unwrap().is_empty());
        assert!(job.destination_path.exists());

        // Hard links keep data alive for later snapshots after the base is removed
        std::thread::sleep(std::time::Duration::from_millis(20));
        let inc = f
            .manager
            .create_backup(&f.source, BackupType::Incremental)
            .unwrap();
        f.manager
            .cleanup_before(inc.created_at - Duration::milliseconds(1))
            .unwrap();
        assert!(!job.destination_path.exists());
        let result = f.manager.verify_backup(&inc.destination_path, Some(1.0));
        assert!(result.is_valid, "{:?}", result.errors);
    }

    #[test]
    fn test_cleanup_ages_unindexed_directories_by_mtime() {
        let f = fixture();
        let stray = f.config.paths.backup_models.join("manual_copy");
        std::fs::create_dir_all(&stray).unwrap();

        let removed = f
            .manager
            .cleanup_before(Utc::now() + Duration::days(1))
            .unwrap();
        assert_eq!(removed, vec!["manual_copy".to_string()]);
        assert!(!stray.exists());
    }

    #[test]
    fn test_concurrent_backup_is_refused() {
        let f = fixture();
        let _held = StorageLock::try_acquire(&f.config.paths.backup_root, BACKUP_LOCK).unwrap();
        let err = f
            .manager
            .create_backup(&f.source, BackupType::Full)
            .unwrap_err();
        assert!(matches!(err, StorageError::LockHeld(_)));
    }

    #[test]
    fn test_latest_job() {
        let f = fixture();
        assert!(f.manager.latest_job().unwrap().is_none());
        f.manager.create_backup(&f.source, BackupType::Full).unwrap();
        let second = f
            .manager
            .create_backup(&f.source.join("nope"), BackupType::Full)
            .unwrap();
        let latest = f.manager.latest_job().unwrap().unwrap();
        assert_eq!(latest.backup_id, second.backup_id);
        assert_eq!(latest.status, BackupStatus::Failed);
    }
}
