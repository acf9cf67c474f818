//! Append-only log of finished backup jobs
//!
//! One JSON object per line in `backup_root/backup_index.jsonl`. Lines are appended when a job
//! finishes and the whole file is rewritten atomically when retention removes entries.

use super::{BackupJob, BackupStatus};
use crate::error::{IoResultExt, StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const INDEX_FILE: &str = "backup_index.jsonl";

#[derive(Debug, Clone)]
pub struct BackupIndex {
    path: PathBuf,
}

impl BackupIndex {
    pub fn new(backup_root: &Path) -> Self {
        Self {
            path: backup_root.join(INDEX_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records in append order; unparsable lines are skipped
    pub fn load(&self) -> StorageResult<Vec<BackupJob>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };

        let records: Vec<BackupJob> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str(line) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = n + 1,
                        error = %e,
                        "Skipping malformed backup index entry"
                    );
                    None
                }
            })
            .collect();

        Ok(records)
    }

    pub fn append(&self, job: &BackupJob) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).at(parent)?;
        }
        let mut line = serde_json::to_string(job)
            .map_err(std::io::Error::other)
            .at(&self.path)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .at(&self.path)?;
        file.write_all(line.as_bytes()).at(&self.path)?;
        file.sync_all().at(&self.path)?;
        Ok(())
    }

    /// Replace the index with `records`
    pub fn rewrite(&self, records: &[BackupJob]) -> StorageResult<()> {
        let mut content = String::new();
        for job in records {
            let line = serde_json::to_string(job)
                .map_err(std::io::Error::other)
                .at(&self.path)?;
            content.push_str(&line);
            content.push('\n');
        }

        // Atomic write: write to temp file, then rename
        let temp_file = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&temp_file).at(&temp_file)?;
            file.write_all(content.as_bytes()).at(&temp_file)?;
            file.sync_all().at(&temp_file)?;
        }
        std::fs::rename(&temp_file, &self.path).at(&self.path)?;
        Ok(())
    }

    /// Most recent completed backup of `source` whose directory still exists
    ///
    /// Ordered by recorded creation time; among equal times the later entry wins.
    pub fn last_completed(&self, source: &Path) -> StorageResult<Option<BackupJob>> {
        let mut best: Option<BackupJob> = None;
        for job in self.load()? {
            if job.status != BackupStatus::Completed
                || job.source_path != source
                || !job.destination_path.is_dir()
            {
                continue;
            }
            if best.as_ref().is_none_or(|b| job.created_at >= b.created_at) {
                best = Some(job);
            }
        }
        Ok(best)
    }
}
