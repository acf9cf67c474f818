//! Sequencing of the storage components for `setup` and `status`

use crate::backup::{BackupJob, BackupManager, BackupStatus};
use crate::config::StorageConfig;
use crate::environment::write_env_script;
use crate::error::{StorageError, StorageResult};
use crate::layout::{create_directory_structure, verify_prerequisites};
use crate::monitor::{DeviceHealth, HealthSummary, StorageHealth, StorageMonitor};
use crate::symlinks::{SymlinkEntry, SymlinkManager};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Roll-up of every component's health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    /// Warnings only
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// What `setup` did
#[derive(Debug, Clone, Serialize)]
pub struct SetupReport {
    pub created_directories: Vec<PathBuf>,
    pub symlinks: Vec<SymlinkEntry>,
    pub repaired_symlinks: usize,
    pub env_script: PathBuf,
    pub health: HealthSummary,
}

/// Storage, symlink, device, and backup state in one structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedStatus {
    pub timestamp: DateTime<Utc>,
    pub overall_status: OverallStatus,
    pub storage_health: Vec<StorageHealth>,
    pub symlink_status: Vec<SymlinkEntry>,
    pub smart_health: BTreeMap<String, DeviceHealth>,
    pub summary: HealthSummary,
    pub latest_backup: Option<BackupJob>,
}

impl AggregatedStatus {
    /// Dotted `key -> value` view, e.g. `storage_health.0.usage_percent`
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        match serde_json::to_value(self) {
            Ok(value) => flatten_value("", &value, &mut out),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize status");
            }
        }
        out
    }
}

fn flatten_value(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    let key = |k: &str| {
        if prefix.is_empty() {
            k.to_string()
        } else {
            format!("{}.{}", prefix, k)
        }
    };

    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_value(&key(k), v, out);
            }
        }
        Value::Array(items) => {
            out.insert(key("count"), items.len().to_string());
            for (i, v) in items.iter().enumerate() {
                flatten_value(&key(&i.to_string()), v, out);
            }
        }
        Value::Null => {}
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

/// Owns one of each component over a shared configuration
pub struct StorageOrchestrator {
    config: Arc<StorageConfig>,
    symlinks: SymlinkManager,
    monitor: Arc<StorageMonitor>,
    backups: BackupManager,
}

impl StorageOrchestrator {
    pub fn new(config: Arc<StorageConfig>) -> Self {
        let monitor = Arc::new(StorageMonitor::new(config.clone()));
        Self::with_monitor(config, monitor)
    }

    pub fn with_monitor(config: Arc<StorageConfig>, monitor: Arc<StorageMonitor>) -> Self {
        Self {
            symlinks: SymlinkManager::new(config.clone()),
            backups: BackupManager::new(config.clone()),
            monitor,
            config,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn symlinks(&self) -> &SymlinkManager {
        &self.symlinks
    }

    pub fn monitor(&self) -> &Arc<StorageMonitor> {
        &self.monitor
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Bring the storage layout up from scratch, optionally staying in the monitor loop
    ///
    /// Each step runs only if the previous one succeeded; the first error is returned as is.
    /// Nothing created before a failure is rolled back.
    pub async fn setup(&self, run_monitor: bool) -> StorageResult<SetupReport> {
        tracing::info!("Starting storage setup");

        self.config.validate()?;

        let prereq = verify_prerequisites(&self.config);
        if !prereq.is_ok() {
            let missing: Vec<String> = prereq
                .missing_mounts
                .iter()
                .map(|p| format!("missing mount {}", p.display()))
                .chain(
                    prereq
                        .permission_issues
                        .iter()
                        .map(|p| format!("no read/write access to {}", p.display())),
                )
                .collect();
            return Err(StorageError::Configuration(format!(
                "Storage prerequisites not met: {}",
                missing.join(", ")
            )));
        }

        let created_directories = create_directory_structure(&self.config)?;
        let mut symlinks = self.symlinks.create_symlinks()?;

        let mut repaired_symlinks = 0;
        if symlinks.iter().any(SymlinkEntry::is_broken) {
            if !self.config.symlinks.repair_broken_links {
                return Err(first_broken(&symlinks));
            }
            tracing::warn!("Broken symlinks after creation, attempting repair");
            let outcome = self.symlinks.repair_symlinks(&symlinks)?;
            repaired_symlinks = outcome.repaired_count();
            symlinks = self.symlinks.verify_all();
            if symlinks.iter().any(SymlinkEntry::is_broken) {
                return Err(first_broken(&symlinks));
            }
        }

        let env_script = write_env_script(&self.config)?;
        let report = self.monitor.run_cycle().await?;

        tracing::info!(
            directories = created_directories.len(),
            symlinks = symlinks.len(),
            repaired = repaired_symlinks,
            overall_healthy = report.summary.overall_healthy,
            "Storage setup complete"
        );

        let setup = SetupReport {
            created_directories,
            symlinks,
            repaired_symlinks,
            env_script,
            health: report.summary,
        };

        if run_monitor {
            self.monitor.start_monitor(None).await;
        }

        Ok(setup)
    }

    /// Current health of every component
    ///
    /// A backup index that cannot be read is logged and reported as no backup.
    pub async fn status(&self) -> AggregatedStatus {
        let report = self.monitor.generate_report().await;

        let latest_backup = match self.backups.latest_job() {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read backup index");
                None
            }
        };

        let overall_status = overall_status(&report.summary, latest_backup.as_ref());

        AggregatedStatus {
            timestamp: report.timestamp,
            overall_status,
            storage_health: report.storage_health,
            symlink_status: report.symlink_status,
            smart_health: report.smart_health,
            summary: report.summary,
            latest_backup,
        }
    }
}

fn first_broken(entries: &[SymlinkEntry]) -> StorageError {
    match entries.iter().find(|e| e.is_broken()) {
        Some(entry) => StorageError::TargetMissing {
            link: entry.link_path.clone(),
            target: entry.target_path.clone(),
        },
        None => StorageError::Configuration("symlink verification failed".to_string()),
    }
}

/// Errors make the system unhealthy; warnings or a failed or unverified last backup make it
/// degraded
pub fn overall_status(summary: &HealthSummary, latest_backup: Option<&BackupJob>) -> OverallStatus {
    if !summary.overall_healthy {
        OverallStatus::Unhealthy
    } else if !summary.warnings.is_empty()
        || latest_backup.is_some_and(|j| j.status == BackupStatus::Failed || !j.errors.is_empty())
    {
        OverallStatus::Degraded
    } else {
        OverallStatus::Healthy
    }
}
