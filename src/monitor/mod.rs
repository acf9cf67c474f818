//! Storage health monitoring
//!
//! Produces [`StorageHealth`] snapshots for the storage roots, device health via a
//! [`DeviceHealthProvider`], and a combined [`HealthReport`]. The long-running loop in
//! [`StorageMonitor::run_until`] writes the latest report to disk on every tick.

pub mod disk;
pub mod performance;
pub mod smart;

pub use disk::{FilesystemStats, MountInfo};
pub use performance::PerformanceMetrics;
pub use smart::{DeviceHealth, DeviceHealthProvider, DeviceHealthStatus, SmartctlProvider};

use crate::config::{MonitorSettings, StorageConfig};
use crate::error::{IoResultExt, StorageResult};
use crate::symlinks::{LinkHealth, SymlinkEntry, SymlinkManager};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::time::{Duration, interval};

/// Point-in-time capacity and inode usage of one path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageHealth {
    pub path: PathBuf,
    pub total_space: u64,
    pub used_space: u64,
    pub free_space: u64,
    pub usage_percent: f64,
    pub inode_total: u64,
    pub inode_used: u64,
    pub inode_free: u64,
    pub inode_usage_percent: f64,
    pub mount_point: Option<PathBuf>,
    pub filesystem: Option<String>,
    pub is_healthy: bool,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl StorageHealth {
    /// Apply the configured thresholds to filesystem counters
    ///
    /// Crossing a warning threshold only adds a warning; crossing a critical threshold
    /// also marks the path unhealthy.
    pub fn evaluate(path: &Path, stats: &FilesystemStats, settings: &MonitorSettings) -> Self {
        let usage = stats.usage_fraction();
        let inode_usage = stats.inode_usage_fraction();
        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if usage > settings.disk_usage_critical {
            warnings.push(format!("Critical disk usage: {:.1}%", usage * 100.0));
            is_healthy = false;
        } else if usage > settings.disk_usage_warning {
            warnings.push(format!("High disk usage: {:.1}%", usage * 100.0));
        }

        if inode_usage > settings.inode_usage_critical {
            warnings.push(format!("Critical inode usage: {:.1}%", inode_usage * 100.0));
            is_healthy = false;
        } else if inode_usage > settings.inode_usage_warning {
            warnings.push(format!("High inode usage: {:.1}%", inode_usage * 100.0));
        }

        Self {
            path: path.to_path_buf(),
            total_space: stats.total_bytes,
            used_space: stats.used_bytes,
            free_space: stats.free_bytes,
            usage_percent: usage * 100.0,
            inode_total: stats.total_inodes,
            inode_used: stats.used_inodes(),
            inode_free: stats.free_inodes,
            inode_usage_percent: inode_usage * 100.0,
            mount_point: None,
            filesystem: None,
            is_healthy,
            warnings,
            timestamp: Utc::now(),
        }
    }

    /// Snapshot for a path whose filesystem could not be read
    pub fn unavailable(path: &Path, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            total_space: 0,
            used_space: 0,
            free_space: 0,
            usage_percent: 0.0,
            inode_total: 0,
            inode_used: 0,
            inode_free: 0,
            inode_usage_percent: 0.0,
            mount_point: None,
            filesystem: None,
            is_healthy: false,
            warnings: vec![reason.into()],
            timestamp: Utc::now(),
        }
    }

    pub fn with_mount(mut self, mount: Option<MountInfo>) -> Self {
        if let Some(mount) = mount {
            self.mount_point = Some(mount.mount_point);
            self.filesystem = Some(mount.filesystem);
        }
        self
    }
}

/// Counts and collected problems across a report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub healthy_storage: usize,
    pub total_storage: usize,
    pub healthy_symlinks: usize,
    pub total_symlinks: usize,
    pub overall_healthy: bool,
    /// Conditions that make the system unhealthy
    pub errors: Vec<String>,
    /// Conditions worth attention that do not affect health
    pub warnings: Vec<String>,
}

/// Combined storage, symlink, and device health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub storage_health: Vec<StorageHealth>,
    pub symlink_status: Vec<SymlinkEntry>,
    pub smart_health: BTreeMap<String, DeviceHealth>,
    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn new(
        storage_health: Vec<StorageHealth>,
        symlink_status: Vec<SymlinkEntry>,
        smart_health: BTreeMap<String, DeviceHealth>,
    ) -> Self {
        let mut summary = HealthSummary {
            total_storage: storage_health.len(),
            total_symlinks: symlink_status.len(),
            ..Default::default()
        };

        for health in &storage_health {
            let path = health.path.display();
            if health.is_healthy {
                summary.healthy_storage += 1;
                summary
                    .warnings
                    .extend(health.warnings.iter().map(|w| format!("{}: {}", path, w)));
            } else {
                summary
                    .errors
                    .extend(health.warnings.iter().map(|w| format!("{}: {}", path, w)));
            }
        }

        for entry in &symlink_status {
            if entry.is_broken() {
                summary.errors.extend(entry.issue());
            } else {
                summary.healthy_symlinks += 1;
                if matches!(entry.health, LinkHealth::Misdirected { .. }) {
                    summary.warnings.extend(entry.issue());
                }
            }
        }

        for (device, health) in &smart_health {
            match health.status {
                DeviceHealthStatus::Failing => summary.errors.push(format!(
                    "{}: SMART health check failed",
                    device
                )),
                DeviceHealthStatus::Unknown => summary.warnings.push(format!(
                    "{}: health unknown ({})",
                    device,
                    health.error.as_deref().unwrap_or("no data")
                )),
                DeviceHealthStatus::Passed => {}
            }
            if health.status != DeviceHealthStatus::Failing {
                summary
                    .warnings
                    .extend(health.warnings.iter().map(|w| format!("{}: {}", device, w)));
            }
        }

        summary.overall_healthy = summary.errors.is_empty();

        Self {
            timestamp: Utc::now(),
            storage_health,
            symlink_status,
            smart_health,
            summary,
        }
    }
}

/// Polls storage roots, symlinks, and devices
pub struct StorageMonitor {
    config: Arc<StorageConfig>,
    provider: Arc<dyn DeviceHealthProvider>,
    history: RwLock<VecDeque<StorageHealth>>,
    smart_cache: RwLock<Option<(Instant, BTreeMap<String, DeviceHealth>)>>,
}

impl StorageMonitor {
    /// Create a monitor that queries devices with smartctl
    pub fn new(config: Arc<StorageConfig>) -> Self {
        let provider = Arc::new(SmartctlProvider::from_settings(&config.monitoring));
        Self::with_provider(config, provider)
    }

    /// Create a monitor with a custom device health provider
    pub fn with_provider(
        config: Arc<StorageConfig>,
        provider: Arc<dyn DeviceHealthProvider>,
    ) -> Self {
        Self {
            config,
            provider,
            history: RwLock::new(VecDeque::new()),
            smart_cache: RwLock::new(None),
        }
    }

    /// Storage roots covered by every report
    pub fn monitored_paths(&self) -> Vec<PathBuf> {
        let paths = &self.config.paths;
        vec![
            paths.models_root.clone(),
            paths.backup_root.clone(),
            paths.app_root.clone(),
        ]
    }

    pub fn check_disk_usage(&self, path: &Path) -> StorageHealth {
        if !path.exists() {
            return StorageHealth::unavailable(path, "Path does not exist");
        }

        let health = match FilesystemStats::query(path) {
            Ok(stats) => StorageHealth::evaluate(path, &stats, &self.config.monitoring)
                .with_mount(disk::mount_for(path)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read filesystem statistics");
                return StorageHealth::unavailable(path, format!("Error getting health info: {}", e));
            }
        };

        let label = path.display().to_string();
        crate::metrics::record_disk_usage(&label, health.usage_percent, health.free_space);
        crate::metrics::record_inode_usage(&label, health.inode_usage_percent);
        for warning in &health.warnings {
            crate::metrics::record_health_warning(&label);
            tracing::warn!(path = %label, warning = %warning, "Storage threshold exceeded");
        }

        health
    }

    /// Inode usage of the filesystem containing `path`, in percent
    pub fn check_inode_usage(&self, path: &Path) -> StorageResult<f64> {
        let stats = FilesystemStats::query(path)?;
        let percent = stats.inode_usage_fraction() * 100.0;
        crate::metrics::record_inode_usage(&path.display().to_string(), percent);
        Ok(percent)
    }

    /// Query every device concurrently; query failures become `Unknown`
    pub async fn check_smart_health(&self, devices: &[String]) -> BTreeMap<String, DeviceHealth> {
        let queries = devices.iter().map(|device| async move {
            let health = match self.provider.device_health(device).await {
                Ok(health) => health,
                Err(e) => {
                    tracing::warn!(device = %device, error = %e, "Device health unavailable");
                    DeviceHealth::unknown(device, e.to_string())
                }
            };
            crate::metrics::record_device_health(device, health.metric_value());
            (device.clone(), health)
        });

        futures::future::join_all(queries).await.into_iter().collect()
    }

    /// Configured devices, or the enumerated whole disks when none are configured
    pub fn devices(&self) -> Vec<String> {
        if self.config.monitoring.devices.is_empty() {
            disk::enumerate_devices(Path::new("/dev"))
        } else {
            self.config.monitoring.devices.clone()
        }
    }

    /// Build a full report, querying devices when SMART checks are enabled
    pub async fn generate_report(&self) -> HealthReport {
        let smart = if self.config.monitoring.enable_smart_checks {
            self.check_smart_health(&self.devices()).await
        } else {
            BTreeMap::new()
        };
        self.report_with(smart)
    }

    fn report_with(&self, smart: BTreeMap<String, DeviceHealth>) -> HealthReport {
        let storage = self
            .monitored_paths()
            .iter()
            .map(|p| self.check_disk_usage(p))
            .collect();
        let symlinks = SymlinkManager::new(self.config.clone()).verify_all();
        crate::metrics::update_broken_symlinks(symlinks.iter().filter(|e| e.is_broken()).count());

        HealthReport::new(storage, symlinks, smart)
    }

    /// SMART results, refreshed only when older than `smart_check_interval_secs`
    async fn cached_smart_health(&self) -> BTreeMap<String, DeviceHealth> {
        if !self.config.monitoring.enable_smart_checks {
            return BTreeMap::new();
        }

        let max_age = Duration::from_secs(self.config.monitoring.smart_check_interval_secs);
        if let Some((at, results)) = self.smart_cache.read().await.as_ref()
            && at.elapsed() < max_age
        {
            return results.clone();
        }

        let results = self.check_smart_health(&self.devices()).await;
        *self.smart_cache.write().await = Some((Instant::now(), results.clone()));
        results
    }

    /// Snapshot of the retained storage health history, oldest first
    pub async fn history(&self) -> Vec<StorageHealth> {
        self.history.read().await.iter().cloned().collect()
    }

    async fn record_history(&self, snapshots: &[StorageHealth]) {
        let limit = self.config.monitoring.history_limit;
        let mut history = self.history.write().await;
        history.extend(snapshots.iter().cloned());
        while history.len() > limit {
            history.pop_front();
        }
    }

    /// One monitoring cycle: report, history, report file
    pub async fn run_cycle(&self) -> StorageResult<HealthReport> {
        let smart = self.cached_smart_health().await;
        let report = self.report_with(smart);

        self.record_history(&report.storage_health).await;
        write_report(&report, &self.config.paths.health_report_file())?;

        for error in &report.summary.errors {
            tracing::warn!(issue = %error, "Health issue");
        }
        tracing::info!(
            healthy_storage = report.summary.healthy_storage,
            total_storage = report.summary.total_storage,
            healthy_symlinks = report.summary.healthy_symlinks,
            total_symlinks = report.summary.total_symlinks,
            overall_healthy = report.summary.overall_healthy,
            "Health check complete"
        );

        Ok(report)
    }

    /// Run cycles every `every` until `shutdown` resolves
    ///
    /// A failed cycle is logged and the loop continues.
    pub async fn run_until<F>(&self, every: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(every);
        tokio::pin!(shutdown);

        tracing::info!(interval_secs = every.as_secs(), "Storage monitoring started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        tracing::error!(error = %e, "Monitoring cycle failed");
                    }
                }
            }
        }

        tracing::info!("Storage monitoring stopped");
    }

    /// Run the monitor loop until SIGINT or SIGTERM
    pub async fn start_monitor(&self, every: Option<Duration>) {
        let every =
            every.unwrap_or_else(|| Duration::from_secs(self.config.monitoring.check_interval_secs));
        self.run_until(every, shutdown_signal()).await;
    }

    pub fn measure_performance(&self, path: &Path) -> StorageResult<PerformanceMetrics> {
        performance::measure_performance(
            path,
            performance::DEFAULT_TEST_SIZE_MB,
            &self.config.monitoring,
        )
    }
}

/// Write the report as pretty JSON via a temp file and rename
pub fn write_report(report: &HealthReport, path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }

    let json = serde_json::to_vec_pretty(report).map_err(std::io::Error::other).at(path)?;

    // Atomic write: write to temp file, then rename
    let temp_file = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&temp_file).at(&temp_file)?;
        file.write_all(&json).at(&temp_file)?;
        file.sync_all().at(&temp_file)?;
    }
    std::fs::rename(&temp_file, path).at(path)?;

    tracing::debug!(path = %path.display(), "Health report written");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, stopping");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, stopping");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoragePaths;
    use crate::symlinks::LinkKind;
    use smart::mocks::MockDeviceHealthProvider;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> StorageConfig {
        let mut config = StorageConfig {
            paths: StoragePaths::from_roots(
                tmp.path().join("app"),
                tmp.path().join("models"),
                tmp.path().join("backup"),
            ),
            ..Default::default()
        };
        config.monitoring.enable_smart_checks = false;
        config.symlinks.link_user_caches = false;
        config
    }

    fn stats(used_pct: u64, inode_used_pct: u64) -> FilesystemStats {
        FilesystemStats {
            total_bytes: 1000,
            used_bytes: used_pct * 10,
            free_bytes: 1000 - used_pct * 10,
            total_inodes: 100,
            free_inodes: 100 - inode_used_pct,
        }
    }

    #[test]
    fn test_evaluate_below_thresholds() {
        let health =
            StorageHealth::evaluate(Path::new("/data"), &stats(50, 10), &MonitorSettings::default());
        assert!(health.is_healthy);
        assert!(health.warnings.is_empty());
        assert!((health.usage_percent - 50.0).abs() < 1e-9);
        assert_eq!(health.inode_used, 10);
    }

    #[test]
    fn test_evaluate_warning_keeps_healthy() {
        let health =
            StorageHealth::evaluate(Path::new("/data"), &stats(85, 10), &MonitorSettings::default());
        assert!(health.is_healthy);
        assert_eq!(health.warnings, vec!["High disk usage: 85.0%"]);
    }

    #[test]
    fn test_evaluate_critical_is_unhealthy() {
        let health =
            StorageHealth::evaluate(Path::new("/data"), &stats(95, 10), &MonitorSettings::default());
        assert!(!health.is_healthy);
        assert_eq!(health.warnings, vec!["Critical disk usage: 95.0%"]);
    }

    #[test]
    fn test_evaluate_inode_thresholds() {
        let settings = MonitorSettings::default();

        let high = StorageHealth::evaluate(Path::new("/data"), &stats(10, 85), &settings);
        assert!(high.is_healthy);
        assert_eq!(high.warnings, vec!["High inode usage: 85.0%"]);

        let critical = StorageHealth::evaluate(Path::new("/data"), &stats(10, 97), &settings);
        assert!(!critical.is_healthy);
        assert_eq!(critical.warnings, vec!["Critical inode usage: 97.0%"]);
    }

    #[test]
    fn test_check_disk_usage_missing_path() {
        let tmp = TempDir::new().unwrap();
        let monitor = StorageMonitor::new(Arc::new(config(&tmp)));

        let health = monitor.check_disk_usage(&tmp.path().join("nope"));
        assert!(!health.is_healthy);
        assert_eq!(health.warnings, vec!["Path does not exist"]);
    }

    #[test]
    fn test_check_disk_usage_real_path() {
        let tmp = TempDir::new().unwrap();
        let monitor = StorageMonitor::new(Arc::new(config(&tmp)));

        let health = monitor.check_disk_usage(tmp.path());
        assert!(health.total_space > 0);
        assert!((0.0..=100.0).contains(&health.usage_percent));

        let inodes = monitor.check_inode_usage(tmp.path()).unwrap();
        assert!((0.0..=100.0).contains(&inodes));
    }

    #[tokio::test]
    async fn test_smart_failures_become_unknown() {
        let tmp = TempDir::new().unwrap();
        let provider = Arc::new(
            MockDeviceHealthProvider::new().with_device("/dev/sda", DeviceHealthStatus::Passed),
        );
        let monitor = StorageMonitor::with_provider(Arc::new(config(&tmp)), provider.clone());

        let results = monitor
            .check_smart_health(&["/dev/sda".to_string(), "/dev/sdb".to_string()])
            .await;

        assert_eq!(results["/dev/sda"].status, DeviceHealthStatus::Passed);
        assert_eq!(results["/dev/sdb"].status, DeviceHealthStatus::Unknown);
        assert!(results["/dev/sdb"].error.is_some());
        assert_eq!(provider.queries().len(), 2);
    }

    #[test]
    fn test_report_summary() {
        let settings = MonitorSettings::default();
        let storage = vec![
            StorageHealth::evaluate(Path::new("/a"), &stats(50, 10), &settings),
            StorageHealth::evaluate(Path::new("/b"), &stats(85, 10), &settings),
            StorageHealth::unavailable(Path::new("/c"), "Path does not exist"),
        ];
        let mut healthy = SymlinkEntry::new("/l1".into(), "/t1".into(), LinkKind::Primary);
        healthy.health = LinkHealth::Healthy;
        let mut broken = SymlinkEntry::new("/l2".into(), "/t2".into(), LinkKind::Primary);
        broken.health = LinkHealth::TargetMissing;
        let smart = BTreeMap::from([(
            "/dev/sda".to_string(),
            DeviceHealth::unknown("/dev/sda", "smartctl not installed"),
        )]);

        let report = HealthReport::new(storage, vec![healthy, broken], smart);
        let summary = &report.summary;
        assert_eq!(summary.healthy_storage, 2);
        assert_eq!(summary.total_storage, 3);
        assert_eq!(summary.healthy_symlinks, 1);
        assert_eq!(summary.total_symlinks, 2);
        assert!(!summary.overall_healthy);
        assert_eq!(summary.errors.len(), 2);
        assert!(summary.errors[0].starts_with("/c"));
        assert!(summary.errors[1].starts_with("Broken symlink"));
        // High usage and the unknown device are warnings only
        assert_eq!(summary.warnings.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_devices_do_not_fail_report() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(&tmp);
        config.monitoring.enable_smart_checks = true;
        config.monitoring.devices = vec!["/dev/sdx".to_string()];
        let monitor =
            StorageMonitor::with_provider(Arc::new(config), Arc::new(MockDeviceHealthProvider::new()));

        let report = monitor.generate_report().await;
        assert_eq!(
            report.smart_health["/dev/sdx"].status,
            DeviceHealthStatus::Unknown
        );
        assert!(report.summary.errors.iter().all(|e| !e.contains("/dev/sdx")));
    }

    #[tokio::test]
    async fn test_smart_results_are_cached_between_cycles() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(&tmp);
        config.monitoring.enable_smart_checks = true;
        config.monitoring.devices = vec!["/dev/sda".to_string()];
        let provider = Arc::new(
            MockDeviceHealthProvider::new().with_device("/dev/sda", DeviceHealthStatus::Passed),
        );
        let monitor = StorageMonitor::with_provider(Arc::new(config), provider.clone());

        monitor.run_cycle().await.unwrap();
        monitor.run_cycle().await.unwrap();
        assert_eq!(provider.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_run_until_writes_report_and_bounds_history() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(&tmp);
        config.monitoring.history_limit = 2;
        let config = Arc::new(config);
        let monitor = StorageMonitor::new(config.clone());

        monitor
            .run_until(
                Duration::from_secs(60),
                tokio::time::sleep(Duration::from_millis(200)),
            )
            .await;

        let report_file = config.paths.health_report_file();
        let content = std::fs::read_to_string(&report_file).unwrap();
        let report: HealthReport = serde_json::from_str(&content).unwrap();
        assert_eq!(report.summary.total_storage, 3);
        assert!(!report_file.with_extension("json.tmp").exists());

        assert_eq!(monitor.history().await.len(), 2);
    }
}
