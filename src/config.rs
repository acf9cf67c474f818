//! Configuration structures and loading logic
//!
//! Settings are read once at process start: an optional TOML file provides the base values and
//! environment variables (`CITADEL_*`, `MODEL_*`, `SYMLINK_*`, `STORAGE_MONITOR_*`, `BACKUP_*`)
//! override individual fields. The validated [`StorageConfig`] is then handed to each component.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Complete storage configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub paths: StoragePaths,
    pub models: ModelSettings,
    pub symlinks: SymlinkSettings,
    pub monitoring: MonitorSettings,
    pub backup: BackupSettings,
}

/// Logical storage roles resolved to absolute paths
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StoragePaths {
    pub app_root: PathBuf,
    /// Application-facing models path (a symlink into `models_active`)
    pub app_models: PathBuf,
    pub app_scripts: PathBuf,
    pub app_configs: PathBuf,
    pub app_logs: PathBuf,

    pub models_root: PathBuf,
    pub models_active: PathBuf,
    pub models_archive: PathBuf,
    pub models_staging: PathBuf,
    pub cache_root: PathBuf,
    pub downloads_root: PathBuf,

    pub backup_root: PathBuf,
    pub backup_models: PathBuf,
    pub backup_system: PathBuf,

    pub hf_cache: PathBuf,
    pub torch_cache: PathBuf,
    pub vllm_cache: PathBuf,
    pub transformers_cache: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::from_roots(
            default_app_root(),
            default_models_root(),
            default_backup_root(),
        )
    }
}

impl StoragePaths {
    /// Derive the full layout from the three root directories
    pub fn from_roots(
        app_root: impl Into<PathBuf>,
        models_root: impl Into<PathBuf>,
        backup_root: impl Into<PathBuf>,
    ) -> Self {
        let app_root = app_root.into();
        let models_root = models_root.into();
        let backup_root = backup_root.into();
        let cache_root = models_root.join("cache");

        Self {
            app_models: app_root.join("models"),
            app_scripts: app_root.join("scripts"),
            app_configs: app_root.join("configs"),
            app_logs: app_root.join("logs"),
            models_active: models_root.join("active"),
            models_archive: models_root.join("archive"),
            models_staging: models_root.join("staging"),
            downloads_root: models_root.join("downloads"),
            backup_models: backup_root.join("models"),
            backup_system: backup_root.join("system"),
            hf_cache: cache_root.clone(),
            torch_cache: cache_root.join("torch"),
            vllm_cache: cache_root.join("vllm"),
            transformers_cache: cache_root.join("transformers"),
            cache_root,
            app_root,
            models_root,
            backup_root,
        }
    }

    /// All configured paths with their role names, in declaration order
    pub fn roles(&self) -> Vec<(&'static str, &Path)> {
        vec![
            ("app_root", self.app_root.as_path()),
            ("app_models", self.app_models.as_path()),
            ("app_scripts", self.app_scripts.as_path()),
            ("app_configs", self.app_configs.as_path()),
            ("app_logs", self.app_logs.as_path()),
            ("models_root", self.models_root.as_path()),
            ("models_active", self.models_active.as_path()),
            ("models_archive", self.models_archive.as_path()),
            ("models_staging", self.models_staging.as_path()),
            ("cache_root", self.cache_root.as_path()),
            ("downloads_root", self.downloads_root.as_path()),
            ("backup_root", self.backup_root.as_path()),
            ("backup_models", self.backup_models.as_path()),
            ("backup_system", self.backup_system.as_path()),
            ("hf_cache", self.hf_cache.as_path()),
            ("torch_cache", self.torch_cache.as_path()),
            ("vllm_cache", self.vllm_cache.as_path()),
            ("transformers_cache", self.transformers_cache.as_path()),
        ]
    }

    /// Directory holding the per-model convenience links
    pub fn model_links_dir(&self) -> PathBuf {
        self.app_root.join("model-links")
    }

    /// Path of the generated environment script
    pub fn env_script(&self) -> PathBuf {
        self.app_configs.join("storage-env.sh")
    }

    /// Path of the latest health report written by the monitor loop
    pub fn health_report_file(&self) -> PathBuf {
        self.app_logs.join("storage_health_report.json")
    }
}

/// Model directory names and convenience aliases
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    /// Model key -> directory name under `models_active`
    pub model_directories: BTreeMap<String, String>,
    /// Short alias -> model key
    pub convenience_links: BTreeMap<String, String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_directories: default_model_directories(),
            convenience_links: default_convenience_links(),
        }
    }
}

impl ModelSettings {
    /// Resolve a convenience alias to its model directory name
    pub fn resolve_alias(&self, alias: &str) -> Option<&str> {
        self.convenience_links
            .get(alias)
            .and_then(|key| self.model_directories.get(key))
            .map(String::as_str)
    }
}

/// Symlink creation and repair behavior
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SymlinkSettings {
    /// Replace links that already exist but point elsewhere
    pub force_recreate: bool,
    /// Check that targets exist before linking
    pub verify_targets: bool,
    /// Create missing target directories instead of failing
    pub create_missing_targets: bool,
    /// Octal permission string applied to directories we create
    pub directory_mode: String,
    /// Link `~/.cache/huggingface` and `~/.cache/torch` into the cache root
    pub link_user_caches: bool,
    /// Home directory used for the cache links (defaults to the current user's home)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_link_home: Option<PathBuf>,
    /// Repair broken links during `setup`
    pub repair_broken_links: bool,
}

impl Default for SymlinkSettings {
    fn default() -> Self {
        Self {
            force_recreate: false,
            verify_targets: true,
            create_missing_targets: true,
            directory_mode: "0755".to_string(),
            link_user_caches: true,
            cache_link_home: None,
            repair_broken_links: true,
        }
    }
}

impl SymlinkSettings {
    /// Parsed directory mode
    pub fn directory_mode(&self) -> StorageResult<u32> {
        let mode = u32::from_str_radix(self.directory_mode.trim_start_matches("0o"), 8)
            .map_err(|e| {
                StorageError::Configuration(format!(
                    "Invalid directory_mode '{}': {}",
                    self.directory_mode, e
                ))
            })?;
        if mode > 0o7777 {
            return Err(StorageError::Configuration(format!(
                "directory_mode '{}' is out of range",
                self.directory_mode
            )));
        }
        Ok(mode)
    }

    /// Home directory that the user cache links live under
    pub fn cache_home(&self) -> Option<PathBuf> {
        self.cache_link_home.clone().or_else(dirs::home_dir)
    }
}

/// Storage monitoring thresholds and intervals
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    pub enable_monitoring: bool,
    pub check_interval_secs: u64,

    pub disk_usage_warning: f64,
    pub disk_usage_critical: f64,
    pub inode_usage_warning: f64,
    pub inode_usage_critical: f64,

    pub enable_smart_checks: bool,
    pub smart_check_interval_secs: u64,
    pub smartctl_path: String,
    /// Prefix SMART queries with `sudo -n`
    pub smart_use_sudo: bool,
    pub smart_timeout_secs: u64,
    pub smart_temperature_warning: f64,
    /// Explicit device list; enumerated from /dev when empty
    pub devices: Vec<String>,

    pub io_latency_threshold_ms: f64,
    pub throughput_threshold_mbps: f64,

    /// Number of health snapshots kept in memory by the monitor loop
    pub history_limit: usize,

    pub metrics_export_enabled: bool,
    pub metrics_port: u16,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enable_monitoring: true,
            check_interval_secs: 60,
            disk_usage_warning: 0.8,
            disk_usage_critical: 0.9,
            inode_usage_warning: 0.8,
            inode_usage_critical: 0.95,
            enable_smart_checks: true,
            smart_check_interval_secs: 3600,
            smartctl_path: "smartctl".to_string(),
            smart_use_sudo: false,
            smart_timeout_secs: 30,
            smart_temperature_warning: 60.0,
            devices: Vec::new(),
            io_latency_threshold_ms: 100.0,
            throughput_threshold_mbps: 100.0,
            history_limit: 1000,
            metrics_export_enabled: false,
            metrics_port: 8000,
        }
    }
}

/// Backup retention and verification
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackupSettings {
    pub retention_days: u32,
    /// Default to incremental backups when no type is given
    pub incremental_backup: bool,
    /// Run a sampled verification right after each backup
    pub verify_backups: bool,
    pub verification_sample_rate: f64,
    /// Log copy progress every N files
    pub progress_log_interval: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            retention_days: 30,
            incremental_backup: true,
            verify_backups: true,
            verification_sample_rate: 0.1,
            progress_log_interval: 1000,
        }
    }
}

impl StorageConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> StorageResult<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                StorageError::Configuration(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            toml::from_str(&content).map_err(|e| {
                StorageError::Configuration(format!("Failed to parse TOML config: {}", e))
            })?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;

        Ok(config)
    }

    /// Apply `CITADEL_*`, `MODEL_*`, `SYMLINK_*`, `STORAGE_MONITOR_*` and `BACKUP_*` overrides
    ///
    /// `MODELS_CACHE` and `MODELS_DOWNLOADS` are accepted as aliases; the `CITADEL_` names win
    /// when both are set.
    pub fn apply_env_overrides(&mut self) -> StorageResult<()> {
        // A root override re-derives every path under it; per-path variables then apply on top
        let mut app_root = self.paths.app_root.clone();
        let mut models_root = self.paths.models_root.clone();
        let mut backup_root = self.paths.backup_root.clone();
        env_override(&mut app_root, "CITADEL_APP_ROOT")?;
        env_override(&mut models_root, "CITADEL_MODELS_ROOT")?;
        env_override(&mut backup_root, "CITADEL_BACKUP_ROOT")?;
        if app_root != self.paths.app_root
            || models_root != self.paths.models_root
            || backup_root != self.paths.backup_root
        {
            self.paths = StoragePaths::from_roots(app_root, models_root, backup_root);
        }

        let p = &mut self.paths;
        env_override(&mut p.app_models, "CITADEL_APP_MODELS")?;
        env_override(&mut p.app_scripts, "CITADEL_APP_SCRIPTS")?;
        env_override(&mut p.app_configs, "CITADEL_APP_CONFIGS")?;
        env_override(&mut p.app_logs, "CITADEL_APP_LOGS")?;
        env_override(&mut p.models_active, "CITADEL_MODELS_ACTIVE")?;
        env_override(&mut p.models_archive, "CITADEL_MODELS_ARCHIVE")?;
        env_override(&mut p.models_staging, "CITADEL_MODELS_STAGING")?;
        env_override(&mut p.cache_root, "MODELS_CACHE")?;
        env_override(&mut p.cache_root, "CITADEL_CACHE_ROOT")?;
        env_override(&mut p.downloads_root, "MODELS_DOWNLOADS")?;
        env_override(&mut p.downloads_root, "CITADEL_DOWNLOADS_ROOT")?;
        env_override(&mut p.backup_models, "CITADEL_BACKUP_MODELS")?;
        env_override(&mut p.backup_system, "CITADEL_BACKUP_SYSTEM")?;
        env_override(&mut p.hf_cache, "CITADEL_HF_CACHE")?;
        env_override(&mut p.torch_cache, "CITADEL_TORCH_CACHE")?;
        env_override(&mut p.vllm_cache, "CITADEL_VLLM_CACHE")?;
        env_override(&mut p.transformers_cache, "CITADEL_TRANSFORMERS_CACHE")?;

        env_override_json(&mut self.models.model_directories, "MODEL_DIRECTORIES")?;
        env_override_json(&mut self.models.convenience_links, "MODEL_CONVENIENCE_LINKS")?;

        let s = &mut self.symlinks;
        env_flag(&mut s.force_recreate, "SYMLINK_FORCE_RECREATE")?;
        env_flag(&mut s.verify_targets, "SYMLINK_VERIFY_TARGETS")?;
        env_flag(&mut s.create_missing_targets, "SYMLINK_CREATE_MISSING_TARGETS")?;
        env_override(&mut s.directory_mode, "SYMLINK_DIRECTORY_MODE")?;
        env_flag(&mut s.link_user_caches, "SYMLINK_LINK_USER_CACHES")?;
        env_flag(&mut s.repair_broken_links, "SYMLINK_REPAIR_BROKEN_LINKS")?;
        if let Ok(home) = std::env::var("SYMLINK_CACHE_LINK_HOME") {
            s.cache_link_home = Some(PathBuf::from(home));
        }

        let m = &mut self.monitoring;
        env_flag(&mut m.enable_monitoring, "STORAGE_MONITOR_ENABLE_MONITORING")?;
        env_override(&mut m.check_interval_secs, "STORAGE_MONITOR_CHECK_INTERVAL")?;
        env_override(&mut m.disk_usage_warning, "STORAGE_MONITOR_DISK_USAGE_WARNING")?;
        env_override(&mut m.disk_usage_critical, "STORAGE_MONITOR_DISK_USAGE_CRITICAL")?;
        env_override(&mut m.inode_usage_warning, "STORAGE_MONITOR_INODE_USAGE_WARNING")?;
        env_override(&mut m.inode_usage_critical, "STORAGE_MONITOR_INODE_USAGE_CRITICAL")?;
        env_flag(&mut m.enable_smart_checks, "STORAGE_MONITOR_ENABLE_SMART_CHECKS")?;
        env_override(&mut m.smart_check_interval_secs, "STORAGE_MONITOR_SMART_CHECK_INTERVAL")?;
        env_override(&mut m.smartctl_path, "STORAGE_MONITOR_SMARTCTL_PATH")?;
        env_flag(&mut m.smart_use_sudo, "STORAGE_MONITOR_SMART_USE_SUDO")?;
        env_override(&mut m.io_latency_threshold_ms, "STORAGE_MONITOR_IO_LATENCY_THRESHOLD")?;
        env_override(&mut m.throughput_threshold_mbps, "STORAGE_MONITOR_THROUGHPUT_THRESHOLD")?;
        env_flag(&mut m.metrics_export_enabled, "STORAGE_MONITOR_METRICS_EXPORT_ENABLED")?;
        env_override(&mut m.metrics_port, "STORAGE_MONITOR_METRICS_PORT")?;
        if let Ok(devices) = std::env::var("STORAGE_MONITOR_DEVICES") {
            m.devices = devices
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
        }

        let b = &mut self.backup;
        env_override(&mut b.retention_days, "BACKUP_RETENTION_DAYS")?;
        env_flag(&mut b.incremental_backup, "BACKUP_INCREMENTAL_BACKUP")?;
        env_flag(&mut b.verify_backups, "BACKUP_VERIFY_BACKUPS")?;
        env_override(&mut b.verification_sample_rate, "BACKUP_VERIFICATION_SAMPLE_RATE")?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> StorageResult<()> {
        for (role, path) in self.paths.roles() {
            if !path.is_absolute() {
                return Err(config_err(format!(
                    "Path '{}' for {} must be absolute",
                    path.display(),
                    role
                )));
            }
            ensure_creatable(role, path)?;
        }

        let m = &self.monitoring;
        check_fraction("disk_usage_warning", m.disk_usage_warning)?;
        check_fraction("disk_usage_critical", m.disk_usage_critical)?;
        check_fraction("inode_usage_warning", m.inode_usage_warning)?;
        check_fraction("inode_usage_critical", m.inode_usage_critical)?;
        if m.disk_usage_warning > m.disk_usage_critical {
            return Err(config_err(
                "disk_usage_warning must not exceed disk_usage_critical",
            ));
        }
        if m.inode_usage_warning > m.inode_usage_critical {
            return Err(config_err(
                "inode_usage_warning must not exceed inode_usage_critical",
            ));
        }
        if m.check_interval_secs == 0 {
            return Err(config_err("check_interval_secs must be > 0"));
        }

        let rate = self.backup.verification_sample_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(config_err(format!(
                "verification_sample_rate must be within [0.0, 1.0] (got {})",
                rate
            )));
        }

        self.symlinks.directory_mode()?;

        for (key, dir) in &self.models.model_directories {
            validate_name("model key", key)?;
            validate_name("model directory", dir)?;
        }
        for (alias, key) in &self.models.convenience_links {
            validate_name("convenience link", alias)?;
            if !self.models.model_directories.contains_key(key) {
                return Err(config_err(format!(
                    "Convenience link '{}' references unknown model '{}'",
                    alias, key
                )));
            }
        }

        Ok(())
    }
}

fn config_err(msg: impl Into<String>) -> StorageError {
    StorageError::Configuration(msg.into())
}

fn env_override<T>(target: &mut T, key: &str) -> StorageResult<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Ok(value) = std::env::var(key) {
        *target = value
            .parse()
            .map_err(|e| config_err(format!("Invalid {} value: {}", key, e)))?;
    }
    Ok(())
}

fn env_flag(target: &mut bool, key: &str) -> StorageResult<()> {
    if let Ok(value) = std::env::var(key) {
        *target = match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => return Err(config_err(format!("Invalid {} value: {}", key, other))),
        };
    }
    Ok(())
}

fn env_override_json<T>(target: &mut T, key: &str) -> StorageResult<()>
where
    T: serde::de::DeserializeOwned,
{
    if let Ok(value) = std::env::var(key) {
        *target = serde_json::from_str(&value)
            .map_err(|e| config_err(format!("Invalid {} value: {}", key, e)))?;
    }
    Ok(())
}

fn check_fraction(name: &str, value: f64) -> StorageResult<()> {
    if !(0.1..=1.0).contains(&value) {
        return Err(config_err(format!(
            "{} must be within [0.1, 1.0] (got {})",
            name, value
        )));
    }
    Ok(())
}

fn validate_name(kind: &str, name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(config_err(format!("{} cannot be empty", kind)));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(config_err(format!(
            "{} '{}' cannot contain path separators",
            kind, name
        )));
    }
    Ok(())
}

/// A path must either exist as a directory (or a link to one) or have a writable ancestor
fn ensure_creatable(role: &str, path: &Path) -> StorageResult<()> {
    use nix::unistd::{AccessFlags, access};

    if path.is_symlink() || path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(config_err(format!(
            "Path '{}' for {} exists but is not a directory",
            path.display(),
            role
        )));
    }

    let ancestor = path
        .ancestors()
        .skip(1)
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"));

    access(ancestor, AccessFlags::W_OK | AccessFlags::X_OK).map_err(|e| {
        config_err(format!(
            "Path '{}' for {} cannot be created: '{}' is not writable ({})",
            path.display(),
            role,
            ancestor.display(),
            e
        ))
    })
}

// Default functions
fn default_app_root() -> PathBuf {
    PathBuf::from("/opt/citadel")
}
fn default_models_root() -> PathBuf {
    PathBuf::from("/mnt/citadel-models")
}
fn default_backup_root() -> PathBuf {
    PathBuf::from("/mnt/citadel-backup")
}
fn default_model_directories() -> BTreeMap<String, String> {
    [
        ("mixtral-8x7b-instruct", "Mixtral-8x7B-Instruct-v0.1"),
        ("yi-34b-chat", "Yi-34B-Chat"),
        ("nous-hermes-2-mixtral", "Nous-Hermes-2-Mixtral-8x7B-DPO"),
        ("openchat-3.5", "openchat-3.5-1210"),
        ("phi-3-mini-128k", "Phi-3-mini-128k-instruct"),
        ("deepcoder-14b-instruct", "deepseek-coder-14b-instruct-v1.5"),
        ("mimo-vl-7b-rl", "imp-v1_5-7b"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
fn default_convenience_links() -> BTreeMap<String, String> {
    [
        ("mixtral", "mixtral-8x7b-instruct"),
        ("yi34b", "yi-34b-chat"),
        ("hermes", "nous-hermes-2-mixtral"),
        ("openchat", "openchat-3.5"),
        ("phi3", "phi-3-mini-128k"),
        ("coder", "deepcoder-14b-instruct"),
        ("vision", "mimo-vl-7b-rl"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn rooted(tmp: &TempDir) -> StorageConfig {
        StorageConfig {
            paths: StoragePaths::from_roots(
                tmp.path().join("app"),
                tmp.path().join("models"),
                tmp.path().join("backup"),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.paths.app_root, PathBuf::from("/opt/citadel"));
        assert_eq!(
            config.paths.models_active,
            PathBuf::from("/mnt/citadel-models/active")
        );
        assert_eq!(config.paths.hf_cache, config.paths.cache_root);
        assert_eq!(config.monitoring.disk_usage_warning, 0.8);
        assert_eq!(config.monitoring.disk_usage_critical, 0.9);
        assert_eq!(config.backup.verification_sample_rate, 0.1);
        assert_eq!(config.models.model_directories.len(), 7);
        assert_eq!(config.models.convenience_links.len(), 7);
    }

    #[test]
    fn test_resolve_alias() {
        let models = ModelSettings::default();
        assert_eq!(
            models.resolve_alias("mixtral"),
            Some("Mixtral-8x7B-Instruct-v0.1")
        );
        assert_eq!(models.resolve_alias("nope"), None);
    }

    #[test]
    fn test_rooted_config_validates() {
        let tmp = TempDir::new().unwrap();
        assert!(rooted(&tmp).validate().is_ok());
    }

    #[test]
    fn test_relative_path_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = rooted(&tmp);
        config.paths.backup_root = PathBuf::from("relative/backup");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));
    }

    #[test]
    fn test_file_in_place_of_directory_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = rooted(&tmp);
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        config.paths.models_root = file;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_validation() {
        let tmp = TempDir::new().unwrap();

        let mut config = rooted(&tmp);
        config.monitoring.disk_usage_warning = 0.05;
        assert!(config.validate().is_err());

        let mut config = rooted(&tmp);
        config.monitoring.disk_usage_warning = 0.95;
        config.monitoring.disk_usage_critical = 0.9;
        assert!(config.validate().is_err());

        let mut config = rooted(&tmp);
        config.backup.verification_sample_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_directory_mode_parsing() {
        let mut settings = SymlinkSettings::default();
        assert_eq!(settings.directory_mode().unwrap(), 0o755);

        settings.directory_mode = "0o700".to_string();
        assert_eq!(settings.directory_mode().unwrap(), 0o700);

        settings.directory_mode = "rwx".to_string();
        assert!(settings.directory_mode().is_err());
    }

    #[test]
    fn test_unknown_convenience_target_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = rooted(&tmp);
        config
            .models
            .convenience_links
            .insert("ghost".to_string(), "missing-model".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_name_validation() {
        let tmp = TempDir::new().unwrap();
        let mut config = rooted(&tmp);
        config
            .models
            .model_directories
            .insert("bad".to_string(), "../escape".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_toml() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("storage.toml");
        std::fs::write(
            &file,
            r#"
[paths]
app_root = "/srv/app"

[monitoring]
check_interval_secs = 15
disk_usage_warning = 0.7

[backup]
retention_days = 7
"#,
        )
        .unwrap();

        let config = StorageConfig::load(Some(file)).unwrap();
        assert_eq!(config.paths.app_root, PathBuf::from("/srv/app"));
        // Unspecified fields keep their defaults
        assert_eq!(
            config.paths.models_root,
            PathBuf::from("/mnt/citadel-models")
        );
        assert_eq!(config.monitoring.check_interval_secs, 15);
        assert_eq!(config.monitoring.disk_usage_warning, 0.7);
        assert_eq!(config.backup.retention_days, 7);
    }

    #[test]
    #[serial]
    fn test_load_invalid_toml() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("broken.toml");
        std::fs::write(&file, "this is not valid TOML {{{}}").unwrap();
        assert!(matches!(
            StorageConfig::load(Some(file)),
            Err(StorageError::Configuration(_))
        ));
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        unsafe {
            std::env::set_var("CITADEL_MODELS_ROOT", "/data/models");
            std::env::set_var("SYMLINK_FORCE_RECREATE", "yes");
            std::env::set_var("STORAGE_MONITOR_CHECK_INTERVAL", "5");
            std::env::set_var("BACKUP_RETENTION_DAYS", "14");
            std::env::set_var("MODEL_CONVENIENCE_LINKS", r#"{"mixtral":"mixtral-8x7b-instruct"}"#);
        }

        let config = StorageConfig::load(None);

        unsafe {
            std::env::remove_var("CITADEL_MODELS_ROOT");
            std::env::remove_var("SYMLINK_FORCE_RECREATE");
            std::env::remove_var("STORAGE_MONITOR_CHECK_INTERVAL");
            std::env::remove_var("BACKUP_RETENTION_DAYS");
            std::env::remove_var("MODEL_CONVENIENCE_LINKS");
        }

        let config = config.unwrap();
        assert_eq!(config.paths.models_root, PathBuf::from("/data/models"));
        assert!(config.symlinks.force_recreate);
        assert_eq!(config.monitoring.check_interval_secs, 5);
        assert_eq!(config.backup.retention_days, 14);
        assert_eq!(config.models.convenience_links.len(), 1);
        assert_eq!(
            config.paths.models_active,
            PathBuf::from("/data/models/active")
        );
        assert_eq!(
            config.paths.downloads_root,
            PathBuf::from("/data/models/downloads")
        );
    }

    #[test]
    #[serial]
    fn test_invalid_environment_value() {
        unsafe {
            std::env::set_var("STORAGE_MONITOR_CHECK_INTERVAL", "often");
        }
        let result = StorageConfig::load(None);
        unsafe {
            std::env::remove_var("STORAGE_MONITOR_CHECK_INTERVAL");
        }
        assert!(matches!(result, Err(StorageError::Configuration(_))));
    }

    #[test]
    #[serial]
    fn test_cache_and_download_aliases() {
        unsafe {
            std::env::set_var("MODELS_CACHE", "/fast/cache");
            std::env::set_var("MODELS_DOWNLOADS", "/fast/downloads");
            std::env::set_var("CITADEL_DOWNLOADS_ROOT", "/bulk/downloads");
        }
        let config = StorageConfig::load(None);
        unsafe {
            std::env::remove_var("MODELS_CACHE");
            std::env::remove_var("MODELS_DOWNLOADS");
            std::env::remove_var("CITADEL_DOWNLOADS_ROOT");
        }

        let config = config.unwrap();
        assert_eq!(config.paths.cache_root, PathBuf::from("/fast/cache"));
        assert_eq!(config.paths.downloads_root, PathBuf::from("/bulk/downloads"));
    }
}
