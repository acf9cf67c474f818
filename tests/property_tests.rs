//! Property-based tests using proptest
//!
//! These tests verify invariants across randomized inputs, helping catch
//! edge cases that might be missed by example-based testing.

use chrono::{Duration, Utc};
use citadel_storage::backup::{BackupJob, BackupManager, BackupStatus, BackupType, sample_size};
use citadel_storage::config::{MonitorSettings, StorageConfig, StoragePaths};
use citadel_storage::monitor::{FilesystemStats, StorageHealth};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

// =============================================================================
// Arbitrary Implementations
// =============================================================================

/// Filesystem counters with used <= total
fn arb_stats() -> impl Strategy<Value = FilesystemStats> {
    (1u64..1 << 40, 0.0f64..=1.0, 1u64..1 << 24, 0.0f64..=1.0).prop_map(
        |(total_bytes, used_frac, total_inodes, used_inode_frac)| {
            let used_bytes = (total_bytes as f64 * used_frac) as u64;
            let used_inodes = (total_inodes as f64 * used_inode_frac) as u64;
            FilesystemStats {
                total_bytes,
                used_bytes,
                free_bytes: total_bytes - used_bytes,
                total_inodes,
                free_inodes: total_inodes - used_inodes,
            }
        },
    )
}

/// Threshold pairs that pass config validation
fn arb_thresholds() -> impl Strategy<Value = MonitorSettings> {
    (0.1f64..=1.0, 0.1f64..=1.0, 0.1f64..=1.0, 0.1f64..=1.0).prop_map(|(a, b, c, d)| {
        MonitorSettings {
            disk_usage_warning: a.min(b),
            disk_usage_critical: a.max(b),
            inode_usage_warning: c.min(d),
            inode_usage_critical: c.max(d),
            ..Default::default()
        }
    })
}

// =============================================================================
// Threshold Invariants
// =============================================================================

proptest! {
    /// A path is unhealthy exactly when a critical threshold is exceeded
    #[test]
    fn unhealthy_iff_critical(stats in arb_stats(), settings in arb_thresholds()) {
        let health = StorageHealth::evaluate(Path::new("/data"), &stats, &settings);
        let critical = stats.usage_fraction() > settings.disk_usage_critical
            || stats.inode_usage_fraction() > settings.inode_usage_critical;
        prop_assert_eq!(health.is_healthy, !critical);
    }

    /// Warnings appear exactly when a warning threshold is exceeded
    #[test]
    fn warnings_iff_warning_threshold(stats in arb_stats(), settings in arb_thresholds()) {
        let health = StorageHealth::evaluate(Path::new("/data"), &stats, &settings);
        let warned = stats.usage_fraction() > settings.disk_usage_warning
            || stats.inode_usage_fraction() > settings.inode_usage_warning;
        prop_assert_eq!(!health.warnings.is_empty(), warned);
        prop_assert!(health.warnings.len() <= 2);
    }

    /// Percentages stay within [0, 100]
    #[test]
    fn usage_percent_in_range(stats in arb_stats()) {
        let health = StorageHealth::evaluate(Path::new("/data"), &stats, &MonitorSettings::default());
        prop_assert!((0.0..=100.0).contains(&health.usage_percent));
        prop_assert!((0.0..=100.0).contains(&health.inode_usage_percent));
    }
}

// =============================================================================
// Verification Sampling
// =============================================================================

proptest! {
    /// Sample size never exceeds the population and is non-zero when files exist
    #[test]
    fn sample_size_bounds(total in 0usize..100_000, rate in 0.0f64..=1.0) {
        let n = sample_size(total, rate);
        prop_assert!(n <= total);
        prop_assert_eq!(n == 0, total == 0);
    }

    /// Raising the rate never checks fewer files
    #[test]
    fn sample_size_monotonic(total in 0usize..100_000, a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(sample_size(total, lo) <= sample_size(total, hi));
    }

    /// A full rate checks everything
    #[test]
    fn sample_size_full(total in 0usize..100_000) {
        prop_assert_eq!(sample_size(total, 1.0), total);
    }
}

// =============================================================================
// Retention
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Cleanup removes exactly the backups created strictly before the cutoff
    #[test]
    fn cleanup_removes_exactly_older(ages in prop::collection::vec(-3600i64..3600, 1..8)) {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig {
            paths: StoragePaths::from_roots(
                tmp.path().join("app"),
                tmp.path().join("models"),
                tmp.path().join("backup"),
            ),
            ..Default::default()
        };
        let cutoff = Utc::now();
        let manager = BackupManager::new(Arc::new(config.clone()));

        let mut expected = BTreeSet::new();
        for (i, age) in ages.iter().enumerate() {
            let id = format!("active_full_{}", i);
            let dest = config.paths.backup_models.join(&id);
            std::fs::create_dir_all(&dest).unwrap();

            let mut job = BackupJob::new(id.clone(), tmp.path().join("active"), dest, BackupType::Full);
            job.status = BackupStatus::Completed;
            // Positive ages are in the past; zero sits exactly on the cutoff
            job.created_at = cutoff - Duration::seconds(*age);
            manager.index().append(&job).unwrap();
            if *age > 0 {
                expected.insert(id);
            }
        }

        let removed: BTreeSet<String> = manager.cleanup_before(cutoff).unwrap().into_iter().collect();
        prop_assert_eq!(&removed, &expected);

        for (i, _) in ages.iter().enumerate() {
            let id = format!("active_full_{}", i);
            let exists = config.paths.backup_models.join(&id).exists();
            prop_assert_eq!(exists, !expected.contains(&id));
        }

        let remaining = manager.index().load().unwrap().len();
        prop_assert_eq!(remaining, ages.len() - expected.len());
    }
}
