//! Sequential throughput probe

use crate::config::MonitorSettings;
use crate::error::{IoResultExt, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

const PROBE_FILE: &str = ".storage_perf_test";
const CHUNK: usize = 1024 * 1024;
const BLOCKS_PER_MB: f64 = 256.0;

/// Default probe size
pub const DEFAULT_TEST_SIZE_MB: usize = 10;

/// Measured sequential I/O for a directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub path: PathBuf,
    /// Milliseconds per MiB read
    pub read_latency_ms: f64,
    /// Milliseconds per MiB written, including fsync
    pub write_latency_ms: f64,
    pub read_throughput_mbps: f64,
    pub write_throughput_mbps: f64,
    /// Estimated 4 KiB operations per second
    pub iops_read: f64,
    pub iops_write: f64,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

// Removes the probe file on every exit path
struct ProbeFile(PathBuf);

impl Drop for ProbeFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Write then read back `test_size_mb` MiB in `path`, creating the directory if needed
pub fn measure_performance(
    path: &Path,
    test_size_mb: usize,
    settings: &MonitorSettings,
) -> StorageResult<PerformanceMetrics> {
    std::fs::create_dir_all(path).at(path)?;
    let probe = ProbeFile(path.join(PROBE_FILE));
    let data = vec![b'0'; CHUNK];

    let write_start = Instant::now();
    {
        let mut file = File::create(&probe.0).at(&probe.0)?;
        for _ in 0..test_size_mb {
            file.write_all(&data).at(&probe.0)?;
        }
        file.sync_all().at(&probe.0)?;
    }
    let write_secs = write_start.elapsed().as_secs_f64();

    let read_start = Instant::now();
    {
        let mut file = File::open(&probe.0).at(&probe.0)?;
        let mut buf = vec![0u8; CHUNK];
        while file.read(&mut buf).at(&probe.0)? > 0 {}
    }
    let read_secs = read_start.elapsed().as_secs_f64();
    drop(probe);

    let size = test_size_mb as f64;
    let per_sec = |amount: f64, secs: f64| if secs > 0.0 { amount / secs } else { 0.0 };
    let per_mb_ms = |secs: f64| if size > 0.0 { secs / size * 1000.0 } else { 0.0 };

    let mut metrics = PerformanceMetrics {
        path: path.to_path_buf(),
        read_latency_ms: per_mb_ms(read_secs),
        write_latency_ms: per_mb_ms(write_secs),
        read_throughput_mbps: per_sec(size, read_secs),
        write_throughput_mbps: per_sec(size, write_secs),
        iops_read: per_sec(size * BLOCKS_PER_MB, read_secs),
        iops_write: per_sec(size * BLOCKS_PER_MB, write_secs),
        warnings: Vec::new(),
        timestamp: Utc::now(),
    };
    metrics.warnings = performance_warnings(&metrics, settings);

    tracing::info!(
        path = %path.display(),
        write_mbps = format!("{:.1}", metrics.write_throughput_mbps),
        read_mbps = format!("{:.1}", metrics.read_throughput_mbps),
        "Performance probe complete"
    );

    Ok(metrics)
}

fn performance_warnings(metrics: &PerformanceMetrics, settings: &MonitorSettings) -> Vec<String> {
    let mut warnings = Vec::new();
    let latency_limit = settings.io_latency_threshold_ms;
    let throughput_floor = settings.throughput_threshold_mbps;

    for (label, latency) in [
        ("read", metrics.read_latency_ms),
        ("write", metrics.write_latency_ms),
    ] {
        if latency > latency_limit {
            warnings.push(format!(
                "High {} latency: {:.1}ms per MiB (threshold {}ms)",
                label, latency, settings.io_latency_threshold_ms
            ));
        }
    }
    for (label, throughput) in [
        ("read", metrics.read_throughput_mbps),
        ("write", metrics.write_throughput_mbps),
    ] {
        if throughput > 0.0 && throughput < throughput_floor {
            warnings.push(format!(
                "Low {} throughput: {:.1}MB/s (threshold {}MB/s)",
                label, throughput, settings.throughput_threshold_mbps
            ));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_measure_performance() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("perf_test");

        let metrics = measure_performance(&dir, 1, &MonitorSettings::default()).unwrap();
        assert_eq!(metrics.path, dir);
        assert!(metrics.read_latency_ms >= 0.0);
        assert!(metrics.write_latency_ms >= 0.0);
        assert!(metrics.write_throughput_mbps >= 0.0);
        assert!(!dir.join(PROBE_FILE).exists());
    }

    #[test]
    fn test_warnings_against_thresholds() {
        let settings = MonitorSettings::default();
        let slow = PerformanceMetrics {
            path: PathBuf::from("/data"),
            read_latency_ms: 5.0,
            write_latency_ms: 250.0,
            read_throughput_mbps: 200.0,
            write_throughput_mbps: 4.0,
            iops_read: 0.0,
            iops_write: 0.0,
            warnings: Vec::new(),
            timestamp: Utc::now(),
        };

        let warnings = performance_warnings(&slow, &settings);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("write latency"));
        assert!(warnings[1].contains("write throughput"));
    }
}
