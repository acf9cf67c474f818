//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};

/// Install the Prometheus recorder and serve `/metrics` on `port`
///
/// Must be called from within a tokio runtime.
pub fn setup_metrics(port: u16) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!(%addr, "Prometheus metrics exporter listening");

    Ok(())
}

/// Update disk usage gauges for a monitored path
pub fn record_disk_usage(path: &str, usage_percent: f64, free_bytes: u64) {
    metrics::gauge!("citadel_storage_disk_usage_percent",
        "path" => path.to_string()
    )
    .set(usage_percent);
    metrics::gauge!("citadel_storage_disk_free_bytes",
        "path" => path.to_string()
    )
    .set(free_bytes as f64);
}

/// Update inode usage gauge for a monitored path
pub fn record_inode_usage(path: &str, usage_percent: f64) {
    metrics::gauge!("citadel_storage_inode_usage_percent",
        "path" => path.to_string()
    )
    .set(usage_percent);
}

/// Record a storage health warning
pub fn record_health_warning(path: &str) {
    metrics::counter!("citadel_storage_health_warnings_total",
        "path" => path.to_string()
    )
    .increment(1);
}

/// Update device health gauge (1 passed, 0 failing, -1 unknown)
pub fn record_device_health(device: &str, value: f64) {
    metrics::gauge!("citadel_storage_device_health",
        "device" => device.to_string()
    )
    .set(value);
}

/// Update broken symlink count gauge
pub fn update_broken_symlinks(count: usize) {
    metrics::gauge!("citadel_storage_broken_symlinks").set(count as f64);
}

/// Record repaired symlinks
pub fn record_symlink_repairs(count: usize) {
    metrics::counter!("citadel_storage_symlink_repairs_total").increment(count as u64);
}

/// Record a finished backup job
pub fn record_backup_completed(backup_type: &str, bytes_written: u64, files_linked: u64) {
    metrics::counter!("citadel_storage_backups_completed_total",
        "type" => backup_type.to_string()
    )
    .increment(1);
    metrics::counter!("citadel_storage_backup_bytes_written_total",
        "type" => backup_type.to_string()
    )
    .increment(bytes_written);
    metrics::counter!("citadel_storage_backup_files_linked_total",
        "type" => backup_type.to_string()
    )
    .increment(files_linked);
}

/// Record a failed backup job
pub fn record_backup_failed(backup_type: &str) {
    metrics::counter!("citadel_storage_backups_failed_total",
        "type" => backup_type.to_string()
    )
    .increment(1);
}

/// Record backups removed by retention cleanup
pub fn record_backups_removed(count: usize) {
    metrics::counter!("citadel_storage_backups_removed_total").increment(count as u64);
}
