//! SMART device health via smartctl
//!
//! All knowledge of smartctl's text output lives in this file. Callers only see
//! [`DeviceHealth`] values produced through the [`DeviceHealthProvider`] trait.

use crate::config::MonitorSettings;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::process::Command;

// ============================================================================
// Types
// ============================================================================

/// Overall SMART self-assessment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceHealthStatus {
    Passed,
    Failing,
    Unknown,
}

/// Health of a single block device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHealth {
    pub device: String,
    pub status: DeviceHealthStatus,
    pub temperature_celsius: Option<f64>,
    pub reallocated_sectors: Option<u64>,
    pub warnings: Vec<String>,
    /// Why the device could not be assessed
    pub error: Option<String>,
}

impl DeviceHealth {
    pub fn unknown(device: &str, reason: impl Into<String>) -> Self {
        Self {
            device: device.to_string(),
            status: DeviceHealthStatus::Unknown,
            temperature_celsius: None,
            reallocated_sectors: None,
            warnings: Vec::new(),
            error: Some(reason.into()),
        }
    }

    /// Gauge value: 1 passed, 0 failing, -1 unknown
    pub fn metric_value(&self) -> f64 {
        match self.status {
            DeviceHealthStatus::Passed => 1.0,
            DeviceHealthStatus::Failing => 0.0,
            DeviceHealthStatus::Unknown => -1.0,
        }
    }
}

// ============================================================================
// Trait Definitions
// ============================================================================

/// Source of device health assessments
#[async_trait]
pub trait DeviceHealthProvider: Send + Sync {
    /// Query one device; failures to run the query are errors, not `Unknown`
    async fn device_health(&self, device: &str) -> StorageResult<DeviceHealth>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Runs `smartctl -H -A <device>`, optionally through non-interactive sudo
pub struct SmartctlProvider {
    binary: String,
    use_sudo: bool,
    timeout: Duration,
    temperature_warning: f64,
}

impl SmartctlProvider {
    pub fn from_settings(settings: &MonitorSettings) -> Self {
        Self {
            binary: settings.smartctl_path.clone(),
            use_sudo: settings.smart_use_sudo,
            timeout: Duration::from_secs(settings.smart_timeout_secs),
            temperature_warning: settings.smart_temperature_warning,
        }
    }

    fn command(&self, device: &str) -> Command {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&self.binary);
            cmd
        } else {
            Command::new(&self.binary)
        };
        cmd.args(["-H", "-A", device]).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl DeviceHealthProvider for SmartctlProvider {
    async fn device_health(&self, device: &str) -> StorageResult<DeviceHealth> {
        let query_error = |reason: String| StorageError::DeviceQuery {
            device: device.to_string(),
            reason,
        };

        let output = tokio::time::timeout(self.timeout, self.command(device).output())
            .await
            .map_err(|_| query_error(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| query_error(format!("failed to run {}: {}", self.binary, e)))?;

        // smartctl's exit status is a bitmask; bits 0 and 1 mean the device was never read
        let code = output.status.code().unwrap_or(-1);
        if code < 0 || code & 0b11 != 0 {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.lines().last().unwrap_or_default().trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(query_error(format!("exit status {}: {}", code, detail)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_smart_output(
            device,
            &stdout,
            self.temperature_warning,
        ))
    }
}

// ============================================================================
// Output Parsing
// ============================================================================

/// Translate `smartctl -H -A` output into a [`DeviceHealth`]
///
/// Handles the ATA attribute table as well as the NVMe and SCSI health sections.
pub fn parse_smart_output(device: &str, output: &str, temperature_warning: f64) -> DeviceHealth {
    let mut status = None;
    let mut temperature = None;
    let mut reallocated = None;

    for line in output.lines() {
        let trimmed = line.trim();

        if let Some(result) = trimmed
            .strip_prefix("SMART overall-health self-assessment test result:")
            .or_else(|| trimmed.strip_prefix("SMART Health Status:"))
        {
            let result = result.trim();
            status = Some(if result.starts_with("PASSED") || result.starts_with("OK") {
                DeviceHealthStatus::Passed
            } else {
                DeviceHealthStatus::Failing
            });
            continue;
        }

        if let Some(value) = trimmed
            .strip_prefix("Temperature:")
            .or_else(|| trimmed.strip_prefix("Current Drive Temperature:"))
        {
            temperature = temperature.or_else(|| leading_number(value.trim()));
            continue;
        }

        // ATA attribute rows: ID NAME FLAG VALUE WORST THRESH TYPE UPDATED WHEN_FAILED RAW_VALUE
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() >= 10 && fields[0].bytes().all(|b| b.is_ascii_digit()) {
            match fields[1] {
                "Temperature_Celsius" | "Airflow_Temperature_Cel" => {
                    temperature = temperature.or_else(|| leading_number(fields[9]));
                }
                "Reallocated_Sector_Ct" => {
                    reallocated = leading_number(fields[9]).map(|v| v as u64);
                }
                _ => {}
            }
        }
    }

    let Some(status) = status else {
        return DeviceHealth {
            temperature_celsius: temperature,
            reallocated_sectors: reallocated,
            ..DeviceHealth::unknown(device, "no SMART health result in smartctl output")
        };
    };

    let mut warnings = Vec::new();
    if status == DeviceHealthStatus::Failing {
        warnings.push("SMART self-assessment reports failure".to_string());
    }
    if let Some(t) = temperature
        && t > temperature_warning
    {
        warnings.push(format!("High temperature: {:.0}°C", t));
    }
    if let Some(count) = reallocated
        && count > 0
    {
        warnings.push(format!("Reallocated sectors: {}", count));
    }

    DeviceHealth {
        device: device.to_string(),
        status,
        temperature_celsius: temperature,
        reallocated_sectors: reallocated,
        warnings,
        error: None,
    }
}

fn leading_number(s: &str) -> Option<f64> {
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    s[..end].parse().ok()
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Provider returning canned results; unknown devices fail like a missing smartctl
    #[derive(Default)]
    pub struct MockDeviceHealthProvider {
        results: HashMap<String, DeviceHealthStatus>,
        queries: Mutex<Vec<String>>,
    }

    impl MockDeviceHealthProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_device(mut self, device: &str, status: DeviceHealthStatus) -> Self {
            self.results.insert(device.to_string(), status);
            self
        }

        /// Devices queried so far, in order
        pub fn queries(&self) -> Vec<String> {
            self.queries.lock().map(|q| q.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl DeviceHealthProvider for MockDeviceHealthProvider {
        async fn device_health(&self, device: &str) -> StorageResult<DeviceHealth> {
            if let Ok(mut q) = self.queries.lock() {
                q.push(device.to_string());
            }
            match self.results.get(device) {
                Some(status) => Ok(DeviceHealth {
                    device: device.to_string(),
                    status: *status,
                    temperature_celsius: Some(35.0),
                    reallocated_sectors: Some(0),
                    warnings: Vec::new(),
                    error: None,
                }),
                None => Err(StorageError::DeviceQuery {
                    device: device.to_string(),
                    reason: "no such device".to_string(),
                }),
            }
        }
    }
}
