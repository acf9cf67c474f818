//! Citadel Storage - model storage manager
//!
//! Keeps the application tree linked into model storage, watches capacity and device health,
//! and takes hard-link incremental backups of the model directories.

pub mod backup;
pub mod config;
pub mod environment;
pub mod error;
pub mod layout;
pub mod lock;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod symlinks;

pub use backup::{BackupJob, BackupManager, BackupStatus, BackupType, VerificationResult};
pub use config::StorageConfig;
pub use error::{StorageError, StorageResult};
pub use monitor::{HealthReport, StorageHealth, StorageMonitor};
pub use orchestrator::{AggregatedStatus, OverallStatus, StorageOrchestrator};
pub use symlinks::{SymlinkEntry, SymlinkManager};
