//! Citadel Storage - command line entry point

use anyhow::{Context, Result, bail};
use citadel_storage::backup::BackupType;
use citadel_storage::config::StorageConfig;
use citadel_storage::{BackupStatus, StorageOrchestrator, StorageResult, layout, metrics};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "citadel-storage")]
#[command(about = "Model storage manager: symlinks, health monitoring, and backups", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create directories and symlinks, write the environment script, and check health
    Setup {
        /// Keep running the monitor loop afterwards
        #[arg(long)]
        monitor: bool,
    },
    /// Aggregated storage, symlink, device, and backup status
    Status {
        /// Print nested JSON
        #[arg(long, conflicts_with = "flat")]
        json: bool,
        /// Print key=value lines
        #[arg(long)]
        flat: bool,
    },
    /// Create the storage directory layout
    CreateDirs,
    /// Create the configured symlinks
    CreateSymlinks,
    /// Check every configured symlink
    VerifySymlinks,
    /// Recreate broken symlinks
    RepairSymlinks,
    /// Back up a directory
    Create {
        source: PathBuf,
        /// Defaults to incremental when `backup.incremental_backup` is set
        #[arg(value_enum)]
        backup_type: Option<BackupType>,
    },
    /// Verify a backup against its checksum manifest
    Verify {
        path: PathBuf,
        /// Fraction of files to check, 0.0 to 1.0
        sample_rate: Option<f64>,
    },
    /// Delete backups older than the retention period
    Cleanup { retention_days: Option<u32> },
    /// Run the monitoring loop until interrupted
    StartMonitor {
        /// Seconds between checks
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Measure read/write performance of a path
    Performance { path: PathBuf },
    /// Check mount points and permissions
    VerifyPrereq,
    /// Generate and save a health report
    HealthReport,
    /// Write the storage environment script
    WriteEnv,
    /// Backup history and counts
    BackupStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only command output
    match cli.log_format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
    }

    let config = StorageConfig::load(cli.config).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    tracing::debug!(
        models_root = %config.paths.models_root.display(),
        backup_root = %config.paths.backup_root.display(),
        app_root = %config.paths.app_root.display(),
        "Configuration loaded"
    );

    let config = Arc::new(config);
    let orchestrator = Arc::new(StorageOrchestrator::new(config.clone()));

    run(cli.command, config, orchestrator).await
}

async fn run(
    command: Command,
    config: Arc<StorageConfig>,
    orch: Arc<StorageOrchestrator>,
) -> Result<()> {
    match command {
        Command::Setup { monitor } => {
            if monitor {
                start_metrics_exporter(&config)?;
            }
            let report = orch.setup(monitor).await.context("Storage setup failed")?;
            print_json(&report)?;
        }

        Command::Status { json, flat } => {
            let status = orch.status().await;
            if json {
                print_json(&status)?;
            } else if flat {
                for (key, value) in status.flatten() {
                    println!("{}={}", key, value);
                }
            } else {
                println!("Overall: {}", status.overall_status);
                println!(
                    "Storage: {}/{} healthy",
                    status.summary.healthy_storage, status.summary.total_storage
                );
                println!(
                    "Symlinks: {}/{} healthy",
                    status.summary.healthy_symlinks, status.summary.total_symlinks
                );
                match &status.latest_backup {
                    Some(job) => println!(
                        "Latest backup: {} ({}, {})",
                        job.backup_id, job.status, job.created_at
                    ),
                    None => println!("Latest backup: none"),
                }
                for error in &status.summary.errors {
                    println!("ERROR: {}", error);
                }
                for warning in &status.summary.warnings {
                    println!("WARNING: {}", warning);
                }
            }
        }

        Command::CreateDirs => {
            let created = blocking(move || layout::create_directory_structure(&config)).await?;
            print_json(&created)?;
        }

        Command::CreateSymlinks => {
            let entries = blocking(move || orch.symlinks().create_symlinks()).await?;
            print_json(&entries)?;
        }

        Command::VerifySymlinks => {
            let entries = blocking(move || Ok(orch.symlinks().verify_all())).await?;
            print_json(&entries)?;
            let broken = entries.iter().filter(|e| e.is_broken()).count();
            if broken > 0 {
                bail!("{} broken symlink(s)", broken);
            }
        }

        Command::RepairSymlinks => {
            let outcome = blocking(move || orch.symlinks().repair_all()).await?;
            print_json(&outcome)?;
            if !outcome.unrepaired.is_empty() {
                bail!("{} symlink(s) could not be repaired", outcome.unrepaired.len());
            }
        }

        Command::Create {
            source,
            backup_type,
        } => {
            let job = blocking(move || {
                let backups = orch.backups();
                let backup_type = backup_type.unwrap_or_else(|| backups.default_backup_type());
                backups.create_backup(&source, backup_type)
            })
            .await?;
            print_json(&job)?;
            if job.status != BackupStatus::Completed {
                bail!("Backup {} failed: {}", job.backup_id, job.errors.join("; "));
            }
        }

        Command::Verify { path, sample_rate } => {
            if let Some(rate) = sample_rate
                && !(0.0..=1.0).contains(&rate)
            {
                bail!("sample_rate must be within [0.0, 1.0] (got {})", rate);
            }
            let result =
                blocking(move || Ok(orch.backups().verify_backup(&path, sample_rate))).await?;
            print_json(&result)?;
            if !result.is_valid {
                bail!("Backup verification failed");
            }
        }

        Command::Cleanup { retention_days } => {
            let removed =
                blocking(move || orch.backups().cleanup_old_backups(retention_days)).await?;
            print_json(&removed)?;
        }

        Command::StartMonitor { interval } => {
            start_metrics_exporter(&config)?;
            orch.monitor()
                .start_monitor(interval.map(Duration::from_secs))
                .await;
        }

        Command::Performance { path } => {
            let perf = blocking(move || orch.monitor().measure_performance(&path)).await?;
            print_json(&perf)?;
        }

        Command::VerifyPrereq => {
            let report = layout::verify_prerequisites(&config);
            print_json(&report)?;
            if !report.is_ok() {
                bail!("Storage prerequisites not met");
            }
        }

        Command::HealthReport => {
            let report = orch
                .monitor()
                .run_cycle()
                .await
                .context("Failed to generate health report")?;
            print_json(&report)?;
        }

        Command::WriteEnv => {
            let path =
                blocking(move || citadel_storage::environment::write_env_script(&config)).await?;
            println!("{}", path.display());
        }

        Command::BackupStatus => {
            let status = blocking(move || orch.backups().status()).await?;
            print_json(&status)?;
        }
    }

    Ok(())
}

/// Run filesystem-heavy work off the async workers
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(f)
        .await
        .context("Blocking task panicked")?;
    Ok(result?)
}

fn start_metrics_exporter(config: &StorageConfig) -> Result<()> {
    if config.monitoring.metrics_export_enabled {
        metrics::setup_metrics(config.monitoring.metrics_port)?;
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}
