//! mysqlbackup - Main entry point
//!
//! Dumps the requested databases through the configured pipeline and
//! writes a manifest next to every artifact.

use anyhow::{bail, Result};
use clap::Parser;
use mysqlbackup::config::{BackupMode, BackupOptions};
use mysqlbackup::engine::BackupEngine;
use mysqlbackup::shutdown::ShutdownCoordinator;
use mysqlbackup::utils;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Databases to back up (comma-separated)
    #[arg(short, long, value_delimiter = ',', required = true)]
    databases: Vec<String>,

    /// Backup mode (overrides config): single, combined, separated, all
    #[arg(short, long)]
    mode: Option<BackupMode>,

    /// Directory artifacts are written into
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print the dump invocation without running it
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut options = BackupOptions::from_file(&args.config)?;
    if let Some(mode) = args.mode {
        options.mode = mode;
    }
    if args.dry_run {
        options.dry_run = true;
    }
    // The -d list is an operator selection, not the whole server; mark it
    // filtered so combined mode names the databases explicitly instead of
    // collapsing to --all-databases. Only mode `all` dumps everything.
    if options.mode != BackupMode::All {
        options.filter_active = true;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&options.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting mysqlbackup v{} ({} mode, host {})",
        env!("CARGO_PKG_VERSION"),
        options.mode.as_str(),
        options.connection.host
    );

    std::fs::create_dir_all(&args.output_dir)?;

    // Create shutdown coordinator
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let cancel = coordinator.cancellation_token();
    let active = coordinator.active_artifact();
    let signal_task = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator.wait_for_signal().await;
        })
    };

    let mode = options.mode;
    let engine = BackupEngine::new(options)?.with_cancellation(cancel.clone(), active);
    let extension = engine.stages().extension_chain();
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();

    let failed = if mode.is_per_database() {
        let output_dir = args.output_dir.clone();
        let suffix = format!("-{stamp}{extension}");
        let result = engine
            .run_separated(&args.databases, args.databases.len(), &move |db| {
                Ok(output_dir.join(format!("{db}{suffix}")))
            })
            .await;
        for failure in &result.failures {
            tracing::error!("{}: {}", failure.database, failure.error);
        }
        result.failed
    } else {
        let artifact = args
            .output_dir
            .join(format!("{}-{stamp}{extension}", mode.as_str()));
        match engine
            .run_combined(&args.databases, &[], args.databases.len(), &artifact)
            .await
        {
            Ok(info) => {
                tracing::info!(
                    "Wrote {} ({} bytes, {:.1}s)",
                    info.artifact.display(),
                    info.size_bytes,
                    info.duration_secs
                );
                0
            }
            Err(e) => {
                tracing::error!("Combined backup failed: {}", e);
                1
            }
        }
    };

    if cancel.is_cancelled() {
        coordinator.finalize();
    }
    signal_task.abort();

    if failed > 0 {
        bail!("{} backup(s) failed", failed);
    }
    Ok(())
}
