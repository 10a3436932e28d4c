use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use forager::config::Config;
use forager::feed::Fetcher;
use forager::scheduler::{PollOutcome, Scheduler};
use forager::storage::{Database, DatabaseError};

#[derive(Parser, Debug)]
#[command(name = "forager", about = "Feed ingestion daemon: polls RSS/Atom sources into SQLite")]
struct Args {
    /// Configuration file
    #[arg(long, value_name = "FILE", default_value = "forager.toml")]
    config: PathBuf,

    /// Database file (overrides `database_path` from the config)
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Poll every enabled source once and exit
    #[arg(long)]
    once: bool,
}

/// Resolve when the process is asked to stop (Ctrl-C, or SIGTERM on Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Received Ctrl-C, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl-C, shutting down");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(database) = args.database {
        config.database_path = database;
    }
    config.validate().context("Invalid configuration")?;

    let db_path = config
        .database_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path).await {
        Ok(db) => db,
        Err(DatabaseError::Locked) => {
            anyhow::bail!(
                "Database {} is locked; is another forager instance running?",
                db_path
            );
        }
        Err(e) => return Err(e).context("Failed to open database"),
    };

    let report = db
        .sync_sources(&config.new_sources(), config.sync.disable_missing)
        .await
        .context("Failed to sync sources from configuration")?;
    tracing::info!(
        created = report.created,
        updated = report.updated,
        unchanged = report.unchanged,
        disabled = report.disabled,
        "Synced sources"
    );

    let fetcher = Fetcher::new(&config.fetcher).context("Failed to build HTTP client")?;
    let scheduler = Scheduler::new(
        db,
        fetcher,
        config.scheduler.clone(),
        config.default_poll_interval_secs,
    );

    if args.once {
        let reports = scheduler.run_once().await.context("Failed to list sources")?;
        let mut failed = 0;
        let mut inserted = 0;
        for report in &reports {
            match &report.outcome {
                Ok(PollOutcome::Ingested(stats)) => inserted += stats.inserted,
                Ok(PollOutcome::NotModified) => {}
                Err(e) => {
                    failed += 1;
                    eprintln!("source {}: {}", report.source_id, e);
                }
            }
        }
        println!(
            "Polled {} sources: {} new articles, {} failed",
            reports.len(),
            inserted,
            failed
        );
        return Ok(());
    }

    let handle = scheduler.spawn();
    shutdown_signal().await?;
    handle.shutdown().await;
    Ok(())
}
