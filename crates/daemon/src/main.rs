mod metrics;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulsarflow_core::{
    create_notifier, create_queue_manager, load_config, validate_config, AcquisitionManager,
    Config, FtpFileSource, HttpArchiveApi, JobScheduler, Notifications, RetryPolicy,
    SanitizedConfig, SqliteStore,
};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often the metrics file is rewritten.
const METRICS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "pulsarflow", version, about = "Survey data acquisition and processing daemons")]
struct Cli {
    /// Configuration file
    #[arg(long, env = "PULSARFLOW_CONFIG", default_value = "pulsarflow.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Write Prometheus metrics to this file
    #[arg(long, global = true)]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Group, submit and track processing jobs
    Scheduler {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Request restores and download raw data
    Downloader {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Print job, file and queue counts as JSON
    Status {
        /// Include the effective configuration (secrets redacted)
        #[arg(long)]
        show_config: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    if let Err(e) = run(cli).await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!("pulsarflow {} loading configuration from {:?}", VERSION, cli.config);
    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
    validate_config(&config).context("Configuration validation failed")?;
    info!("Database path: {:?}", config.database.path);

    let store = Arc::new(
        SqliteStore::open(&config.database.path, RetryPolicy::from(&config.database))
            .context("Failed to open pipeline database")?,
    );
    let notifications = Notifications::new(create_notifier(&config.notify), config.notify.clone());

    let registry = metrics::registry()?;
    let exporter = cli.metrics_file.clone().map(|path| {
        info!("Writing metrics to {:?}", path);
        metrics::spawn_exporter(registry.clone(), path, METRICS_INTERVAL)
    });

    let result = match cli.command {
        Command::Scheduler { once } => run_scheduler(&config, store, notifications, once).await,
        Command::Downloader { once } => run_downloader(&config, store, notifications, once).await,
        Command::Status { show_config } => print_status(&config, store, show_config).await,
    };

    if let Some(exporter) = exporter {
        exporter.abort();
    }
    if let Some(path) = &cli.metrics_file {
        metrics::write_metrics(&registry, path)?;
    }
    result
}

async fn run_scheduler(
    config: &Config,
    store: Arc<SqliteStore>,
    notifications: Notifications,
    once: bool,
) -> Result<()> {
    let queue = create_queue_manager(&config.queue);
    info!("Using {} queue backend", queue.name());
    let scheduler = Arc::new(JobScheduler::new(
        store,
        queue,
        config.scheduler.clone(),
        notifications,
    ));

    if once {
        let report = scheduler.run_cycle().await.context("Scheduler cycle failed")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    scheduler.start().await;
    shutdown_signal().await;
    info!("Stopping scheduler...");
    scheduler.stop().await;
    Ok(())
}

async fn run_downloader(
    config: &Config,
    store: Arc<SqliteStore>,
    notifications: Notifications,
    once: bool,
) -> Result<()> {
    let Some(acquisition) = &config.acquisition else {
        bail!("The downloader needs an [acquisition] section in the configuration");
    };
    let api = Arc::new(
        HttpArchiveApi::new(&acquisition.archive).context("Failed to create archive client")?,
    );
    let source = Arc::new(FtpFileSource::new(&acquisition.archive));
    info!(
        "Archive at {}, FTP host {}",
        acquisition.archive.api_url, acquisition.archive.ftp_host
    );
    let manager = Arc::new(AcquisitionManager::new(
        store,
        api,
        source,
        acquisition.clone(),
        notifications,
    ));

    if once {
        manager
            .recover_interrupted()
            .await
            .context("Failed to recover interrupted downloads")?;
        let summary = manager.run_cycle().await.context("Acquisition cycle failed")?;
        manager
            .wait_for_workers()
            .await
            .context("Failed to record download results")?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    manager
        .start()
        .await
        .context("Failed to start acquisition")?;
    shutdown_signal().await;
    info!("Stopping downloader (waiting for transfers in flight)...");
    manager.stop().await;
    Ok(())
}

async fn print_status(config: &Config, store: Arc<SqliteStore>, show_config: bool) -> Result<()> {
    let disabled = Notifications::disabled();
    let scheduler = JobScheduler::new(
        Arc::clone(&store),
        create_queue_manager(&config.queue),
        config.scheduler.clone(),
        disabled.clone(),
    );
    let scheduler_status = scheduler.status().await?;

    let acquisition_status = match &config.acquisition {
        Some(acquisition) => {
            let manager = AcquisitionManager::new(
                Arc::clone(&store),
                Arc::new(HttpArchiveApi::new(&acquisition.archive)?),
                Arc::new(FtpFileSource::new(&acquisition.archive)),
                acquisition.clone(),
                disabled,
            );
            Some(manager.status().await?)
        }
        None => None,
    };

    let mut status = serde_json::json!({
        "version": VERSION,
        "scheduler": scheduler_status,
        "acquisition": acquisition_status,
    });
    if show_config {
        status["config"] = serde_json::to_value(SanitizedConfig::from(config))?;
    }
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scheduler_once() {
        let cli = Cli::try_parse_from([
            "pulsarflow",
            "--config",
            "/etc/pulsarflow.toml",
            "scheduler",
            "--once",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/pulsarflow.toml"));
        assert!(matches!(cli.command, Command::Scheduler { once: true }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["pulsarflow", "status", "--json-logs", "--show-config"]).unwrap();
        assert!(cli.json_logs);
        assert!(matches!(cli.command, Command::Status { show_config: true }));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["pulsarflow"]).is_err());
    }
}
