//! chainsync CLI: run one pipeline component per process, or all of them in
//! one with `worker`.
//!
//! Usage:
//! ```bash
//! chainsync --config config/default.yaml worker
//! chainsync scheduler
//! chainsync crawler
//! chainsync writer
//! chainsync http
//! chainsync migrate up
//! chainsync migrate to 202105221650
//! ```

mod bootstrap;
mod http;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::Notify;
use tracing::{info, warn};

use chainsync_core::{Service, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "chainsync", version, about = "Reorg-tolerant EVM block sync pipeline")]
struct Cli {
    /// YAML configuration file.
    #[arg(
        long,
        short,
        env = "CHAINSYNC_CONFIG",
        default_value = "config/default.yaml",
        global = true
    )]
    config: PathBuf,

    /// Seconds allowed for a graceful shutdown.
    #[arg(long, default_value_t = 300, global = true)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scheduler, crawler, writer and HTTP server in one process.
    Worker,
    /// Publish crawl requests for new and unstable blocks.
    Scheduler,
    /// Fetch requested blocks from the node and hand them to the writer.
    Crawler,
    /// Persist finalized blocks.
    Writer,
    /// Serve stored blocks and transactions over HTTP.
    Http,
    /// Apply or roll back schema migrations.
    Migrate {
        #[command(subcommand)]
        action: Migrate,
    },
}

#[derive(Debug, Subcommand)]
enum Migrate {
    /// Apply every pending migration.
    Up,
    /// Roll back every applied migration.
    Down,
    /// Migrate up or down to `version`.
    To { version: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    logging::init(&config.log);
    let grace = Duration::from_secs(cli.timeout);

    info!(app_id = %config.app_id, command = ?cli.command, "chainsync starting");
    match cli.command {
        Command::Worker => work(&config, grace).await,
        Command::Scheduler => run(Arc::new(bootstrap::scheduler(&config).await?), grace).await,
        Command::Crawler => run(Arc::new(bootstrap::crawler(&config).await?), grace).await,
        Command::Writer => run(Arc::new(bootstrap::writer(&config).await?), grace).await,
        Command::Http => http::serve(&config, grace).await,
        Command::Migrate { action } => migrate(&config, action).await,
    }
}

/// Run `service` until it fails or a shutdown signal arrives, then stop it
/// within `grace`.
async fn run(service: Arc<dyn Service>, grace: Duration) -> anyhow::Result<()> {
    let name = service.name();
    let runner = service.clone();
    let mut task = tokio::spawn(async move { runner.start().await });

    tokio::select! {
        joined = &mut task => {
            // the run loop ended on its own: release what it holds
            service.stop().await?;
            joined.with_context(|| format!("{name} task failed"))??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    info!(service = name, grace_secs = grace.as_secs(), "stopping");
    let stopped = tokio::time::timeout(grace, async {
        service.stop().await?;
        task.await.with_context(|| format!("{name} task failed"))??;
        anyhow::Ok(())
    })
    .await;

    match stopped {
        Ok(result) => result,
        Err(_) => bail!("{name} did not stop within {}s", grace.as_secs()),
    }
}

/// Run the all-in-one worker next to the HTTP read path. The server stops
/// with the worker; the worker releases the shared handles.
async fn work(config: &SyncConfig, grace: Duration) -> anyhow::Result<()> {
    let listener = http::bind(config).await?;
    let (worker, query) = bootstrap::worker(config).await?;

    let worker_done = Arc::new(Notify::new());
    let server = {
        let worker_done = worker_done.clone();
        tokio::spawn(http::serve_on(listener, query, async move {
            tokio::select! {
                _ = worker_done.notified() => {}
                _ = shutdown_signal() => {}
            }
        }))
    };

    let worked = run(Arc::new(worker), grace).await;
    worker_done.notify_one();
    let served = match tokio::time::timeout(grace, server).await {
        Ok(joined) => joined.context("http server task failed")?,
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "http server did not stop in time");
            Ok(())
        }
    };
    worked.and(served)
}

async fn migrate(config: &SyncConfig, action: Migrate) -> anyhow::Result<()> {
    let store = bootstrap::store(config).await?;
    let result = match &action {
        Migrate::Up => store.migrate_up().await,
        Migrate::Down => store.migrate_down().await,
        Migrate::To { version } => store.migrate_to(version).await,
    };
    store.close().await?;
    result.with_context(|| format!("migrate {action:?} failed"))?;
    info!(?action, "migration complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!(error = %e, "failed waiting for Ctrl+C");
                        }
                    }
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed waiting for Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed waiting for Ctrl+C");
        }
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_migrate_to() {
        let cli = Cli::try_parse_from(["chainsync", "migrate", "to", "202105221650"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Migrate { action: Migrate::To { ref version } } if version == "202105221650"
        ));
        assert_eq!(cli.timeout, 300);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["chainsync", "crawler", "--config", "x.yaml", "--timeout", "5"])
                .unwrap();
        assert!(matches!(cli.command, Command::Crawler));
        assert_eq!(cli.config, PathBuf::from("x.yaml"));
        assert_eq!(cli.timeout, 5);
    }

    #[test]
    fn parses_worker() {
        let cli = Cli::try_parse_from(["chainsync", "worker", "--timeout", "30"]).unwrap();
        assert!(matches!(cli.command, Command::Worker));
        assert_eq!(cli.timeout, 30);
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["chainsync", "indexer"]).is_err());
    }

    #[test]
    fn shipped_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../config/default.yaml");
        let config = SyncConfig::load(path).unwrap();
        assert_eq!(config.scheduler.unstable_number, 20);
    }
}
