//! news-harvester binary entrypoint.
//! Parses the CLI, sets up tracing and wires registry, store, adapters, sink and
//! scheduler together.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use news_harvester::config::{self, LogFormat, Settings};
use news_harvester::ingest::config::{load_registry_default, spawn_reload_watcher, RegistryHandle};
use news_harvester::ingest::pipeline::{Orchestrator, PipelineCfg};
use news_harvester::ingest::providers::AdapterSet;
use news_harvester::ingest::scheduler::{RunMode, Scheduler, SchedulerCfg};
use news_harvester::notify::build_sink;
use news_harvester::status::{self, Metrics, StatusState};
use news_harvester::store::SeenStore;

/// Completed, but some sources or publishes failed.
const EXIT_PARTIAL: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "news-harvester", version, about = "Periodic news harvester")]
struct Cli {
    /// Settings file (TOML or JSON). Default: $HARVESTER_CONFIG, then config/harvester.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Sources file. Default: $HARVESTER_SOURCES, then config/sources.{toml,json}.
    #[arg(long, global = true)]
    sources: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Harvest every `interval_minutes` until interrupted (default).
    Run,
    /// Run a single cycle and exit.
    Once,
    /// Print store statistics and the last cycle summary.
    Stats,
    /// Purge seen records older than the retention period.
    Cleanup {
        /// Overrides `storage.keep_days`.
        #[arg(long)]
        days: Option<u64>,
    },
}

/// RUST_LOG wins, then LOG_LEVEL, then `info`.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("LOG_LEVEL").map(|l| EnvFilter::new(l.to_ascii_lowercase())))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(s) => {
            init_tracing(s.logging.format);
            s
        }
        Err(e) => {
            init_tracing(LogFormat::Compact);
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match dispatch(&cli, settings).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: &Cli, settings: Settings) -> Result<ExitCode> {
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => harvest(cli, settings, RunMode::Forever).await,
        Command::Once => harvest(cli, settings, RunMode::Once).await,
        Command::Stats => print_stats(&settings).await,
        Command::Cleanup { days } => cleanup(&settings, days),
    }
}

async fn harvest(cli: &Cli, settings: Settings, mode: RunMode) -> Result<ExitCode> {
    let hint = cli.sources.clone().or_else(|| settings.sources_path.clone());
    let (sources_path, report) = load_registry_default(hint.as_deref())?;
    report.log_rejected();
    tracing::info!(
        path = %sources_path.display(),
        sources = report.registry.len(),
        enabled = report.registry.enabled().count(),
        rejected = report.rejected.len(),
        "sources loaded"
    );

    let store = Arc::new(SeenStore::open(&settings.storage.database_path)?);
    let sink = build_sink(&settings.output)?;
    let adapters = AdapterSet::from_settings(&settings)?;
    let orchestrator = Arc::new(Orchestrator::new(
        adapters,
        store.clone(),
        sink,
        PipelineCfg::from_settings(&settings),
    ));
    let registry = RegistryHandle::new(report.registry);
    let scheduler = Scheduler::new(orchestrator, registry.clone(), SchedulerCfg::from_settings(&settings));

    let shutdown = CancellationToken::new();
    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            token.cancel();
        });
    }

    if mode == RunMode::Forever {
        if settings.scheduler.reload_poll_secs > 0 {
            spawn_reload_watcher(
                registry,
                sources_path,
                Duration::from_secs(settings.scheduler.reload_poll_secs),
                shutdown.child_token(),
            );
        }
        if let Some(listen) = settings.status.listen.clone() {
            let metrics = Metrics::init()?;
            let state = StatusState {
                scheduler: scheduler.handle(),
                store: store.clone(),
                metrics: Some(metrics.handle),
            };
            let token = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = status::serve(&listen, state, token).await {
                    tracing::error!(error = format!("{e:#}"), "status endpoint stopped");
                }
            });
        }
    }

    let run = scheduler.run(mode, shutdown.clone()).await;
    shutdown.cancel();
    let report = run.context("harvest aborted")?;

    Ok(if report.has_failures() {
        ExitCode::from(EXIT_PARTIAL)
    } else {
        ExitCode::SUCCESS
    })
}

async fn print_stats(settings: &Settings) -> Result<ExitCode> {
    let store = SeenStore::open(&settings.storage.database_path)?;
    let stats = store.stats()?;
    let fmt_ts = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
    };

    println!("database:      {}", settings.storage.database_path.display());
    println!("total records: {}", stats.total_records);
    println!("oldest:        {}", fmt_ts(stats.oldest_record));
    println!("newest:        {}", fmt_ts(stats.newest_record));
    if !stats.by_source.is_empty() {
        println!("by source:");
        for (source, n) in &stats.by_source {
            println!("  {source:<30} {n}");
        }
    }

    match status::load_last_cycle(&settings.storage.state_path).await {
        Some(c) => {
            println!("last cycle:    {} .. {}", c.started_at.to_rfc3339(), c.finished_at.to_rfc3339());
            println!(
                "  sources attempted={} failed={} skipped={}",
                c.sources_attempted, c.sources_failed, c.sources_skipped
            );
            println!(
                "  items fetched={} filtered={} deduped={} published={} publish_failures={}",
                c.items_fetched, c.items_filtered, c.items_deduped, c.items_published, c.publish_failures
            );
            for f in &c.failures {
                println!("  failed: {} ({}): {}", f.source, f.kind, f.error);
            }
        }
        None => println!("last cycle:    none recorded"),
    }
    Ok(ExitCode::SUCCESS)
}

fn cleanup(settings: &Settings, days: Option<u64>) -> Result<ExitCode> {
    let days = days.unwrap_or(settings.storage.keep_days);
    let store = SeenStore::open(&settings.storage.database_path)?;
    let removed = store.purge_older_than(config::days(days))?;
    tracing::info!(removed, days, "cleanup finished");
    println!(
        "removed {removed} records older than {days} days from {}",
        settings.storage.database_path.display()
    );
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler");
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
