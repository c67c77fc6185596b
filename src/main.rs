//! CLI entry point for the catalog mirror.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use mirror_core::engine::DEFAULT_READY_TIMEOUT;
use mirror_core::{
    Database, EngineConfig, EngineRpcClient, EngineSupervisor, RateLimiter, Registry, Scheduler,
    SchedulerConfig, StorageLayout,
};
use tracing::{debug, error, info, warn};

mod cli;
mod config;

use cli::{Args, Command, RunArgs, StatsArgs};
use config::{FileConfig, RunSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let file_config = config::load_config(args.config.as_deref())?;

    match args.command {
        Command::Run(run) => run_mirror(&run, file_config.as_ref()).await,
        Command::Stats(stats) => print_stats(&stats, file_config.as_ref()).await,
    }
}

async fn run_mirror(args: &RunArgs, file_config: Option<&FileConfig>) -> Result<()> {
    let settings = RunSettings::resolve(args, file_config);
    info!(database = %settings.database.display(), "mirror starting");

    let db = Database::new_with_options(&settings.database, settings.db_options)
        .await
        .with_context(|| format!("Failed to open catalog '{}'", settings.database.display()))?;
    let registry = Registry::new(db);

    let mut supervisor = EngineSupervisor::new(EngineConfig {
        program: settings.engine.clone(),
        download_dir: settings.staging_dir.clone(),
        max_concurrent_downloads: settings.concurrency,
        log_dir: settings.log_dir.clone(),
        ..EngineConfig::default()
    })?;
    debug!(command = %supervisor.command_line(), "launching engine");
    supervisor.start()?;

    let rpc = EngineRpcClient::new(&supervisor.rpc_url(), supervisor.secret())?;
    match rpc.wait_until_ready(DEFAULT_READY_TIMEOUT).await {
        Ok(version) => info!(version = %version.version, port = supervisor.port(), "engine ready"),
        Err(e) => {
            supervisor.stop();
            return Err(e).context("Download engine did not become ready");
        }
    }

    let limiter = Arc::new(RateLimiter::new(settings.request_limit));
    let layout = StorageLayout::new(&settings.download_dir, &settings.staging_dir);
    let scheduler_config = SchedulerConfig {
        max_concurrent: settings.concurrency,
        max_task_retries: settings.max_task_retries,
        max_record_errors: settings.max_record_errors,
        tick_interval: settings.tick_interval,
        idle_interval: settings.idle_interval,
        proxy: settings.proxy.clone(),
        user_agent: settings.user_agent.clone(),
    };
    let mut scheduler = Scheduler::new(registry, rpc, limiter, layout, scheduler_config)
        .with_supervisor(supervisor);

    let stop = scheduler.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current tick");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let outcome = scheduler.run(settings.service).await;
    scheduler.shutdown().await;

    match outcome {
        Ok(stats) => {
            info!(
                admitted = stats.admitted,
                completed = stats.completed,
                failed = stats.failed,
                rejected = stats.rejected,
                retried = stats.retried,
                "mirror finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "mirror aborted");
            Err(e.into())
        }
    }
}

async fn print_stats(args: &StatsArgs, file_config: Option<&FileConfig>) -> Result<()> {
    let path = config::resolve_database(args.database.as_ref(), file_config);
    if !path.exists() {
        anyhow::bail!("Catalog database '{}' does not exist", path.display());
    }

    let db = Database::new(&path)
        .await
        .with_context(|| format!("Failed to open catalog '{}'", path.display()))?;
    let registry = Registry::new(db);

    let name = registry.catalog_name().await?;
    println!("catalog: {}", name.as_deref().unwrap_or("(unnamed)"));

    let mut total = 0;
    for (status, count) in registry.status_counts().await? {
        total += count;
        println!("{:>12}: {count}", status.as_str());
    }
    println!("{:>12}: {total}", "total");

    Ok(())
}
