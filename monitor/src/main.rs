mod actions;
mod api;
mod cli;
mod config;

use accounting::lifecycle::InstallRecord;
use accounting::tasks;
use accounting::{LifecycleController, Monitor, MonitorParts, SystemCounterSource};
use actions::HostActions;
use anyhow::{Context, Result};
use api::ApiServer;
use clap::Parser;
use cli::CliArgs;
use common::JsonStore;
use config::MonitorConfig;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut cfg = MonitorConfig::load_or_default(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    args.apply(&mut cfg);

    let _log_guard = common::init_tracing(cfg.log_dir.as_deref(), &cfg.log_file, &cfg.log_level);

    if !Path::new(&args.config).exists() {
        match cfg.save(&args.config) {
            Ok(()) => info!("Wrote default configuration to {}", args.config),
            Err(e) => warn!("Failed to write default configuration {}: {}", args.config, e),
        }
    }

    info!("Starting server monitor");
    info!("Data directory: {}", cfg.data_dir);
    info!("API address: {}", cfg.api_addr);
    info!("Time-to-live: {:?}", cfg.ttl());
    if let Some(threads) = cfg.runtime_threads {
        info!("Runtime threads: {}", threads);
    } else {
        info!("Runtime threads: default (CPU cores)");
    }

    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("Failed to create data directory {}", cfg.data_dir))?;

    let dispatcher = Arc::new(HostActions::new(cfg.shutdown_command.clone()));

    let install: JsonStore<InstallRecord> = JsonStore::new(cfg.install_path());
    let mut cleanup_targets = vec![cfg.totals_path(), cfg.limit_path()];
    if cfg.self_destruct {
        cleanup_targets.push(args.config.clone().into());
        match std::env::current_exe() {
            Ok(exe) => cleanup_targets.push(exe),
            Err(e) => warn!("Cannot resolve own executable for cleanup: {}", e),
        }
    }
    let mut lifecycle = LifecycleController::activate(install, cfg.ttl(), common::now_secs_f64())
        .with_cleanup_targets(cleanup_targets);
    info!("Cleanup targets on expiry: {:?}", lifecycle.cleanup_targets());

    // Already past the time-to-live: erase and exit before any task starts.
    if lifecycle.evaluate(common::now_secs_f64()) {
        lifecycle.expire(dispatcher.as_ref());
        return Ok(());
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = cfg.runtime_threads {
        builder.worker_threads(threads.max(1));
    }
    let runtime = builder
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    runtime.block_on(run(cfg, dispatcher, lifecycle))
}

async fn run(
    cfg: MonitorConfig,
    dispatcher: Arc<HostActions>,
    lifecycle: LifecycleController,
) -> Result<()> {
    let monitor = Arc::new(Monitor::new(MonitorParts {
        source: Arc::new(SystemCounterSource::new()),
        dispatcher,
        totals: JsonStore::new(cfg.totals_path()),
        limit: JsonStore::new(cfg.limit_path()),
        lifecycle,
        smoothing: cfg.rate_smoothing,
        retry_backoff: cfg.shutdown_retry(),
    }));

    let intervals = cfg.task_intervals();
    let shutdown = CancellationToken::new();
    let handles = tasks::spawn_all(monitor.clone(), intervals, shutdown.clone());

    let api_server = {
        let server = ApiServer::new(
            monitor.clone(),
            cfg.api_addr.clone(),
            cfg.admin_token.clone(),
            intervals.checkpoint_timeout,
        );
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown.child_token()).await {
                error!("API server error: {}", e);
                shutdown.cancel();
            }
        })
    };

    info!("Server monitor started");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        _ = shutdown.cancelled() => {
            info!("Background tasks requested shutdown");
        }
    }

    if let Err(e) =
        tasks::shutdown_and_checkpoint(monitor, handles, shutdown, intervals.checkpoint_timeout)
            .await
    {
        error!("Final checkpoint failed: {}", e);
    }
    if let Err(e) = api_server.await {
        error!("API server task ended abnormally: {}", e);
    }

    info!("Server monitor stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
