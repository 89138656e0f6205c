// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Rollup Commander Node
//!
//! Entry point for the `rollup-node` binary. Parses CLI arguments, loads the
//! config, opens the database, starts the batch build loop and serves the
//! JSON-RPC API and Prometheus metrics.
//!
//! Subcommands:
//!
//! - `run`     — start the commander
//! - `init`    — create the data directory and a default config file
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod submitter;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

use rollup_protocol::batch::BuildLoop;
use rollup_protocol::config::CommanderConfig;
use rollup_protocol::storage::CommanderDb;
use rollup_protocol::Commander;

use cli::{Commands, RollupNodeCli};
use logging::LogFormat;
use metrics::NodeMetrics;
use submitter::LoggingSubmitter;

/// Config file looked up in the data directory when `--config` is absent.
const CONFIG_FILE_NAME: &str = "commander.json";

/// How often commander counters are copied into Prometheus.
const METRICS_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = RollupNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            println!("rollup-node {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Read the config file, then apply CLI overrides.
fn load_config(args: &cli::RunArgs) -> Result<CommanderConfig> {
    let mut config = match &args.config {
        Some(path) => CommanderConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let path = args.data_dir.join(CONFIG_FILE_NAME);
            if path.exists() {
                CommanderConfig::load(&path)
                    .with_context(|| format!("failed to load config from {}", path.display()))?
            } else {
                tracing::warn!(path = %path.display(), "no config file, using defaults");
                CommanderConfig::default()
            }
        }
    };

    if let Some(port) = args.api_port {
        config.api.port = port;
    }
    if let Some(port) = args.metrics_port {
        config.api.metrics_port = port;
    }
    if args.auth_key.is_some() {
        config.api.auth_key = args.auth_key.clone();
    }
    if args.migration {
        config.migration = true;
    }
    Ok(config)
}

/// Starts the commander: build loop, metrics poller, API and metrics servers.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, LogFormat::from_str_lossy(&args.log_format));

    let config = load_config(&args)?;
    tracing::info!(
        api_port = config.api.port,
        metrics_port = config.api.metrics_port,
        data_dir = %args.data_dir.display(),
        migration = config.migration,
        admin_enabled = config.api.auth_key.is_some(),
        "starting rollup-node"
    );
    if config.rollup.disable_signatures {
        tracing::warn!("signature verification is disabled");
    }

    // --- Persistent storage ---
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = CommanderDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let commander = Commander::open(db, config.clone()).context("failed to start commander")?;

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    // --- Shutdown channel ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- Batch build loop ---
    let build_loop = BuildLoop::new(commander.clone(), Arc::new(LoggingSubmitter));
    let build_rx = shutdown_rx.clone();
    let build_handle = tokio::spawn(async move { build_loop.run(build_rx).await });

    // --- Metrics poller ---
    let poll_commander = commander.clone();
    let poll_metrics = Arc::clone(&node_metrics);
    let mut poll_rx = shutdown_rx;
    let poll_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = poll_rx.changed() => return,
            }
            match poll_commander.mempool_size() {
                Ok(size) => poll_metrics.observe(
                    &poll_commander.stats(),
                    size,
                    poll_commander.is_migrating(),
                ),
                Err(e) => tracing::warn!(error = %e, "failed to read mempool size"),
            }
        }
    });

    // --- API server ---
    let api_router = api::create_router(api::AppState::new(commander.clone()));
    let api_addr = format!("0.0.0.0:{}", config.api.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("JSON-RPC server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", config.api.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping build loop");
        }
    }

    // The build loop finishes its current cycle before it exits.
    let _ = shutdown_tx.send(true);
    if let Err(e) = build_handle.await {
        tracing::error!(error = %e, "build loop task failed");
    }
    poll_handle.abort();

    commander.db().flush().context("failed to flush database")?;
    tracing::info!("rollup-node stopped");
    Ok(())
}

/// Creates the data directory and writes a default config file.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("rollup_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let config_path = data_dir.join(CONFIG_FILE_NAME);
    if config_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite it",
            config_path.display()
        );
    }
    write_default_config(&config_path)?;
    tracing::info!(path = %config_path.display(), "default config written");

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config file    : {}", config_path.display());
    println!("Add genesis accounts to the config file before the first run.");
    Ok(())
}

fn write_default_config(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&CommanderConfig::default())
        .context("failed to encode default config")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write config to {}", path.display()))
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
