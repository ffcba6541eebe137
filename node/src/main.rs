// Copyright (c) 2026 Cloak Contributors. MIT License.
// See LICENSE for details.

//! # Cloak Settlement Node
//!
//! Entry point for the `cloak-node` binary. Parses CLI arguments, initializes
//! logging and metrics, opens the transfer index, starts the reconciliation
//! loop, and serves the HTTP API.
//!
//! - `run`: start the node
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

use cloak_contracts::{EscrowLedger, InProcessLedger, SystemClock};
use cloak_protocol::settlement::{CoordinatorConfig, SettlementCoordinator};
use cloak_protocol::storage::TransferIndex;
use cloak_protocol::transfer::{Address, CommitmentGenerator};

use cli::{CloakNodeCli, Commands};
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CloakNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the node: index, devnet ledger, reconcile loop, API and metrics.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        logging::DEFAULT_FILTER,
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        network = %args.network,
        data_dir = %args.data_dir.display(),
        "starting cloak-node"
    );

    // --- Index ---
    let index_path = args.data_dir.join("index");
    std::fs::create_dir_all(&index_path)
        .with_context(|| format!("failed to create index directory: {}", index_path.display()))?;
    let index = TransferIndex::open(&index_path)
        .with_context(|| format!("failed to open index at {}", index_path.display()))?;
    tracing::info!(
        path = %index_path.display(),
        transfers = index.transfer_count(),
        "index opened"
    );

    // --- Devnet ledger ---
    let admin: Address = args
        .admin
        .parse()
        .with_context(|| format!("invalid admin address: {}", args.admin))?;
    let collector: Address = args
        .fee_collector
        .parse()
        .with_context(|| format!("invalid fee collector address: {}", args.fee_collector))?;
    let escrow = EscrowLedger::new(admin, args.fee_bps, collector)
        .context("failed to deploy escrow contract")?;
    let ledger = InProcessLedger::new(escrow, Arc::new(SystemClock));
    tracing::info!(fee_bps = args.fee_bps, admin = %admin, "devnet ledger ready");

    // --- Coordinator ---
    let coordinator = Arc::new(SettlementCoordinator::new(
        CommitmentGenerator::default(),
        index,
        Arc::new(ledger),
        CoordinatorConfig::default(),
    ));

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    if let Ok(stats) = coordinator.index().get_stats() {
        node_metrics.pending_transfers.set(stats.pending as i64);
    }

    // --- Reconcile loop ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcile = {
        let coordinator = Arc::clone(&coordinator);
        let metrics = Arc::clone(&node_metrics);
        let interval = Duration::from_millis(args.reconcile_interval_ms);
        tokio::spawn(async move {
            coordinator
                .run_reconcile_loop(interval, shutdown_rx, |report| {
                    metrics.observe_reconcile(report);
                    if let Ok(stats) = coordinator.index().get_stats() {
                        metrics.pending_transfers.set(stats.pending as i64);
                    }
                })
                .await;
        })
    };

    // --- Application state ---
    let app_state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            cloak_protocol::config::PROTOCOL_VERSION,
        ),
        network: args.network.clone(),
        coordinator: Arc::clone(&coordinator),
        metrics: Arc::clone(&node_metrics),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
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
            tracing::info!("shutdown signal received");
        }
    }

    // Let an in-progress pass finish so the cursor lands with its batch.
    let _ = shutdown_tx.send(true);
    if let Err(e) = reconcile.await {
        tracing::warn!(error = %e, "reconcile task ended abnormally");
    }
    coordinator
        .index()
        .flush()
        .context("failed to flush index on shutdown")?;

    tracing::info!("cloak-node stopped");
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("cloak-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol   {}", cloak_protocol::config::PROTOCOL_VERSION);
    println!("rustc      {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed, that branch never completes.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
