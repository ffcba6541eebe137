//! # CLI Interface
//!
//! Defines the command-line argument structure for `cloak-node` using
//! `clap` derive. Two subcommands: `run` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cloak_protocol::config::{
    DEFAULT_API_PORT, DEFAULT_FEE_BPS, DEFAULT_METRICS_PORT, DEFAULT_NETWORK,
    DEFAULT_RECONCILE_INTERVAL_MS,
};

/// Cloak settlement node.
///
/// Serves the recipient/sender HTTP API over the off-ledger index, keeps the
/// index reconciled against the ledger's event stream, and exposes
/// Prometheus metrics. Runs an in-process devnet ledger.
#[derive(Parser, Debug)]
#[command(
    name = "cloak-node",
    about = "Cloak hidden-transfer settlement node",
    version,
    propagate_version = true
)]
pub struct CloakNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory holding the transfer index.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "CLOAK_DATA_DIR", default_value = "./cloak-data")]
    pub data_dir: PathBuf,

    /// Port for the HTTP API.
    #[arg(long, env = "CLOAK_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "CLOAK_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Network name reported by `/status`.
    #[arg(long, env = "CLOAK_NETWORK", default_value = DEFAULT_NETWORK)]
    pub network: String,

    /// Publish fee of the devnet escrow contract, in basis points.
    #[arg(long, env = "CLOAK_FEE_BPS", default_value_t = DEFAULT_FEE_BPS)]
    pub fee_bps: u32,

    /// Address credited with publish fees.
    #[arg(
        long,
        env = "CLOAK_FEE_COLLECTOR",
        default_value = "0x000000000000000000000000000000000000fee0"
    )]
    pub fee_collector: String,

    /// Administrator of the devnet escrow contract.
    #[arg(
        long,
        env = "CLOAK_ADMIN",
        default_value = "0x00000000000000000000000000000000000ad000"
    )]
    pub admin: String,

    /// Milliseconds between reconciliation passes.
    #[arg(long, env = "CLOAK_RECONCILE_INTERVAL_MS", default_value_t = DEFAULT_RECONCILE_INTERVAL_MS)]
    pub reconcile_interval_ms: u64,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "CLOAK_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}
