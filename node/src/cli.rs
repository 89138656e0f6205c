//! # CLI Interface
//!
//! Command-line arguments for `rollup-node`, built with `clap` derive.
//! Every flag that overrides the config file can also come from the
//! environment.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Optimistic rollup commander node.
///
/// Accepts signed transactions over JSON-RPC, packs them into batches for
/// the base chain, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "rollup-node",
    about = "Optimistic rollup commander node",
    version,
    propagate_version = true
)]
pub struct RollupNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the commander.
    Run(RunArgs),
    /// Create the data directory and write a default config file.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the JSON config file.
    ///
    /// When omitted, the node looks for `commander.json` in the data
    /// directory and falls back to built-in defaults.
    #[arg(long, short = 'c', env = "ROLLUP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the database and the default config file.
    #[arg(long, short = 'd', env = "ROLLUP_DATA_DIR", default_value = "./rollup-data")]
    pub data_dir: PathBuf,

    /// Port for the JSON-RPC API. Overrides `api.port`.
    #[arg(long, env = "ROLLUP_API_PORT")]
    pub api_port: Option<u16>,

    /// Port for the Prometheus metrics endpoint. Overrides `api.metricsPort`.
    #[arg(long, env = "ROLLUP_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Key expected in the `Auth-Key` header of admin calls.
    #[arg(long, env = "ROLLUP_AUTH_KEY", hide_env_values = true)]
    pub auth_key: Option<String>,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "ROLLUP_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Start in migration mode: no new transactions, no new batches.
    #[arg(long, env = "ROLLUP_MIGRATION")]
    pub migration: bool,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "ROLLUP_DATA_DIR", default_value = "./rollup-data")]
    pub data_dir: PathBuf,

    /// Overwrite an existing config file.
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        RollupNodeCli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = RollupNodeCli::parse_from([
            "rollup-node",
            "run",
            "--data-dir",
            "/tmp/rollup",
            "--api-port",
            "8545",
            "--log-format",
            "json",
            "--migration",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.data_dir, PathBuf::from("/tmp/rollup"));
        assert_eq!(args.api_port, Some(8545));
        assert_eq!(args.metrics_port, None);
        assert_eq!(args.log_format, "json");
        assert!(args.migration);
    }
}
