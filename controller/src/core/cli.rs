use clap::{Parser, Subcommand};

use std::path::PathBuf;

use super::constants::{
    ENV_CALL_TIMEOUT_MS, ENV_CONFIG, ENV_CONSUMPTION_DELAY_MS, ENV_EXECUTOR_BATCH,
    ENV_EXECUTOR_WORKERS, ENV_HOST, ENV_LEASE_TTL_MS, ENV_PORT, ENV_PROGRESS_INTERVAL_MS,
    ENV_QUEUE_HIGH_WATER, ENV_REAP_INTERVAL_MS,
};

#[derive(Parser)]
#[command(name = "trellisd")]
#[command(version, about = "Trellis controller", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server host address
    #[arg(long, short = 'H', global = true, env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', global = true, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Subscription progressor pass interval in milliseconds
    #[arg(long, global = true, env = ENV_PROGRESS_INTERVAL_MS)]
    pub progress_interval_ms: Option<u64>,

    /// Event consumption delay in milliseconds
    #[arg(long, global = true, env = ENV_CONSUMPTION_DELAY_MS)]
    pub consumption_delay_ms: Option<i64>,

    /// Pending-queue depth above which the progressor skips passes
    #[arg(long, global = true, env = ENV_QUEUE_HIGH_WATER)]
    pub queue_high_water: Option<i64>,

    /// Async calls leased per executor pass
    #[arg(long, global = true, env = ENV_EXECUTOR_BATCH)]
    pub executor_batch: Option<i64>,

    /// Concurrent verb invocations per controller
    #[arg(long, global = true, env = ENV_EXECUTOR_WORKERS)]
    pub executor_workers: Option<usize>,

    /// Async call lease TTL in milliseconds
    #[arg(long, global = true, env = ENV_LEASE_TTL_MS)]
    pub lease_ttl_ms: Option<u64>,

    /// Expired-lease sweep interval in milliseconds
    #[arg(long, global = true, env = ENV_REAP_INTERVAL_MS)]
    pub reap_interval_ms: Option<u64>,

    /// Per-invocation deadline in milliseconds
    #[arg(long, global = true, env = ENV_CALL_TIMEOUT_MS)]
    pub call_timeout_ms: Option<u64>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Start the controller (default command)
    Start,
    /// System maintenance commands
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum SystemCommands {
    /// Delete the local data directory (database, WAL). Requires confirmation.
    Prune {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub progress_interval_ms: Option<u64>,
    pub consumption_delay_ms: Option<i64>,
    pub queue_high_water: Option<i64>,
    pub executor_batch: Option<i64>,
    pub executor_workers: Option<usize>,
    pub lease_ttl_ms: Option<u64>,
    pub reap_interval_ms: Option<u64>,
    pub call_timeout_ms: Option<u64>,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig {
        host: cli.host,
        port: cli.port,
        config: cli.config,
        progress_interval_ms: cli.progress_interval_ms,
        consumption_delay_ms: cli.consumption_delay_ms,
        queue_high_water: cli.queue_high_water,
        executor_batch: cli.executor_batch,
        executor_workers: cli.executor_workers,
        lease_ttl_ms: cli.lease_ttl_ms,
        reap_interval_ms: cli.reap_interval_ms,
        call_timeout_ms: cli.call_timeout_ms,
    };
    (config, cli.command)
}
