//! Controller configuration
//!
//! Layered: CLI flags (and their env vars, handled by clap) override the
//! JSON config file, which overrides built-in defaults. The config file
//! lives in the data directory by default and every section is optional.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::cli::CliConfig;
use super::constants::{
    CONFIG_FILE_NAME, DEFAULT_CALL_TIMEOUT_MS, DEFAULT_CONSUMPTION_DELAY_MS,
    DEFAULT_EXECUTOR_BATCH, DEFAULT_EXECUTOR_INTERVAL_MS, DEFAULT_EXECUTOR_WORKERS, DEFAULT_HOST,
    DEFAULT_LEASE_TTL_MS, DEFAULT_PORT, DEFAULT_PROGRESS_INTERVAL_MS, DEFAULT_QUEUE_HIGH_WATER,
    DEFAULT_REAP_INTERVAL_MS,
};
use crate::domain::asynccall::ExecutorConfig;
use crate::domain::pubsub::ProgressorConfig;

// =============================================================================
// File Config Structs (JSON deserialization)
// =============================================================================

/// Server configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Pub/sub configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PubSubFileConfig {
    pub progress_interval_ms: Option<u64>,
    pub consumption_delay_ms: Option<i64>,
    pub queue_high_water: Option<i64>,
}

/// Executor configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ExecutorFileConfig {
    pub interval_ms: Option<u64>,
    pub batch_size: Option<i64>,
    pub workers: Option<usize>,
    pub lease_ttl_ms: Option<u64>,
    pub reap_interval_ms: Option<u64>,
    pub call_timeout_ms: Option<u64>,
}

/// Root of the JSON config file
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub pubsub: PubSubFileConfig,
    #[serde(default)]
    pub executor: ExecutorFileConfig,
}

// =============================================================================
// Resolved configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub progress_interval: Duration,
    pub consumption_delay_ms: i64,
    pub queue_high_water: i64,
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub interval: Duration,
    pub batch_size: i64,
    pub workers: usize,
    pub lease_ttl: Duration,
    pub reap_interval: Duration,
    pub call_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub pubsub: PubSubConfig,
    pub executor: ExecutorSettings,
}

impl AppConfig {
    /// Resolve configuration from defaults, the optional JSON config file,
    /// and CLI/env overrides (strongest last).
    pub fn load(cli: &CliConfig) -> Result<Self> {
        let file = Self::load_file(cli)?;
        Ok(Self::merge(&file, cli))
    }

    fn load_file(cli: &CliConfig) -> Result<FileConfig> {
        let path = match &cli.config {
            Some(path) => path.clone(),
            None => {
                let default = default_config_path();
                if !default.exists() {
                    return Ok(FileConfig::default());
                }
                default
            }
        };

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: FileConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    fn merge(file: &FileConfig, cli: &CliConfig) -> Self {
        Self {
            server: ServerConfig {
                host: cli
                    .host
                    .clone()
                    .or_else(|| file.server.host.clone())
                    .unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: cli.port.or(file.server.port).unwrap_or(DEFAULT_PORT),
            },
            pubsub: PubSubConfig {
                progress_interval: Duration::from_millis(
                    cli.progress_interval_ms
                        .or(file.pubsub.progress_interval_ms)
                        .unwrap_or(DEFAULT_PROGRESS_INTERVAL_MS),
                ),
                consumption_delay_ms: cli
                    .consumption_delay_ms
                    .or(file.pubsub.consumption_delay_ms)
                    .unwrap_or(DEFAULT_CONSUMPTION_DELAY_MS),
                queue_high_water: cli
                    .queue_high_water
                    .or(file.pubsub.queue_high_water)
                    .unwrap_or(DEFAULT_QUEUE_HIGH_WATER),
            },
            executor: ExecutorSettings {
                interval: Duration::from_millis(
                    file.executor
                        .interval_ms
                        .unwrap_or(DEFAULT_EXECUTOR_INTERVAL_MS),
                ),
                batch_size: cli
                    .executor_batch
                    .or(file.executor.batch_size)
                    .unwrap_or(DEFAULT_EXECUTOR_BATCH),
                workers: cli
                    .executor_workers
                    .or(file.executor.workers)
                    .unwrap_or(DEFAULT_EXECUTOR_WORKERS),
                lease_ttl: Duration::from_millis(
                    cli.lease_ttl_ms
                        .or(file.executor.lease_ttl_ms)
                        .unwrap_or(DEFAULT_LEASE_TTL_MS),
                ),
                reap_interval: Duration::from_millis(
                    cli.reap_interval_ms
                        .or(file.executor.reap_interval_ms)
                        .unwrap_or(DEFAULT_REAP_INTERVAL_MS),
                ),
                call_timeout: Duration::from_millis(
                    cli.call_timeout_ms
                        .or(file.executor.call_timeout_ms)
                        .unwrap_or(DEFAULT_CALL_TIMEOUT_MS),
                ),
            },
        }
    }

    pub fn progressor_config(&self) -> ProgressorConfig {
        ProgressorConfig {
            interval: self.pubsub.progress_interval,
            consumption_delay_ms: self.pubsub.consumption_delay_ms,
            queue_high_water: self.pubsub.queue_high_water,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            interval: self.executor.interval,
            batch_size: self.executor.batch_size,
            lease_ttl: self.executor.lease_ttl,
            workers: self.executor.workers,
            call_timeout: self.executor.call_timeout,
        }
    }
}

fn default_config_path() -> PathBuf {
    super::storage::AppStorage::resolve_data_dir().join(CONFIG_FILE_NAME)
}
