//! Application-wide constants

/// Application name used in platform paths
pub const APP_NAME: &str = "Trellis";

/// Lowercase name used in log filters and URLs
pub const APP_NAME_LOWER: &str = "trellis";

/// Fallback dot-folder when no platform dir is available
pub const APP_DOT_FOLDER: &str = ".trellis";

/// Config file name searched in the data directory
pub const CONFIG_FILE_NAME: &str = "controller.json";

// Environment variables
pub const ENV_LOG: &str = "TRELLIS_LOG";
pub const ENV_DATA_DIR: &str = "TRELLIS_DATA_DIR";
pub const ENV_HOST: &str = "TRELLIS_HOST";
pub const ENV_PORT: &str = "TRELLIS_PORT";
pub const ENV_CONFIG: &str = "TRELLIS_CONFIG";
pub const ENV_PROGRESS_INTERVAL_MS: &str = "TRELLIS_PROGRESS_INTERVAL_MS";
pub const ENV_CONSUMPTION_DELAY_MS: &str = "TRELLIS_CONSUMPTION_DELAY_MS";
pub const ENV_QUEUE_HIGH_WATER: &str = "TRELLIS_QUEUE_HIGH_WATER";
pub const ENV_EXECUTOR_BATCH: &str = "TRELLIS_EXECUTOR_BATCH";
pub const ENV_EXECUTOR_WORKERS: &str = "TRELLIS_EXECUTOR_WORKERS";
pub const ENV_LEASE_TTL_MS: &str = "TRELLIS_LEASE_TTL_MS";
pub const ENV_REAP_INTERVAL_MS: &str = "TRELLIS_REAP_INTERVAL_MS";
pub const ENV_CALL_TIMEOUT_MS: &str = "TRELLIS_CALL_TIMEOUT_MS";

// Server defaults
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8892;

// Pub/sub defaults
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_CONSUMPTION_DELAY_MS: i64 = 200;
pub const DEFAULT_QUEUE_HIGH_WATER: i64 = 1_024;

// Executor defaults
pub const DEFAULT_EXECUTOR_INTERVAL_MS: u64 = 250;
pub const DEFAULT_EXECUTOR_BATCH: i64 = 16;
pub const DEFAULT_EXECUTOR_WORKERS: usize = 8;
pub const DEFAULT_LEASE_TTL_MS: u64 = 60_000;
pub const DEFAULT_REAP_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

// Timeline limits
pub const TIMELINE_MAX_LIMIT: u32 = 1_000;
pub const TIMELINE_DEFAULT_LIMIT: u32 = 100;
/// Minimum streaming re-poll interval
pub const STREAM_MIN_INTERVAL_MS: u64 = 1_000;

// Routing
pub const ROUTE_CACHE_TTL_MS: i64 = 5_000;

// SQLite tuning
pub const SQLITE_DB_FILENAME: &str = "controller.db";
pub const SQLITE_MAX_CONNECTIONS: u32 = 8;
pub const SQLITE_BUSY_TIMEOUT_SECS: u64 = 5;
pub const SQLITE_CACHE_SIZE: &str = "-64000";
pub const SQLITE_WAL_AUTOCHECKPOINT: &str = "1000";
pub const SQLITE_CHECKPOINT_INTERVAL_SECS: u64 = 300;

// Shutdown
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

// HTTP
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;
