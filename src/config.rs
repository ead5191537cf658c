//! Configuration types.
//!
//! Every section has sensible defaults and can be overridden from
//! `RUNNER_*` environment variables via [`RunnerConfig::from_env`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Task queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of simultaneously running tasks.
    pub max_concurrent: usize,
    /// Timeout applied when a task does not specify one.
    pub default_timeout: Duration,
    /// How long terminal tasks are kept before being purged.
    pub history_retention: Duration,
    /// Hard cap on retained terminal tasks.
    pub max_history: usize,
    /// How often the history sweeper runs.
    pub sweep_interval: Duration,
    /// Optional JSON snapshot used to reload tasks on boot.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            default_timeout: Duration::from_secs(1800), // 30 minutes
            history_retention: Duration::from_secs(3600), // 1 hour
            max_history: 500,
            sweep_interval: Duration::from_secs(60),
            snapshot_path: None,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Tasks a single worker may run at once.
    pub per_worker_capacity: usize,
    /// Utilization above which one worker is added per tick.
    pub scale_up_threshold: f64,
    /// Utilization below which one idle worker is removed per tick.
    pub scale_down_threshold: f64,
    /// Idle time after which a worker above `min_workers` is drained.
    pub idle_timeout: Duration,
    pub scale_interval: Duration,
    pub health_check_interval: Duration,
    /// First retry delay after a failed provision; doubles per failure.
    pub provision_backoff_base: Duration,
    pub provision_backoff_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            per_worker_capacity: 1,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            idle_timeout: Duration::from_secs(300),
            scale_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            provision_backoff_base: Duration::from_secs(5),
            provision_backoff_max: Duration::from_secs(300),
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long a cancelled execution may take to wind down before it is
    /// force-marked cancelled.
    pub cancel_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// Protocol server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Per-connection outbound buffer; `progress` events are dropped when full.
    pub outbound_buffer: usize,
    /// Repository used when a query names none and no working directory is configured.
    pub default_repository: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            outbound_buffer: 256,
            default_repository: None,
        }
    }
}

/// Agent executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Agent CLI binary.
    pub command: String,
    /// Extra arguments passed before the generated ones.
    pub extra_args: Vec<String>,
    pub default_model: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            extra_args: Vec::new(),
            default_model: None,
        }
    }
}

/// Complete runner configuration.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub dispatch: DispatchConfig,
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl RunnerConfig {
    /// Build a configuration from defaults overridden by `RUNNER_*` env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("RUNNER_MAX_CONCURRENT")? {
            config.queue.max_concurrent = v;
        }
        if let Some(v) = env_secs("RUNNER_TASK_TIMEOUT_SECS")? {
            config.queue.default_timeout = v;
        }
        if let Some(v) = env_secs("RUNNER_HISTORY_RETENTION_SECS")? {
            config.queue.history_retention = v;
        }
        if let Some(v) = env_parse::<usize>("RUNNER_MAX_HISTORY")? {
            config.queue.max_history = v;
        }
        config.queue.snapshot_path = env_string("RUNNER_SNAPSHOT_PATH").map(PathBuf::from);

        if let Some(v) = env_parse::<usize>("RUNNER_MIN_WORKERS")? {
            config.pool.min_workers = v;
        }
        if let Some(v) = env_parse::<usize>("RUNNER_MAX_WORKERS")? {
            config.pool.max_workers = v;
        }
        if let Some(v) = env_parse::<usize>("RUNNER_WORKER_CAPACITY")? {
            config.pool.per_worker_capacity = v;
        }
        if let Some(v) = env_parse::<f64>("RUNNER_SCALE_UP_THRESHOLD")? {
            config.pool.scale_up_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("RUNNER_SCALE_DOWN_THRESHOLD")? {
            config.pool.scale_down_threshold = v;
        }
        if let Some(v) = env_secs("RUNNER_IDLE_TIMEOUT_SECS")? {
            config.pool.idle_timeout = v;
        }
        if let Some(v) = env_secs("RUNNER_SCALE_INTERVAL_SECS")? {
            config.pool.scale_interval = v;
        }
        if let Some(v) = env_secs("RUNNER_HEALTH_INTERVAL_SECS")? {
            config.pool.health_check_interval = v;
        }

        if let Some(v) = env_secs("RUNNER_CANCEL_GRACE_SECS")? {
            config.dispatch.cancel_grace = v;
        }

        if let Some(v) = env_string("RUNNER_BIND_ADDR") {
            config.server.bind_addr = v;
        }
        if let Some(v) = env_parse::<u16>("RUNNER_PORT")? {
            config.server.port = v;
        }
        config.server.default_repository = env_string("RUNNER_DEFAULT_REPOSITORY");

        if let Some(v) = env_string("RUNNER_AGENT_COMMAND") {
            config.executor.command = v;
        }
        if let Some(v) = env_string("RUNNER_AGENT_ARGS") {
            config.executor.extra_args = v.split_whitespace().map(str::to_string).collect();
        }
        config.executor.default_model = env_string("RUNNER_AGENT_MODEL");

        config.log_dir = env_string("RUNNER_LOG_DIR").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_concurrent == 0 {
            return Err(invalid("RUNNER_MAX_CONCURRENT", "must be at least 1"));
        }
        if self.pool.per_worker_capacity == 0 {
            return Err(invalid("RUNNER_WORKER_CAPACITY", "must be at least 1"));
        }
        if self.pool.max_workers == 0 || self.pool.min_workers > self.pool.max_workers {
            return Err(invalid(
                "RUNNER_MAX_WORKERS",
                "must be at least 1 and not below RUNNER_MIN_WORKERS",
            ));
        }
        if self.pool.scale_down_threshold >= self.pool.scale_up_threshold {
            return Err(invalid(
                "RUNNER_SCALE_DOWN_THRESHOLD",
                "must be below RUNNER_SCALE_UP_THRESHOLD",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(None),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}
