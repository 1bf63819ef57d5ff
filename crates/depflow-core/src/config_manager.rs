use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration for depflow
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DepflowConfig {
    /// Dependency walk settings
    #[serde(default)]
    pub propagation: PropagationConfig,

    /// Dependency and queue storage
    #[serde(default)]
    pub store: StoreConfig,

    /// Queue consumer settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Mutation entry point settings
    #[serde(default)]
    pub events: EventsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropagationConfig {
    /// Maximum recursion depth of one propagation pass
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Dirt per attribute: disables the per-channel "already triggered" check
    #[serde(default)]
    pub attribute_dirting: bool,

    /// Record nested event/dependency trace markers
    #[serde(default)]
    pub trace_enabled: bool,

    /// Number of dirted objects from which the full trace is written out
    #[serde(default = "default_trace_threshold")]
    pub trace_threshold: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            attribute_dirting: false,
            trace_enabled: false,
            trace_threshold: default_trace_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Backend: "memory" or "sled"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Directory of the sled database
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Attempts after the first failed write transaction
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Linear backoff between write attempts (ms)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Idle poll interval of the queue worker (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Detail lines kept in a content repository check report
    #[serde(default = "default_cr_check_max_details")]
    pub cr_check_max_details: usize,

    /// Entries consumed per worker wake-up
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            cr_check_max_details: default_cr_check_max_details(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EventsConfig {
    /// Attempt a synchronous publish right after each mutation
    #[serde(default)]
    pub instant_publish: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_max_depth() -> usize {
    64
}
fn default_trace_threshold() -> usize {
    100
}
fn default_store_backend() -> String {
    "memory".to_string()
}
fn default_store_path() -> PathBuf {
    PathBuf::from(".depflow/data")
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    20
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_cr_check_max_details() -> usize {
    10
}
fn default_batch_size() -> usize {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Configuration manager: file, then environment, then validation
pub struct ConfigManager {
    config: DepflowConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (.env file)
    /// 2. Config file (.depflow.toml)
    /// 3. Sensible defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_dotenv();
        let (config, config_path) = Self::load_config_file()?;
        Self::finish(config, config_path)
    }

    /// Load from an explicit file, still honouring environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::load_dotenv();
        let config = Self::read_toml_file(path)?;
        Self::finish(config, Some(path.to_path_buf()))
    }

    fn finish(config: DepflowConfig, config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = Self::apply_env_overrides(config);
        Self::validate_config(&config)?;

        info!(
            config_file = %config_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "NONE (using defaults)".to_string()),
            store_backend = %config.store.backend,
            max_depth = config.propagation.max_depth,
            "Configuration loaded"
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    fn load_dotenv() {
        if Path::new(".env").exists() {
            if let Err(e) = dotenv::from_filename(".env") {
                warn!("Failed to load .env file: {}", e);
            }
        }
    }

    /// Search order: ./.depflow.toml, ~/.depflow/config.toml, defaults
    fn load_config_file() -> Result<(DepflowConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".depflow.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".depflow").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        Ok((DepflowConfig::default(), None))
    }

    fn read_toml_file(path: &Path) -> Result<DepflowConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_env_overrides(mut config: DepflowConfig) -> DepflowConfig {
        fn flag(value: &str) -> bool {
            value.eq_ignore_ascii_case("true") || value == "1"
        }

        if let Ok(depth) = std::env::var("DEPFLOW_MAX_DEPTH") {
            if let Ok(d) = depth.parse() {
                config.propagation.max_depth = d;
            }
        }
        if let Ok(value) = std::env::var("DEPFLOW_ATTRIBUTE_DIRTING") {
            config.propagation.attribute_dirting = flag(&value);
        }
        if let Ok(value) = std::env::var("DEPFLOW_TRACE") {
            config.propagation.trace_enabled = flag(&value);
        }
        if let Ok(threshold) = std::env::var("DEPFLOW_TRACE_THRESHOLD") {
            if let Ok(t) = threshold.parse() {
                config.propagation.trace_threshold = t;
            }
        }

        if let Ok(backend) = std::env::var("DEPFLOW_STORE_BACKEND") {
            config.store.backend = backend;
        }
        if let Ok(path) = std::env::var("DEPFLOW_STORE_PATH") {
            config.store.path = PathBuf::from(path);
        }
        if let Ok(retries) = std::env::var("DEPFLOW_STORE_RETRIES") {
            if let Ok(r) = retries.parse() {
                config.store.max_retries = r;
            }
        }

        if let Ok(interval) = std::env::var("DEPFLOW_POLL_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                config.queue.poll_interval_ms = ms;
            }
        }
        if let Ok(value) = std::env::var("DEPFLOW_INSTANT_PUBLISH") {
            config.events.instant_publish = flag(&value);
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("DEPFLOW_LOG_FORMAT") {
            config.logging.format = format;
        }

        config
    }

    pub fn validate_config(config: &DepflowConfig) -> Result<(), ConfigError> {
        if config.propagation.max_depth == 0 {
            return Err(ConfigError::ValidationError(
                "propagation.max_depth must be at least 1".to_string(),
            ));
        }

        match config.store.backend.as_str() {
            "memory" | "sled" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid store backend: {}. Must be one of: memory, sled",
                    other
                )))
            }
        }

        if config.queue.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "queue.batch_size must be at least 1".to_string(),
            ));
        }

        // RUST_LOG may carry directives ("depflow=debug,info"); only bare levels are checked.
        let level = config.logging.level.as_str();
        if !level.contains('=') && !level.contains(',') {
            match level {
                "trace" | "debug" | "info" | "warn" | "error" => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                        other
                    )))
                }
            }
        }

        match config.logging.format.as_str() {
            "pretty" | "json" | "compact" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}. Must be one of: pretty, json, compact",
                    other
                )))
            }
        }

        Ok(())
    }

    pub fn from_config(config: DepflowConfig) -> Result<Self, ConfigError> {
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: None,
        })
    }

    pub fn config(&self) -> &DepflowConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Create a default config file
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = DepflowConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}
