//! Configuration module for the threadlink server.
//!
//! Handles loading configuration from TOML files, CLI arguments,
//! and environment variables.

pub mod file;
pub mod runtime;

use crate::config::file::FileConfig;
use crate::config::runtime::{
    ConsumerSettings, QueueConfig, RouterSettings, ServerConfig, SessionSettings, StorageSettings, TelegramConfig,
    UnthreadConfig,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use threadlink_core::events::DEFAULT_QUEUE_NAME;
use url::Url;

const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org/";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid url: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("{0} is not set in the config file or the environment")]
    MissingSecret(&'static str),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Loaded configuration result containing all parts.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub server: ServerConfig,
    pub telegram: TelegramConfig,
    pub unthread: UnthreadConfig,
    pub redis_url: Option<String>,
    pub queue: QueueConfig,
    pub storage: StorageSettings,
    pub consumer: ConsumerSettings,
    pub router: RouterSettings,
    pub sessions: SessionSettings,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the TOML file
    /// 2. Apply CLI and environment overrides
    /// 3. Validate and convert into runtime settings
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        self.parse(&config_content, |name| std::env::var(name).ok())
    }

    /// Reload the configuration (used during SIGHUP).
    pub fn reload(&self) -> Result<LoadedConfig, ConfigError> {
        self.load()
    }

    fn parse(&self, content: &str, env: impl Fn(&str) -> Option<String>) -> Result<LoadedConfig, ConfigError> {
        let mut file_config: FileConfig = toml::from_str(content)?;

        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }
        if let Some(token) = env("TELEGRAM_BOT_TOKEN") {
            file_config.telegram.bot_token = Some(token);
        }
        if let Some(key) = env("UNTHREAD_API_KEY") {
            file_config.unthread.api_key = Some(key);
        }
        if let Some(url) = env("REDIS_URL") {
            file_config.storage.redis_url = Some(url);
        }

        build_loaded_config(file_config)
    }
}

fn build_loaded_config(file: FileConfig) -> Result<LoadedConfig, ConfigError> {
    let bot_token = non_empty(file.telegram.bot_token).ok_or(ConfigError::MissingSecret("TELEGRAM_BOT_TOKEN"))?;
    let api_key = non_empty(file.unthread.api_key).ok_or(ConfigError::MissingSecret("UNTHREAD_API_KEY"))?;

    let telegram = TelegramConfig {
        bot_token,
        api_url: directory_url(file.telegram.api_url, DEFAULT_TELEGRAM_API_URL)?,
    };
    let unthread = UnthreadConfig {
        api_key,
        api_url: directory_url(file.unthread.api_url, threadlink_sdk::client::DEFAULT_BASE_URL)?,
    };

    let storage_defaults = StorageSettings::default();
    let storage = StorageSettings {
        memory_ttl: secs_or(file.storage.memory_ttl_secs, storage_defaults.memory_ttl),
        distributed_ttl: secs_or(file.storage.distributed_ttl_secs, storage_defaults.distributed_ttl),
        operation_timeout: millis_or(file.storage.operation_timeout_ms, storage_defaults.operation_timeout),
        reconcile_interval: secs_or(file.storage.reconcile_interval_secs, storage_defaults.reconcile_interval),
        sweep_interval: secs_or(file.storage.sweep_interval_secs, storage_defaults.sweep_interval),
    };

    let consumer_defaults = ConsumerSettings::default();
    let consumer = ConsumerSettings {
        poll_interval: millis_or(file.queue.poll_interval_ms, consumer_defaults.poll_interval),
        batch_size: file.queue.batch_size.unwrap_or(consumer_defaults.batch_size),
        max_retries: file.queue.max_retries.unwrap_or(consumer_defaults.max_retries),
        retry_base_delay: millis_or(file.queue.retry_base_delay_ms, consumer_defaults.retry_base_delay),
        retry_max_delay: secs_or(file.queue.retry_max_delay_secs, consumer_defaults.retry_max_delay),
        handler_timeout: secs_or(file.queue.handler_timeout_secs, consumer_defaults.handler_timeout),
        reconnect_max_delay: secs_or(file.queue.reconnect_max_delay_secs, consumer_defaults.reconnect_max_delay),
    };

    let router_defaults = RouterSettings::default();
    let router = RouterSettings {
        delivery_timeout: secs_or(file.router.delivery_timeout_secs, router_defaults.delivery_timeout),
        source_platform: non_empty(file.router.source_platform).unwrap_or(router_defaults.source_platform),
    };

    let session_defaults = SessionSettings::default();
    let sessions = SessionSettings {
        user_state_ttl: secs_or(file.sessions.user_state_ttl_secs, session_defaults.user_state_ttl),
        dm_setup_ttl: secs_or(file.sessions.dm_setup_ttl_secs, session_defaults.dm_setup_ttl),
    };

    let loaded = LoadedConfig {
        server: ServerConfig {
            listen: file.server.listen,
        },
        telegram,
        unthread,
        redis_url: non_empty(file.storage.redis_url),
        queue: QueueConfig {
            name: non_empty(file.queue.name).unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
        },
        storage,
        consumer,
        router,
        sessions,
    };
    validate(&loaded)?;
    Ok(loaded)
}

/// Memory, distributed and durable.
const STORAGE_TIERS: u32 = 3;

fn validate(config: &LoadedConfig) -> Result<(), ConfigError> {
    let consumer = &config.consumer;
    if consumer.batch_size == 0 {
        return Err(ConfigError::ValidationError("queue.batch_size must be at least 1".into()));
    }
    if consumer.poll_interval.is_zero() {
        return Err(ConfigError::ValidationError("queue.poll_interval_ms must be positive".into()));
    }
    if consumer.handler_timeout.is_zero() {
        return Err(ConfigError::ValidationError("queue.handler_timeout_secs must be positive".into()));
    }
    if consumer.retry_base_delay > consumer.retry_max_delay {
        return Err(ConfigError::ValidationError(
            "queue.retry_base_delay_ms exceeds queue.retry_max_delay_secs".into(),
        ));
    }
    if config.storage.operation_timeout.is_zero() {
        return Err(ConfigError::ValidationError("storage.operation_timeout_ms must be positive".into()));
    }
    if config.storage.memory_ttl > config.storage.distributed_ttl {
        return Err(ConfigError::ValidationError(
            "storage.memory_ttl_secs must not exceed storage.distributed_ttl_secs".into(),
        ));
    }
    if config.router.delivery_timeout.is_zero() {
        return Err(ConfigError::ValidationError("router.delivery_timeout_secs must be positive".into()));
    }
    // A ticket read may time out on every tier before the delivery starts.
    let worst_case = config.storage.operation_timeout * STORAGE_TIERS + config.router.delivery_timeout;
    if consumer.handler_timeout <= worst_case {
        return Err(ConfigError::ValidationError(format!(
            "queue.handler_timeout_secs must exceed {}s (three storage operations plus one delivery)",
            worst_case.as_secs_f64()
        )));
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

/// API roots are joined with relative paths, so they must end with `/`.
fn directory_url(value: Option<Url>, default: &str) -> Result<Url, ConfigError> {
    let mut url = match value {
        Some(url) => url,
        None => Url::parse(default)?,
    };
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}
