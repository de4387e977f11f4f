//! TOML file configuration structures.
//!
//! These structs directly map to the `threadlink.toml` file format. Every
//! section except `[server]` may be omitted; missing values fall back to the
//! defaults of the runtime settings.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub unthread: UnthreadConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address and port to listen on (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

/// Telegram Bot API section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Overridden by `TELEGRAM_BOT_TOKEN`.
    pub bot_token: Option<String>,
    /// API root, for a self-hosted Bot API server.
    pub api_url: Option<Url>,
}

/// Unthread API section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnthreadConfig {
    /// Overridden by `UNTHREAD_API_KEY`.
    pub api_key: Option<String>,
    pub api_url: Option<Url>,
}

/// Storage tiers. Durations are in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Redis used as the distributed tier and the event queue.
    /// Overridden by `REDIS_URL`.
    pub redis_url: Option<String>,
    pub memory_ttl_secs: Option<u64>,
    pub distributed_ttl_secs: Option<u64>,
    pub operation_timeout_ms: Option<u64>,
    pub reconcile_interval_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

/// Event queue consumer. Reloaded on SIGHUP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_secs: Option<u64>,
    pub handler_timeout_secs: Option<u64>,
    pub reconnect_max_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    pub delivery_timeout_secs: Option<u64>,
    pub source_platform: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub user_state_ttl_secs: Option<u64>,
    pub dm_setup_ttl_secs: Option<u64>,
}
