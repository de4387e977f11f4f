//! Validated configuration the binary runs with.
//!
//! Component settings are the core crate's types; only the adapter
//! credentials are defined here.

pub use threadlink_core::config::{ConsumerSettings, RouterSettings, SessionSettings, StorageSettings};

use std::fmt;
use std::net::SocketAddr;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

#[derive(Clone, PartialEq, Eq)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub api_url: Url,
}

// Tokens must never reach the logs.
impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"<redacted>")
            .field("api_url", &self.api_url.as_str())
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct UnthreadConfig {
    pub api_key: String,
    pub api_url: Url,
}

impl fmt::Debug for UnthreadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnthreadConfig")
            .field("api_key", &"<redacted>")
            .field("api_url", &self.api_url.as_str())
            .finish()
    }
}

/// Where events are consumed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
}
