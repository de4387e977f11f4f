//! Runtime settings shared across crates.
//!
//! These are the validated, typed settings the core components run with.
//! Loading and parsing the configuration file is handled by the server crate.

mod config_store;

pub use config_store::{ConfigStore, ConfigWatcher};

use std::time::Duration;

/// Settings of the unified storage engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    /// Lifetime of memory-tier entries.
    pub memory_ttl: Duration,
    /// Lifetime of distributed-tier entries.
    pub distributed_ttl: Duration,
    /// Upper bound for a single tier operation.
    pub operation_timeout: Duration,
    /// How often pending deletes are retried.
    pub reconcile_interval: Duration,
    /// How often expired memory entries are swept.
    pub sweep_interval: Duration,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            memory_ttl: Duration::from_secs(24 * 60 * 60),
            distributed_ttl: Duration::from_secs(3 * 24 * 60 * 60),
            operation_timeout: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Settings of the event queue consumer. Hot-reloadable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Delay between polls when the queue is idle.
    pub poll_interval: Duration,
    /// Maximum events dequeued per poll.
    pub batch_size: usize,
    /// Attempts after the first one before an event is dead-lettered.
    pub max_retries: u32,
    /// Backoff of the first retry; doubles with every attempt.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Upper bound for one handler invocation. Must cover a cold ticket
    /// read through every storage tier plus one chat delivery.
    pub handler_timeout: Duration,
    /// Longest wait between reconnect attempts to the queue backend.
    pub reconnect_max_delay: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            max_retries: 5,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(300),
            handler_timeout: Duration::from_secs(45),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// Settings of the conversation router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterSettings {
    /// Upper bound for one chat delivery call.
    pub delivery_timeout: Duration,
    /// Platform tag the router subscribes to.
    pub source_platform: String,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_secs(15),
            source_platform: threadlink_sdk::objects::event::SOURCE_DASHBOARD.to_string(),
        }
    }
}

/// Lifetimes of ephemeral conversational records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub user_state_ttl: Duration,
    pub dm_setup_ttl: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            user_state_ttl: Duration::from_secs(60 * 60),
            dm_setup_ttl: Duration::from_secs(10 * 60),
        }
    }
}
