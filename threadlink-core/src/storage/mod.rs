//! Cascading storage engine.
//!
//! Three tiers implement the same [`CacheTier`] contract:
//!
//! 1. [`MemoryTier`] – process-local, volatile, 24h horizon
//! 2. [`RedisTier`] – shared, survives restarts, 3-day horizon, optional
//! 3. [`PostgresTier`] – the permanent record, ignores TTLs
//!
//! [`UnifiedStorage`] hides the topology from callers: reads cascade from
//! the fastest tier and promote hits upwards, writes go to the durable tier
//! first, and deletes make forward progress even when a tier is down.

pub mod durable;
pub mod memory;
pub mod reconciler;
pub mod redis;
pub mod unified;

pub use durable::PostgresTier;
pub use memory::MemoryTier;
pub use reconciler::StorageReconciler;
pub use redis::RedisTier;
pub use unified::{DeleteReport, PENDING_DELETES_KEY, StorageError, StorageStatus, TierTtls, UnifiedStorage};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Position of a tier in the cascade, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Memory,
    Distributed,
    Durable,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::Memory => write!(f, "memory"),
            TierKind::Distributed => write!(f, "distributed"),
            TierKind::Durable => write!(f, "durable"),
        }
    }
}

/// Errors a single tier can report.
#[derive(Debug, Error)]
pub enum TierError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("stored value is not valid JSON: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("{tier} tier timed out after {after:?}")]
    Timeout { tier: TierKind, after: Duration },

    #[error("{0} tier unavailable")]
    Unavailable(TierKind),
}

/// Uniform contract of a storage tier.
///
/// Values are opaque JSON documents. `ttl` is a hint: the memory and
/// distributed tiers expire entries after it, the durable tier ignores it.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn kind(&self) -> TierKind;

    async fn get(&self, key: &str) -> Result<Option<Value>, TierError>;

    async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), TierError>;

    async fn delete(&self, key: &str) -> Result<(), TierError>;

    /// Liveness check used by `/ready`.
    async fn ping(&self) -> Result<(), TierError> {
        Ok(())
    }
}
