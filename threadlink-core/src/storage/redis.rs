//! Shared tier backed by Redis.
//!
//! Values are stored as JSON strings under the caller's key, with `SET EX`
//! expiry. The connection is dialed on first use, so the tier exists even
//! when Redis is down at startup. While it is unreachable every call fails
//! and the unified storage degrades to the remaining tiers, recording
//! deletes it could not apply.

use super::{CacheTier, TierError, TierKind};
use async_trait::async_trait;
use crate::utils::lazy_redis::LazyConnection;
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;

/// Default lifetime of a distributed entry when the caller gives no TTL.
pub const DEFAULT_DISTRIBUTED_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

#[derive(Clone)]
pub struct RedisTier {
    conn: LazyConnection,
}

impl RedisTier {
    /// Prepare a tier for `url` without connecting.
    pub fn open(url: &str) -> Result<Self, TierError> {
        Ok(Self {
            conn: LazyConnection::open(url)?,
        })
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    fn kind(&self) -> TierKind {
        TierKind::Distributed
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, TierError> {
        let mut conn = self.conn.get().await?;
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), TierError> {
        let mut conn = self.conn.get().await?;
        let raw = serde_json::to_string(value)?;
        // SET EX rejects 0, so sub-second TTLs round up to one second.
        let seconds = ttl.unwrap_or(DEFAULT_DISTRIBUTED_TTL).as_secs().max(1);
        let _: () = conn.set_ex(key, raw, seconds).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        let mut conn = self.conn.get().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), TierError> {
        let mut conn = self.conn.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
