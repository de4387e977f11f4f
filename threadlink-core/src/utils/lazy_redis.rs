//! Redis connection opened on first use.

use redis::RedisResult;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// A [`ConnectionManager`] that is dialed when first needed.
///
/// Building one never touches the network, so a process can start while
/// Redis is down. A failed dial leaves the cell empty and the next call
/// tries again; once established, the manager handles reconnects itself.
#[derive(Clone)]
pub struct LazyConnection {
    client: redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
}

impl LazyConnection {
    /// Parse `url`. Fails only on a malformed URL.
    pub fn open(url: &str) -> RedisResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: Arc::new(OnceCell::new()),
        })
    }

    pub async fn get(&self) -> RedisResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| {
                // Callers retry on their own schedule.
                let config = ConnectionManagerConfig::new().set_number_of_retries(1);
                ConnectionManager::new_with_config(self.client.clone(), config)
            })
            .await?;
        Ok(conn.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.conn.initialized()
    }
}
