//! Redis-backed event queue.
//!
//! Key layout for a queue named `q`:
//!
//! | Key | Type | Content |
//! |---|---|---|
//! | `q` | list | raw event documents, producers `LPUSH`, consumed from the right |
//! | `q:processing` | list | items in flight |
//! | `q:retry` | sorted set | [`RetryEnvelope`] JSON scored by due time (unix ms) |
//! | `q:dead-letter` | list | [`DeadLetter`] JSON |
//!
//! A due retry is moved back to the consuming end of `q` as its envelope, so
//! the attempt count travels with the item.

use super::queue::{DeadLetter, EventQueue, QueueError, QueuedEvent, RetryEnvelope, unix_millis};
use crate::utils::lazy_redis::LazyConnection;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Clone)]
pub struct RedisEventQueue {
    conn: LazyConnection,
    queue: String,
    processing: String,
    retry: String,
    dead_letter: String,
}

impl RedisEventQueue {
    /// Prepare the queue named `name` on `url`.
    ///
    /// Connects on first use; an unreachable server surfaces as an error from
    /// the first call, which the consumer backs off and retries.
    pub fn open(url: &str, name: &str) -> Result<Self, QueueError> {
        Ok(Self {
            conn: LazyConnection::open(url)?,
            queue: name.to_string(),
            processing: format!("{name}:processing"),
            retry: format!("{name}:retry"),
            dead_letter: format!("{name}:dead-letter"),
        })
    }

    pub fn name(&self) -> &str {
        &self.queue
    }

    /// Move retries that are due onto the consuming end of the queue.
    async fn release_due_retries(&self, max: usize) -> Result<usize, QueueError> {
        let mut conn = self.conn.get().await?;
        let now = unix_millis(OffsetDateTime::now_utc());
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.retry)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(max)
            .query_async(&mut conn)
            .await?;

        // Each release lands on the consuming end, so the latest due goes
        // first and the earliest ends up next in line.
        let mut released = 0;
        for member in due.into_iter().rev() {
            // Only the consumer that removes the member may requeue it.
            let removed: i64 = conn.zrem(&self.retry, &member).await?;
            if removed == 1 {
                let _: i64 = conn.rpush(&self.queue, &member).await?;
                released += 1;
            }
        }
        if released > 0 {
            debug!(queue = %self.queue, released, "Released due retries");
        }
        Ok(released)
    }

    /// Move an in-flight item into the retry set, due after `delay`.
    async fn park(&self, event: &QueuedEvent, envelope: String, delay: Duration) -> Result<(), QueueError> {
        let due = unix_millis(OffsetDateTime::now_utc() + delay);
        let mut conn = self.conn.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .zadd(&self.retry, envelope, due)
            .ignore()
            .lrem(&self.processing, 1, &event.receipt)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Decode an in-flight item, unwrapping retry envelopes.
fn decode_item(raw: String) -> QueuedEvent {
    match serde_json::from_str::<RetryEnvelope>(&raw) {
        Ok(envelope) => QueuedEvent {
            payload: envelope.payload,
            attempt: envelope.attempt,
            receipt: raw,
        },
        Err(_) => QueuedEvent {
            payload: raw.clone(),
            attempt: 0,
            receipt: raw,
        },
    }
}

#[async_trait]
impl EventQueue for RedisEventQueue {
    async fn dequeue(&self, max: usize) -> Result<Vec<QueuedEvent>, QueueError> {
        self.release_due_retries(max).await?;

        let mut conn = self.conn.get().await?;
        let mut items = Vec::with_capacity(max);
        while items.len() < max {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(&self.queue)
                .arg(&self.processing)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            match raw {
                Some(raw) => items.push(decode_item(raw)),
                None => break,
            }
        }
        Ok(items)
    }

    async fn ack(&self, event: &QueuedEvent) -> Result<(), QueueError> {
        let mut conn = self.conn.get().await?;
        let _: i64 = conn.lrem(&self.processing, 1, &event.receipt).await?;
        Ok(())
    }

    async fn retry_later(&self, event: &QueuedEvent, delay: Duration, error: &str) -> Result<(), QueueError> {
        let envelope = serde_json::to_string(&RetryEnvelope::new(event, error))?;
        self.park(event, envelope, delay).await
    }

    async fn defer(&self, event: &QueuedEvent, delay: Duration) -> Result<(), QueueError> {
        let envelope = serde_json::to_string(&RetryEnvelope::deferred(event))?;
        self.park(event, envelope, delay).await
    }

    async fn dead_letter(&self, event: &QueuedEvent, error: &str) -> Result<(), QueueError> {
        let letter = serde_json::to_string(&DeadLetter::new(event, error))?;
        let mut conn = self.conn.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .lpush(&self.dead_letter, letter)
            .ignore()
            .lrem(&self.processing, 1, &event.receipt)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.get().await?;
        let mut recovered = 0;
        loop {
            // Newest first onto the consuming end leaves the oldest next in line.
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing)
                .arg(&self.queue)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!(queue = %self.queue, recovered, "Recovered in-flight events");
        }
        Ok(recovered)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.get().await?;
        let len: usize = conn.llen(&self.queue).await?;
        Ok(len)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
