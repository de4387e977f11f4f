use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("queue item encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("queue backend unavailable")]
    Unavailable,
}

/// An item taken off the queue and held in flight until settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    /// Raw event document.
    pub payload: String,
    /// Failed attempts so far; `0` for a fresh event.
    pub attempt: u32,
    /// Backend handle identifying the in-flight copy.
    pub receipt: String,
}

/// A failed event waiting for its next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEnvelope {
    pub attempt: u32,
    pub payload: String,
    pub last_error: String,
    /// Unix milliseconds the retry was scheduled at.
    pub scheduled_at: i64,
}

impl RetryEnvelope {
    pub fn new(event: &QueuedEvent, error: &str) -> Self {
        Self {
            attempt: event.attempt + 1,
            payload: event.payload.clone(),
            last_error: error.to_string(),
            scheduled_at: unix_millis(OffsetDateTime::now_utc()),
        }
    }

    /// Park `event` again without counting an attempt.
    pub fn deferred(event: &QueuedEvent) -> Self {
        Self {
            attempt: event.attempt,
            payload: event.payload.clone(),
            last_error: DEFERRED.to_string(),
            scheduled_at: unix_millis(OffsetDateTime::now_utc()),
        }
    }
}

/// `lastError` of an item parked behind an earlier event of its conversation.
pub const DEFERRED: &str = "waiting for an earlier event of the conversation";

/// An event that exhausted its retries or could never succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub payload: String,
    pub error: String,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
}

impl DeadLetter {
    pub fn new(event: &QueuedEvent, error: &str) -> Self {
        Self {
            payload: event.payload.clone(),
            error: error.to_string(),
            attempts: event.attempt + 1,
            failed_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Consumer side of a reliable work queue.
///
/// Every dequeued item stays in flight until it is settled with exactly one
/// of `ack`, `retry_later` or `dead_letter`.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Take up to `max` items, oldest first. Due retries come before fresh
    /// items.
    async fn dequeue(&self, max: usize) -> Result<Vec<QueuedEvent>, QueueError>;

    async fn ack(&self, event: &QueuedEvent) -> Result<(), QueueError>;

    /// Schedule another attempt after `delay`.
    async fn retry_later(&self, event: &QueuedEvent, delay: Duration, error: &str) -> Result<(), QueueError>;

    /// Put `event` back after `delay` without counting an attempt.
    async fn defer(&self, event: &QueuedEvent, delay: Duration) -> Result<(), QueueError>;

    async fn dead_letter(&self, event: &QueuedEvent, error: &str) -> Result<(), QueueError>;

    /// Return items left in flight by a previous process to the queue.
    async fn recover_in_flight(&self) -> Result<usize, QueueError>;

    /// Items waiting to be dequeued.
    async fn depth(&self) -> Result<usize, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

pub(crate) fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}
