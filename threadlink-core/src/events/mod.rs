//! The inbound event queue.
//!
//! A webhook receiver outside this process pushes one JSON
//! [`WebhookEvent`](threadlink_sdk::objects::WebhookEvent) per dashboard event
//! onto a named queue. This module provides the consumer side of that queue:
//! dequeue with an in-flight list, acknowledgement, delayed retries and a
//! dead-letter list.
//!
//! # Item flow
//!
//! 1. Producer pushes onto `{queue}`
//! 2. [`EventQueue::dequeue`] moves items into `{queue}:processing`
//! 3. The consumer settles each item with exactly one of
//!    [`ack`](EventQueue::ack), [`retry_later`](EventQueue::retry_later) or
//!    [`dead_letter`](EventQueue::dead_letter)
//! 4. Due retries return to the head of `{queue}` on a later dequeue

pub mod memory_queue;
pub mod queue;
pub mod redis_queue;

pub use memory_queue::InMemoryEventQueue;
pub use queue::{DeadLetter, EventQueue, QueueError, QueuedEvent, RetryEnvelope};
pub use redis_queue::RedisEventQueue;

/// Queue the webhook receiver publishes to.
pub const DEFAULT_QUEUE_NAME: &str = "unthread-events";
