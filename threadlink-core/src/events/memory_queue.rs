//! Process-local event queue for tests and single-node runs.

use super::queue::{DeadLetter, EventQueue, QueueError, QueuedEvent, RetryEnvelope};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct State {
    /// Front is the next item to dequeue.
    ready: VecDeque<QueuedEvent>,
    in_flight: Vec<QueuedEvent>,
    retries: Vec<(Instant, RetryEnvelope)>,
    dead: Vec<DeadLetter>,
    next_receipt: u64,
}

impl State {
    fn receipt(&mut self) -> String {
        self.next_receipt += 1;
        format!("mem-{}", self.next_receipt)
    }
}

/// Same semantics as the Redis queue, held in memory.
///
/// Due times use tokio's clock, so paused-time tests control retries.
#[derive(Clone, Default)]
pub struct InMemoryEventQueue {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw event document.
    pub fn push(&self, payload: impl Into<String>) {
        let mut state = self.lock();
        let receipt = state.receipt();
        state.ready.push_back(QueuedEvent {
            payload: payload.into(),
            attempt: 0,
            receipt,
        });
    }

    pub fn push_json<T: serde::Serialize>(&self, event: &T) -> Result<(), QueueError> {
        self.push(serde_json::to_string(event)?);
        Ok(())
    }

    /// Simulate a backend outage: every call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead.clone()
    }

    pub fn scheduled_retries(&self) -> Vec<RetryEnvelope> {
        self.lock().retries.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn ready(&self) -> usize {
        self.lock().ready.len()
    }

    /// Nothing ready, in flight, or waiting to be retried.
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.ready.is_empty() && state.in_flight.is_empty() && state.retries.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock still holds consistent data for this structure.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(QueueError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn settle(state: &mut State, event: &QueuedEvent) {
        if let Some(pos) = state.in_flight.iter().position(|e| e.receipt == event.receipt) {
            state.in_flight.remove(pos);
        }
    }
}

#[async_trait]
impl EventQueue for InMemoryEventQueue {
    async fn dequeue(&self, max: usize) -> Result<Vec<QueuedEvent>, QueueError> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.lock();

        let mut due = Vec::new();
        state.retries.retain(|(at, envelope)| {
            if *at <= now {
                due.push((*at, envelope.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, _)| *at);
        // Due retries jump the line, earliest due first.
        for (_, envelope) in due.into_iter().rev() {
            let receipt = state.receipt();
            state.ready.push_front(QueuedEvent {
                payload: envelope.payload,
                attempt: envelope.attempt,
                receipt,
            });
        }

        let take = max.min(state.ready.len());
        let batch: Vec<QueuedEvent> = state.ready.drain(..take).collect();
        state.in_flight.extend(batch.iter().cloned());
        Ok(batch)
    }

    async fn ack(&self, event: &QueuedEvent) -> Result<(), QueueError> {
        self.check()?;
        Self::settle(&mut self.lock(), event);
        Ok(())
    }

    async fn retry_later(&self, event: &QueuedEvent, delay: Duration, error: &str) -> Result<(), QueueError> {
        self.check()?;
        let mut state = self.lock();
        Self::settle(&mut state, event);
        state
            .retries
            .push((Instant::now() + delay, RetryEnvelope::new(event, error)));
        Ok(())
    }

    async fn defer(&self, event: &QueuedEvent, delay: Duration) -> Result<(), QueueError> {
        self.check()?;
        let mut state = self.lock();
        Self::settle(&mut state, event);
        state
            .retries
            .push((Instant::now() + delay, RetryEnvelope::deferred(event)));
        Ok(())
    }

    async fn dead_letter(&self, event: &QueuedEvent, error: &str) -> Result<(), QueueError> {
        self.check()?;
        let mut state = self.lock();
        Self::settle(&mut state, event);
        state.dead.push(DeadLetter::new(event, error));
        Ok(())
    }

    async fn recover_in_flight(&self) -> Result<usize, QueueError> {
        self.check()?;
        let mut state = self.lock();
        let recovered: Vec<QueuedEvent> = state.in_flight.drain(..).collect();
        let count = recovered.len();
        for event in recovered.into_iter().rev() {
            state.ready.push_front(event);
        }
        Ok(count)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        self.check()?;
        Ok(self.lock().ready.len())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_and_ack() {
        let queue = InMemoryEventQueue::new();
        queue.push("a");
        queue.push("b");
        queue.push("c");

        let batch = queue.dequeue(2).await.unwrap();
        assert_eq!(
            batch.iter().map(|e| e.payload.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(queue.in_flight(), 2);

        for event in &batch {
            queue.ack(event).await.unwrap();
        }
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_becomes_due_and_jumps_the_line() {
        let queue = InMemoryEventQueue::new();
        queue.push("a");
        let first = queue.dequeue(1).await.unwrap().remove(0);
        queue
            .retry_later(&first, Duration::from_secs(2), "timeout")
            .await
            .unwrap();
        queue.push("b");

        let batch = queue.dequeue(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, "b");
        queue.ack(&batch[0]).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        queue.push("c");
        let batch = queue.dequeue(10).await.unwrap();
        assert_eq!(batch[0].payload, "a");
        assert_eq!(batch[0].attempt, 1);
        assert_eq!(batch[1].payload, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_items_keep_attempts_and_due_order() {
        let queue = InMemoryEventQueue::new();
        queue.push("a");
        queue.push("b");
        let batch = queue.dequeue(2).await.unwrap();
        queue
            .retry_later(&batch[0], Duration::from_secs(1), "timeout")
            .await
            .unwrap();
        queue
            .defer(&batch[1], Duration::from_millis(1001))
            .await
            .unwrap();

        let parked = queue.scheduled_retries();
        assert_eq!(parked[1].attempt, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        let batch = queue.dequeue(10).await.unwrap();
        assert_eq!(
            batch.iter().map(|e| (e.payload.as_str(), e.attempt)).collect::<Vec<_>>(),
            vec![("a", 1), ("b", 0)]
        );
    }

    #[tokio::test]
    async fn test_dead_letter_and_recovery() {
        let queue = InMemoryEventQueue::new();
        queue.push("a");
        queue.push("b");
        let batch = queue.dequeue(2).await.unwrap();
        queue.dead_letter(&batch[0], "malformed").await.unwrap();

        let letters = queue.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload, "a");
        assert_eq!(letters[0].error, "malformed");

        assert_eq!(queue.recover_in_flight().await.unwrap(), 1);
        assert_eq!(queue.dequeue(1).await.unwrap()[0].payload, "b");
    }

    #[tokio::test]
    async fn test_outage() {
        let queue = InMemoryEventQueue::new();
        queue.set_unavailable(true);
        assert!(matches!(queue.dequeue(1).await, Err(QueueError::Unavailable)));
        queue.set_unavailable(false);
        assert!(queue.ping().await.is_ok());
    }
}
