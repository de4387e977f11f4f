//! EventQueueConsumer processor.
//!
//! The EventQueueConsumer is responsible for:
//! - Polling the event queue and handing each event to the dispatcher
//! - Settling every item: ack, delayed retry, or dead letter
//! - Keeping events of one conversation in queue order
//! - Backing off while the queue backend is unreachable
//!
//! Each batch is grouped by conversation id. Groups run concurrently, events
//! inside a group run one after another, and the next batch starts only once
//! the whole batch is settled. While an event waits for its retry, later
//! events of its conversation are parked behind it, including ones dequeued
//! in later batches.

use super::dispatcher::{DispatchOutcome, EventDispatcher, HandlerError};
use crate::config::{ConfigWatcher, ConsumerSettings};
use crate::events::{EventQueue, QueueError, QueuedEvent};
use crate::utils::backoff::{retry_delay, with_jitter};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use threadlink_sdk::objects::WebhookEvent;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Gap between the due times of items parked behind one another.
const PARK_STEP: Duration = Duration::from_millis(1);

/// A parked head that has not come back this long after its due time is
/// assumed lost and stops holding its conversation back.
const ABANDON_AFTER: Duration = Duration::from_secs(600);

/// An item together with its decoded event.
struct Work {
    item: QueuedEvent,
    event: Result<WebhookEvent, serde_json::Error>,
}

struct ParkedItem {
    payload: String,
    due: Instant,
}

/// Whether an item may run now.
#[derive(Debug, PartialEq, Eq)]
enum Turn {
    Proceed,
    /// Park the item until this instant.
    Wait(Instant),
}

/// Items of each conversation that sit in the retry set, oldest first.
///
/// An item runs only when nothing older of its conversation is parked; the
/// others are parked behind the head without spending an attempt.
#[derive(Default)]
struct ParkedEvents {
    lanes: DashMap<String, VecDeque<ParkedItem>>,
}

impl ParkedEvents {
    fn claim(&self, conversation: &str, payload: &str, now: Instant) -> Turn {
        let Some(mut lane) = self.lanes.get_mut(conversation) else {
            return Turn::Proceed;
        };

        while let Some(head) = lane.front() {
            if head.payload == payload || now <= head.due + ABANDON_AFTER {
                break;
            }
            warn!(conversation_id = conversation, "Parked event never returned, releasing its conversation");
            lane.pop_front();
        }

        let position = lane.iter().position(|p| p.payload == payload);
        let turn = match position {
            Some(0) => {
                lane.pop_front();
                Turn::Proceed
            }
            _ if lane.is_empty() => Turn::Proceed,
            Some(index) => {
                // Came back before the head; go behind everything again.
                let due = latest_due(&lane).max(now) + PARK_STEP;
                if let Some(item) = lane.get_mut(index) {
                    item.due = due;
                }
                Turn::Wait(due)
            }
            None => {
                let due = latest_due(&lane).max(now) + PARK_STEP;
                lane.push_back(ParkedItem {
                    payload: payload.to_string(),
                    due,
                });
                Turn::Wait(due)
            }
        };

        let empty = lane.is_empty();
        drop(lane);
        if empty {
            self.lanes.remove_if(conversation, |_, lane| lane.is_empty());
        }
        turn
    }

    /// Record a failed item that must run before anything else of its
    /// conversation.
    fn park_head(&self, conversation: &str, payload: &str, due: Instant) {
        self.lanes.entry(conversation.to_string()).or_default().push_front(ParkedItem {
            payload: payload.to_string(),
            due,
        });
    }

    /// Drop an item that could not be parked after all.
    fn forget(&self, conversation: &str, payload: &str) {
        if let Some(mut lane) = self.lanes.get_mut(conversation) {
            if let Some(index) = lane.iter().rposition(|p| p.payload == payload) {
                lane.remove(index);
            }
        }
        self.lanes.remove_if(conversation, |_, lane| lane.is_empty());
    }

    fn is_blocked(&self, conversation: &str) -> bool {
        self.lanes.contains_key(conversation)
    }
}

fn latest_due(lane: &VecDeque<ParkedItem>) -> Instant {
    lane.iter().map(|p| p.due).max().unwrap_or_else(Instant::now)
}

pub struct EventQueueConsumer {
    queue: Arc<dyn EventQueue>,
    dispatcher: Arc<EventDispatcher>,
    parked: Arc<ParkedEvents>,
}

impl EventQueueConsumer {
    pub fn new(queue: Arc<dyn EventQueue>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            queue,
            dispatcher,
            parked: Arc::new(ParkedEvents::default()),
        }
    }

    /// Run until `shutdown_rx` flips to `true`.
    ///
    /// Items a previous process left in flight are returned to the queue
    /// before the first poll, once the backend answers. The batch in progress
    /// when shutdown is signalled is finished first.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>, mut settings: ConfigWatcher<ConsumerSettings>) {
        info!("EventQueueConsumer started");

        let mut recovered = false;
        let mut failures: u32 = 0;
        loop {
            if settings.has_changed() {
                info!("Consumer settings reloaded");
            }
            let current = settings.latest();

            let result = if recovered {
                self.poll_once(&current).await
            } else {
                match self.queue.recover_in_flight().await {
                    Ok(n) => {
                        if n > 0 {
                            info!(recovered = n, "Returned in-flight events to the queue");
                        }
                        recovered = true;
                        self.poll_once(&current).await
                    }
                    Err(e) => Err(e),
                }
            };

            let delay = match result {
                Ok(processed) => {
                    if failures > 0 {
                        info!(after_failures = failures, "Queue connection restored");
                        failures = 0;
                    }
                    if processed == 0 {
                        current.poll_interval
                    } else {
                        Duration::ZERO
                    }
                }
                Err(e) => {
                    let delay = retry_delay(failures, current.poll_interval, current.reconnect_max_delay);
                    failures = failures.saturating_add(1);
                    warn!(error = %e, retry_in = ?delay, failures, "Queue unavailable, reconnecting");
                    delay
                }
            };

            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("EventQueueConsumer received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("EventQueueConsumer shutdown complete");
    }

    /// Dequeue one batch and settle every item in it.
    ///
    /// Returns the number of items taken off the queue.
    pub async fn poll_once(&self, settings: &ConsumerSettings) -> Result<usize, QueueError> {
        let batch = self.queue.dequeue(settings.batch_size).await?;
        let taken = batch.len();
        if taken == 0 {
            return Ok(0);
        }
        debug!(taken, "Dequeued batch");

        let mut tasks = JoinSet::new();
        for group in group_by_conversation(batch) {
            let queue = Arc::clone(&self.queue);
            let dispatcher = Arc::clone(&self.dispatcher);
            let parked = Arc::clone(&self.parked);
            let settings = settings.clone();
            tasks.spawn(async move {
                for work in group {
                    process(queue.as_ref(), &dispatcher, &parked, &settings, work).await;
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Event group task failed");
            }
        }
        Ok(taken)
    }

    /// Whether events of `conversation` are held back behind a parked one.
    pub fn is_conversation_blocked(&self, conversation: &str) -> bool {
        self.parked.is_blocked(conversation)
    }
}

/// Split a batch into per-conversation groups, keeping queue order inside
/// each group. Items without a conversation id get a group of their own.
fn group_by_conversation(batch: Vec<QueuedEvent>) -> Vec<Vec<Work>> {
    let mut groups: Vec<Vec<Work>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for item in batch {
        let event = serde_json::from_str::<WebhookEvent>(&item.payload);
        let key = event
            .as_ref()
            .ok()
            .and_then(|e| e.conversation_id())
            .map(str::to_string);
        let work = Work { item, event };

        match key {
            Some(key) => match index.get(&key) {
                Some(&slot) => groups[slot].push(work),
                None => {
                    index.insert(key, groups.len());
                    groups.push(vec![work]);
                }
            },
            None => groups.push(vec![work]),
        }
    }
    groups
}

async fn process(
    queue: &dyn EventQueue,
    dispatcher: &EventDispatcher,
    parked: &ParkedEvents,
    settings: &ConsumerSettings,
    work: Work,
) {
    let Work { item, event } = work;

    let event = match event {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, attempt = item.attempt, "Undecodable queue item, dropping");
            settle(queue.ack(&item).await, &item);
            return;
        }
    };
    let conversation = event.conversation_id();

    if let Some(conversation) = conversation {
        let now = Instant::now();
        if let Turn::Wait(due) = parked.claim(conversation, &item.payload, now) {
            debug!(conversation_id = conversation, "Earlier event still parked, deferring");
            if let Err(e) = queue.defer(&item, due.saturating_duration_since(now)).await {
                parked.forget(conversation, &item.payload);
                settle(Err(e), &item);
            }
            return;
        }
    }

    let outcome = match tokio::time::timeout(settings.handler_timeout, dispatcher.dispatch(&event)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(HandlerError::Transient(format!(
            "handler timed out after {:?}",
            settings.handler_timeout
        ))),
    };

    let failure = match outcome {
        Ok(DispatchOutcome::Handled) | Ok(DispatchOutcome::Unhandled) => {
            settle(queue.ack(&item).await, &item);
            return;
        }
        Err(failure) => failure,
    };

    let (reason, not_before) = match failure {
        HandlerError::Transient(reason) => (reason, Duration::ZERO),
        HandlerError::Throttled { reason, retry_after } => (reason, retry_after),
        HandlerError::Permanent(reason) => {
            warn!(
                event_type = %event.event_type,
                conversation_id = ?conversation,
                reason = %reason,
                "Event failed permanently, acknowledging"
            );
            settle(queue.ack(&item).await, &item);
            return;
        }
        HandlerError::Malformed(reason) => {
            warn!(event_type = %event.event_type, reason = %reason, "Malformed event, dropping");
            settle(queue.ack(&item).await, &item);
            return;
        }
    };

    if item.attempt >= settings.max_retries {
        error!(
            event_type = %event.event_type,
            conversation_id = ?conversation,
            attempts = item.attempt + 1,
            reason = %reason,
            "Retries exhausted, dead-lettering event"
        );
        settle(queue.dead_letter(&item, &reason).await, &item);
        return;
    }

    let delay = with_jitter(retry_delay(
        item.attempt,
        settings.retry_base_delay,
        settings.retry_max_delay,
    ))
    .max(not_before);
    warn!(
        event_type = %event.event_type,
        conversation_id = ?conversation,
        attempt = item.attempt + 1,
        retry_in = ?delay,
        reason = %reason,
        "Event failed, scheduling retry"
    );
    let due = Instant::now() + delay;
    match queue.retry_later(&item, delay, &reason).await {
        Ok(()) => {
            if let Some(conversation) = conversation {
                parked.park_head(conversation, &item.payload, due);
            }
        }
        Err(e) => settle(Err(e), &item),
    }
}

/// An unsettled item stays in flight and is recovered on the next start.
fn settle(result: Result<(), QueueError>, item: &QueuedEvent) {
    if let Err(e) = result {
        error!(error = %e, attempt = item.attempt, "Failed to settle queue item");
    }
}
