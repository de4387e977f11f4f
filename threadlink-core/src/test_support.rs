//! In-memory fakes shared by unit tests.

use crate::config::StorageSettings;
use crate::ports::{
    ChatDelivery, DeliveryError, NewTicket, OutboundMessage, RemoteTicket, SentMessage, TicketingApi, TicketingError,
};
use crate::storage::{CacheTier, MemoryTier, TierError, TierKind, UnifiedStorage};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use threadlink_sdk::objects::{EventTimestamp, WebhookEvent};

pub fn test_storage_settings() -> StorageSettings {
    StorageSettings {
        operation_timeout: Duration::from_millis(500),
        ..StorageSettings::default()
    }
}

/// Two-tier storage with a memory tier in front of an in-memory "durable" tier.
pub fn memory_storage() -> UnifiedStorage {
    storage_over(Arc::new(SwitchableTier::new(TierKind::Durable)))
}

/// Like [`memory_storage`], over a durable tier the test keeps a handle to.
pub fn storage_over(durable: Arc<SwitchableTier>) -> UnifiedStorage {
    UnifiedStorage::new(Arc::new(MemoryTier::new()), None, durable, &test_storage_settings())
}

/// Let spawned tasks run until `done` holds, for at most about two seconds.
pub async fn settle(mut done: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

pub fn dashboard_event(event_type: &str, data: Value) -> WebhookEvent {
    WebhookEvent {
        event_id: None,
        event_type: event_type.to_string(),
        source_platform: "dashboard".to_string(),
        target_platform: "telegram".to_string(),
        timestamp: EventTimestamp::now(),
        data,
        attachments: None,
    }
}

/// Memory tier that counts reads and reports an arbitrary kind.
pub struct CountingTier {
    inner: MemoryTier,
    kind: TierKind,
    reads: AtomicUsize,
}

impl CountingTier {
    pub fn new(inner: MemoryTier, kind: TierKind) -> Self {
        Self {
            inner,
            kind,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryTier {
        &self.inner
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheTier for CountingTier {
    fn kind(&self) -> TierKind {
        self.kind
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, TierError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), TierError> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.inner.delete(key).await
    }
}

/// Tier without expiry that can be switched off to simulate an outage.
pub struct SwitchableTier {
    kind: TierKind,
    entries: Mutex<HashMap<String, Value>>,
    down: AtomicBool,
    reads: AtomicUsize,
    read_delay_ms: AtomicU64,
    write_delay_ms: AtomicU64,
}

impl SwitchableTier {
    pub fn new(kind: TierKind) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            read_delay_ms: AtomicU64::new(0),
            write_delay_ms: AtomicU64::new(0),
        }
    }

    /// Every `get` answers this long after looking at the entries.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every `set` sleeps this long before storing.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn get_raw(&self, key: &str) -> Option<Value> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Put a value directly, bypassing the outage switch.
    pub fn seed(&self, key: &str, value: Value) {
        self.entries.lock().unwrap().insert(key.to_string(), value);
    }

    /// Inspect directly, bypassing the outage switch.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), TierError> {
        if self.down.load(Ordering::SeqCst) {
            Err(TierError::Unavailable(self.kind))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheTier for SwitchableTier {
    fn kind(&self) -> TierKind {
        self.kind
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, TierError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let value = self.entries.lock().unwrap().get(key).cloned();
        pause(&self.read_delay_ms).await;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &Value, _ttl: Option<Duration>) -> Result<(), TierError> {
        self.check()?;
        pause(&self.write_delay_ms).await;
        self.entries.lock().unwrap().insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.check()?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), TierError> {
        self.check()
    }
}

async fn pause(millis: &AtomicU64) {
    let millis = millis.load(Ordering::SeqCst);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

/// Chat that records every message and fails on demand.
#[derive(Default)]
pub struct RecordingChat {
    sent: Mutex<Vec<OutboundMessage>>,
    /// Consumed one per call before `always_fail`.
    scripted_failures: Mutex<VecDeque<DeliveryError>>,
    always_fail: Mutex<Option<DeliveryError>>,
    next_message_id: AtomicI64,
}

impl RecordingChat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_message_id: AtomicI64::new(1000),
            ..Default::default()
        })
    }

    pub fn fail_next(&self, error: DeliveryError) {
        self.scripted_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_always(&self, error: Option<DeliveryError>) {
        *self.always_fail.lock().unwrap() = error;
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn failure(&self) -> Option<DeliveryError> {
        if let Some(error) = self.scripted_failures.lock().unwrap().pop_front() {
            return Some(error);
        }
        self.always_fail.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatDelivery for RecordingChat {
    async fn send_message(&self, message: OutboundMessage) -> Result<SentMessage, DeliveryError> {
        if let Some(error) = self.failure() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(message);
        Ok(SentMessage {
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn edit_message(&self, _chat_id: i64, _message_id: i64, _text: &str) -> Result<(), DeliveryError> {
        match self.failure() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Ticketing service held in memory.
#[derive(Default)]
pub struct FakeTicketing {
    tickets: Mutex<HashMap<String, RemoteTicket>>,
    replies: Mutex<Vec<(String, String, String)>>,
    customers: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    unavailable: AtomicBool,
}

impl FakeTicketing {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_status(&self, conversation_id: &str, status: &str) {
        if let Some(ticket) = self.tickets.lock().unwrap().get_mut(conversation_id) {
            ticket.status = Some(status.to_string());
        }
    }

    /// `(conversation_id, text, author)` of every posted reply.
    pub fn replies(&self) -> Vec<(String, String, String)> {
        self.replies.lock().unwrap().clone()
    }

    pub fn customers_created(&self) -> usize {
        self.customers.lock().unwrap().len()
    }

    pub fn tickets_created(&self) -> usize {
        self.tickets.lock().unwrap().len()
    }

    fn check(&self) -> Result<(), TicketingError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(TicketingError::Unavailable("fake outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TicketingApi for FakeTicketing {
    async fn create_ticket(&self, _ticket: NewTicket) -> Result<RemoteTicket, TicketingError> {
        self.check()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let ticket = RemoteTicket {
            conversation_id: format!("c-{n}"),
            friendly_id: n.to_string(),
            status: Some("open".into()),
        };
        self.tickets
            .lock()
            .unwrap()
            .insert(ticket.conversation_id.clone(), ticket.clone());
        Ok(ticket)
    }

    async fn post_reply(&self, conversation_id: &str, text: &str, author_name: &str) -> Result<(), TicketingError> {
        self.check()?;
        self.replies.lock().unwrap().push((
            conversation_id.to_string(),
            text.to_string(),
            author_name.to_string(),
        ));
        Ok(())
    }

    async fn get_ticket(&self, conversation_id: &str) -> Result<RemoteTicket, TicketingError> {
        self.check()?;
        self.tickets
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| TicketingError::Rejected(format!("no conversation {conversation_id}")))
    }

    async fn create_customer(&self, name: &str) -> Result<String, TicketingError> {
        self.check()?;
        let mut customers = self.customers.lock().unwrap();
        customers.push(name.to_string());
        Ok(format!("cu_{}", customers.len()))
    }
}
