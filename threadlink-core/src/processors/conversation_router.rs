//! ConversationRouter processor.
//!
//! The ConversationRouter is responsible for:
//! - Relaying agent messages (`message_created`) into the ticket's chat thread
//! - Announcing status changes (`conversation_updated`) exactly once
//! - Skipping events already processed for a ticket
//! - Dropping local mappings of chats that can no longer be reached
//! - Moving the mappings of a group that was upgraded to a new chat id
//!
//! Every chat delivery happens before any state is written. A transient
//! delivery failure therefore leaves the ticket untouched and the consumer
//! retries the event later.
//!
//! Once a message is out, its marker is remembered in process before anything
//! else is awaited, and the ticket is persisted by a spawned task. Cancelling
//! the handler after delivery can then neither lose the marker nor stop the
//! write, so the retry that follows a handler timeout skips the event.

use super::dispatcher::{EventDispatcher, EventHandler, HandlerError, SubscribeError};
use super::format;
use crate::config::RouterSettings;
use crate::entities::{
    AgentMessageLink, ChatCleanup, CustomerRepository, Repositories, Ticket, TicketRepository, TicketStatus,
};
use crate::ports::{ChatDelivery, DeliveryError, OutboundMessage, SentMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use threadlink_sdk::objects::event::{CONVERSATION_UPDATED, MESSAGE_CREATED};
use threadlink_sdk::objects::{ConversationUpdatedData, EventPayload, MessageCreatedData, WebhookEvent};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long a delivered marker is remembered in process when the ticket
/// write that should have stored it keeps failing.
const DELIVERED_RETENTION: Duration = Duration::from_secs(3600);

pub struct ConversationRouter {
    tickets: TicketRepository,
    customers: CustomerRepository,
    cleanup: ChatCleanup,
    chat: Arc<dyn ChatDelivery>,
    settings: RouterSettings,
    /// `{conversationId}:{marker}` of deliveries not yet persisted.
    delivered: Arc<DashMap<String, Instant>>,
}

impl ConversationRouter {
    pub fn new(repositories: &Repositories, chat: Arc<dyn ChatDelivery>, settings: RouterSettings) -> Self {
        Self {
            tickets: repositories.tickets.clone(),
            customers: repositories.customers.clone(),
            cleanup: repositories.chat_cleanup(),
            chat,
            settings,
            delivered: Arc::new(DashMap::new()),
        }
    }

    /// Subscribe to `message_created` and `conversation_updated` from the
    /// configured source platform.
    pub fn register(self: Arc<Self>, dispatcher: &mut EventDispatcher) -> Result<(), SubscribeError> {
        let source = self.settings.source_platform.clone();
        dispatcher.subscribe(MESSAGE_CREATED, &source, self.clone())?;
        dispatcher.subscribe(CONVERSATION_UPDATED, &source, self)?;
        Ok(())
    }

    async fn on_message_created(&self, event: &WebhookEvent, data: MessageCreatedData) -> Result<(), HandlerError> {
        let Some(mut ticket) = self.load_ticket(&data.conversation_id).await? else {
            return Ok(());
        };

        let marker = event_marker(event, &data.conversation_id);
        if self.already_delivered(&ticket, &marker) {
            debug!(conversation_id = %data.conversation_id, marker = %marker, "Duplicate message event, skipping");
            return Ok(());
        }

        let text = data.text.as_deref().unwrap_or_default();
        if text.trim().is_empty() && event.attachments.as_ref().is_none_or(|a| !a.has_files) {
            debug!(conversation_id = %data.conversation_id, "Empty agent message, skipping");
            return Ok(());
        }

        let body = format::agent_reply(
            &ticket.friendly_id,
            data.user_name.as_deref(),
            text,
            event.attachments.as_ref(),
        );
        let sent = self
            .deliver(&ticket, OutboundMessage::new(ticket.chat_id, body).reply_to(ticket.message_id))
            .await?;
        let delivered_key = self.remember_delivery(&ticket.conversation_id, &marker);

        let now = OffsetDateTime::now_utc();
        ticket.last_agent_reply_at = Some(now);
        ticket.record_event(marker);
        let link = AgentMessageLink {
            chat_id: ticket.chat_id,
            message_id: sent.message_id,
            conversation_id: ticket.conversation_id.clone(),
            sent_at: now,
        };

        info!(
            conversation_id = %ticket.conversation_id,
            chat_id = ticket.chat_id,
            message_id = sent.message_id,
            "Agent message relayed"
        );
        self.persist_after_delivery(ticket, Some(link), delivered_key).await;
        Ok(())
    }

    async fn on_conversation_updated(
        &self,
        event: &WebhookEvent,
        data: ConversationUpdatedData,
    ) -> Result<(), HandlerError> {
        let Some(conversation_id) = data.conversation_id() else {
            return Err(HandlerError::Malformed("conversation_updated without conversation id".into()));
        };
        let Some(remote_status) = data.status.as_deref() else {
            debug!(conversation_id, "Update carries no status, ignoring");
            return Ok(());
        };
        let Some(status) = TicketStatus::from_remote(remote_status) else {
            debug!(conversation_id, remote_status, "Unmapped remote status, ignoring");
            return Ok(());
        };

        let Some(mut ticket) = self.load_ticket(conversation_id).await? else {
            return Ok(());
        };

        let marker = event_marker(event, conversation_id);
        if self.already_delivered(&ticket, &marker) {
            debug!(conversation_id, marker = %marker, "Duplicate status event, skipping");
            return Ok(());
        }
        if ticket.status == status {
            debug!(conversation_id, %status, "Status unchanged");
            return Ok(());
        }

        let notice = format::status_notice(&ticket.friendly_id, status);
        self.deliver(&ticket, OutboundMessage::new(ticket.chat_id, notice).reply_to(ticket.message_id))
            .await?;
        let delivered_key = self.remember_delivery(conversation_id, &marker);

        let from = ticket.status;
        ticket.transition(status, OffsetDateTime::now_utc());
        ticket.record_event(marker);

        info!(conversation_id, %from, to = %status, "Ticket status changed");
        self.persist_after_delivery(ticket, None, delivered_key).await;
        Ok(())
    }

    async fn load_ticket(&self, conversation_id: &str) -> Result<Option<Ticket>, HandlerError> {
        match self.tickets.get(conversation_id).await {
            Ok(Some(ticket)) => Ok(Some(ticket)),
            Ok(None) => {
                info!(conversation_id, "No ticket mapped to conversation, dropping event");
                Ok(None)
            }
            Err(e) => Err(HandlerError::Transient(format!("loading ticket {conversation_id}: {e}"))),
        }
    }

    fn already_delivered(&self, ticket: &Ticket, marker: &str) -> bool {
        ticket.has_processed(marker)
            || self
                .delivered
                .contains_key(&delivered_key(&ticket.conversation_id, marker))
    }

    /// Remember a delivery until its ticket write lands. Also forgets
    /// entries older than [`DELIVERED_RETENTION`].
    fn remember_delivery(&self, conversation_id: &str, marker: &str) -> String {
        let key = delivered_key(conversation_id, marker);
        let now = Instant::now();
        self.delivered.insert(key.clone(), now);
        self.delivered
            .retain(|_, at| now.saturating_duration_since(*at) < DELIVERED_RETENTION);
        key
    }

    /// Send under the delivery timeout, translating failures.
    ///
    /// A permanent failure removes the chat's local mappings before returning.
    /// A migrated chat has its mappings moved and the event is retried there.
    async fn deliver(&self, ticket: &Ticket, message: OutboundMessage) -> Result<SentMessage, HandlerError> {
        let result = match tokio::time::timeout(self.settings.delivery_timeout, self.chat.send_message(message)).await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        };

        match result {
            Ok(sent) => Ok(sent),
            Err(e) if e.is_permanent() => {
                warn!(
                    conversation_id = %ticket.conversation_id,
                    chat_id = ticket.chat_id,
                    error = %e,
                    "Chat unreachable, removing local mappings"
                );
                let report = self.cleanup.cleanup_chat(ticket.chat_id).await;
                Err(HandlerError::Permanent(format!(
                    "chat {} unreachable ({e}), removed {} ticket(s)",
                    ticket.chat_id,
                    report.tickets_removed.len()
                )))
            }
            Err(DeliveryError::ChatMigrated { to_chat_id }) => {
                self.migrate_chat(ticket.chat_id, to_chat_id).await?;
                Err(HandlerError::Transient(format!(
                    "chat {} moved to {to_chat_id}, delivering there on retry",
                    ticket.chat_id
                )))
            }
            Err(DeliveryError::RateLimited {
                retry_after: Some(retry_after),
            }) => Err(HandlerError::Throttled {
                reason: "chat rate limit".into(),
                retry_after,
            }),
            Err(e) if e.is_transient() => Err(HandlerError::Transient(e.to_string())),
            Err(e) => Err(HandlerError::Permanent(e.to_string())),
        }
    }

    /// Move every ticket and the customer of `from` to `to`.
    async fn migrate_chat(&self, from: i64, to: i64) -> Result<(), HandlerError> {
        let failed = |e: String| HandlerError::Transient(format!("moving chat {from} to {to}: {e}"));

        let tickets = self
            .tickets
            .list_for_chat(from)
            .await
            .map_err(|e| failed(e.to_string()))?;
        for ticket in &tickets {
            self.tickets
                .move_to_chat(ticket, to)
                .await
                .map_err(|e| failed(e.to_string()))?;
        }
        let customer = self
            .customers
            .find_by_chat(from)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if let Some(customer) = customer {
            self.customers
                .move_to_chat(&customer, to)
                .await
                .map_err(|e| failed(e.to_string()))?;
        }
        info!(from, to, tickets = tickets.len(), "Chat mappings moved after group upgrade");
        Ok(())
    }

    /// Store the ticket in a task of its own so that cancelling the handler
    /// cannot interrupt the write. The message is out; retrying would
    /// duplicate it, so failures are only logged.
    async fn persist_after_delivery(&self, ticket: Ticket, link: Option<AgentMessageLink>, delivered_key: String) {
        let tickets = self.tickets.clone();
        let delivered = Arc::clone(&self.delivered);
        let task = tokio::spawn(async move {
            match tickets.update(&ticket).await {
                Ok(()) => {
                    delivered.remove(&delivered_key);
                }
                Err(e) => error!(
                    conversation_id = %ticket.conversation_id,
                    error = %e,
                    "Delivered but failed to persist ticket state"
                ),
            }
            if let Some(link) = link {
                if let Err(e) = tickets.record_agent_message(&link).await {
                    warn!(conversation_id = %link.conversation_id, error = %e, "Failed to link agent message");
                }
            }
        });
        if let Err(e) = task.await {
            error!(error = %e, "Ticket persist task failed");
        }
    }
}

#[async_trait]
impl EventHandler for ConversationRouter {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        match event.payload() {
            Ok(EventPayload::MessageCreated(data)) => self.on_message_created(event, data).await,
            Ok(EventPayload::ConversationUpdated(data)) => self.on_conversation_updated(event, data).await,
            Ok(_) => {
                debug!(event_type = %event.event_type, "Event type not routed");
                Ok(())
            }
            Err(e) => Err(HandlerError::Malformed(e.to_string())),
        }
    }
}

fn delivered_key(conversation_id: &str, marker: &str) -> String {
    format!("{conversation_id}:{marker}")
}

/// Idempotency marker of an event.
///
/// The producer's `eventId` when present, then the message id of a
/// `message_created`, then `{eventType}:{conversationId}:{timestampMillis}`.
pub fn event_marker(event: &WebhookEvent, conversation_id: &str) -> String {
    if let Some(id) = event.event_id.as_deref().filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    if event.event_type == MESSAGE_CREATED {
        if let Some(id) = event.data.get("id").and_then(|v| v.as_str()) {
            return id.to_string();
        }
    }
    format!(
        "{}:{}:{}",
        event.event_type,
        conversation_id,
        event.timestamp.unix_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsumerSettings, SessionSettings};
    use crate::entities::Customer;
    use crate::events::InMemoryEventQueue;
    use crate::processors::{DispatchOutcome, EventQueueConsumer};
    use crate::storage::{TierKind, UnifiedStorage};
    use crate::test_support::{RecordingChat, SwitchableTier, dashboard_event, memory_storage, storage_over};
    use serde_json::json;
    use threadlink_sdk::objects::AttachmentSummary;

    struct Fixture {
        repos: Repositories,
        chat: Arc<RecordingChat>,
        dispatcher: EventDispatcher,
    }

    async fn fixture() -> Fixture {
        fixture_over(memory_storage()).await
    }

    async fn fixture_over(storage: UnifiedStorage) -> Fixture {
        let repos = Repositories::new(storage, &SessionSettings::default());
        repos
            .tickets
            .save(&Ticket::new("c-1", "101", 555, 10, "cu_1"))
            .await
            .unwrap();
        repos
            .tickets
            .save(&Ticket::new("c-2", "102", 777, 20, "cu_2"))
            .await
            .unwrap();
        repos.customers.save(&Customer::new("cu_1", 555, "Acme")).await.unwrap();
        repos.customers.save(&Customer::new("cu_2", 777, "Globex")).await.unwrap();

        let chat = RecordingChat::new();
        let router = Arc::new(ConversationRouter::new(
            &repos,
            chat.clone(),
            RouterSettings {
                delivery_timeout: Duration::from_millis(200),
                ..RouterSettings::default()
            },
        ));
        let mut dispatcher = EventDispatcher::new();
        router.register(&mut dispatcher).unwrap();
        Fixture {
            repos,
            chat,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn test_agent_message_is_threaded_to_ticket() {
        let f = fixture().await;
        let event = dashboard_event(
            "message_created",
            json!({"conversationId": "c-1", "text": "hello"}),
        );

        let outcome = f.dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Handled);

        let sent = f.chat.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, 555);
        assert_eq!(sent[0].reply_to_message_id, Some(10));
        assert!(sent[0].text.contains("hello"));

        let ticket = f.repos.tickets.get("c-1").await.unwrap().unwrap();
        assert!(ticket.last_agent_reply_at.is_some());
        assert_eq!(ticket.status, TicketStatus::Open);

        let link = f.repos.tickets.find_agent_message(555, 1000).await.unwrap().unwrap();
        assert_eq!(link.conversation_id, "c-1");
    }

    #[tokio::test]
    async fn test_closed_update_transitions_and_notifies_once() {
        let f = fixture().await;
        let event = dashboard_event(
            "conversation_updated",
            json!({"conversationId": "c-1", "status": "closed"}),
        );

        f.dispatcher.dispatch(&event).await.unwrap();
        f.dispatcher.dispatch(&event).await.unwrap();

        let sent = f.chat.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("closed"));
        assert_eq!(sent[0].reply_to_message_id, Some(10));
        assert_eq!(
            f.repos.tickets.get("c-1").await.unwrap().unwrap().status,
            TicketStatus::Closed
        );

        // A later distinct event with the same status is a no-op too.
        let mut again = event.clone();
        again.event_id = Some("evt-other".into());
        f.dispatcher.dispatch(&again).await.unwrap();
        assert_eq!(f.chat.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_after_close() {
        let f = fixture().await;
        for (id, status) in [("e1", "closed"), ("e2", "in_progress")] {
            let mut event = dashboard_event(
                "conversation_updated",
                json!({"id": "c-1", "status": status}),
            );
            event.event_id = Some(id.into());
            f.dispatcher.dispatch(&event).await.unwrap();
        }
        let sent = f.chat.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].text.contains("reopened"));
        assert_eq!(
            f.repos.tickets.get("c-1").await.unwrap().unwrap().status,
            TicketStatus::Open
        );
    }

    #[tokio::test]
    async fn test_duplicate_message_is_delivered_once() {
        let f = fixture().await;
        let mut event = dashboard_event(
            "message_created",
            json!({"conversationId": "c-1", "id": "m-1", "text": "hello"}),
        );

        f.dispatcher.dispatch(&event).await.unwrap();
        // Redelivery with a fresh timestamp still carries the message id.
        event.timestamp = threadlink_sdk::objects::EventTimestamp::now();
        f.dispatcher.dispatch(&event).await.unwrap();

        assert_eq!(f.chat.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_chat_cleans_up_local_mappings() {
        let f = fixture().await;
        f.chat.fail_next(DeliveryError::BlockedByUser);
        let event = dashboard_event(
            "message_created",
            json!({"conversationId": "c-2", "text": "are you there?"}),
        );

        let err = f.dispatcher.dispatch(&event).await.unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));

        assert_eq!(f.repos.tickets.get("c-2").await.unwrap(), None);
        assert_eq!(f.repos.customers.find_by_chat(777).await.unwrap(), None);
        assert_eq!(f.repos.customers.find_by_id("cu_2").await.unwrap(), None);
        // Other chats are untouched.
        assert!(f.repos.tickets.get("c-1").await.unwrap().is_some());
        assert!(f.chat.sent().is_empty());
    }

    #[tokio::test]
    async fn test_missing_chat_on_status_change_cleans_up() {
        let f = fixture().await;
        f.chat.fail_always(Some(DeliveryError::ChatNotFound));
        let event = dashboard_event(
            "conversation_updated",
            json!({"conversationId": "c-1", "status": "closed"}),
        );

        assert!(matches!(
            f.dispatcher.dispatch(&event).await,
            Err(HandlerError::Permanent(_))
        ));
        assert_eq!(f.repos.tickets.get("c-1").await.unwrap(), None);
        assert_eq!(f.repos.customers.find_by_chat(555).await.unwrap(), None);

        // Later events for the removed ticket are dropped quietly.
        f.chat.fail_always(None);
        f.dispatcher
            .dispatch(&dashboard_event(
                "message_created",
                json!({"conversationId": "c-1", "text": "hello?"}),
            ))
            .await
            .unwrap();
        assert!(f.chat.sent().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_ticket_unchanged() {
        let f = fixture().await;
        f.chat.fail_next(DeliveryError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        });
        let event = dashboard_event(
            "conversation_updated",
            json!({"conversationId": "c-1", "status": "resolved"}),
        );

        let before = f.repos.tickets.get("c-1").await.unwrap().unwrap();
        let err = f.dispatcher.dispatch(&event).await.unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Throttled { retry_after, .. } if retry_after == Duration::from_secs(3)
        ));
        assert_eq!(f.repos.tickets.get("c-1").await.unwrap().unwrap(), before);

        // The retry goes through.
        f.dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(f.chat.sent().len(), 1);
        assert_eq!(
            f.repos.tickets.get("c-1").await.unwrap().unwrap().status,
            TicketStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_rate_limit_without_retry_after_is_plain_transient() {
        let f = fixture().await;
        f.chat.fail_next(DeliveryError::RateLimited { retry_after: None });
        let event = dashboard_event("message_created", json!({"conversationId": "c-1", "text": "x"}));
        assert!(matches!(
            f.dispatcher.dispatch(&event).await,
            Err(HandlerError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn test_migrated_chat_moves_mappings_and_retries_there() {
        let f = fixture().await;
        f.chat.fail_next(DeliveryError::ChatMigrated { to_chat_id: -100_555 });
        let event = dashboard_event(
            "message_created",
            json!({"conversationId": "c-1", "id": "m-1", "text": "hello"}),
        );

        assert!(matches!(
            f.dispatcher.dispatch(&event).await,
            Err(HandlerError::Transient(_))
        ));
        let ticket = f.repos.tickets.get("c-1").await.unwrap().unwrap();
        assert_eq!(ticket.chat_id, -100_555);
        assert!(f.repos.tickets.list_for_chat(555).await.unwrap().is_empty());
        assert_eq!(f.repos.customers.find_by_chat(555).await.unwrap(), None);
        assert_eq!(
            f.repos
                .customers
                .find_by_chat(-100_555)
                .await
                .unwrap()
                .map(|c| c.unthread_customer_id),
            Some("cu_1".to_string())
        );

        f.dispatcher.dispatch(&event).await.unwrap();
        let sent = f.chat.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, -100_555);
        assert_eq!(sent[0].reply_to_message_id, Some(10));
        // The other chat is untouched.
        assert_eq!(f.repos.tickets.get("c-2").await.unwrap().unwrap().chat_id, 777);
    }

    #[tokio::test]
    async fn test_failed_persist_still_blocks_redelivery() {
        let durable = Arc::new(SwitchableTier::new(TierKind::Durable));
        let f = fixture_over(storage_over(durable.clone())).await;
        let event = dashboard_event(
            "message_created",
            json!({"conversationId": "c-1", "id": "m-1", "text": "hello"}),
        );

        durable.set_down(true);
        f.dispatcher.dispatch(&event).await.unwrap();
        durable.set_down(false);

        f.dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(f.chat.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_after_delivery_does_not_resend() {
        let durable = Arc::new(SwitchableTier::new(TierKind::Durable));
        let f = fixture_over(storage_over(durable.clone())).await;
        // Slower than the handler timeout, faster than the storage timeout.
        durable.set_write_delay(Duration::from_millis(400));

        let queue = InMemoryEventQueue::new();
        queue
            .push_json(&dashboard_event(
                "message_created",
                json!({"conversationId": "c-1", "id": "m-1", "text": "hello"}),
            ))
            .unwrap();
        let settings = ConsumerSettings {
            handler_timeout: Duration::from_millis(300),
            retry_base_delay: Duration::from_secs(1),
            ..ConsumerSettings::default()
        };
        let consumer = EventQueueConsumer::new(Arc::new(queue.clone()), Arc::new(f.dispatcher));

        consumer.poll_once(&settings).await.unwrap();
        assert_eq!(queue.scheduled_retries().len(), 1);
        assert_eq!(f.chat.sent().len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(consumer.poll_once(&settings).await.unwrap(), 1);
        assert!(queue.is_drained());
        assert_eq!(f.chat.sent().len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let ticket = f.repos.tickets.get("c-1").await.unwrap().unwrap();
        assert!(ticket.has_processed("m-1"));
    }

    #[tokio::test]
    async fn test_rejected_message_is_not_retried_or_cleaned() {
        let f = fixture().await;
        f.chat.fail_next(DeliveryError::Rejected("message is too long".into()));
        let event = dashboard_event("message_created", json!({"conversationId": "c-1", "text": "x"}));

        assert!(matches!(
            f.dispatcher.dispatch(&event).await,
            Err(HandlerError::Permanent(_))
        ));
        assert!(f.repos.tickets.get("c-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_acknowledged() {
        let f = fixture().await;
        let event = dashboard_event("message_created", json!({"conversationId": "nope", "text": "hi"}));
        assert_eq!(
            f.dispatcher.dispatch(&event).await.unwrap(),
            DispatchOutcome::Handled
        );
        assert!(f.chat.sent().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unregistered_events() {
        let f = fixture().await;
        let malformed = dashboard_event("message_created", json!({"text": "no conversation"}));
        assert!(matches!(
            f.dispatcher.dispatch(&malformed).await,
            Err(HandlerError::Malformed(_))
        ));

        let unregistered = dashboard_event("conversation_created", json!({"id": "c-9"}));
        assert_eq!(
            f.dispatcher.dispatch(&unregistered).await.unwrap(),
            DispatchOutcome::Unhandled
        );
        assert!(f.chat.sent().is_empty());
    }

    #[tokio::test]
    async fn test_attachment_only_message_is_relayed() {
        let f = fixture().await;
        let mut event = dashboard_event("message_created", json!({"conversationId": "c-1"}));
        event.attachments = Some(AttachmentSummary {
            has_files: true,
            count: 1,
            total_size: 100,
            types: vec!["image/png".into()],
            names: vec!["screenshot.png".into()],
        });
        f.dispatcher.dispatch(&event).await.unwrap();
        assert!(f.chat.sent()[0].text.contains("screenshot.png"));
    }

    #[test]
    fn test_marker_priority() {
        let mut event = dashboard_event("message_created", json!({"conversationId": "c-1", "id": "m-7"}));
        assert_eq!(event_marker(&event, "c-1"), "m-7");

        event.event_id = Some("evt-1".into());
        assert_eq!(event_marker(&event, "c-1"), "evt-1");

        let update = dashboard_event("conversation_updated", json!({"id": "c-1", "status": "closed"}));
        assert_eq!(
            event_marker(&update, "c-1"),
            format!("conversation_updated:c-1:{}", update.timestamp.unix_millis())
        );
    }
}
