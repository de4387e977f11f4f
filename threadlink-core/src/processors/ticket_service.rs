//! Escalation flows initiated from the chat side.
//!
//! The command layer that parses chat messages lives outside this crate and
//! calls into [`TicketService`] once it has collected what it needs.

use super::format;
use crate::entities::{
    CustomerRepository, DualIndexError, EnsureCustomerError, Repositories, Ticket, TicketRepository, TicketStatus,
};
use crate::ports::{ChatDelivery, DeliveryError, NewTicket, OutboundMessage, TicketingApi, TicketingError};
use crate::storage::StorageError;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TicketServiceError {
    #[error("ticketing error: {0}")]
    Ticketing(#[from] TicketingError),

    #[error("chat delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Customer(#[from] DualIndexError),

    #[error("no local ticket for conversation {0}")]
    UnknownTicket(String),
}

impl From<EnsureCustomerError<TicketingError>> for TicketServiceError {
    fn from(value: EnsureCustomerError<TicketingError>) -> Self {
        match value {
            EnsureCustomerError::Storage(e) => TicketServiceError::Storage(e),
            EnsureCustomerError::Index(e) => TicketServiceError::Customer(e),
            EnsureCustomerError::Create(e) => TicketServiceError::Ticketing(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTicketRequest {
    pub chat_id: i64,
    /// Name the customer account gets if the chat has none yet.
    pub customer_name: String,
    pub user_id: Option<i64>,
    pub author_name: String,
    pub author_email: Option<String>,
    pub title: String,
    pub summary: String,
    /// The user's message the confirmation should answer.
    pub reply_to_message_id: Option<i64>,
}

pub struct TicketService {
    tickets: TicketRepository,
    customers: CustomerRepository,
    ticketing: Arc<dyn TicketingApi>,
    chat: Arc<dyn ChatDelivery>,
}

impl TicketService {
    pub fn new(repositories: &Repositories, ticketing: Arc<dyn TicketingApi>, chat: Arc<dyn ChatDelivery>) -> Self {
        Self {
            tickets: repositories.tickets.clone(),
            customers: repositories.customers.clone(),
            ticketing,
            chat,
        }
    }

    /// Open a remote ticket for a chat and anchor it to a confirmation message.
    pub async fn open_ticket(&self, request: OpenTicketRequest) -> Result<Ticket, TicketServiceError> {
        let ticketing = Arc::clone(&self.ticketing);
        let customer_name = request.customer_name.clone();
        let customer = self
            .customers
            .ensure_for_chat(request.chat_id, &request.customer_name, || async move {
                ticketing.create_customer(&customer_name).await
            })
            .await?;

        let remote = self
            .ticketing
            .create_ticket(NewTicket {
                customer_id: customer.unthread_customer_id.clone(),
                title: request.title.clone(),
                body: request.summary.clone(),
                author_name: request.author_name.clone(),
                author_email: request.author_email.clone(),
            })
            .await?;

        let mut confirmation = OutboundMessage::new(
            request.chat_id,
            format::ticket_confirmation(&remote.friendly_id, &request.title),
        );
        if let Some(message_id) = request.reply_to_message_id {
            confirmation = confirmation.reply_to(message_id);
        }
        let sent = self.chat.send_message(confirmation).await?;

        let mut ticket = Ticket::new(
            remote.conversation_id,
            remote.friendly_id,
            request.chat_id,
            sent.message_id,
            customer.unthread_customer_id,
        );
        ticket.user_id = request.user_id;
        self.tickets.save(&ticket).await?;

        info!(
            conversation_id = %ticket.conversation_id,
            friendly_id = %ticket.friendly_id,
            chat_id = ticket.chat_id,
            "Ticket opened"
        );
        Ok(ticket)
    }

    /// Forward a chat reply to the ticket it answers.
    ///
    /// Returns `None` when `reply_to_message_id` is neither a ticket
    /// confirmation nor a relayed agent message.
    pub async fn relay_user_reply(
        &self,
        chat_id: i64,
        reply_to_message_id: i64,
        text: &str,
        author_name: &str,
    ) -> Result<Option<Ticket>, TicketServiceError> {
        let Some(ticket) = self.resolve_reply_target(chat_id, reply_to_message_id).await? else {
            debug!(chat_id, reply_to_message_id, "Reply is not linked to a ticket");
            return Ok(None);
        };

        self.ticketing
            .post_reply(&ticket.conversation_id, text, author_name)
            .await?;
        debug!(conversation_id = %ticket.conversation_id, "User reply forwarded");
        Ok(Some(ticket))
    }

    /// Pull the remote friendly id and status into the local ticket.
    ///
    /// Sends no chat notification.
    pub async fn refresh_ticket(&self, conversation_id: &str) -> Result<Ticket, TicketServiceError> {
        let mut ticket = self
            .tickets
            .get(conversation_id)
            .await?
            .ok_or_else(|| TicketServiceError::UnknownTicket(conversation_id.to_string()))?;
        let remote = self.ticketing.get_ticket(conversation_id).await?;

        let renamed = !remote.friendly_id.is_empty() && remote.friendly_id != ticket.friendly_id;
        if renamed {
            ticket.friendly_id = remote.friendly_id;
        }
        if let Some(status) = remote.status.as_deref().and_then(TicketStatus::from_remote) {
            ticket.transition(status, OffsetDateTime::now_utc());
        }

        if renamed {
            self.tickets.save(&ticket).await?;
        } else {
            self.tickets.update(&ticket).await?;
        }
        Ok(ticket)
    }

    async fn resolve_reply_target(&self, chat_id: i64, message_id: i64) -> Result<Option<Ticket>, StorageError> {
        if let Some(ticket) = self.tickets.find_by_message(chat_id, message_id).await? {
            return Ok(Some(ticket));
        }
        match self.tickets.find_agent_message(chat_id, message_id).await? {
            Some(link) => self.tickets.get(&link.conversation_id).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::entities::AgentMessageLink;
    use crate::test_support::{FakeTicketing, RecordingChat, memory_storage};

    struct Fixture {
        repos: Repositories,
        ticketing: Arc<FakeTicketing>,
        chat: Arc<RecordingChat>,
        service: TicketService,
    }

    fn fixture() -> Fixture {
        let repos = Repositories::new(memory_storage(), &SessionSettings::default());
        let ticketing = FakeTicketing::new();
        let chat = RecordingChat::new();
        let service = TicketService::new(&repos, ticketing.clone(), chat.clone());
        Fixture {
            repos,
            ticketing,
            chat,
            service,
        }
    }

    fn request(chat_id: i64) -> OpenTicketRequest {
        OpenTicketRequest {
            chat_id,
            customer_name: "Acme".into(),
            user_id: Some(7),
            author_name: "Jo".into(),
            author_email: None,
            title: "Printer on fire".into(),
            summary: "Smoke everywhere".into(),
            reply_to_message_id: Some(3),
        }
    }

    #[tokio::test]
    async fn test_open_ticket_anchors_to_confirmation() {
        let f = fixture();
        let ticket = f.service.open_ticket(request(555)).await.unwrap();

        let sent = f.chat.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].reply_to_message_id, Some(3));
        assert_eq!(ticket.message_id, 1000);
        assert_eq!(ticket.user_id, Some(7));

        assert_eq!(
            f.repos.tickets.find_by_message(555, 1000).await.unwrap(),
            Some(ticket.clone())
        );
        assert_eq!(
            f.repos.customers.find_by_chat(555).await.unwrap().unwrap().unthread_customer_id,
            ticket.customer_id
        );
    }

    #[tokio::test]
    async fn test_customer_created_once_per_chat() {
        let f = fixture();
        f.service.open_ticket(request(555)).await.unwrap();
        f.service.open_ticket(request(555)).await.unwrap();
        f.service.open_ticket(request(777)).await.unwrap();

        assert_eq!(f.ticketing.customers_created(), 2);
        assert_eq!(f.ticketing.tickets_created(), 3);
        assert_eq!(f.repos.tickets.list_for_chat(555).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remote_outage_stores_nothing() {
        let f = fixture();
        f.ticketing.set_unavailable(true);
        let err = f.service.open_ticket(request(555)).await.unwrap_err();
        assert!(matches!(err, TicketServiceError::Ticketing(ref e) if e.is_transient()));
        assert_eq!(f.repos.customers.find_by_chat(555).await.unwrap(), None);
        assert!(f.chat.sent().is_empty());
    }

    #[tokio::test]
    async fn test_reply_routing() {
        let f = fixture();
        let ticket = f.service.open_ticket(request(555)).await.unwrap();

        let routed = f
            .service
            .relay_user_reply(555, ticket.message_id, "more details", "Jo")
            .await
            .unwrap();
        assert_eq!(routed.map(|t| t.conversation_id), Some(ticket.conversation_id.clone()));

        f.repos
            .tickets
            .record_agent_message(&AgentMessageLink {
                chat_id: 555,
                message_id: 4242,
                conversation_id: ticket.conversation_id.clone(),
                sent_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();
        assert!(
            f.service
                .relay_user_reply(555, 4242, "thanks", "Jo")
                .await
                .unwrap()
                .is_some()
        );

        assert_eq!(
            f.service.relay_user_reply(555, 1, "unrelated", "Jo").await.unwrap(),
            None
        );
        assert_eq!(f.ticketing.replies().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_pulls_remote_status() {
        let f = fixture();
        let ticket = f.service.open_ticket(request(555)).await.unwrap();
        f.ticketing.set_status(&ticket.conversation_id, "resolved");

        let refreshed = f.service.refresh_ticket(&ticket.conversation_id).await.unwrap();
        assert_eq!(refreshed.status, TicketStatus::Closed);
        assert!(f.chat.sent().len() == 1);

        assert!(matches!(
            f.service.refresh_ticket("missing").await,
            Err(TicketServiceError::UnknownTicket(_))
        ));
    }
}
