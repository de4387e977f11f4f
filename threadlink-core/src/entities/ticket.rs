//! Tickets: the local mapping of a remote conversation to a chat thread.

use super::keys;
use crate::storage::{DeleteReport, StorageError, UnifiedStorage};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use time::OffsetDateTime;
use tracing::{debug, warn};

/// How many processed event markers a ticket remembers.
pub const EVENT_MARKER_CAPACITY: usize = 32;

/// How many agent reply links a ticket keeps. Older links are deleted.
pub const AGENT_LINK_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    Closed,
}

impl TicketStatus {
    /// Map a status reported by the ticketing service.
    ///
    /// Everything the dashboard considers "in work" counts as open.
    pub fn from_remote(status: &str) -> Option<Self> {
        match status.to_ascii_lowercase().as_str() {
            "open" | "in_progress" | "on_hold" | "reopened" => Some(TicketStatus::Open),
            "closed" | "resolved" => Some(TicketStatus::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TicketStatus::Open => write!(f, "open"),
            TicketStatus::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub conversation_id: String,
    pub friendly_id: String,
    pub chat_id: i64,
    /// Confirmation message in the chat; every relay is threaded to it.
    pub message_id: i64,
    pub customer_id: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    pub status: TicketStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_agent_reply_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub status_changed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub recent_event_markers: VecDeque<String>,
}

impl Ticket {
    pub fn new(
        conversation_id: impl Into<String>,
        friendly_id: impl Into<String>,
        chat_id: i64,
        message_id: i64,
        customer_id: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            friendly_id: friendly_id.into(),
            chat_id,
            message_id,
            customer_id: customer_id.into(),
            user_id: None,
            status: TicketStatus::Open,
            created_at: OffsetDateTime::now_utc(),
            last_agent_reply_at: None,
            status_changed_at: None,
            recent_event_markers: VecDeque::new(),
        }
    }

    pub fn has_processed(&self, marker: &str) -> bool {
        self.recent_event_markers.iter().any(|m| m == marker)
    }

    /// Remember `marker`, evicting the oldest beyond [`EVENT_MARKER_CAPACITY`].
    pub fn record_event(&mut self, marker: impl Into<String>) {
        let marker = marker.into();
        if self.has_processed(&marker) {
            return;
        }
        self.recent_event_markers.push_back(marker);
        while self.recent_event_markers.len() > EVENT_MARKER_CAPACITY {
            self.recent_event_markers.pop_front();
        }
    }

    /// Move to `to`. Returns `false` when the ticket already has that status.
    ///
    /// Both directions are valid any number of times.
    pub fn transition(&mut self, to: TicketStatus, at: OffsetDateTime) -> bool {
        if self.status == to {
            return false;
        }
        self.status = to;
        self.status_changed_at = Some(at);
        true
    }
}

/// Which chat message carried which agent reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageLink {
    pub chat_id: i64,
    pub message_id: i64,
    pub conversation_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TicketPointer {
    conversation_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatTickets {
    conversation_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    chat_id: i64,
    message_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentMessages {
    messages: VecDeque<MessageRef>,
}

#[derive(Clone)]
pub struct TicketRepository {
    storage: UnifiedStorage,
}

impl TicketRepository {
    pub fn new(storage: UnifiedStorage) -> Self {
        Self { storage }
    }

    pub async fn get(&self, conversation_id: &str) -> Result<Option<Ticket>, StorageError> {
        self.storage.get_typed(&keys::ticket(conversation_id)).await
    }

    /// Persist a new ticket together with its lookup indices.
    pub async fn save(&self, ticket: &Ticket) -> Result<(), StorageError> {
        self.update(ticket).await?;

        let pointer = TicketPointer {
            conversation_id: ticket.conversation_id.clone(),
        };
        self.storage
            .set_typed(&keys::ticket_by_friendly_id(&ticket.friendly_id), &pointer)
            .await?;
        self.storage
            .set_typed(
                &keys::ticket_by_message(ticket.chat_id, ticket.message_id),
                &pointer,
            )
            .await?;

        let chat_key = keys::chat_tickets(ticket.chat_id);
        let mut index: ChatTickets = self.storage.get_typed(&chat_key).await?.unwrap_or_default();
        if !index.conversation_ids.contains(&ticket.conversation_id) {
            index.conversation_ids.push(ticket.conversation_id.clone());
            self.storage.set_typed(&chat_key, &index).await?;
        }
        Ok(())
    }

    /// Persist changes to an existing ticket record only.
    pub async fn update(&self, ticket: &Ticket) -> Result<(), StorageError> {
        self.storage
            .set_typed(&keys::ticket(&ticket.conversation_id), ticket)
            .await
    }

    pub async fn find_by_friendly_id(&self, friendly_id: &str) -> Result<Option<Ticket>, StorageError> {
        let pointer: Option<TicketPointer> = self
            .storage
            .get_typed(&keys::ticket_by_friendly_id(friendly_id))
            .await?;
        self.follow(pointer).await
    }

    /// The ticket whose confirmation message is `message_id`.
    pub async fn find_by_message(&self, chat_id: i64, message_id: i64) -> Result<Option<Ticket>, StorageError> {
        let pointer: Option<TicketPointer> = self
            .storage
            .get_typed(&keys::ticket_by_message(chat_id, message_id))
            .await?;
        self.follow(pointer).await
    }

    /// Every ticket still mapped to `chat_id`, in creation order.
    pub async fn list_for_chat(&self, chat_id: i64) -> Result<Vec<Ticket>, StorageError> {
        let index: ChatTickets = self
            .storage
            .get_typed(&keys::chat_tickets(chat_id))
            .await?
            .unwrap_or_default();

        let mut tickets = Vec::with_capacity(index.conversation_ids.len());
        for conversation_id in &index.conversation_ids {
            match self.get(conversation_id).await? {
                Some(ticket) => tickets.push(ticket),
                None => debug!(chat_id, conversation_id = %conversation_id, "Chat index points at a missing ticket"),
            }
        }
        Ok(tickets)
    }

    /// Remove the ticket record, its indices and its agent reply links.
    pub async fn delete(&self, ticket: &Ticket) -> DeleteReport {
        let mut report = self.storage.delete(&keys::ticket(&ticket.conversation_id)).await;
        report.merge(
            self.storage
                .delete(&keys::ticket_by_friendly_id(&ticket.friendly_id))
                .await,
        );
        report.merge(
            self.storage
                .delete(&keys::ticket_by_message(ticket.chat_id, ticket.message_id))
                .await,
        );
        report.merge(self.unindex_chat(ticket.chat_id, &ticket.conversation_id).await);

        let links_key = keys::ticket_agent_messages(&ticket.conversation_id);
        match self.storage.get_typed::<AgentMessages>(&links_key).await {
            Ok(Some(index)) => {
                for m in index.messages {
                    report.merge(self.storage.delete(&keys::agent_message(m.chat_id, m.message_id)).await);
                }
                report.merge(self.storage.delete(&links_key).await);
            }
            Ok(None) => {}
            Err(e) => warn!(
                conversation_id = %ticket.conversation_id,
                error = %e,
                "Failed to read agent message index"
            ),
        }
        report
    }

    /// Re-home `ticket` under `chat_id` after its chat changed id.
    ///
    /// The confirmation message keeps its id. Returns the moved ticket.
    pub async fn move_to_chat(&self, ticket: &Ticket, chat_id: i64) -> Result<Ticket, StorageError> {
        let mut moved = ticket.clone();
        moved.chat_id = chat_id;
        self.save(&moved).await?;

        let mut report = self
            .storage
            .delete(&keys::ticket_by_message(ticket.chat_id, ticket.message_id))
            .await;
        report.merge(self.unindex_chat(ticket.chat_id, &ticket.conversation_id).await);
        if !report.is_complete() {
            warn!(
                conversation_id = %ticket.conversation_id,
                from = ticket.chat_id,
                skipped = ?report.skipped,
                "Old chat indices pending delete"
            );
        }
        Ok(moved)
    }

    /// Record a delivered agent reply, dropping the oldest links beyond
    /// [`AGENT_LINK_CAPACITY`].
    pub async fn record_agent_message(&self, link: &AgentMessageLink) -> Result<(), StorageError> {
        self.storage
            .set_typed(&keys::agent_message(link.chat_id, link.message_id), link)
            .await?;

        let index_key = keys::ticket_agent_messages(&link.conversation_id);
        let mut index: AgentMessages = self.storage.get_typed(&index_key).await?.unwrap_or_default();
        let entry = MessageRef {
            chat_id: link.chat_id,
            message_id: link.message_id,
        };
        if !index.messages.contains(&entry) {
            index.messages.push_back(entry);
        }
        let excess = index.messages.len().saturating_sub(AGENT_LINK_CAPACITY);
        let evicted: Vec<MessageRef> = index.messages.drain(..excess).collect();
        self.storage.set_typed(&index_key, &index).await?;

        for old in evicted {
            self.storage
                .delete(&keys::agent_message(old.chat_id, old.message_id))
                .await;
        }
        Ok(())
    }

    pub async fn find_agent_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<AgentMessageLink>, StorageError> {
        self.storage
            .get_typed(&keys::agent_message(chat_id, message_id))
            .await
    }

    /// Drop `conversation_id` from the chat's ticket index.
    async fn unindex_chat(&self, chat_id: i64, conversation_id: &str) -> DeleteReport {
        let chat_key = keys::chat_tickets(chat_id);
        match self.storage.get_typed::<ChatTickets>(&chat_key).await {
            Ok(Some(mut index)) => {
                index.conversation_ids.retain(|id| id != conversation_id);
                if index.conversation_ids.is_empty() {
                    return self.storage.delete(&chat_key).await;
                }
                if let Err(e) = self.storage.set_typed(&chat_key, &index).await {
                    warn!(chat_id, error = %e, "Failed to update chat ticket index");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(chat_id, error = %e, "Failed to read chat ticket index"),
        }
        DeleteReport::default()
    }

    async fn follow(&self, pointer: Option<TicketPointer>) -> Result<Option<Ticket>, StorageError> {
        match pointer {
            Some(pointer) => self.get(&pointer.conversation_id).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_storage;

    #[test]
    fn test_status_mapping() {
        assert_eq!(TicketStatus::from_remote("closed"), Some(TicketStatus::Closed));
        assert_eq!(TicketStatus::from_remote("RESOLVED"), Some(TicketStatus::Closed));
        assert_eq!(TicketStatus::from_remote("in_progress"), Some(TicketStatus::Open));
        assert_eq!(TicketStatus::from_remote("snoozed"), None);
    }

    #[test]
    fn test_status_machine_is_reentrant() {
        let mut ticket = Ticket::new("c-1", "1", 555, 10, "cu");
        let now = OffsetDateTime::now_utc();
        assert!(!ticket.transition(TicketStatus::Open, now));
        assert!(ticket.transition(TicketStatus::Closed, now));
        assert!(ticket.transition(TicketStatus::Open, now));
        assert!(ticket.transition(TicketStatus::Closed, now));
        assert_eq!(ticket.status_changed_at, Some(now));
    }

    #[test]
    fn test_event_markers_are_bounded() {
        let mut ticket = Ticket::new("c-1", "1", 555, 10, "cu");
        for i in 0..(EVENT_MARKER_CAPACITY + 5) {
            ticket.record_event(format!("m-{i}"));
        }
        assert_eq!(ticket.recent_event_markers.len(), EVENT_MARKER_CAPACITY);
        assert!(!ticket.has_processed("m-0"));
        assert!(ticket.has_processed(&format!("m-{}", EVENT_MARKER_CAPACITY + 4)));

        ticket.record_event("m-10");
        assert_eq!(ticket.recent_event_markers.len(), EVENT_MARKER_CAPACITY);
    }

    #[test]
    fn test_serialized_shape() {
        let ticket = Ticket::new("c-1", "42", 555, 10, "cu");
        let json = serde_json::to_value(&ticket).unwrap();
        assert_eq!(json["conversationId"], "c-1");
        assert_eq!(json["friendlyId"], "42");
        assert_eq!(json["chatId"], 555);
        assert_eq!(json["status"], "open");
        assert!(json["lastAgentReplyAt"].is_null());
    }

    #[tokio::test]
    async fn test_indices_follow_the_ticket() {
        let repo = TicketRepository::new(memory_storage());
        let first = Ticket::new("c-1", "1", 555, 10, "cu");
        let second = Ticket::new("c-2", "2", 555, 20, "cu");
        repo.save(&first).await.unwrap();
        repo.save(&second).await.unwrap();

        assert_eq!(repo.find_by_friendly_id("2").await.unwrap(), Some(second.clone()));
        assert_eq!(repo.find_by_message(555, 10).await.unwrap(), Some(first.clone()));
        assert_eq!(repo.list_for_chat(555).await.unwrap().len(), 2);

        assert!(repo.delete(&first).await.is_complete());
        assert_eq!(repo.get("c-1").await.unwrap(), None);
        assert_eq!(repo.find_by_message(555, 10).await.unwrap(), None);
        assert_eq!(repo.list_for_chat(555).await.unwrap(), vec![second.clone()]);

        repo.delete(&second).await;
        assert!(repo.list_for_chat(555).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_agent_message_links() {
        let repo = TicketRepository::new(memory_storage());
        let link = AgentMessageLink {
            chat_id: 555,
            message_id: 77,
            conversation_id: "c-1".into(),
            sent_at: OffsetDateTime::now_utc(),
        };
        repo.record_agent_message(&link).await.unwrap();
        assert_eq!(repo.find_agent_message(555, 77).await.unwrap(), Some(link));
        assert_eq!(repo.find_agent_message(555, 78).await.unwrap(), None);
    }

    fn link(message_id: i64) -> AgentMessageLink {
        AgentMessageLink {
            chat_id: 555,
            message_id,
            conversation_id: "c-1".into(),
            sent_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_ticket_delete_removes_agent_links() {
        let repo = TicketRepository::new(memory_storage());
        let ticket = Ticket::new("c-1", "1", 555, 10, "cu");
        repo.save(&ticket).await.unwrap();
        repo.record_agent_message(&link(1000)).await.unwrap();
        repo.record_agent_message(&link(1001)).await.unwrap();

        assert!(repo.delete(&ticket).await.is_complete());
        assert_eq!(repo.find_agent_message(555, 1000).await.unwrap(), None);
        assert_eq!(repo.find_agent_message(555, 1001).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_agent_links_are_capped_per_ticket() {
        let repo = TicketRepository::new(memory_storage());
        let total = AGENT_LINK_CAPACITY as i64 + 2;
        for message_id in 0..total {
            repo.record_agent_message(&link(message_id)).await.unwrap();
        }

        assert_eq!(repo.find_agent_message(555, 0).await.unwrap(), None);
        assert_eq!(repo.find_agent_message(555, 1).await.unwrap(), None);
        assert!(repo.find_agent_message(555, 2).await.unwrap().is_some());
        assert!(repo.find_agent_message(555, total - 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_move_to_chat_rewrites_indices() {
        let repo = TicketRepository::new(memory_storage());
        let ticket = Ticket::new("c-1", "1", -555, 10, "cu");
        let other = Ticket::new("c-2", "2", -555, 11, "cu");
        repo.save(&ticket).await.unwrap();
        repo.save(&other).await.unwrap();

        let moved = repo.move_to_chat(&ticket, -100_555).await.unwrap();
        assert_eq!(moved.chat_id, -100_555);
        assert_eq!(repo.get("c-1").await.unwrap(), Some(moved.clone()));
        assert_eq!(repo.find_by_message(-100_555, 10).await.unwrap(), Some(moved.clone()));
        assert_eq!(repo.find_by_message(-555, 10).await.unwrap(), None);
        assert_eq!(repo.list_for_chat(-100_555).await.unwrap(), vec![moved]);
        assert_eq!(repo.list_for_chat(-555).await.unwrap(), vec![other]);
    }
}
