use async_trait::async_trait;
use thiserror::Error;

/// Ticket to open on behalf of a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTicket {
    pub customer_id: String,
    pub title: String,
    pub body: String,
    pub author_name: String,
    pub author_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTicket {
    pub conversation_id: String,
    pub friendly_id: String,
    /// Remote status string, as reported by the service.
    pub status: Option<String>,
}

#[derive(Debug, Error)]
pub enum TicketingError {
    #[error("ticketing service unavailable: {0}")]
    Unavailable(String),

    #[error("ticketing service rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected response from ticketing service: {0}")]
    InvalidResponse(String),
}

impl TicketingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TicketingError::Unavailable(_))
    }
}

#[async_trait]
pub trait TicketingApi: Send + Sync {
    async fn create_ticket(&self, ticket: NewTicket) -> Result<RemoteTicket, TicketingError>;

    async fn post_reply(&self, conversation_id: &str, text: &str, author_name: &str) -> Result<(), TicketingError>;

    async fn get_ticket(&self, conversation_id: &str) -> Result<RemoteTicket, TicketingError>;

    /// Create a customer account and return its id.
    async fn create_customer(&self, name: &str) -> Result<String, TicketingError>;
}
