use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub chat_id: i64,
    pub text: String,
    /// Thread the message under this chat message.
    pub reply_to_message_id: Option<i64>,
}

impl OutboundMessage {
    pub fn new(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            reply_to_message_id: None,
        }
    }

    pub fn reply_to(mut self, message_id: i64) -> Self {
        self.reply_to_message_id = Some(message_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: i64,
}

/// Why a message could not be delivered to a chat.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("bot was blocked by the user")]
    BlockedByUser,

    #[error("chat not found")]
    ChatNotFound,

    #[error("bot was removed from the chat")]
    BotRemoved,

    /// A group became a supergroup and now lives under `to_chat_id`.
    #[error("chat migrated to {to_chat_id}")]
    ChatMigrated { to_chat_id: i64 },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("delivery timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    /// The chat platform refused the request for a reason unrelated to
    /// reachability, e.g. malformed markup.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl DeliveryError {
    /// The chat can never be reached again; local mappings should go.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DeliveryError::BlockedByUser | DeliveryError::ChatNotFound | DeliveryError::BotRemoved
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeliveryError::RateLimited { .. } | DeliveryError::Timeout | DeliveryError::Transport(_)
        )
    }
}

#[async_trait]
pub trait ChatDelivery: Send + Sync {
    async fn send_message(&self, message: OutboundMessage) -> Result<SentMessage, DeliveryError>;

    async fn edit_message(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), DeliveryError>;
}
