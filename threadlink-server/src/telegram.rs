//! Telegram Bot API adapter for outbound chat messages.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use threadlink_core::ports::{ChatDelivery, DeliveryError, OutboundMessage, SentMessage};
use url::Url;

use crate::config::runtime::TelegramConfig;

/// Delivers chat messages through the Bot API.
#[derive(Clone)]
pub struct TelegramDelivery {
    http: Client,
    /// `{api_url}bot{token}/`; never logged.
    method_base: Url,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_parameters: Option<ReplyParameters>,
}

#[derive(Serialize)]
struct ReplyParameters {
    message_id: i64,
    /// The anchor may have been deleted; post unthreaded rather than fail.
    allow_sending_without_reply: bool,
}

#[derive(Serialize)]
struct EditMessageTextRequest<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<u16>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
    migrate_to_chat_id: Option<i64>,
}

#[derive(Deserialize)]
struct MessageResult {
    message_id: i64,
}

impl TelegramDelivery {
    pub fn new(config: &TelegramConfig, request_timeout: Duration) -> Result<Self, DeliveryError> {
        let method_base = config
            .api_url
            // Tokens contain a colon; the leading `./` keeps it from parsing as a scheme.
            .join(&format!("./bot{}/", config.bot_token))
            .map_err(|e| DeliveryError::Rejected(format!("invalid bot api url: {e}")))?;
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.without_url().to_string()))?;
        Ok(Self { http, method_base })
    }

    async fn call<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<ApiResponse<T>, DeliveryError> {
        let url = self
            .method_base
            .join(method)
            .map_err(|e| DeliveryError::Rejected(format!("invalid method {method}: {e}")))?;
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(transport_error)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            if status.is_server_error() {
                DeliveryError::Transport(format!("bot api returned {status}"))
            } else {
                DeliveryError::Rejected(format!("unreadable bot api response ({status}): {e}"))
            }
        })
    }
}

#[async_trait]
impl ChatDelivery for TelegramDelivery {
    #[tracing::instrument(skip_all, err, name = "Telegram:sendMessage", fields(chat_id = message.chat_id))]
    async fn send_message(&self, message: OutboundMessage) -> Result<SentMessage, DeliveryError> {
        let request = SendMessageRequest {
            chat_id: message.chat_id,
            text: &message.text,
            reply_parameters: message.reply_to_message_id.map(|message_id| ReplyParameters {
                message_id,
                allow_sending_without_reply: true,
            }),
        };
        let response: ApiResponse<MessageResult> = self.call("sendMessage", &request).await?;
        match into_result(response)? {
            Some(result) => Ok(SentMessage {
                message_id: result.message_id,
            }),
            None => Err(DeliveryError::Rejected("sendMessage returned no message".into())),
        }
    }

    #[tracing::instrument(skip_all, err, name = "Telegram:editMessageText", fields(chat_id = chat_id, message_id = message_id))]
    async fn edit_message(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), DeliveryError> {
        let request = EditMessageTextRequest {
            chat_id,
            message_id,
            text,
        };
        // `result` is a Message or `true` depending on the chat kind.
        let response: ApiResponse<serde_json::Value> = self.call("editMessageText", &request).await?;
        match into_result(response) {
            Ok(_) => Ok(()),
            Err(DeliveryError::Rejected(description)) if description.contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn into_result<T>(response: ApiResponse<T>) -> Result<Option<T>, DeliveryError> {
    if response.ok {
        return Ok(response.result);
    }
    let (retry_after, migrate_to_chat_id) = match response.parameters {
        Some(p) => (p.retry_after.map(Duration::from_secs), p.migrate_to_chat_id),
        None => (None, None),
    };
    Err(classify_failure(
        response.error_code.unwrap_or(0),
        response.description.as_deref().unwrap_or(""),
        retry_after,
        migrate_to_chat_id,
    ))
}

/// Map a Bot API error to a delivery error.
///
/// Reachability failures are recognised from the description since the Bot
/// API reports all of them as 400 or 403.
pub fn classify_failure(
    error_code: u16,
    description: &str,
    retry_after: Option<Duration>,
    migrate_to_chat_id: Option<i64>,
) -> DeliveryError {
    let lower = description.to_ascii_lowercase();
    if error_code == 429 {
        return DeliveryError::RateLimited { retry_after };
    }
    if let Some(to_chat_id) = migrate_to_chat_id {
        return DeliveryError::ChatMigrated { to_chat_id };
    }
    if lower.contains("bot was blocked by the user") {
        return DeliveryError::BlockedByUser;
    }
    if lower.contains("chat not found") || lower.contains("user is deactivated") {
        return DeliveryError::ChatNotFound;
    }
    if lower.contains("bot was kicked")
        || lower.contains("bot is not a member")
        || lower.contains("chat was deleted")
    {
        return DeliveryError::BotRemoved;
    }
    if error_code >= 500 {
        return DeliveryError::Transport(format!("{error_code}: {description}"));
    }
    DeliveryError::Rejected(description.to_string())
}

fn transport_error(e: reqwest::Error) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::Timeout
    } else {
        DeliveryError::Transport(e.without_url().to_string())
    }
}
