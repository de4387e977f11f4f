//! Unthread REST API client (bot → Unthread).
//!
//! Every request carries the workspace API key in the `X-API-KEY` header.

use reqwest::Client;
use url::Url;

use super::ClientError;
use crate::objects::unthread::{
    Conversation, CreateConversationRequest, CreateCustomerRequest, PostMessageRequest,
    PostedMessage, RemoteCustomer,
};

/// Production API root.
pub const DEFAULT_BASE_URL: &str = "https://api.unthread.io/api/";

const API_KEY_HEADER: &str = "X-API-KEY";

/// Typed HTTP client for the Unthread API.
#[derive(Debug, Clone)]
pub struct UnthreadClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl UnthreadClient {
    /// Create a new `UnthreadClient`.
    ///
    /// * `base_url` – API root; must end with `/` so relative paths join below it.
    /// * `api_key` – workspace API key.
    pub fn new(base_url: Url, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url,
            api_key: api_key.into(),
        }
    }

    /// Replace the default `reqwest::Client` with a custom one (e.g. to
    /// configure timeouts or a proxy).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// `POST conversations` – open a new conversation (ticket).
    pub async fn create_conversation(
        &self,
        request: &CreateConversationRequest,
    ) -> Result<Conversation, ClientError> {
        let url = self.base_url.join("conversations")?;
        let resp = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(request)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// `GET conversations/{id}` – fetch a conversation.
    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, ClientError> {
        let url = self.base_url.join(&format!(
            "conversations/{}",
            encode_segment(conversation_id)
        ))?;
        let resp = self
            .http
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// `POST conversations/{id}/messages` – append a message to a conversation.
    pub async fn post_message(
        &self,
        conversation_id: &str,
        request: &PostMessageRequest,
    ) -> Result<PostedMessage, ClientError> {
        let url = self.base_url.join(&format!(
            "conversations/{}/messages",
            encode_segment(conversation_id)
        ))?;
        let resp = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(request)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// `POST customers` – register a customer (one per Telegram group).
    pub async fn create_customer(
        &self,
        request: &CreateCustomerRequest,
    ) -> Result<RemoteCustomer, ClientError> {
        let url = self.base_url.join("customers")?;
        let resp = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(request)
            .send()
            .await?;
        parse_response(resp).await
    }
}

/// Conversation ids are opaque; keep them from escaping their path segment.
fn encode_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '/' => "%2F".to_string(),
            '?' => "%3F".to_string(),
            '#' => "%23".to_string(),
            c => c.to_string(),
        })
        .collect()
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::Api { status, body });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(ClientError::Json)
}
