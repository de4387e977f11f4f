//! Request and response objects of the Unthread REST API.

use serde::{Deserialize, Serialize};

/// `POST /conversations`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub markdown: String,
    pub status: String,
    pub customer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triage_channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_behalf_of: Option<OnBehalfOf>,
}

impl CreateConversationRequest {
    /// A Slack-style conversation opened for `customer_id`.
    pub fn new(customer_id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: "slack".to_string(),
            title: title.into(),
            markdown: body.into(),
            status: "open".to_string(),
            customer_id: customer_id.into(),
            triage_channel_id: None,
            on_behalf_of: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnBehalfOf {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Conversation as returned by the API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// Sequential ticket number shown to humans.
    #[serde(default)]
    pub friendly_id: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
}

impl Conversation {
    /// `friendlyId` is numeric on most accounts but a string on some; render both.
    pub fn friendly_id_string(&self) -> Option<String> {
        match self.friendly_id.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// `POST /conversations/{id}/messages`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageRequest {
    pub body: MessageBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_behalf_of: Option<OnBehalfOf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl PostMessageRequest {
    pub fn markdown(text: impl Into<String>, author: Option<OnBehalfOf>) -> Self {
        Self {
            body: MessageBody {
                kind: "markdown".to_string(),
                value: text.into(),
            },
            on_behalf_of: author,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostedMessage {
    #[serde(default, alias = "ts")]
    pub id: Option<String>,
}

/// `POST /customers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCustomerRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCustomer {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}
