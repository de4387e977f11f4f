//! Queue wire types for events relayed from the ticketing dashboard.
//!
//! A webhook receiver (outside this repository) pushes one JSON document per
//! event onto the `unthread-events` queue. The document carries a loosely
//! typed `data` object whose shape depends on `eventType`;
//! [`WebhookEvent::payload`] decodes it into an [`EventPayload`] variant.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

/// Event type emitted when an agent (or user) posts a message on a conversation.
pub const MESSAGE_CREATED: &str = "message_created";
/// Event type emitted when conversation metadata (e.g. status) changes.
pub const CONVERSATION_UPDATED: &str = "conversation_updated";
/// Event type emitted when a conversation is created on the dashboard.
pub const CONVERSATION_CREATED: &str = "conversation_created";

/// Source platform tag used by the webhook receiver for dashboard events.
pub const SOURCE_DASHBOARD: &str = "dashboard";

/// A single event document as read from the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    /// Optional producer-assigned unique id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub event_type: String,
    pub source_platform: String,
    #[serde(default)]
    pub target_platform: String,
    pub timestamp: EventTimestamp,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<AttachmentSummary>,
}

impl WebhookEvent {
    /// Decode `data` according to `event_type`.
    ///
    /// Unknown event types decode to [`EventPayload::Other`] so that new
    /// dashboard events never fail decoding; a known type whose `data` does
    /// not match the expected shape is a [`PayloadError`].
    pub fn payload(&self) -> Result<EventPayload, PayloadError> {
        let decode_err = |source| PayloadError {
            event_type: self.event_type.clone(),
            source,
        };
        match self.event_type.as_str() {
            MESSAGE_CREATED => serde_json::from_value(self.data.clone())
                .map(EventPayload::MessageCreated)
                .map_err(decode_err),
            CONVERSATION_UPDATED => serde_json::from_value(self.data.clone())
                .map(EventPayload::ConversationUpdated)
                .map_err(decode_err),
            CONVERSATION_CREATED => serde_json::from_value(self.data.clone())
                .map(EventPayload::ConversationCreated)
                .map_err(decode_err),
            _ => Ok(EventPayload::Other),
        }
    }

    /// The conversation this event belongs to, read without full decoding.
    ///
    /// Used as the ordering key: events sharing a conversation are processed
    /// strictly in queue order.
    pub fn conversation_id(&self) -> Option<&str> {
        let direct = self.data.get("conversationId").and_then(|v| v.as_str());
        match direct {
            Some(id) => Some(id),
            None if self.event_type != MESSAGE_CREATED => {
                self.data.get("id").and_then(|v| v.as_str())
            }
            None => None,
        }
    }

    /// Whether the event carries at least one image attachment.
    pub fn has_image_attachments(&self) -> bool {
        self.attachments
            .as_ref()
            .is_some_and(AttachmentSummary::has_images)
    }
}

/// Timestamp of an event.
///
/// Serialized as RFC 3339. Producers that send unix epoch milliseconds are
/// accepted too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventTimestamp(pub OffsetDateTime);

impl EventTimestamp {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    pub fn unix_millis(&self) -> i128 {
        self.0.unix_timestamp_nanos() / 1_000_000
    }
}

impl From<OffsetDateTime> for EventTimestamp {
    fn from(value: OffsetDateTime) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for EventTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self
            .0
            .format(&time::format_description::well_known::Rfc3339)
        {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{}", self.unix_millis()),
        }
    }
}

impl Serialize for EventTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        time::serde::rfc3339::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for EventTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Millis(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => OffsetDateTime::parse(&s, &time::format_description::well_known::Rfc3339)
                .map(Self)
                .map_err(serde::de::Error::custom),
            Raw::Millis(ms) => OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
                .map(Self)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Attachment metadata attached by the webhook receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentSummary {
    pub has_files: bool,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub total_size: u64,
    /// MIME types, one per file.
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
}

impl AttachmentSummary {
    /// `hasFiles && types` non-empty and at least one `image/*` type.
    pub fn has_images(&self) -> bool {
        self.has_files
            && self
                .types
                .iter()
                .any(|t| t.to_ascii_lowercase().starts_with("image/"))
    }
}

/// Typed view over [`WebhookEvent::data`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    MessageCreated(MessageCreatedData),
    ConversationUpdated(ConversationUpdatedData),
    ConversationCreated(ConversationCreatedData),
    /// An event type this version does not understand.
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCreatedData {
    pub conversation_id: String,
    /// Message id assigned by the ticketing service.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "content")]
    pub text: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Display name of the agent, when the receiver resolved it.
    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdatedData {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub friendly_id: Option<serde_json::Value>,
}

impl ConversationUpdatedData {
    /// Dashboard payloads name the conversation either `conversationId` or `id`.
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref().or(self.id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreatedData {
    #[serde(alias = "id")]
    pub conversation_id: String,
    #[serde(default)]
    pub friendly_id: Option<serde_json::Value>,
}

/// The `data` object of a known event type did not match its schema.
#[derive(Debug, thiserror::Error)]
#[error("malformed {event_type} payload: {source}")]
pub struct PayloadError {
    pub event_type: String,
    #[source]
    pub source: serde_json::Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> WebhookEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_message_created_decoding() {
        let event = parse(
            r#"{
                "eventType": "message_created",
                "sourcePlatform": "dashboard",
                "targetPlatform": "telegram",
                "timestamp": "2024-05-01T10:00:00Z",
                "data": {"conversationId": "c-1", "id": "m-9", "text": "hello"}
            }"#,
        );
        assert_eq!(event.conversation_id(), Some("c-1"));
        match event.payload().unwrap() {
            EventPayload::MessageCreated(data) => {
                assert_eq!(data.conversation_id, "c-1");
                assert_eq!(data.id.as_deref(), Some("m-9"));
                assert_eq!(data.text.as_deref(), Some("hello"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_conversation_updated_accepts_id_alias() {
        let event = parse(
            r#"{
                "eventType": "conversation_updated",
                "sourcePlatform": "dashboard",
                "timestamp": 1714557600000,
                "data": {"id": "c-7", "status": "closed"}
            }"#,
        );
        assert_eq!(event.conversation_id(), Some("c-7"));
        assert_eq!(event.timestamp.unix_millis(), 1_714_557_600_000);
        match event.payload().unwrap() {
            EventPayload::ConversationUpdated(data) => {
                assert_eq!(data.conversation_id(), Some("c-7"));
                assert_eq!(data.status.as_deref(), Some("closed"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_message_created_without_conversation_is_malformed() {
        let event = parse(
            r#"{
                "eventType": "message_created",
                "sourcePlatform": "dashboard",
                "timestamp": "2024-05-01T10:00:00Z",
                "data": {"text": "orphan"}
            }"#,
        );
        assert!(event.payload().is_err());
        assert_eq!(event.conversation_id(), None);
    }

    #[test]
    fn test_unknown_event_type_is_other() {
        let event = parse(
            r#"{
                "eventType": "reaction_added",
                "sourcePlatform": "dashboard",
                "timestamp": "2024-05-01T10:00:00Z",
                "data": {}
            }"#,
        );
        assert_eq!(event.payload().unwrap(), EventPayload::Other);
    }

    #[test]
    fn test_image_attachment_detection() {
        let mut summary = AttachmentSummary {
            has_files: true,
            count: 2,
            total_size: 2048,
            types: vec!["application/pdf".into(), "IMAGE/PNG".into()],
            names: vec![],
        };
        assert!(summary.has_images());

        summary.types = vec!["application/pdf".into()];
        assert!(!summary.has_images());

        summary.types = vec!["image/jpeg".into()];
        summary.has_files = false;
        assert!(!summary.has_images());
    }
}
