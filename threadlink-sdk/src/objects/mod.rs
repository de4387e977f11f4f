pub mod event;
pub mod unthread;

pub use event::{
    AttachmentSummary, ConversationCreatedData, ConversationUpdatedData, EventPayload,
    EventTimestamp, MessageCreatedData, PayloadError, WebhookEvent,
};
