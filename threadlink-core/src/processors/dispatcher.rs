//! Routes queue events to handlers by `(eventType, sourcePlatform)`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use threadlink_sdk::objects::WebhookEvent;
use tracing::{debug, info, warn};

/// How a handler failed, which decides what the consumer does next.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Worth retrying later; no state was changed.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Transient, and the next attempt must wait at least `retry_after`.
    #[error("throttled for {retry_after:?}: {reason}")]
    Throttled { reason: String, retry_after: Duration },

    /// Will never succeed; the event is acknowledged.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The event itself is unusable; it is logged and dropped.
    #[error("malformed event: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No handler for the event's key. Nothing happened.
    Unhandled,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("a handler for ({event_type}, {source_platform}) is already registered")]
    Duplicate {
        event_type: String,
        source_platform: String,
    },
}

type HandlerKey = (String, String);

/// Handler registry. Built at startup, then shared read-only.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<HandlerKey, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for the key. Fails if the key is taken.
    pub fn subscribe(
        &mut self,
        event_type: &str,
        source_platform: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscribeError> {
        let key = (event_type.to_string(), source_platform.to_string());
        if self.handlers.contains_key(&key) {
            return Err(SubscribeError::Duplicate {
                event_type: key.0,
                source_platform: key.1,
            });
        }
        info!(event_type, source_platform, "Event handler registered");
        self.handlers.insert(key, handler);
        Ok(())
    }

    /// Register `handler` for the key, replacing any existing handler.
    ///
    /// Returns the handler that was replaced.
    pub fn subscribe_replacing(
        &mut self,
        event_type: &str,
        source_platform: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Option<Arc<dyn EventHandler>> {
        let previous = self
            .handlers
            .insert((event_type.to_string(), source_platform.to_string()), handler);
        if previous.is_some() {
            info!(event_type, source_platform, "Event handler replaced");
        } else {
            info!(event_type, source_platform, "Event handler registered");
        }
        previous
    }

    pub fn is_subscribed(&self, event_type: &str, source_platform: &str) -> bool {
        self.handlers
            .contains_key(&(event_type.to_string(), source_platform.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn dispatch(&self, event: &WebhookEvent) -> Result<DispatchOutcome, HandlerError> {
        let key = (event.event_type.clone(), event.source_platform.clone());
        let Some(handler) = self.handlers.get(&key) else {
            warn!(
                event_type = %event.event_type,
                source_platform = %event.source_platform,
                "No handler registered, dropping event"
            );
            return Ok(DispatchOutcome::Unhandled);
        };

        debug!(
            event_type = %event.event_type,
            source_platform = %event.source_platform,
            conversation_id = ?event.conversation_id(),
            "Dispatching event"
        );
        handler.handle(event).await?;
        Ok(DispatchOutcome::Handled)
    }
}
