//! Event processors.
//!
//! - `EventQueueConsumer`: Polls the event queue, hands events to the dispatcher
//! - `EventDispatcher`: Routes events by `(eventType, sourcePlatform)`
//! - `ConversationRouter`: Relays dashboard events into chat threads
//! - `TicketService`: Opens tickets and forwards chat replies

pub mod consumer;
pub mod conversation_router;
pub mod dispatcher;
pub mod format;
pub mod ticket_service;

pub use consumer::EventQueueConsumer;
pub use conversation_router::{ConversationRouter, event_marker};
pub use dispatcher::{DispatchOutcome, EventDispatcher, EventHandler, HandlerError, SubscribeError};
pub use ticket_service::{OpenTicketRequest, TicketService, TicketServiceError};
