//! Outbound collaborators the core depends on.
//!
//! Adapters live in the server crate; tests use in-memory fakes.

pub mod chat;
pub mod ticketing;

pub use chat::{ChatDelivery, DeliveryError, OutboundMessage, SentMessage};
pub use ticketing::{NewTicket, RemoteTicket, TicketingApi, TicketingError};
