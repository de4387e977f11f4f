//! Application state shared across all request handlers.

use std::sync::Arc;
use threadlink_core::events::EventQueue;
use threadlink_core::processors::TicketService;
use threadlink_core::storage::UnifiedStorage;

/// Application state that is shared across all request handlers.
///
/// This is cloneable and cheap to pass around (everything is behind Arc).
#[derive(Clone)]
pub struct AppState {
    pub storage: UnifiedStorage,
    /// Queue the consumer drains; checked by `/ready`.
    pub queue: Arc<dyn EventQueue>,
    pub tickets: Arc<TicketService>,
}

impl AppState {
    pub fn new(storage: UnifiedStorage, queue: Arc<dyn EventQueue>, tickets: Arc<TicketService>) -> Self {
        Self {
            storage,
            queue,
            tickets,
        }
    }
}
