pub mod admin;
pub mod cleanup;
pub mod customer;
pub mod dm_setup;
pub mod global_config;
pub mod group_config;
pub mod keys;
pub mod ticket;
pub mod user_state;

pub use admin::{AdminProfile, AdminRepository};
pub use cleanup::{ChatCleanup, CleanupReport};
pub use customer::{
    Customer, CustomerDeleteReport, CustomerIndex, CustomerRepository, DualIndexError, EnsureCustomerError,
};
pub use dm_setup::{DmSetupRepository, DmSetupSession};
pub use global_config::{GlobalConfigDocument, GlobalConfigRepository, MESSAGE_TEMPLATES};
pub use group_config::{GroupConfig, GroupConfigRepository};
pub use ticket::{AgentMessageLink, Ticket, TicketRepository, TicketStatus};
pub use user_state::{UserState, UserStateRepository};

use crate::config::SessionSettings;
use crate::storage::{StorageError, UnifiedStorage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
}

impl RepositoryError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        RepositoryError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Every repository, sharing one [`UnifiedStorage`].
#[derive(Clone)]
pub struct Repositories {
    pub tickets: TicketRepository,
    pub customers: CustomerRepository,
    pub user_states: UserStateRepository,
    pub admins: AdminRepository,
    pub group_configs: GroupConfigRepository,
    pub dm_setups: DmSetupRepository,
    pub global_config: GlobalConfigRepository,
}

impl Repositories {
    pub fn new(storage: UnifiedStorage, sessions: &SessionSettings) -> Self {
        Self {
            tickets: TicketRepository::new(storage.clone()),
            customers: CustomerRepository::new(storage.clone()),
            user_states: UserStateRepository::new(storage.clone(), sessions.user_state_ttl),
            admins: AdminRepository::new(storage.clone()),
            group_configs: GroupConfigRepository::new(storage.clone()),
            dm_setups: DmSetupRepository::new(storage.clone(), sessions.dm_setup_ttl),
            global_config: GlobalConfigRepository::new(storage),
        }
    }

    pub fn chat_cleanup(&self) -> ChatCleanup {
        ChatCleanup::new(self.tickets.clone(), self.customers.clone())
    }
}
