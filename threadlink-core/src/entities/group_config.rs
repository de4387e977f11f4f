use super::{RepositoryError, keys};
use crate::storage::{StorageError, UnifiedStorage};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Binding between a group chat and a customer account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub chat_id: i64,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub is_configured: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub setup_at: Option<OffsetDateTime>,
    /// Admin who completed the setup.
    #[serde(default)]
    pub setup_by: Option<i64>,
}

impl GroupConfig {
    pub fn unconfigured(chat_id: i64) -> Self {
        Self {
            chat_id,
            customer_id: None,
            is_configured: false,
            setup_at: None,
            setup_by: None,
        }
    }
}

#[derive(Clone)]
pub struct GroupConfigRepository {
    storage: UnifiedStorage,
}

impl GroupConfigRepository {
    pub fn new(storage: UnifiedStorage) -> Self {
        Self { storage }
    }

    pub async fn get(&self, chat_id: i64) -> Result<Option<GroupConfig>, StorageError> {
        self.storage.get_typed(&keys::group_config(chat_id)).await
    }

    pub async fn save(&self, config: &GroupConfig) -> Result<(), StorageError> {
        self.storage
            .set_typed(&keys::group_config(config.chat_id), config)
            .await
    }

    /// Bind `chat_id` to `customer_id`, recording who did it.
    pub async fn mark_configured(
        &self,
        chat_id: i64,
        customer_id: impl Into<String>,
        setup_by: i64,
    ) -> Result<GroupConfig, RepositoryError> {
        let mut config = self
            .get(chat_id)
            .await?
            .unwrap_or_else(|| GroupConfig::unconfigured(chat_id));
        config.customer_id = Some(customer_id.into());
        config.is_configured = true;
        config.setup_at = Some(OffsetDateTime::now_utc());
        config.setup_by = Some(setup_by);
        self.save(&config).await?;
        Ok(config)
    }

    pub async fn reset(&self, chat_id: i64) -> bool {
        self.storage.delete(&keys::group_config(chat_id)).await.is_complete()
    }
}
