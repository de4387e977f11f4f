use super::{RepositoryError, keys};
use crate::storage::{StorageError, UnifiedStorage};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

/// An administrator who may configure group chats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminProfile {
    pub telegram_user_id: i64,
    pub is_activated: bool,
    /// Private chat with the bot, known once the admin has activated.
    #[serde(default)]
    pub dm_chat_id: Option<i64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub activated_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
}

impl AdminProfile {
    pub fn new(telegram_user_id: i64) -> Self {
        Self {
            telegram_user_id,
            is_activated: false,
            dm_chat_id: None,
            activated_at: None,
            last_active_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Clone)]
pub struct AdminRepository {
    storage: UnifiedStorage,
}

impl AdminRepository {
    pub fn new(storage: UnifiedStorage) -> Self {
        Self { storage }
    }

    pub async fn get(&self, telegram_user_id: i64) -> Result<Option<AdminProfile>, StorageError> {
        self.storage.get_typed(&keys::admin(telegram_user_id)).await
    }

    pub async fn save(&self, profile: &AdminProfile) -> Result<(), StorageError> {
        self.storage
            .set_typed(&keys::admin(profile.telegram_user_id), profile)
            .await
    }

    /// Mark the admin as activated from their private chat.
    ///
    /// Creates the profile if it does not exist. Activating twice keeps the
    /// first `activatedAt`.
    pub async fn activate(&self, telegram_user_id: i64, dm_chat_id: i64) -> Result<AdminProfile, StorageError> {
        let now = OffsetDateTime::now_utc();
        let mut profile = self
            .get(telegram_user_id)
            .await?
            .unwrap_or_else(|| AdminProfile::new(telegram_user_id));
        profile.is_activated = true;
        profile.dm_chat_id = Some(dm_chat_id);
        profile.activated_at.get_or_insert(now);
        profile.last_active_at = now;
        self.save(&profile).await?;
        info!(telegram_user_id, dm_chat_id, "Admin activated");
        Ok(profile)
    }

    /// Bump `lastActiveAt`.
    pub async fn touch(&self, telegram_user_id: i64) -> Result<AdminProfile, RepositoryError> {
        let mut profile = self
            .get(telegram_user_id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("admin", telegram_user_id))?;
        profile.last_active_at = OffsetDateTime::now_utc();
        self.save(&profile).await?;
        Ok(profile)
    }

    pub async fn reset(&self, telegram_user_id: i64) -> bool {
        self.storage.delete(&keys::admin(telegram_user_id)).await.is_complete()
    }
}
