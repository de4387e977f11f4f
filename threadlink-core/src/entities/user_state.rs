use super::keys;
use crate::storage::{StorageError, UnifiedStorage};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

/// Conversation state of a user inside a multi-step command flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub user_id: i64,
    /// Name of the flow that owns this state.
    pub processor: String,
    pub step: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl UserState {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

#[derive(Clone)]
pub struct UserStateRepository {
    storage: UnifiedStorage,
    ttl: Duration,
}

impl UserStateRepository {
    pub fn new(storage: UnifiedStorage, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    /// The user's state, or `None` when absent or past `expiresAt`.
    ///
    /// An expired record is deleted on the way out.
    pub async fn get(&self, user_id: i64) -> Result<Option<UserState>, StorageError> {
        let key = keys::user_state(user_id);
        let state: Option<UserState> = self.storage.get_typed(&key).await?;
        match state {
            Some(state) if state.is_expired(OffsetDateTime::now_utc()) => {
                debug!(user_id, "Deleting expired user state");
                self.storage.delete(&key).await;
                Ok(None)
            }
            state => Ok(state),
        }
    }

    /// Store a state for `user_id`, replacing any previous one.
    pub async fn set(
        &self,
        user_id: i64,
        processor: impl Into<String>,
        step: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<UserState, StorageError> {
        let state = UserState {
            user_id,
            processor: processor.into(),
            step: step.into(),
            payload,
            expires_at: OffsetDateTime::now_utc() + self.ttl,
        };
        self.storage
            .set_typed_expiring(&keys::user_state(user_id), &state, self.ttl)
            .await?;
        Ok(state)
    }

    pub async fn clear(&self, user_id: i64) -> bool {
        self.storage.delete(&keys::user_state(user_id)).await.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TierKind;
    use crate::test_support::{SwitchableTier, memory_storage, storage_over};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_get_clear() {
        let repo = UserStateRepository::new(memory_storage(), Duration::from_secs(60));
        let stored = repo
            .set(7, "support", "awaiting_summary", json!({"chatId": 555}))
            .await
            .unwrap();

        assert_eq!(repo.get(7).await.unwrap(), Some(stored));
        assert!(repo.clear(7).await);
        assert_eq!(repo.get(7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_state_is_a_miss_and_deleted() {
        let durable = Arc::new(SwitchableTier::new(TierKind::Durable));
        let storage = storage_over(durable.clone());
        let repo = UserStateRepository::new(storage.clone(), Duration::from_secs(60));
        let expired = UserState {
            user_id: 7,
            processor: "support".into(),
            step: "awaiting_summary".into(),
            payload: serde_json::Value::Null,
            expires_at: OffsetDateTime::now_utc() - Duration::from_secs(1),
        };
        // Written without a TTL, as the durable tier would hold it.
        storage.set_typed(&keys::user_state(7), &expired).await.unwrap();

        assert_eq!(repo.get(7).await.unwrap(), None);
        assert!(!durable.contains(&keys::user_state(7)));
    }
}
