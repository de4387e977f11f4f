//! Group setup sessions an admin walks through in their private chat.
//!
//! An admin has at most one active session, tracked by the
//! `dm-setup:admin:{adminUserId}` index. Sessions expire ten minutes after
//! creation by default; expiry is enforced on read, and an expired session
//! or a pointer to a missing one is deleted when read.

use super::{RepositoryError, keys};
use crate::storage::{StorageError, UnifiedStorage};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmSetupSession {
    pub session_id: String,
    pub admin_user_id: i64,
    pub group_chat_id: i64,
    pub current_step: String,
    #[serde(default)]
    pub step_data: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl DmSetupSession {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminSessionPointer {
    session_id: String,
}

#[derive(Clone)]
pub struct DmSetupRepository {
    storage: UnifiedStorage,
    ttl: Duration,
}

impl DmSetupRepository {
    pub fn new(storage: UnifiedStorage, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    /// Start a session, replacing the admin's previous one if any.
    pub async fn create(
        &self,
        admin_user_id: i64,
        group_chat_id: i64,
        first_step: impl Into<String>,
    ) -> Result<DmSetupSession, StorageError> {
        if let Some(previous) = self.find_for_admin(admin_user_id).await? {
            debug!(admin_user_id, session_id = %previous.session_id, "Replacing setup session");
            self.storage.delete(&keys::dm_setup(&previous.session_id)).await;
        }

        let now = OffsetDateTime::now_utc();
        let session = DmSetupSession {
            session_id: Uuid::new_v4().to_string(),
            admin_user_id,
            group_chat_id,
            current_step: first_step.into(),
            step_data: serde_json::Value::Object(Default::default()),
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.put(&session).await?;
        self.storage
            .set_typed_expiring(
                &keys::dm_setup_by_admin(admin_user_id),
                &AdminSessionPointer {
                    session_id: session.session_id.clone(),
                },
                self.ttl,
            )
            .await?;
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<DmSetupSession>, StorageError> {
        let key = keys::dm_setup(session_id);
        let session: Option<DmSetupSession> = self.storage.get_typed(&key).await?;
        match session {
            Some(session) if session.is_expired(OffsetDateTime::now_utc()) => {
                debug!(session_id, "Deleting expired setup session");
                self.storage.delete(&key).await;
                Ok(None)
            }
            session => Ok(session),
        }
    }

    pub async fn find_for_admin(&self, admin_user_id: i64) -> Result<Option<DmSetupSession>, StorageError> {
        let pointer_key = keys::dm_setup_by_admin(admin_user_id);
        let pointer: Option<AdminSessionPointer> = self.storage.get_typed(&pointer_key).await?;
        let Some(pointer) = pointer else {
            return Ok(None);
        };
        let session = self.get(&pointer.session_id).await?;
        if session.is_none() {
            debug!(admin_user_id, "Dropping pointer to a gone setup session");
            self.storage.delete(&pointer_key).await;
        }
        Ok(session)
    }

    /// Move the session to `step`, merging `data` into its step data.
    ///
    /// Does not extend the session's lifetime.
    pub async fn advance(
        &self,
        session_id: &str,
        step: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<DmSetupSession, RepositoryError> {
        let mut session = self
            .get(session_id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("setup session", session_id))?;
        session.current_step = step.into();
        merge_object(&mut session.step_data, data);
        self.put(&session).await?;
        Ok(session)
    }

    /// Drop the session and the admin's pointer to it.
    pub async fn complete(&self, session: &DmSetupSession) -> bool {
        let mut report = self.storage.delete(&keys::dm_setup(&session.session_id)).await;
        report.merge(
            self.storage
                .delete(&keys::dm_setup_by_admin(session.admin_user_id))
                .await,
        );
        report.is_complete()
    }

    async fn put(&self, session: &DmSetupSession) -> Result<(), StorageError> {
        let remaining = (session.expires_at - OffsetDateTime::now_utc())
            .try_into()
            .unwrap_or(Duration::ZERO);
        self.storage
            .set_typed_expiring(&keys::dm_setup(&session.session_id), session, remaining)
            .await
    }
}

fn merge_object(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            target.extend(patch);
        }
        (_, serde_json::Value::Null) => {}
        (target, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TierKind;
    use crate::test_support::{SwitchableTier, memory_storage, storage_over};
    use serde_json::json;
    use std::sync::Arc;

    fn repo() -> DmSetupRepository {
        DmSetupRepository::new(memory_storage(), Duration::from_secs(600))
    }

    #[tokio::test]
    async fn test_session_walkthrough() {
        let repo = repo();
        let session = repo.create(42, -100, "choose_customer").await.unwrap();
        assert_eq!(repo.find_for_admin(42).await.unwrap(), Some(session.clone()));

        let advanced = repo
            .advance(&session.session_id, "confirm", json!({"customerName": "Acme"}))
            .await
            .unwrap();
        assert_eq!(advanced.current_step, "confirm");
        assert_eq!(advanced.step_data["customerName"], "Acme");
        assert_eq!(advanced.expires_at, session.expires_at);

        assert!(repo.complete(&advanced).await);
        assert_eq!(repo.get(&session.session_id).await.unwrap(), None);
        assert_eq!(repo.find_for_admin(42).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_new_session_replaces_previous() {
        let repo = repo();
        let first = repo.create(42, -100, "choose_customer").await.unwrap();
        let second = repo.create(42, -200, "choose_customer").await.unwrap();

        assert_eq!(repo.get(&first.session_id).await.unwrap(), None);
        assert_eq!(
            repo.find_for_admin(42).await.unwrap().map(|s| s.group_chat_id),
            Some(-200)
        );
        assert_ne!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn test_expired_session_cannot_advance() {
        let storage = memory_storage();
        let repo = DmSetupRepository::new(storage.clone(), Duration::from_secs(600));
        let now = OffsetDateTime::now_utc();
        let expired = DmSetupSession {
            session_id: "s-1".into(),
            admin_user_id: 42,
            group_chat_id: -100,
            current_step: "confirm".into(),
            step_data: json!({}),
            created_at: now - Duration::from_secs(700),
            expires_at: now - Duration::from_secs(100),
        };
        storage.set_typed(&keys::dm_setup("s-1"), &expired).await.unwrap();

        assert_eq!(repo.get("s-1").await.unwrap(), None);
        assert!(matches!(
            repo.advance("s-1", "done", json!({})).await,
            Err(RepositoryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_session_and_pointer_are_deleted_on_read() {
        let durable = Arc::new(SwitchableTier::new(TierKind::Durable));
        let storage = storage_over(durable.clone());
        let repo = DmSetupRepository::new(storage.clone(), Duration::from_secs(600));
        let now = OffsetDateTime::now_utc();
        let expired = DmSetupSession {
            session_id: "s-2".into(),
            admin_user_id: 43,
            group_chat_id: -100,
            current_step: "confirm".into(),
            step_data: json!({}),
            created_at: now - Duration::from_secs(700),
            expires_at: now - Duration::from_secs(100),
        };
        storage.set_typed(&keys::dm_setup("s-2"), &expired).await.unwrap();
        storage
            .set_typed(
                &keys::dm_setup_by_admin(43),
                &AdminSessionPointer {
                    session_id: "s-2".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(repo.find_for_admin(43).await.unwrap(), None);
        assert!(!durable.contains(&keys::dm_setup("s-2")));
        assert!(!durable.contains(&keys::dm_setup_by_admin(43)));
    }
}
