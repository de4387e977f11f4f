//! Customers: one per chat, reachable by chat id and by remote id.

use super::keys;
use crate::storage::{DeleteReport, StorageError, UnifiedStorage};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub unthread_customer_id: String,
    pub telegram_chat_id: i64,
    pub display_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Customer {
    pub fn new(unthread_customer_id: impl Into<String>, telegram_chat_id: i64, display_name: impl Into<String>) -> Self {
        Self {
            unthread_customer_id: unthread_customer_id.into(),
            telegram_chat_id,
            display_name: display_name.into(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// The two indices of a customer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomerIndex {
    ByChat,
    ById,
}

impl std::fmt::Display for CustomerIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CustomerIndex::ByChat => write!(f, "by-chat"),
            CustomerIndex::ById => write!(f, "by-id"),
        }
    }
}

/// A customer write failed on one of its indices.
///
/// Indices are written by-chat first, so a `ById` failure means the by-chat
/// index holds the new record and the by-id index does not.
#[derive(Debug, Error)]
#[error("customer {index} index write failed: {source}")]
pub struct DualIndexError {
    pub index: CustomerIndex,
    #[source]
    pub source: StorageError,
}

#[derive(Debug, Error)]
pub enum EnsureCustomerError<E> {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Index(#[from] DualIndexError),

    #[error("creating the remote customer failed: {0}")]
    Create(E),
}

/// Outcome of deleting both customer indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerDeleteReport {
    pub by_chat: DeleteReport,
    pub by_id: DeleteReport,
}

impl CustomerDeleteReport {
    pub fn is_complete(&self) -> bool {
        self.by_chat.is_complete() && self.by_id.is_complete()
    }

    /// Indices with at least one tier pending reconciliation.
    pub fn incomplete_indices(&self) -> Vec<CustomerIndex> {
        let mut indices = Vec::new();
        if !self.by_chat.is_complete() {
            indices.push(CustomerIndex::ByChat);
        }
        if !self.by_id.is_complete() {
            indices.push(CustomerIndex::ById);
        }
        indices
    }
}

#[derive(Clone)]
pub struct CustomerRepository {
    storage: UnifiedStorage,
}

impl CustomerRepository {
    pub fn new(storage: UnifiedStorage) -> Self {
        Self { storage }
    }

    pub async fn find_by_chat(&self, chat_id: i64) -> Result<Option<Customer>, StorageError> {
        self.storage.get_typed(&keys::customer_by_chat(chat_id)).await
    }

    pub async fn find_by_id(&self, customer_id: &str) -> Result<Option<Customer>, StorageError> {
        self.storage.get_typed(&keys::customer_by_id(customer_id)).await
    }

    /// Write both indices. Succeeds only if both writes succeed.
    pub async fn save(&self, customer: &Customer) -> Result<(), DualIndexError> {
        self.storage
            .set_typed(&keys::customer_by_chat(customer.telegram_chat_id), customer)
            .await
            .map_err(|source| DualIndexError {
                index: CustomerIndex::ByChat,
                source,
            })?;
        self.storage
            .set_typed(&keys::customer_by_id(&customer.unthread_customer_id), customer)
            .await
            .map_err(|source| DualIndexError {
                index: CustomerIndex::ById,
                source,
            })?;
        Ok(())
    }

    /// Delete both indices.
    pub async fn delete(&self, customer: &Customer) -> CustomerDeleteReport {
        CustomerDeleteReport {
            by_chat: self
                .storage
                .delete(&keys::customer_by_chat(customer.telegram_chat_id))
                .await,
            by_id: self
                .storage
                .delete(&keys::customer_by_id(&customer.unthread_customer_id))
                .await,
        }
    }

    /// Re-key `customer` under `chat_id` after its chat changed id.
    pub async fn move_to_chat(&self, customer: &Customer, chat_id: i64) -> Result<Customer, DualIndexError> {
        let mut moved = customer.clone();
        moved.telegram_chat_id = chat_id;
        self.save(&moved).await?;
        let report = self
            .storage
            .delete(&keys::customer_by_chat(customer.telegram_chat_id))
            .await;
        info!(
            customer_id = %customer.unthread_customer_id,
            from = customer.telegram_chat_id,
            to = chat_id,
            complete = report.is_complete(),
            "Customer moved to new chat"
        );
        Ok(moved)
    }

    /// Return the chat's customer, creating it through `create` only when
    /// none is stored yet.
    ///
    /// `create` returns the remote customer id.
    pub async fn ensure_for_chat<F, Fut, E>(
        &self,
        chat_id: i64,
        display_name: &str,
        create: F,
    ) -> Result<Customer, EnsureCustomerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        if let Some(existing) = self.find_by_chat(chat_id).await? {
            return Ok(existing);
        }

        let remote_id = create().await.map_err(EnsureCustomerError::Create)?;
        let customer = Customer::new(remote_id, chat_id, display_name);
        self.save(&customer).await?;
        info!(
            chat_id,
            customer_id = %customer.unthread_customer_id,
            "Customer created for chat"
        );
        Ok(customer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_storage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_both_indices_resolve_to_same_record() {
        let repo = CustomerRepository::new(memory_storage());
        let customer = Customer::new("cu_1", 555, "Acme");
        repo.save(&customer).await.unwrap();

        assert_eq!(repo.find_by_chat(555).await.unwrap(), Some(customer.clone()));
        assert_eq!(repo.find_by_id("cu_1").await.unwrap(), Some(customer));
    }

    #[tokio::test]
    async fn test_delete_removes_both_indices() {
        let repo = CustomerRepository::new(memory_storage());
        let customer = Customer::new("cu_1", 555, "Acme");
        repo.save(&customer).await.unwrap();

        let report = repo.delete(&customer).await;
        assert!(report.is_complete());
        assert!(report.incomplete_indices().is_empty());
        assert_eq!(repo.find_by_chat(555).await.unwrap(), None);
        assert_eq!(repo.find_by_id("cu_1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_move_to_chat_rekeys_by_chat_index() {
        let repo = CustomerRepository::new(memory_storage());
        let customer = Customer::new("cu_1", -555, "Acme");
        repo.save(&customer).await.unwrap();

        let moved = repo.move_to_chat(&customer, -100_555).await.unwrap();
        assert_eq!(repo.find_by_chat(-555).await.unwrap(), None);
        assert_eq!(repo.find_by_chat(-100_555).await.unwrap(), Some(moved.clone()));
        assert_eq!(repo.find_by_id("cu_1").await.unwrap(), Some(moved));
    }

    #[tokio::test]
    async fn test_ensure_creates_once() {
        let repo = CustomerRepository::new(memory_storage());
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let customer = repo
                .ensure_for_chat(555, "Acme", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::convert::Infallible>("cu_new".to_string())
                })
                .await
                .unwrap();
            assert_eq!(customer.unthread_customer_id, "cu_new");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_surfaces_create_failure() {
        let repo = CustomerRepository::new(memory_storage());
        let result = repo
            .ensure_for_chat(555, "Acme", || async { Err::<String, _>("boom") })
            .await;
        assert!(matches!(result, Err(EnsureCustomerError::Create("boom"))));
        assert_eq!(repo.find_by_chat(555).await.unwrap(), None);
    }
}
