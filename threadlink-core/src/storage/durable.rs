//! Durable tier backed by PostgreSQL.
//!
//! All entities live in a single `storage_entries` table keyed by the
//! storage key; the `namespace` column (the key up to the first `:`) is
//! generated by the database for inspection queries. The durable tier is
//! the record of truth and keeps entries until they are deleted.

use super::{CacheTier, TierError, TierKind};
use crate::framework::DatabaseProcessor;
use async_trait::async_trait;
use kanau::processor::Processor;
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StorageEntry {
    pub key: String,
    pub value: Value,
    pub created_at: time::OffsetDateTime,
    pub updated_at: time::OffsetDateTime,
}

#[derive(Debug, Clone)]
/// Fetch one entry by key.
pub struct GetStorageEntry {
    pub key: String,
}

impl Processor<GetStorageEntry> for DatabaseProcessor {
    type Output = Option<StorageEntry>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetStorageEntry")]
    async fn process(&self, query: GetStorageEntry) -> Result<Option<StorageEntry>, sqlx::Error> {
        sqlx::query_as::<_, StorageEntry>(
            r#"
            SELECT key, value, created_at, updated_at
            FROM storage_entries
            WHERE key = $1
            "#,
        )
        .bind(query.key)
        .fetch_optional(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
/// Insert or replace an entry.
pub struct UpsertStorageEntry {
    pub key: String,
    pub value: Value,
}

impl Processor<UpsertStorageEntry> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:UpsertStorageEntry")]
    async fn process(&self, upsert: UpsertStorageEntry) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO storage_entries (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(upsert.key)
        .bind(upsert.value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// Delete an entry. Returns whether a row was removed.
pub struct DeleteStorageEntry {
    pub key: String,
}

impl Processor<DeleteStorageEntry> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:DeleteStorageEntry")]
    async fn process(&self, delete: DeleteStorageEntry) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM storage_entries
            WHERE key = $1
            "#,
        )
        .bind(delete.key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone)]
/// Count entries per namespace, for the readiness report.
pub struct CountEntriesByNamespace;

impl Processor<CountEntriesByNamespace> for DatabaseProcessor {
    type Output = Vec<(String, i64)>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:CountEntriesByNamespace")]
    async fn process(&self, _: CountEntriesByNamespace) -> Result<Vec<(String, i64)>, sqlx::Error> {
        sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT namespace, COUNT(*)
            FROM storage_entries
            GROUP BY namespace
            ORDER BY namespace
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }
}

/// The PostgreSQL tier.
#[derive(Clone)]
pub struct PostgresTier {
    processor: DatabaseProcessor,
}

impl PostgresTier {
    pub fn new(pool: PgPool) -> Self {
        Self {
            processor: DatabaseProcessor { pool },
        }
    }

    pub async fn namespace_counts(&self) -> Result<Vec<(String, i64)>, TierError> {
        Ok(self.processor.process(CountEntriesByNamespace).await?)
    }
}

#[async_trait]
impl CacheTier for PostgresTier {
    fn kind(&self) -> TierKind {
        TierKind::Durable
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, TierError> {
        let entry = self
            .processor
            .process(GetStorageEntry {
                key: key.to_string(),
            })
            .await?;
        Ok(entry.map(|e| e.value))
    }

    async fn set(&self, key: &str, value: &Value, _ttl: Option<Duration>) -> Result<(), TierError> {
        self.processor
            .process(UpsertStorageEntry {
                key: key.to_string(),
                value: value.clone(),
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.processor
            .process(DeleteStorageEntry {
                key: key.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), TierError> {
        sqlx::query("SELECT 1")
            .execute(&self.processor.pool)
            .await?;
        Ok(())
    }
}
