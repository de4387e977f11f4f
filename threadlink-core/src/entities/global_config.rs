use super::keys;
use crate::storage::{StorageError, UnifiedStorage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Name of the document holding the bot's message templates.
pub const MESSAGE_TEMPLATES: &str = "message-templates";

/// A named, versioned singleton document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfigDocument<T> {
    pub name: String,
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    #[serde(default)]
    pub updated_by: Option<String>,
    pub data: T,
}

#[derive(Clone)]
pub struct GlobalConfigRepository {
    storage: UnifiedStorage,
}

impl GlobalConfigRepository {
    pub fn new(storage: UnifiedStorage) -> Self {
        Self { storage }
    }

    pub async fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<GlobalConfigDocument<T>>, StorageError> {
        self.storage.get_typed(&keys::global_config(name)).await
    }

    /// Replace the document's data, bumping its version.
    ///
    /// The first write of a name produces version 1.
    pub async fn update<T>(
        &self,
        name: &str,
        data: T,
        updated_by: Option<String>,
    ) -> Result<GlobalConfigDocument<T>, StorageError>
    where
        T: Serialize + DeserializeOwned,
    {
        let current: Option<GlobalConfigDocument<serde_json::Value>> = self.get(name).await?;
        let document = GlobalConfigDocument {
            name: name.to_string(),
            version: current.map_or(0, |doc| doc.version) + 1,
            last_updated: OffsetDateTime::now_utc(),
            updated_by,
            data,
        };
        self.storage
            .set_typed(&keys::global_config(name), &document)
            .await?;
        Ok(document)
    }
}
