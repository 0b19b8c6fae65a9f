//! Durable state: the key-value store and the indexed record store, both
//! backed by one SQLite database.

mod migrations;
pub mod records;
pub mod sqlite;


use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;

pub use records::{
    sanitize_meta, truncate_text, InteractionLogRecord, PageContext, PageFeatureRecord, PageSource,
};
pub use sqlite::{
    IndexKey, InteractionLogIndex, PageFeatureIndex, SqliteConfig, SqlitePath, SqlitePersistence,
};

/// Names of the values kept in the key-value store.
pub mod keys {
    pub const ACTION_QUEUE: &str = "actionQueue";
    pub const PAGE_STATS: &str = "pageStats";
    pub const PAGE_PREFERENCES: &str = "pagePreferences";
    pub const DEBUG_MODE: &str = "debugMode";
    pub const API_KEY: &str = "apiKey";
}

/// Durable get/set of named JSON values.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>>;

    /// Writes all entries atomically.
    async fn set_many(&self, entries: Vec<(String, JsonValue)>) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<bool>;

    async fn set(&self, key: &str, value: JsonValue) -> Result<()> {
        self.set_many(vec![(key.to_string(), value)]).await
    }
}

/// Indexed tables of page-feature snapshots and interaction logs.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put_page_feature(&self, record: PageFeatureRecord) -> Result<String>;

    async fn put_interaction_log(&self, record: InteractionLogRecord) -> Result<String>;

    async fn get_page_feature(&self, id: &str) -> Result<Option<PageFeatureRecord>>;

    async fn query_page_features(
        &self,
        index: PageFeatureIndex,
        key: IndexKey,
    ) -> Result<Vec<PageFeatureRecord>>;

    async fn query_interaction_logs(
        &self,
        index: InteractionLogIndex,
        key: IndexKey,
    ) -> Result<Vec<InteractionLogRecord>>;
}

impl SqlitePersistence {
    async fn blocking<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&SqlitePersistence) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let persistence = self.clone();
        tokio::task::spawn_blocking(move || task(&persistence))
            .await
            .context("SQLite worker terminated unexpectedly")?
    }
}

#[async_trait]
impl KeyValueStore for SqlitePersistence {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        let key = key.to_string();
        self.blocking(move |db| db.kv_get(&key)).await
    }

    async fn set_many(&self, entries: Vec<(String, JsonValue)>) -> Result<()> {
        self.blocking(move |db| db.kv_set_many(&entries)).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.blocking(move |db| db.kv_remove(&key)).await
    }
}

#[async_trait]
impl RecordStore for SqlitePersistence {
    async fn put_page_feature(&self, record: PageFeatureRecord) -> Result<String> {
        self.blocking(move |db| db.upsert_page_feature(record)).await
    }

    async fn put_interaction_log(&self, record: InteractionLogRecord) -> Result<String> {
        self.blocking(move |db| db.insert_interaction_log(record))
            .await
    }

    async fn get_page_feature(&self, id: &str) -> Result<Option<PageFeatureRecord>> {
        let id = id.to_string();
        self.blocking(move |db| db.load_page_feature(&id)).await
    }

    async fn query_page_features(
        &self,
        index: PageFeatureIndex,
        key: IndexKey,
    ) -> Result<Vec<PageFeatureRecord>> {
        self.blocking(move |db| db.page_features_by(index, &key))
            .await
    }

    async fn query_interaction_logs(
        &self,
        index: InteractionLogIndex,
        key: IndexKey,
    ) -> Result<Vec<InteractionLogRecord>> {
        self.blocking(move |db| db.interaction_logs_by(index, &key))
            .await
    }
}

/// Reads a typed value, falling back to `T::default()` when the key is
/// missing or holds something that no longer decodes.
pub async fn load_or_default<T>(store: &dyn KeyValueStore, key: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(raw) = store.get(key).await? else {
        return Ok(T::default());
    };

    match serde_json::from_value(raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(target: "record_store", key, %err, "discarding undecodable stored value");
            Ok(T::default())
        }
    }
}

pub fn encode<T: Serialize>(key: &str, value: &T) -> Result<(String, JsonValue)> {
    let encoded =
        serde_json::to_value(value).with_context(|| format!("failed to encode value for {key}"))?;
    Ok((key.to_string(), encoded))
}
