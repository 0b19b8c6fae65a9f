use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::migrations::run_migrations;
use super::records::{
    sanitize_meta, InteractionLogRecord, PageContext, PageFeatureRecord, PageSource,
};
use crate::util::now_ms;

const PAGE_FEATURE_COLUMNS: &str = "id, url, origin, source, title, extracted_at_ms, \
    visual_trend, layout_highlights, category, text_sample, viewport_summary, context, \
    raw_llm_response";

const INTERACTION_LOG_COLUMNS: &str = "id, url, origin, action_type, meta, timestamp_ms";

/// Storage location for the SQLite database.
#[derive(Debug, Clone)]
pub enum SqlitePath {
    File(PathBuf),
    Memory,
}

impl SqlitePath {
    fn to_manager(&self) -> SqliteConnectionManager {
        match self {
            SqlitePath::File(path) => {
                SqliteConnectionManager::file(path).with_flags(Self::open_flags())
            }
            SqlitePath::Memory => SqliteConnectionManager::memory().with_flags(Self::open_flags()),
        }
    }

    fn open_flags() -> OpenFlags {
        OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
    }

    fn as_path(&self) -> Option<&Path> {
        match self {
            SqlitePath::File(path) => Some(path.as_path()),
            SqlitePath::Memory => None,
        }
    }
}

/// Configuration required to bootstrap SQLite persistence.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub path: SqlitePath,
    pub pool_size: u32,
    pub busy_timeout: Duration,
}

impl SqliteConfig {
    /// In-memory databases are private to one connection, so the pool holds
    /// exactly one.
    pub fn memory() -> Self {
        Self {
            path: SqlitePath::Memory,
            pool_size: 1,
            busy_timeout: Duration::from_millis(250),
        }
    }

    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: SqlitePath::File(path.into()),
            pool_size: 4,
            busy_timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFeatureIndex {
    Origin,
    Url,
    Category,
    Source,
    ExtractedAt,
}

impl PageFeatureIndex {
    fn column(&self) -> &'static str {
        match self {
            PageFeatureIndex::Origin => "origin",
            PageFeatureIndex::Url => "url",
            PageFeatureIndex::Category => "category",
            PageFeatureIndex::Source => "source",
            PageFeatureIndex::ExtractedAt => "extracted_at_ms",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionLogIndex {
    Origin,
    Url,
    ActionType,
    Timestamp,
}

impl InteractionLogIndex {
    fn column(&self) -> &'static str {
        match self {
            InteractionLogIndex::Origin => "origin",
            InteractionLogIndex::Url => "url",
            InteractionLogIndex::ActionType => "action_type",
            InteractionLogIndex::Timestamp => "timestamp_ms",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKey {
    Text(String),
    Integer(i64),
}

impl IndexKey {
    fn to_value(&self) -> Value {
        match self {
            IndexKey::Text(text) => Value::Text(text.clone()),
            IndexKey::Integer(number) => Value::Integer(*number),
        }
    }
}

impl From<&str> for IndexKey {
    fn from(value: &str) -> Self {
        IndexKey::Text(value.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(value: String) -> Self {
        IndexKey::Text(value)
    }
}

impl From<i64> for IndexKey {
    fn from(value: i64) -> Self {
        IndexKey::Integer(value)
    }
}

impl From<PageSource> for IndexKey {
    fn from(value: PageSource) -> Self {
        IndexKey::Text(value.as_str().to_string())
    }
}

/// Handle that manages SQLite backed persistence.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: Pool<SqliteConnectionManager>,
    db_path: Option<PathBuf>,
}

impl SqlitePersistence {
    /// Builds the connection pool and brings the schema up to date.
    pub fn bootstrap(config: SqliteConfig) -> Result<Self> {
        if let Some(parent) = config.path.as_path().and_then(Path::parent) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let busy_timeout = config.busy_timeout;
        let manager = config
            .path
            .to_manager()
            .with_init(move |conn| Self::configure_connection(conn, busy_timeout));

        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .context("failed to create SQLite connection pool")?;

        {
            let mut conn = pool
                .get()
                .context("failed to acquire SQLite bootstrap connection")?;
            run_migrations(&mut conn).context("failed to run SQLite migrations")?;
        }

        Ok(Self {
            pool,
            db_path: config.path.as_path().map(Path::to_path_buf),
        })
    }

    /// Provides access to a pooled connection for custom commands.
    pub fn connection(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|err| anyhow!("failed to obtain SQLite connection: {err}"))
    }

    fn configure_connection(conn: &mut Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        Ok(())
    }

    /// Upserts by primary id and returns the id the record was stored under.
    pub fn upsert_page_feature(&self, record: PageFeatureRecord) -> Result<String> {
        let mut record = record.sanitized();
        record.id = match record.source {
            PageSource::History => PageFeatureRecord::history_id(&record.origin),
            PageSource::Live if record.id.trim().is_empty() => Uuid::new_v4().to_string(),
            PageSource::Live => record.id,
        };

        let context =
            serde_json::to_string(&record.context).context("failed to serialize page context")?;

        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .context("failed to open transaction for page feature upsert")?;

        tx.execute(
            "INSERT INTO page_features (
                id,
                url,
                origin,
                source,
                title,
                extracted_at_ms,
                visual_trend,
                layout_highlights,
                category,
                text_sample,
                viewport_summary,
                context,
                raw_llm_response
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(id) DO UPDATE SET
                url=excluded.url,
                origin=excluded.origin,
                source=excluded.source,
                title=excluded.title,
                extracted_at_ms=excluded.extracted_at_ms,
                visual_trend=excluded.visual_trend,
                layout_highlights=excluded.layout_highlights,
                category=excluded.category,
                text_sample=excluded.text_sample,
                viewport_summary=excluded.viewport_summary,
                context=excluded.context,
                raw_llm_response=excluded.raw_llm_response
            ",
            params![
                record.id,
                record.url,
                record.origin,
                record.source.as_str(),
                record.title,
                record.extracted_at,
                record.visual_trend,
                record.layout_highlights,
                record.category,
                record.text_sample,
                record.viewport_summary,
                context,
                record.raw_llm_response,
            ],
        )
        .context("failed to upsert page feature record")?;

        tx.commit()
            .context("failed to commit page feature upsert")?;
        Ok(record.id)
    }

    pub fn insert_interaction_log(&self, record: InteractionLogRecord) -> Result<String> {
        let id = if record.id.trim().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            record.id
        };
        let meta = serde_json::to_string(&sanitize_meta(&record.meta))
            .context("failed to serialize interaction meta")?;

        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .context("failed to open transaction for interaction log insert")?;

        tx.execute(
            "INSERT INTO interaction_logs (id, url, origin, action_type, meta, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                record.url,
                record.origin,
                record.action_type,
                meta,
                record.timestamp
            ],
        )
        .context("failed to insert interaction log record")?;

        tx.commit()
            .context("failed to commit interaction log insert")?;
        Ok(id)
    }

    pub fn load_page_feature(&self, id: &str) -> Result<Option<PageFeatureRecord>> {
        let conn = self.connection()?;
        let sql = format!("SELECT {PAGE_FEATURE_COLUMNS} FROM page_features WHERE id = ?1");
        let record = conn
            .prepare(&sql)?
            .query_row(params![id], |row| Self::read_page_feature(row))
            .optional()?;
        Ok(record)
    }

    /// All records matching `key` on `index`, newest extraction first.
    pub fn page_features_by(
        &self,
        index: PageFeatureIndex,
        key: &IndexKey,
    ) -> Result<Vec<PageFeatureRecord>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {PAGE_FEATURE_COLUMNS} FROM page_features WHERE {} = ?1 \
             ORDER BY extracted_at_ms DESC",
            index.column()
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![key.to_value()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(Self::read_page_feature(row)?);
        }
        Ok(records)
    }

    pub fn interaction_logs_by(
        &self,
        index: InteractionLogIndex,
        key: &IndexKey,
    ) -> Result<Vec<InteractionLogRecord>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {INTERACTION_LOG_COLUMNS} FROM interaction_logs WHERE {} = ?1 \
             ORDER BY timestamp_ms DESC",
            index.column()
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![key.to_value()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(Self::read_interaction_log(row)?);
        }
        Ok(records)
    }

    pub fn count_page_features(&self) -> Result<i64> {
        let conn = self.connection()?;
        let total = conn.query_row("SELECT COUNT(*) FROM page_features", [], |row| row.get(0))?;
        Ok(total)
    }

    pub fn count_interaction_logs(&self) -> Result<i64> {
        let conn = self.connection()?;
        let total =
            conn.query_row("SELECT COUNT(*) FROM interaction_logs", [], |row| row.get(0))?;
        Ok(total)
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<JsonValue>> {
        let conn = self.connection()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|json| {
            serde_json::from_str::<JsonValue>(&json)
                .with_context(|| format!("corrupt value stored for {key}"))
        })
        .transpose()
    }

    /// Writes every entry in a single transaction.
    pub fn kv_set_many(&self, entries: &[(String, JsonValue)]) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .context("failed to open transaction for key-value write")?;
        let updated_at = now_ms();

        for (key, value) in entries {
            let encoded = serde_json::to_string(value)
                .with_context(|| format!("failed to encode value for {key}"))?;
            tx.execute(
                "INSERT INTO kv_store (key, value, updated_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value=excluded.value,
                    updated_at_ms=excluded.updated_at_ms",
                params![key, encoded, updated_at],
            )
            .with_context(|| format!("failed to write key {key}"))?;
        }

        tx.commit().context("failed to commit key-value write")?;
        Ok(())
    }

    pub fn kv_remove(&self, key: &str) -> Result<bool> {
        let conn = self.connection()?;
        let affected = conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    fn read_page_feature(row: &Row) -> rusqlite::Result<PageFeatureRecord> {
        let context = row
            .get::<_, Option<String>>("context")?
            .and_then(|json| serde_json::from_str::<PageContext>(&json).ok())
            .unwrap_or_default();
        let source: String = row.get("source")?;

        Ok(PageFeatureRecord {
            id: row.get("id")?,
            url: row.get("url")?,
            origin: row.get("origin")?,
            source: PageSource::parse(Some(&source)),
            title: row.get("title")?,
            extracted_at: row.get("extracted_at_ms")?,
            visual_trend: row.get("visual_trend")?,
            layout_highlights: row.get("layout_highlights")?,
            category: row.get("category")?,
            text_sample: row.get("text_sample")?,
            viewport_summary: row.get("viewport_summary")?,
            context,
            raw_llm_response: row.get("raw_llm_response")?,
        })
    }

    fn read_interaction_log(row: &Row) -> rusqlite::Result<InteractionLogRecord> {
        let meta = row
            .get::<_, Option<String>>("meta")?
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();

        Ok(InteractionLogRecord {
            id: row.get("id")?,
            url: row.get("url")?,
            origin: row.get("origin")?,
            action_type: row.get("action_type")?,
            meta,
            timestamp: row.get("timestamp_ms")?,
        })
    }

    pub fn database_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
}

#[cfg(test)]
impl SqlitePersistence {
    pub fn run_migrations_for_tests(conn: &mut Connection) -> Result<()> {
        run_migrations(conn)
    }
}
