use anyhow::{bail, Context, Result};
use rusqlite::{Connection, Transaction};

pub(crate) const CURRENT_SCHEMA_VERSION: i32 = 3;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS page_features (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    origin TEXT NOT NULL,
    source TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    extracted_at_ms INTEGER NOT NULL,
    visual_trend TEXT NOT NULL DEFAULT '',
    layout_highlights TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL DEFAULT '',
    text_sample TEXT NOT NULL DEFAULT '',
    viewport_summary TEXT NOT NULL DEFAULT '',
    context TEXT NOT NULL DEFAULT '{}',
    raw_llm_response TEXT
);

CREATE INDEX IF NOT EXISTS idx_page_features_origin ON page_features(origin);
CREATE INDEX IF NOT EXISTS idx_page_features_url ON page_features(url);
CREATE INDEX IF NOT EXISTS idx_page_features_category ON page_features(category);
CREATE INDEX IF NOT EXISTS idx_page_features_source ON page_features(source);
CREATE INDEX IF NOT EXISTS idx_page_features_extracted_at ON page_features(extracted_at_ms);
"#;

const SCHEMA_V2: &str = r#"
CREATE TABLE IF NOT EXISTS interaction_logs (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    origin TEXT NOT NULL,
    action_type TEXT NOT NULL,
    meta TEXT NOT NULL DEFAULT '{}',
    timestamp_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_interaction_logs_origin ON interaction_logs(origin);
CREATE INDEX IF NOT EXISTS idx_interaction_logs_url ON interaction_logs(url);
CREATE INDEX IF NOT EXISTS idx_interaction_logs_action_type ON interaction_logs(action_type);
CREATE INDEX IF NOT EXISTS idx_interaction_logs_timestamp ON interaction_logs(timestamp_ms);
"#;

const SCHEMA_V3: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
"#;

/// Brings the schema up to `CURRENT_SCHEMA_VERSION`. Every step only creates
/// what is missing, so replaying a step against an upgraded database is a no-op.
pub(crate) fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "database version ({}) is newer than supported schema ({})",
            version,
            CURRENT_SCHEMA_VERSION
        );
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;

    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)
            .with_context(|| format!("migration to version {next_version} failed"))?;
        version = next_version;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    Ok(())
}

pub(crate) fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<()> {
    let script = match version {
        1 => SCHEMA_V1,
        2 => SCHEMA_V2,
        3 => SCHEMA_V3,
        _ => bail!("unknown migration target version: {version}"),
    };

    tx.execute_batch(script)
        .with_context(|| format!("failed to execute schema v{version}"))
}
