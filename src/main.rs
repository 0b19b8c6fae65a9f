use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use pagelens_core::bridge;
use pagelens_core::config::ServiceConfig;
use pagelens_core::persistence::{SqliteConfig, SqlitePersistence};
use pagelens_core::service::{BackgroundService, ServiceDeps};
use pagelens_core::telemetry::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = std::env::var_os("PAGELENS_LOG_DIR").map(PathBuf::from);
    let _log_guard = init_tracing(log_dir.as_deref())?;

    let config = ServiceConfig::load()?;
    let db_path = config.resolve_database_path()?;
    info!(target: "native_host", path = %db_path.display(), "opening database");

    let persistence = tokio::task::spawn_blocking(move || {
        SqlitePersistence::bootstrap(SqliteConfig::file(db_path))
    })
    .await
    .context("database bootstrap worker terminated unexpectedly")??;

    let deps = ServiceDeps::from_sqlite(&config, persistence);
    let service = Arc::new(BackgroundService::new(config, deps)?);
    service.start().await?;

    let served = bridge::run(service.clone(), tokio::io::stdin(), tokio::io::stdout()).await;
    service.shutdown().await;
    served
}
