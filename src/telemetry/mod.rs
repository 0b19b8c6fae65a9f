//! Tracing bootstrap. Logs go to stderr because stdout carries the native
//! messaging protocol.

pub mod events;

use std::path::Path;

use anyhow::{anyhow, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Installs the global subscriber. When `log_dir` is set a daily rolling file
/// layer is added; keep the returned guard alive to flush it.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pagelens-host.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().json().with_writer(writer);
            let subscriber = Registry::default()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer);
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|err| anyhow!("failed to set global subscriber: {err}"))?;
            Ok(Some(guard))
        }
        None => {
            let subscriber = Registry::default().with(env_filter).with(stderr_layer);
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|err| anyhow!("failed to set global subscriber: {err}"))?;
            Ok(None)
        }
    }
}
