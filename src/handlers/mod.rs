//! Business logic run by the queue for each task kind.

mod history_sync;
mod page_analysis;
pub mod state;
mod user_action;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::analysis::PageParser;
use crate::config::{HistoryConfig, ServiceConfig};
use crate::enrichment::EnrichmentClient;
use crate::history::{HistorySource, PageFetcher};
use crate::persistence::{KeyValueStore, RecordStore};
use crate::queue::{Task, TaskDispatcher};
use crate::service::events::ServiceEvent;

pub use state::{LastInteraction, PagePreferences, PagePreferencesMap, PageStats, PageStatsMap};

const TARGET: &str = "handlers";

/// Why a payload was dropped without effect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing or empty url")]
    MissingUrl,
    #[error("missing or empty action type")]
    MissingActionType,
}

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub preference_visit_threshold: u64,
    pub fallback_highlight_color: String,
    pub history: HistoryConfig,
}

impl From<&ServiceConfig> for HandlerSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            preference_visit_threshold: config.preference_visit_threshold,
            fallback_highlight_color: config.fallback_highlight_color.clone(),
            history: config.history.clone(),
        }
    }
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

/// External collaborators the handlers call into.
#[derive(Clone)]
pub struct HandlerDeps {
    pub kv: Arc<dyn KeyValueStore>,
    pub records: Arc<dyn RecordStore>,
    pub enrichment: Arc<dyn EnrichmentClient>,
    pub history: Arc<dyn HistorySource>,
    pub fetcher: Arc<dyn PageFetcher>,
}

pub struct TaskHandlers {
    deps: HandlerDeps,
    settings: HandlerSettings,
    parser: PageParser,
    debug_mode: Arc<AtomicBool>,
    events: broadcast::Sender<ServiceEvent>,
}

impl TaskHandlers {
    pub fn new(
        deps: HandlerDeps,
        settings: HandlerSettings,
        debug_mode: Arc<AtomicBool>,
        events: broadcast::Sender<ServiceEvent>,
    ) -> Result<Self> {
        Ok(Self {
            deps,
            settings,
            parser: PageParser::new()?,
            debug_mode,
            events,
        })
    }

    fn debug_enabled(&self) -> bool {
        self.debug_mode.load(Ordering::Relaxed)
    }

    /// Detail logging that is promoted to `info` while debug mode is on.
    fn trace_detail(&self, message: &str, detail: &str) {
        if self.debug_enabled() {
            info!(target: TARGET, detail, "{message}");
        } else {
            debug!(target: TARGET, detail, "{message}");
        }
    }

    fn emit(&self, event: ServiceEvent) {
        // no receivers simply means no page is listening
        if self.events.send(event).is_err() {
            debug!(target: TARGET, "no event subscribers");
        }
    }
}

#[async_trait]
impl TaskDispatcher for TaskHandlers {
    async fn dispatch(&self, task: Task) -> Result<()> {
        match task {
            Task::UserAction(payload) => self.handle_user_action(payload).await,
            Task::SyncHistory => self.handle_history_sync().await.map(|_| ()),
            Task::PageAnalysis(payload) => self.handle_page_analysis(payload).await,
        }
    }
}

pub(crate) fn require_text(value: Option<String>, missing: ValidationError) -> Result<String, ValidationError> {
    match value {
        Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        _ => Err(missing),
    }
}
