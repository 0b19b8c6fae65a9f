//! The background service: owns the task queue, answers extension messages
//! and schedules the periodic history sync.

pub mod events;
pub mod messages;


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value as JsonValue};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::enrichment::{DisabledEnrichment, EnrichmentClient, HttpEnrichmentClient};
use crate::handlers::{HandlerDeps, HandlerSettings, PagePreferencesMap, PageStatsMap, TaskHandlers};
use crate::history::{HistoryBuffer, HttpPageFetcher, PageFetcher};
use crate::persistence::{
    keys, load_or_default, KeyValueStore, PageFeatureIndex, RecordStore, SqlitePersistence,
};
use crate::queue::{QueueError, Task, TaskQueue};
use crate::util::{now_ms, origin_of};

pub use events::ServiceEvent;
pub use messages::{Diagnostics, Message, Response};

const TARGET: &str = "service";
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Collaborators injected into the service.
#[derive(Clone)]
pub struct ServiceDeps {
    pub kv: Arc<dyn KeyValueStore>,
    pub records: Arc<dyn RecordStore>,
    pub enrichment: Arc<dyn EnrichmentClient>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub history: Arc<HistoryBuffer>,
}

impl ServiceDeps {
    /// Production wiring over one SQLite database and the HTTP clients.
    pub fn from_sqlite(config: &ServiceConfig, persistence: SqlitePersistence) -> Self {
        let persistence = Arc::new(persistence);
        let kv: Arc<dyn KeyValueStore> = persistence.clone();
        let enrichment: Arc<dyn EnrichmentClient> = if config.enrichment.enabled {
            Arc::new(HttpEnrichmentClient::new(
                config.enrichment.clone(),
                kv.clone(),
            ))
        } else {
            Arc::new(DisabledEnrichment)
        };

        Self {
            kv,
            records: persistence,
            enrichment,
            fetcher: Arc::new(HttpPageFetcher::new(
                config.history.fetch_timeout(),
                config.history.max_body_bytes,
            )),
            history: Arc::new(HistoryBuffer::default()),
        }
    }
}

pub struct BackgroundService {
    config: ServiceConfig,
    queue: TaskQueue,
    kv: Arc<dyn KeyValueStore>,
    records: Arc<dyn RecordStore>,
    history: Arc<HistoryBuffer>,
    debug_mode: Arc<AtomicBool>,
    events_tx: broadcast::Sender<ServiceEvent>,
    history_timer: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundService {
    pub fn new(config: ServiceConfig, deps: ServiceDeps) -> Result<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let debug_mode = Arc::new(AtomicBool::new(false));

        let handlers = TaskHandlers::new(
            HandlerDeps {
                kv: deps.kv.clone(),
                records: deps.records.clone(),
                enrichment: deps.enrichment,
                history: deps.history.clone(),
                fetcher: deps.fetcher,
            },
            HandlerSettings::from(&config),
            debug_mode.clone(),
            events_tx.clone(),
        )
        .context("failed to build task handlers")?;

        let queue = TaskQueue::new(deps.kv.clone(), Arc::new(handlers));

        Ok(Self {
            config,
            queue,
            kv: deps.kv,
            records: deps.records,
            history: deps.history,
            debug_mode,
            events_tx,
            history_timer: Mutex::new(None),
        })
    }

    /// Restores persisted state, resumes queued tasks and starts the history
    /// timer.
    pub async fn start(&self) -> Result<()> {
        let enabled = match self.kv.get(keys::DEBUG_MODE).await? {
            Some(JsonValue::Bool(enabled)) => enabled,
            _ => false,
        };
        self.debug_mode.store(enabled, Ordering::Relaxed);

        let restored = self.queue.init().await?;
        self.start_history_timer(self.config.history.sync_interval());

        info!(
            target: TARGET,
            restored,
            debug_mode = enabled,
            sync_interval_secs = self.config.history.sync_interval_secs,
            "background service started"
        );
        Ok(())
    }

    pub(crate) fn start_history_timer(&self, period: Duration) {
        let queue = self.queue.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                match queue.enqueue(Task::SyncHistory).await {
                    Ok(()) => debug!(target: TARGET, "scheduled history sync"),
                    Err(QueueError::Closed) => break,
                }
            }
        });

        let previous = self.lock_timer().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events_tx.subscribe()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode.load(Ordering::Relaxed)
    }

    /// Single entry point for every extension message.
    pub async fn handle_message(&self, message: Message) -> Result<Response> {
        let name = message.name();
        if self.debug_mode() {
            info!(target: TARGET, message = name, "handling message");
        } else {
            debug!(target: TARGET, message = name, "handling message");
        }

        match message {
            Message::RecordUserAction { payload } => {
                self.queue.enqueue(Task::UserAction(payload)).await?;
                Ok(Response::queued())
            }
            Message::SubmitPageAnalysis { payload } => {
                self.queue.enqueue(Task::PageAnalysis(payload)).await?;
                Ok(Response::queued())
            }
            Message::GetPersonalization { url } => {
                let preferences: PagePreferencesMap =
                    load_or_default(self.kv.as_ref(), keys::PAGE_PREFERENCES).await?;
                Ok(Response::Personalization {
                    preferences: preferences.get(&origin_of(&url)).cloned(),
                })
            }
            Message::GetDebugMode => Ok(Response::DebugMode {
                enabled: self.debug_mode(),
            }),
            Message::SetDebugMode { enabled } => {
                self.kv
                    .set(keys::DEBUG_MODE, json!(enabled))
                    .await
                    .context("failed to persist debug mode")?;
                self.debug_mode.store(enabled, Ordering::Relaxed);
                info!(target: TARGET, enabled, "debug mode updated");
                Ok(Response::DebugMode { enabled })
            }
            Message::GetDiagnostics => self.diagnostics().await.map(Response::Diagnostics),
            Message::SyncHistory { entries } => {
                let accepted = self.history.record(entries);
                debug!(target: TARGET, accepted, buffered = self.history.len(), "history entries recorded");
                self.queue.enqueue(Task::SyncHistory).await?;
                Ok(Response::queued())
            }
            Message::SetApiKey { api_key } => {
                let api_key = api_key.trim();
                if api_key.is_empty() {
                    self.kv
                        .remove(keys::API_KEY)
                        .await
                        .context("failed to clear api key")?;
                    info!(target: TARGET, "enrichment credential cleared");
                    Ok(Response::ApiKey { stored: false })
                } else {
                    self.kv
                        .set(keys::API_KEY, json!(api_key))
                        .await
                        .context("failed to store api key")?;
                    info!(target: TARGET, "enrichment credential stored");
                    Ok(Response::ApiKey { stored: true })
                }
            }
            Message::GetPageFeatures { url } => {
                let features = self
                    .records
                    .query_page_features(PageFeatureIndex::Origin, origin_of(&url).into())
                    .await?;
                Ok(Response::PageFeatures { features })
            }
        }
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        let stats: PageStatsMap = load_or_default(self.kv.as_ref(), keys::PAGE_STATS).await?;
        let preferences: PagePreferencesMap =
            load_or_default(self.kv.as_ref(), keys::PAGE_PREFERENCES).await?;

        Ok(Diagnostics {
            queue_length: self.queue.len(),
            processing: self.queue.is_processing(),
            debug_mode: self.debug_mode(),
            tracked_pages: stats.len(),
            pages_with_preferences: preferences.len(),
            timestamp: now_ms(),
        })
    }

    /// Stops the timer and the queue. Tasks not yet claimed stay persisted.
    pub async fn shutdown(&self) {
        let timer = self.lock_timer().take();
        if let Some(handle) = timer {
            handle.abort();
        }
        self.queue.shutdown().await;
        info!(target: TARGET, "background service stopped");
    }

    fn lock_timer(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.history_timer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(target: TARGET, "history timer lock poisoned");
                poisoned.into_inner()
            }
        }
    }
}
