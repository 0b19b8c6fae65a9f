//! Persisted single-consumer task queue.
//!
//! Tasks are appended in memory and the full pending list is mirrored to the
//! key-value store. A task is claimed by removing it from the list, so a
//! restart replays only what had not been dequeued yet. Handler failures are
//! logged and the task is dropped: delivery is at-most-once.

pub mod task;


use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::persistence::{keys, KeyValueStore};
use crate::telemetry::events::{record_task_completed, record_task_failed};

pub use task::{PageAnalysisPayload, Task, TaskKind, UserActionPayload};

const TARGET: &str = "task_queue";

/// Routes a claimed task to its handler.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: Task) -> Result<()>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task queue is shut down")]
    Closed,
}

struct QueueInner {
    pending: Mutex<VecDeque<Task>>,
    processing: AtomicBool,
    closed: AtomicBool,
    mirror_lock: tokio::sync::Mutex<()>,
    idle: Notify,
    store: Arc<dyn KeyValueStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .field("processing", &self.is_processing())
            .finish_non_exhaustive()
    }
}

impl TaskQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(VecDeque::new()),
                processing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                mirror_lock: tokio::sync::Mutex::new(()),
                idle: Notify::new(),
                store,
                dispatcher,
            }),
        }
    }

    /// Restores tasks left in the durable mirror by a previous process and
    /// starts draining them. Returns how many tasks were restored.
    pub async fn init(&self) -> Result<usize> {
        let stored = self
            .inner
            .store
            .get(keys::ACTION_QUEUE)
            .await
            .context("failed to read persisted task queue")?;

        let entries = match stored {
            Some(JsonValue::Array(entries)) => entries,
            Some(other) => {
                warn!(target: TARGET, value = %other, "persisted task queue is not a list; ignoring");
                Vec::new()
            }
            None => Vec::new(),
        };

        if self.inner.closed.load(Ordering::SeqCst) {
            debug!(target: TARGET, "queue closed; persisted tasks left for the next run");
            return Ok(0);
        }

        let tasks: Vec<Task> = entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<Task>(entry) {
                Ok(task) => Some(task),
                Err(err) => {
                    warn!(target: TARGET, %err, "skipping undecodable persisted task");
                    None
                }
            })
            .collect();

        // every restored task is pending before any drain snapshots the mirror
        let restored = tasks.len();
        self.lock_pending().extend(tasks);

        if restored > 0 {
            info!(target: TARGET, restored, "resumed tasks from previous run");
            self.schedule_drain();
        }
        Ok(restored)
    }

    /// Appends `task`, replaces the mirror with a snapshot of the whole
    /// pending list and schedules a drain.
    pub async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let kind = task.kind();
        let depth = {
            let mut pending = self.lock_pending();
            pending.push_back(task);
            pending.len()
        };
        debug!(target: TARGET, kind = kind.as_str(), depth, "task enqueued");

        self.persist_snapshot().await;

        self.schedule_drain();
        Ok(())
    }

    /// Processes tasks one at a time until the queue is empty. Returns
    /// immediately if another drain is already running.
    pub async fn drain(&self) {
        loop {
            if self.inner.closed.load(Ordering::SeqCst) || self.lock_pending().is_empty() {
                return;
            }

            if self
                .inner
                .processing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            // shutdown may have completed between the check and the claim
            if self.inner.closed.load(Ordering::SeqCst) {
                self.inner.processing.store(false, Ordering::SeqCst);
                self.inner.idle.notify_waiters();
                return;
            }

            let next = self.lock_pending().pop_front();
            if let Some(task) = next {
                self.persist_snapshot().await;
                self.run_task(task).await;
            }

            self.inner.processing.store(false, Ordering::SeqCst);
            self.inner.idle.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_pending().is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once nothing is pending and no task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.is_processing() && (self.is_empty() || self.is_closed()) {
                return;
            }
            notified.await;
        }
    }

    /// Stops claiming tasks and waits for the running one to finish.
    /// Unclaimed tasks stay in the mirror for the next `init`.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        loop {
            let notified = self.inner.idle.notified();
            if !self.is_processing() {
                break;
            }
            notified.await;
        }
        info!(target: TARGET, remaining = self.len(), "task queue stopped");
    }

    fn schedule_drain(&self) {
        let queue = self.clone();
        tokio::spawn(async move {
            queue.drain().await;
        });
    }

    async fn run_task(&self, task: Task) {
        let kind = task.kind();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.inner.dispatcher.dispatch(task))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => record_task_completed(kind.as_str(), started.elapsed()),
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                record_task_failed(kind.as_str(), started.elapsed(), &message);
            }
            Err(_) => {
                error!(target: TARGET, kind = kind.as_str(), "task handler panicked; task dropped");
                record_task_failed(kind.as_str(), started.elapsed(), "handler panicked");
            }
        }
    }

    async fn persist_snapshot(&self) {
        let _guard = self.inner.mirror_lock.lock().await;
        let snapshot: Vec<Task> = self.lock_pending().iter().cloned().collect();

        let encoded = match serde_json::to_value(&snapshot) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(target: TARGET, %err, "failed to encode task queue snapshot");
                return;
            }
        };

        if let Err(err) = self.inner.store.set(keys::ACTION_QUEUE, encoded).await {
            warn!(
                target: TARGET,
                error = %format!("{err:#}"),
                pending = snapshot.len(),
                "failed to mirror task queue; tasks stay in memory only"
            );
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<Task>> {
        match self.inner.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
