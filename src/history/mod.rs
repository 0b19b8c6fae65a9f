//! Browsing history input for the periodic sync.
//!
//! The host cannot read the browser's history database directly; the
//! extension reports visits with `SYNC_HISTORY` and they are buffered here
//! until the next sync reads them.

pub mod fetch;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::util::origin_of;

pub use fetch::{HttpPageFetcher, PageFetcher};

pub const DEFAULT_BUFFER_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryVisit {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Epoch milliseconds; browsers report this as a float.
    #[serde(default)]
    pub last_visit_time: f64,
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Visits at or after `since_ms`, most recent first, at most `limit`.
    async fn recent_visits(&self, since_ms: i64, limit: usize) -> Result<Vec<HistoryVisit>>;
}

/// Bounded in-memory store of reported visits. The oldest visits are
/// evicted first once `capacity` is reached.
#[derive(Debug)]
pub struct HistoryBuffer {
    visits: Mutex<Vec<HistoryVisit>>,
    capacity: usize,
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }
}

impl HistoryBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            visits: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Adds visits, ignoring entries without a usable url. Returns how many
    /// were accepted.
    pub fn record<I>(&self, visits: I) -> usize
    where
        I: IntoIterator<Item = HistoryVisit>,
    {
        let mut stored = self.lock();
        let mut accepted = 0;
        for visit in visits {
            if visit.url.trim().is_empty() || !visit.last_visit_time.is_finite() {
                continue;
            }
            stored.push(visit);
            accepted += 1;
        }

        if stored.len() > self.capacity {
            stored.sort_by(|a, b| b.last_visit_time.total_cmp(&a.last_visit_time));
            stored.truncate(self.capacity);
        }
        accepted
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HistoryVisit>> {
        match self.visits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl HistorySource for HistoryBuffer {
    async fn recent_visits(&self, since_ms: i64, limit: usize) -> Result<Vec<HistoryVisit>> {
        let mut visits: Vec<HistoryVisit> = self
            .lock()
            .iter()
            .filter(|visit| visit.last_visit_time >= since_ms as f64)
            .cloned()
            .collect();
        visits.sort_by(|a, b| b.last_visit_time.total_cmp(&a.last_visit_time));
        visits.truncate(limit);
        Ok(visits)
    }
}

/// Keeps the most recently visited entry per origin, ordered most recent
/// first.
pub fn latest_per_origin(visits: Vec<HistoryVisit>) -> Vec<(String, HistoryVisit)> {
    let mut latest: HashMap<String, HistoryVisit> = HashMap::new();
    for visit in visits {
        let origin = origin_of(&visit.url);
        match latest.get(&origin) {
            Some(existing) if existing.last_visit_time >= visit.last_visit_time => {}
            _ => {
                latest.insert(origin, visit);
            }
        }
    }

    let mut entries: Vec<(String, HistoryVisit)> = latest.into_iter().collect();
    entries.sort_by(|(origin_a, a), (origin_b, b)| {
        b.last_visit_time
            .total_cmp(&a.last_visit_time)
            .then_with(|| origin_a.cmp(origin_b))
    });
    entries
}
