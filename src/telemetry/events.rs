use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::util::duration_to_ms;

pub(crate) const TARGET: &str = "telemetry::tasks";
pub(crate) const EVENT_TASK_COMPLETED: &str = "task_completed";
pub(crate) const EVENT_TASK_FAILED: &str = "task_failed";
pub(crate) const EVENT_TASK_DROPPED: &str = "task_dropped";
pub(crate) const EVENT_HISTORY_SYNC: &str = "history_sync_summary";

#[derive(Debug, Serialize)]
pub struct TaskOutcomeEvent<'a> {
    pub kind: &'static str,
    pub outcome: &'static str,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct TaskDroppedEvent<'a> {
    pub kind: &'static str,
    pub reason: &'a str,
}

#[derive(Debug, Serialize, Clone, Default, PartialEq, Eq)]
pub struct HistorySyncSummary {
    pub entries: usize,
    pub origins: usize,
    pub stored: usize,
    pub failed: usize,
    pub enriched: usize,
    pub fetch_failed: usize,
    /// Unreachable origins that kept an earlier snapshot.
    pub retained: usize,
}

pub fn record_task_completed(kind: &'static str, latency: Duration) {
    let event = TaskOutcomeEvent {
        kind,
        outcome: "completed",
        latency_ms: duration_to_ms(latency),
        error: None,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_TASK_COMPLETED,
            kind = event.kind,
            latency_ms = event.latency_ms,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_TASK_COMPLETED,
            %err,
            "failed to encode task completion event"
        ),
    }
}

pub fn record_task_failed(kind: &'static str, latency: Duration, error: &str) {
    let event = TaskOutcomeEvent {
        kind,
        outcome: "failed",
        latency_ms: duration_to_ms(latency),
        error: Some(error),
    };

    match serde_json::to_string(&event) {
        Ok(payload) => warn!(
            target: TARGET,
            event = EVENT_TASK_FAILED,
            kind = event.kind,
            latency_ms = event.latency_ms,
            error,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_TASK_FAILED,
            %err,
            "failed to encode task failure event"
        ),
    }
}

/// A payload that failed validation; the task is consumed without effect.
pub fn record_task_dropped(kind: &'static str, reason: &str) {
    let event = TaskDroppedEvent { kind, reason };

    match serde_json::to_string(&event) {
        Ok(payload) => warn!(
            target: TARGET,
            event = EVENT_TASK_DROPPED,
            kind,
            reason,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_TASK_DROPPED,
            %err,
            "failed to encode dropped task event"
        ),
    }
}

pub fn record_history_sync(summary: &HistorySyncSummary) {
    match serde_json::to_string(summary) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_HISTORY_SYNC,
            entries = summary.entries,
            origins = summary.origins,
            stored = summary.stored,
            failed = summary.failed,
            fetch_failed = summary.fetch_failed,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_HISTORY_SYNC,
            %err,
            "failed to encode history sync summary"
        ),
    }
}
