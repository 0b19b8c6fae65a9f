//! Request and response envelopes exchanged with the extension.

use serde::{Deserialize, Serialize};

use crate::handlers::state::PagePreferences;
use crate::history::HistoryVisit;
use crate::persistence::PageFeatureRecord;
use crate::queue::{PageAnalysisPayload, UserActionPayload};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    RecordUserAction {
        #[serde(default)]
        payload: UserActionPayload,
    },
    SubmitPageAnalysis {
        #[serde(default)]
        payload: PageAnalysisPayload,
    },
    GetPersonalization {
        url: String,
    },
    GetDebugMode,
    SetDebugMode {
        enabled: bool,
    },
    GetDiagnostics,
    SyncHistory {
        #[serde(default)]
        entries: Vec<HistoryVisit>,
    },
    SetApiKey {
        #[serde(rename = "apiKey", default)]
        api_key: String,
    },
    GetPageFeatures {
        url: String,
    },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::RecordUserAction { .. } => "RECORD_USER_ACTION",
            Message::SubmitPageAnalysis { .. } => "SUBMIT_PAGE_ANALYSIS",
            Message::GetPersonalization { .. } => "GET_PERSONALIZATION",
            Message::GetDebugMode => "GET_DEBUG_MODE",
            Message::SetDebugMode { .. } => "SET_DEBUG_MODE",
            Message::GetDiagnostics => "GET_DIAGNOSTICS",
            Message::SyncHistory { .. } => "SYNC_HISTORY",
            Message::SetApiKey { .. } => "SET_API_KEY",
            Message::GetPageFeatures { .. } => "GET_PAGE_FEATURES",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub queue_length: usize,
    pub processing: bool,
    pub debug_mode: bool,
    pub tracked_pages: usize,
    pub pages_with_preferences: usize,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Response {
    Queued { status: &'static str },
    Personalization { preferences: Option<PagePreferences> },
    DebugMode { enabled: bool },
    Diagnostics(Diagnostics),
    ApiKey { stored: bool },
    PageFeatures { features: Vec<PageFeatureRecord> },
}

impl Response {
    pub fn queued() -> Self {
        Response::Queued { status: "queued" }
    }
}
