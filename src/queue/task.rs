//! Task envelopes accepted by the queue.
//!
//! Payloads are kept in the lenient shape they arrive in; handlers validate
//! them when the task is processed, so a malformed payload is dropped with a
//! logged reason instead of failing the enqueue.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Task {
    UserAction(UserActionPayload),
    SyncHistory,
    PageAnalysis(PageAnalysisPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    UserAction,
    SyncHistory,
    PageAnalysis,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::UserAction => "user_action",
            TaskKind::SyncHistory => "sync_history",
            TaskKind::PageAnalysis => "page_analysis",
        }
    }
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::UserAction(_) => TaskKind::UserAction,
            Task::SyncHistory => TaskKind::SyncHistory,
            Task::PageAnalysis(_) => TaskKind::PageAnalysis,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserActionPayload {
    #[serde(default, deserialize_with = "lenient_string")]
    pub url: Option<String>,
    #[serde(
        default,
        rename = "type",
        alias = "actionType",
        deserialize_with = "lenient_string"
    )]
    pub action_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_object")]
    pub meta: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageAnalysisPayload {
    #[serde(default, deserialize_with = "lenient_string")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub source: Option<String>,
    /// Kept raw; anything that is not a finite number means "now".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_at: Option<JsonValue>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub visual_trend: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub layout_highlights: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub text_sample: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub viewport_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<JsonValue>,
}

/// Non-string values deserialize as `None` rather than failing the payload.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(text) => Some(text),
        _ => None,
    })
}

fn lenient_object<'de, D>(deserializer: D) -> Result<Map<String, JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Object(fields) => fields,
        _ => Map::new(),
    })
}
