//! Record types persisted by the record store and the sanitization applied
//! before they are written.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const META_STRING_LIMIT: usize = 800;
pub const META_ARRAY_LIMIT: usize = 20;
pub const META_ARRAY_STRING_LIMIT: usize = 200;
pub const VISUAL_TREND_LIMIT: usize = 1_200;
pub const LAYOUT_HIGHLIGHTS_LIMIT: usize = 1_200;
pub const VIEWPORT_SUMMARY_LIMIT: usize = 1_200;
pub const CATEGORY_LIMIT: usize = 120;
pub const TEXT_SAMPLE_LIMIT: usize = 2_000;
pub const RAW_RESPONSE_LIMIT: usize = 4_000;

const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PageSource {
    #[default]
    Live,
    History,
}

impl PageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageSource::Live => "live",
            PageSource::History => "history",
        }
    }

    /// Unknown or missing values collapse to `Live`.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|raw| raw.trim().to_ascii_lowercase()).as_deref() {
            Some("history") => PageSource::History,
            _ => PageSource::Live,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    #[serde(default)]
    pub character_count: u64,
    #[serde(default)]
    pub paragraph_count: u64,
    #[serde(default)]
    pub heading_count: u64,
    #[serde(default)]
    pub image_count: u64,
}

impl PageContext {
    /// Reads each counter independently; missing, negative or non-finite
    /// values become zero.
    pub fn from_json(value: Option<&JsonValue>) -> Self {
        let Some(JsonValue::Object(fields)) = value else {
            return Self::default();
        };

        let counter = |name: &str| -> u64 {
            fields
                .get(name)
                .and_then(JsonValue::as_f64)
                .filter(|number| number.is_finite() && *number > 0.0)
                .map(|number| number.min(u64::MAX as f64) as u64)
                .unwrap_or(0)
        };

        Self {
            character_count: counter("characterCount"),
            paragraph_count: counter("paragraphCount"),
            heading_count: counter("headingCount"),
            image_count: counter("imageCount"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageFeatureRecord {
    /// Empty means "assign on write".
    #[serde(default)]
    pub id: String,
    pub url: String,
    pub origin: String,
    #[serde(default)]
    pub source: PageSource,
    #[serde(default)]
    pub title: String,
    pub extracted_at: i64,
    #[serde(default)]
    pub visual_trend: String,
    #[serde(default)]
    pub layout_highlights: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub text_sample: String,
    #[serde(default)]
    pub viewport_summary: String,
    #[serde(default)]
    pub context: PageContext,
    #[serde(default, rename = "rawLLMResponse", skip_serializing_if = "Option::is_none")]
    pub raw_llm_response: Option<String>,
}

impl PageFeatureRecord {
    /// History snapshots are keyed by origin so repeated syncs overwrite.
    pub fn history_id(origin: &str) -> String {
        format!("history:{origin}")
    }

    pub(crate) fn sanitized(mut self) -> Self {
        self.visual_trend = truncate_text(&self.visual_trend, VISUAL_TREND_LIMIT);
        self.layout_highlights = truncate_text(&self.layout_highlights, LAYOUT_HIGHLIGHTS_LIMIT);
        self.viewport_summary = truncate_text(&self.viewport_summary, VIEWPORT_SUMMARY_LIMIT);
        self.category = truncate_text(&self.category, CATEGORY_LIMIT);
        self.text_sample = truncate_text(&self.text_sample, TEXT_SAMPLE_LIMIT);
        self.raw_llm_response = self
            .raw_llm_response
            .as_deref()
            .map(|raw| truncate_text(raw, RAW_RESPONSE_LIMIT));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InteractionLogRecord {
    #[serde(default)]
    pub id: String,
    pub url: String,
    pub origin: String,
    pub action_type: String,
    #[serde(default)]
    pub meta: Map<String, JsonValue>,
    pub timestamp: i64,
}

/// Truncates to at most `limit` characters; cut strings end with `...`.
pub fn truncate_text(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }

    if limit <= ELLIPSIS.len() {
        return value.chars().take(limit).collect();
    }

    let mut truncated: String = value.chars().take(limit - ELLIPSIS.len()).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

/// Keeps only primitive values and arrays of primitives, clamping strings and
/// array lengths. Everything else is dropped.
pub fn sanitize_meta(meta: &Map<String, JsonValue>) -> Map<String, JsonValue> {
    meta.iter()
        .filter_map(|(key, value)| sanitize_meta_value(value).map(|clean| (key.clone(), clean)))
        .collect()
}

fn sanitize_meta_value(value: &JsonValue) -> Option<JsonValue> {
    match value {
        JsonValue::String(text) => Some(JsonValue::String(truncate_text(text, META_STRING_LIMIT))),
        JsonValue::Number(_) | JsonValue::Bool(_) => Some(value.clone()),
        JsonValue::Array(items) => Some(JsonValue::Array(
            items
                .iter()
                .filter_map(|item| match item {
                    JsonValue::String(text) => Some(JsonValue::String(truncate_text(
                        text,
                        META_ARRAY_STRING_LIMIT,
                    ))),
                    JsonValue::Number(_) | JsonValue::Bool(_) => Some(item.clone()),
                    _ => None,
                })
                .take(META_ARRAY_LIMIT)
                .collect(),
        )),
        JsonValue::Null | JsonValue::Object(_) => None,
    }
}
