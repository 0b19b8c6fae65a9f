//! Shapes of the per-origin maps kept in the key-value store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub type PageStatsMap = BTreeMap<String, PageStats>;
pub type PagePreferencesMap = BTreeMap<String, PagePreferences>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageStats {
    #[serde(default)]
    pub visits: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interaction: Option<LastInteraction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastInteraction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub meta: Map<String, JsonValue>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PagePreferences {
    pub highlight_color: String,
    pub last_updated: i64,
}
