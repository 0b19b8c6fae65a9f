use anyhow::{Context, Result};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use super::{require_text, TaskHandlers, ValidationError, TARGET};
use crate::handlers::state::{LastInteraction, PagePreferences, PagePreferencesMap, PageStatsMap};
use crate::persistence::{encode, keys, load_or_default, sanitize_meta, InteractionLogRecord};
use crate::queue::{TaskKind, UserActionPayload};
use crate::service::events::ServiceEvent;
use crate::telemetry::events::record_task_dropped;
use crate::util::{now_ms, origin_of};

struct UserAction {
    url: String,
    action_type: String,
    meta: Map<String, JsonValue>,
}

impl TryFrom<UserActionPayload> for UserAction {
    type Error = ValidationError;

    fn try_from(payload: UserActionPayload) -> Result<Self, Self::Error> {
        Ok(Self {
            url: require_text(payload.url, ValidationError::MissingUrl)?,
            action_type: require_text(payload.action_type, ValidationError::MissingActionType)?,
            meta: sanitize_meta(&payload.meta),
        })
    }
}

impl TaskHandlers {
    pub(crate) async fn handle_user_action(&self, payload: UserActionPayload) -> Result<()> {
        let action = match UserAction::try_from(payload) {
            Ok(action) => action,
            Err(err) => {
                record_task_dropped(TaskKind::UserAction.as_str(), &err.to_string());
                return Ok(());
            }
        };

        let origin = origin_of(&action.url);
        let timestamp = now_ms();
        let kv = self.deps.kv.as_ref();

        let mut stats: PageStatsMap = load_or_default(kv, keys::PAGE_STATS).await?;
        let mut preferences: PagePreferencesMap =
            load_or_default(kv, keys::PAGE_PREFERENCES).await?;

        let entry = stats.entry(origin.clone()).or_default();
        entry.visits = entry.visits.saturating_add(1);
        entry.last_interaction = Some(LastInteraction {
            action_type: action.action_type.clone(),
            meta: action.meta.clone(),
            timestamp,
        });
        let visits = entry.visits;

        let personalized = visits >= self.settings.preference_visit_threshold;
        if personalized {
            let color = preferred_color(&action.meta)
                .unwrap_or_else(|| self.settings.fallback_highlight_color.clone());
            preferences.insert(
                origin.clone(),
                PagePreferences {
                    highlight_color: color,
                    last_updated: timestamp,
                },
            );
        }

        kv.set_many(vec![
            encode(keys::PAGE_STATS, &stats)?,
            encode(keys::PAGE_PREFERENCES, &preferences)?,
        ])
        .await
        .context("failed to persist page stats and preferences")?;

        self.trace_detail(
            "user action recorded",
            &format!("origin={origin} type={} visits={visits}", action.action_type),
        );

        self.deps
            .records
            .put_interaction_log(InteractionLogRecord {
                id: String::new(),
                url: action.url,
                origin: origin.clone(),
                action_type: action.action_type,
                meta: action.meta,
                timestamp,
            })
            .await
            .context("failed to append interaction log")?;

        if personalized {
            debug!(target: TARGET, %origin, visits, "preferences refreshed");
            self.emit(ServiceEvent::apply_now(origin));
        }
        Ok(())
    }
}

fn preferred_color(meta: &Map<String, JsonValue>) -> Option<String> {
    meta.get("preferredColor")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|color| !color.is_empty())
        .map(str::to_string)
}
