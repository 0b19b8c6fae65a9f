use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::{require_text, TaskHandlers, ValidationError, TARGET};
use crate::analysis::{classify, heuristic_visual_trend};
use crate::enrichment::prompt::{visual_summary_prompt, PagePromptInput};
use crate::enrichment::{Completion, EnrichmentError};
use crate::handlers::state::PagePreferencesMap;
use crate::persistence::{keys, load_or_default, PageContext, PageFeatureRecord, PageSource};
use crate::queue::{PageAnalysisPayload, TaskKind};
use crate::service::events::ServiceEvent;
use crate::telemetry::events::record_task_dropped;
use crate::util::{now_ms, origin_of};

impl TaskHandlers {
    pub(crate) async fn handle_page_analysis(&self, payload: PageAnalysisPayload) -> Result<()> {
        let url = match require_text(payload.url, ValidationError::MissingUrl) {
            Ok(url) => url,
            Err(err) => {
                record_task_dropped(TaskKind::PageAnalysis.as_str(), &err.to_string());
                return Ok(());
            }
        };

        let origin = origin_of(&url);
        let source = PageSource::parse(payload.source.as_deref());
        let extracted_at = extracted_at_or_now(payload.extracted_at.as_ref());
        let context = PageContext::from_json(payload.context.as_ref());
        let title = trimmed(payload.title);
        let text_sample = trimmed(payload.text_sample);
        let layout_highlights = trimmed(payload.layout_highlights);
        let viewport_summary = trimmed(payload.viewport_summary);

        let mut category = trimmed(payload.category);
        if category.is_empty() {
            category = classify(&format!("{title} {text_sample}")).to_string();
        }

        let heuristic = match trimmed(payload.visual_trend) {
            trend if trend.is_empty() => {
                heuristic_visual_trend(&context, average_paragraph_length(&context))
            }
            trend => trend,
        };

        let completion = self
            .enrich_visual_trend(&PagePromptInput {
                url: &url,
                title: &title,
                category: &category,
                text_sample: &text_sample,
                layout_highlights: &layout_highlights,
                context: &context,
            })
            .await;
        let (visual_trend, raw_llm_response) = match completion {
            Some(Completion { text, raw }) => (text, Some(raw)),
            None => (heuristic, None),
        };

        let record = PageFeatureRecord {
            id: String::new(),
            url,
            origin: origin.clone(),
            source,
            title,
            extracted_at,
            visual_trend,
            layout_highlights,
            category: category.clone(),
            text_sample,
            viewport_summary,
            context,
            raw_llm_response,
        };

        let id = self
            .deps
            .records
            .put_page_feature(record)
            .await
            .context("failed to store page features")?;
        self.trace_detail(
            "page analysis stored",
            &format!("id={id} origin={origin} category={category}"),
        );

        self.announce_personalization(&origin, &category).await;
        Ok(())
    }

    /// Asks the enrichment client for a visual summary. Every failure is
    /// soft and yields `None`.
    pub(crate) async fn enrich_visual_trend(
        &self,
        input: &PagePromptInput<'_>,
    ) -> Option<Completion> {
        let prompt = visual_summary_prompt(input);
        match self.deps.enrichment.complete(&prompt).await {
            Ok(completion) => Some(completion),
            Err(EnrichmentError::Disabled | EnrichmentError::NotConfigured) => None,
            Err(err) => {
                warn!(target: TARGET, url = input.url, %err, "enrichment failed; using heuristic summary");
                None
            }
        }
    }

    /// Pushes the stylesheet for `origin` when it already has preferences.
    async fn announce_personalization(&self, origin: &str, category: &str) {
        let preferences: PagePreferencesMap =
            match load_or_default(self.deps.kv.as_ref(), keys::PAGE_PREFERENCES).await {
                Ok(preferences) => preferences,
                Err(err) => {
                    warn!(target: TARGET, %origin, error = %format!("{err:#}"), "failed to load preferences");
                    return;
                }
            };

        if let Some(preference) = preferences.get(origin) {
            debug!(target: TARGET, %origin, "announcing page personalization");
            self.emit(ServiceEvent::page_personalization(
                origin,
                preference,
                Some(category),
            ));
        }
    }
}

fn trimmed(value: Option<String>) -> String {
    value.map(|text| text.trim().to_string()).unwrap_or_default()
}

/// Finite positive numbers are taken as epoch milliseconds.
fn extracted_at_or_now(value: Option<&JsonValue>) -> i64 {
    value
        .and_then(JsonValue::as_f64)
        .filter(|millis| millis.is_finite() && *millis > 0.0 && *millis < i64::MAX as f64)
        .map(|millis| millis as i64)
        .unwrap_or_else(now_ms)
}

fn average_paragraph_length(context: &PageContext) -> u64 {
    if context.paragraph_count == 0 {
        0
    } else {
        context.character_count / context.paragraph_count
    }
}
