use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use super::{TaskHandlers, TARGET};
use crate::analysis::{classify, heuristic_layout_highlights, heuristic_visual_trend, PageMetrics};
use crate::enrichment::prompt::PagePromptInput;
use crate::history::{latest_per_origin, HistoryVisit};
use crate::persistence::{PageFeatureRecord, PageSource};
use crate::telemetry::events::{record_history_sync, HistorySyncSummary};
use crate::util::now_ms;

enum OriginOutcome {
    Stored { enriched: bool, fetched: bool },
    /// The page could not be fetched and an earlier snapshot was kept.
    Retained,
    Failed { fetched: bool },
}

impl TaskHandlers {
    /// Rebuilds one history snapshot per recently visited origin. Origins are
    /// analysed concurrently up to the configured limit and independently of
    /// each other. An unreachable page still yields a snapshot built from the
    /// visit itself unless one already exists for the origin.
    pub(crate) async fn handle_history_sync(&self) -> Result<HistorySyncSummary> {
        let config = &self.settings.history;
        let lookback_ms = i64::try_from(config.lookback().as_millis()).unwrap_or(i64::MAX);
        let since = now_ms().saturating_sub(lookback_ms);

        let visits = self
            .deps
            .history
            .recent_visits(since, config.max_entries)
            .await
            .context("failed to read browsing history")?;

        let entries = visits.len();
        let latest = latest_per_origin(visits);
        let mut summary = HistorySyncSummary {
            entries,
            origins: latest.len(),
            ..HistorySyncSummary::default()
        };

        let outcomes: Vec<OriginOutcome> = stream::iter(latest)
            .map(|(origin, visit)| self.sync_origin(origin, visit))
            .buffer_unordered(config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                OriginOutcome::Stored { enriched, fetched } => {
                    summary.stored += 1;
                    summary.enriched += usize::from(enriched);
                    summary.fetch_failed += usize::from(!fetched);
                }
                OriginOutcome::Retained => {
                    summary.retained += 1;
                    summary.fetch_failed += 1;
                }
                OriginOutcome::Failed { fetched } => {
                    summary.failed += 1;
                    summary.fetch_failed += usize::from(!fetched);
                }
            }
        }

        record_history_sync(&summary);
        Ok(summary)
    }

    async fn sync_origin(&self, origin: String, visit: HistoryVisit) -> OriginOutcome {
        let id = PageFeatureRecord::history_id(&origin);
        let (metrics, fetched) = match self.deps.fetcher.fetch(&visit.url).await {
            Ok(html) => (self.parser.parse(&html), true),
            Err(err) => {
                debug!(target: TARGET, %origin, url = %visit.url, error = %format!("{err:#}"), "history page fetch failed");
                match self.deps.records.get_page_feature(&id).await {
                    Ok(Some(_)) => return OriginOutcome::Retained,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(target: TARGET, %origin, error = %format!("{err:#}"), "failed to look up history snapshot");
                    }
                }
                (PageMetrics::default(), false)
            }
        };

        let title = if metrics.title.is_empty() {
            visit.title.clone().unwrap_or_default().trim().to_string()
        } else {
            metrics.title.clone()
        };
        let context = metrics.context();
        let category = classify(&format!("{title} {}", metrics.text_sample)).to_string();
        let layout_highlights =
            heuristic_layout_highlights(&context, metrics.average_paragraph_length);

        // nothing worth summarising without the page body
        let completion = if fetched {
            self.enrich_visual_trend(&PagePromptInput {
                url: &visit.url,
                title: &title,
                category: &category,
                text_sample: &metrics.text_sample,
                layout_highlights: &layout_highlights,
                context: &context,
            })
            .await
        } else {
            None
        };
        let enriched = completion.is_some();
        let (visual_trend, raw_llm_response) = match completion {
            Some(completion) => (completion.text, Some(completion.raw)),
            None => (
                heuristic_visual_trend(&context, metrics.average_paragraph_length),
                None,
            ),
        };

        let record = PageFeatureRecord {
            id,
            url: visit.url,
            origin: origin.clone(),
            source: PageSource::History,
            title,
            extracted_at: now_ms(),
            visual_trend,
            layout_highlights,
            category,
            text_sample: metrics.text_sample,
            viewport_summary: String::new(),
            context,
            raw_llm_response,
        };

        match self.deps.records.put_page_feature(record).await {
            Ok(id) => {
                self.trace_detail("history snapshot stored", &format!("id={id} enriched={enriched}"));
                OriginOutcome::Stored { enriched, fetched }
            }
            Err(err) => {
                warn!(target: TARGET, %origin, error = %format!("{err:#}"), "failed to store history snapshot");
                OriginOutcome::Failed { fetched }
            }
        }
    }
}
