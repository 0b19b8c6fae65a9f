use super::*;
use crate::analysis::FALLBACK_CATEGORY;
use crate::enrichment::{Completion, EnrichmentError};
use crate::history::{HistoryBuffer, HistoryVisit};
use crate::persistence::records::META_STRING_LIMIT;
use crate::persistence::{
    keys, load_or_default, IndexKey, InteractionLogIndex, PageContext, PageFeatureIndex,
    PageFeatureRecord, PageSource, SqliteConfig, SqlitePersistence,
};
use crate::queue::{PageAnalysisPayload, UserActionPayload};
use crate::util::now_ms;
use anyhow::anyhow;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

struct StubEnrichment {
    reply: Option<&'static str>,
    calls: AtomicUsize,
}

impl StubEnrichment {
    fn replying(reply: &'static str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply),
            calls: AtomicUsize::new(0),
        })
    }

    fn offline() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EnrichmentClient for StubEnrichment {
    async fn complete(&self, _prompt: &str) -> Result<Completion, EnrichmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.reply {
            Some(text) => Ok(Completion {
                text: text.to_string(),
                raw: json!({"choices": [{"message": {"content": text}}]}).to_string(),
            }),
            None => Err(EnrichmentError::Transport("connection refused".into())),
        }
    }
}

#[derive(Default)]
struct StubFetcher {
    pages: HashMap<String, String>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubFetcher {
    fn with_pages(pages: &[(&str, &str)]) -> Self {
        Self {
            pages: pages
                .iter()
                .map(|(url, body)| (url.to_string(), body.to_string()))
                .collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl PageFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("unreachable {url}"))
    }
}

struct Harness {
    handlers: TaskHandlers,
    store: Arc<SqlitePersistence>,
    history: Arc<HistoryBuffer>,
    events: broadcast::Receiver<ServiceEvent>,
}

fn harness_with(
    settings: HandlerSettings,
    enrichment: Arc<dyn EnrichmentClient>,
    fetcher: Arc<dyn PageFetcher>,
) -> Harness {
    let store = Arc::new(SqlitePersistence::bootstrap(SqliteConfig::memory()).expect("in-memory store"));
    let history = Arc::new(HistoryBuffer::default());
    let (events_tx, events) = broadcast::channel(16);
    let handlers = TaskHandlers::new(
        HandlerDeps {
            kv: store.clone(),
            records: store.clone(),
            enrichment,
            history: history.clone(),
            fetcher,
        },
        settings,
        Arc::new(AtomicBool::new(false)),
        events_tx,
    )
    .expect("handlers build");

    Harness {
        handlers,
        store,
        history,
        events,
    }
}

fn harness() -> Harness {
    harness_with(
        HandlerSettings::default(),
        StubEnrichment::offline(),
        Arc::new(StubFetcher::default()),
    )
}

fn action(url: &str, action_type: &str, meta: JsonValue) -> UserActionPayload {
    let meta = match meta {
        JsonValue::Object(fields) => fields,
        _ => Map::new(),
    };
    UserActionPayload {
        url: Some(url.to_string()),
        action_type: Some(action_type.to_string()),
        meta,
    }
}

async fn stats(store: &SqlitePersistence) -> PageStatsMap {
    load_or_default(store, keys::PAGE_STATS)
        .await
        .expect("stats load")
}

async fn preferences(store: &SqlitePersistence) -> PagePreferencesMap {
    load_or_default(store, keys::PAGE_PREFERENCES)
        .await
        .expect("preferences load")
}

#[tokio::test]
async fn three_actions_store_preferred_color() {
    let mut harness = harness();
    for _ in 0..3 {
        harness
            .handlers
            .dispatch(Task::UserAction(action(
                "https://a.test/x",
                "click",
                json!({"preferredColor": "#112233"}),
            )))
            .await
            .expect("action handled");
    }

    let stats = stats(&harness.store).await;
    assert_eq!(stats["https://a.test"].visits, 3);
    let preferences = preferences(&harness.store).await;
    assert_eq!(preferences["https://a.test"].highlight_color, "#112233");

    assert_eq!(
        harness.events.try_recv().expect("event published"),
        ServiceEvent::apply_now("https://a.test")
    );
    assert!(matches!(harness.events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn preferences_appear_at_threshold_and_are_overwritten_in_place() {
    let mut harness = harness();

    for _ in 0..2 {
        harness
            .handlers
            .handle_user_action(action("https://a.test/", "click", json!({})))
            .await
            .expect("action handled");
    }
    assert_eq!(stats(&harness.store).await["https://a.test"].visits, 2);
    assert!(preferences(&harness.store).await.is_empty());
    assert!(matches!(harness.events.try_recv(), Err(TryRecvError::Empty)));

    harness
        .handlers
        .handle_user_action(action("https://a.test/", "click", json!({})))
        .await
        .expect("third action handled");
    let created = preferences(&harness.store).await;
    assert_eq!(created.len(), 1);
    assert_eq!(
        created["https://a.test"].highlight_color,
        HandlerSettings::default().fallback_highlight_color
    );

    harness
        .handlers
        .handle_user_action(action("https://a.test/other", "scroll", json!({"depth": 40})))
        .await
        .expect("fourth action handled");

    let stats = stats(&harness.store).await;
    let entry = &stats["https://a.test"];
    assert_eq!(entry.visits, 4);
    let last = entry.last_interaction.as_ref().expect("last interaction");
    assert_eq!(last.action_type, "scroll");
    assert_eq!(last.meta.get("depth"), Some(&json!(40)));
    assert_eq!(preferences(&harness.store).await.len(), 1);

    let logs = harness
        .handlers
        .deps
        .records
        .query_interaction_logs(InteractionLogIndex::Origin, "https://a.test".into())
        .await
        .expect("logs query");
    assert_eq!(logs.len(), 4);
}

#[tokio::test]
async fn threshold_comes_from_settings() {
    let harness = harness_with(
        HandlerSettings {
            preference_visit_threshold: 1,
            fallback_highlight_color: "#abcdef".into(),
            ..HandlerSettings::default()
        },
        StubEnrichment::offline(),
        Arc::new(StubFetcher::default()),
    );

    harness
        .handlers
        .handle_user_action(action("https://c.test/", "click", json!({"preferredColor": "  "})))
        .await
        .expect("action handled");

    assert_eq!(
        preferences(&harness.store).await["https://c.test"].highlight_color,
        "#abcdef"
    );
}

#[tokio::test]
async fn invalid_user_actions_are_dropped_without_error() {
    let harness = harness();

    let missing_url = UserActionPayload {
        url: None,
        action_type: Some("click".into()),
        meta: Map::new(),
    };
    let blank_type = action("https://a.test/", "   ", json!({}));

    harness
        .handlers
        .handle_user_action(missing_url)
        .await
        .expect("dropped quietly");
    harness
        .handlers
        .handle_user_action(blank_type)
        .await
        .expect("dropped quietly");

    assert!(stats(&harness.store).await.is_empty());
    assert_eq!(harness.store.count_interaction_logs().expect("count"), 0);
}

#[tokio::test]
async fn long_meta_strings_are_truncated_in_logs() {
    let harness = harness();
    harness
        .handlers
        .handle_user_action(action(
            "https://a.test/article",
            "select",
            json!({"snippet": "s".repeat(1_000), "nested": {"dropped": true}}),
        ))
        .await
        .expect("action handled");

    let logs = harness
        .store
        .interaction_logs_by(InteractionLogIndex::Url, &IndexKey::from("https://a.test/article"))
        .expect("logs query");
    assert_eq!(logs.len(), 1);
    let snippet = logs[0].meta["snippet"].as_str().expect("snippet string");
    assert_eq!(snippet.chars().count(), META_STRING_LIMIT);
    assert!(snippet.ends_with("..."));
    assert!(!logs[0].meta.contains_key("nested"));

    let stats = stats(&harness.store).await;
    let last = stats["https://a.test"]
        .last_interaction
        .as_ref()
        .expect("last interaction");
    assert_eq!(
        last.meta["snippet"].as_str().map(|text| text.chars().count()),
        Some(META_STRING_LIMIT)
    );
}

#[tokio::test]
async fn page_analysis_without_context_stores_zero_counters() {
    let harness = harness();
    harness
        .handlers
        .dispatch(Task::PageAnalysis(PageAnalysisPayload {
            url: Some("https://b.test/".into()),
            source: Some("live".into()),
            ..PageAnalysisPayload::default()
        }))
        .await
        .expect("analysis handled");

    let records = harness
        .store
        .page_features_by(PageFeatureIndex::Origin, &IndexKey::from("https://b.test"))
        .expect("records query");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.context, PageContext::default());
    assert_eq!(record.source, PageSource::Live);
    assert_eq!(record.category, "other");
    assert!(!record.visual_trend.is_empty());
    assert_eq!(record.raw_llm_response, None);
    assert!(record.extracted_at > 0);
}

#[tokio::test]
async fn page_analysis_prefers_enriched_summary() {
    let enrichment = StubEnrichment::replying("bright hero with product grid");
    let harness = harness_with(
        HandlerSettings::default(),
        enrichment.clone(),
        Arc::new(StubFetcher::default()),
    );

    harness
        .handlers
        .handle_page_analysis(PageAnalysisPayload {
            url: Some("https://shop.test/item".into()),
            title: Some("Buy shoes".into()),
            text_sample: Some("Add to cart, free shipping".into()),
            visual_trend: Some("observer trend".into()),
            extracted_at: Some(json!(1_700_000_000_000_i64)),
            context: Some(json!({"characterCount": 120, "paragraphCount": 3, "headingCount": "x", "imageCount": 2})),
            ..PageAnalysisPayload::default()
        })
        .await
        .expect("analysis handled");

    assert_eq!(enrichment.calls.load(Ordering::SeqCst), 1);
    let records = harness
        .store
        .page_features_by(PageFeatureIndex::Category, &IndexKey::from("shopping"))
        .expect("records query");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.visual_trend, "bright hero with product grid");
    assert!(record
        .raw_llm_response
        .as_deref()
        .is_some_and(|raw| raw.contains("choices")));
    assert_eq!(record.extracted_at, 1_700_000_000_000);
    assert_eq!(
        record.context,
        PageContext {
            character_count: 120,
            paragraph_count: 3,
            heading_count: 0,
            image_count: 2,
        }
    );
}

#[tokio::test]
async fn page_analysis_keeps_observer_trend_when_enrichment_fails() {
    let harness = harness();
    harness
        .handlers
        .handle_page_analysis(PageAnalysisPayload {
            url: Some("https://b.test/".into()),
            category: Some("news".into()),
            visual_trend: Some("dark two-column".into()),
            source: Some("bogus".into()),
            ..PageAnalysisPayload::default()
        })
        .await
        .expect("analysis handled");

    let records = harness
        .store
        .page_features_by(PageFeatureIndex::Url, &IndexKey::from("https://b.test/"))
        .expect("records query");
    assert_eq!(records[0].visual_trend, "dark two-column");
    assert_eq!(records[0].category, "news");
    assert_eq!(records[0].source, PageSource::Live);
}

#[tokio::test]
async fn page_analysis_without_url_is_dropped() {
    let harness = harness();
    harness
        .handlers
        .handle_page_analysis(PageAnalysisPayload {
            title: Some("orphan".into()),
            ..PageAnalysisPayload::default()
        })
        .await
        .expect("dropped quietly");
    assert_eq!(harness.store.count_page_features().expect("count"), 0);
}

#[tokio::test]
async fn page_analysis_announces_existing_preferences() {
    let mut harness = harness_with(
        HandlerSettings {
            preference_visit_threshold: 1,
            ..HandlerSettings::default()
        },
        StubEnrichment::offline(),
        Arc::new(StubFetcher::default()),
    );

    harness
        .handlers
        .handle_user_action(action("https://a.test/", "click", json!({"preferredColor": "#445566"})))
        .await
        .expect("action handled");
    assert!(matches!(
        harness.events.try_recv(),
        Ok(ServiceEvent::ApplyPersonalizationNow { .. })
    ));

    harness
        .handlers
        .handle_page_analysis(PageAnalysisPayload {
            url: Some("https://a.test/page".into()),
            category: Some("news".into()),
            ..PageAnalysisPayload::default()
        })
        .await
        .expect("analysis handled");

    match harness.events.try_recv().expect("personalization event") {
        ServiceEvent::ApplyPagePersonalization {
            origin,
            css,
            rationale,
        } => {
            assert_eq!(origin, "https://a.test");
            assert!(css.contains("#445566"));
            assert!(rationale.contains("news"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

fn visit(url: &str, title: Option<&str>, age_ms: i64) -> HistoryVisit {
    HistoryVisit {
        url: url.to_string(),
        title: title.map(str::to_string),
        last_visit_time: (now_ms() - age_ms) as f64,
    }
}

#[tokio::test]
async fn history_sync_stores_one_snapshot_per_origin() {
    let fetcher = Arc::new(StubFetcher::with_pages(&[
        (
            "https://shop.test/cart",
            "<html><head><title>Cart</title></head><body><h1>Your cart</h1><p>Buy now</p><img src=x></body></html>",
        ),
        (
            "https://news.test/today",
            "<body><h1>Breaking news</h1><p>Latest headline</p><p>More news</p></body>",
        ),
    ]));
    let harness = harness_with(
        HandlerSettings::default(),
        StubEnrichment::offline(),
        fetcher,
    );

    harness.history.record(vec![
        visit("https://shop.test/old", None, 60_000),
        visit("https://shop.test/cart", Some("Cart page"), 1_000),
        visit("https://news.test/today", None, 2_000),
        visit("https://gone.test/", None, 3_000),
        visit("https://stale.test/", None, 48 * 60 * 60 * 1_000),
    ]);

    let summary = harness
        .handlers
        .handle_history_sync()
        .await
        .expect("sync completes");
    assert_eq!(summary.entries, 4);
    assert_eq!(summary.origins, 3);
    assert_eq!(summary.stored, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.fetch_failed, 1);
    assert_eq!(summary.enriched, 0);

    let shop = harness
        .store
        .load_page_feature(&PageFeatureRecord::history_id("https://shop.test"))
        .expect("load")
        .expect("shop snapshot");
    assert_eq!(shop.url, "https://shop.test/cart");
    assert_eq!(shop.title, "Cart");
    assert_eq!(shop.category, "shopping");
    assert_eq!(shop.source, PageSource::History);
    assert_eq!(shop.context.heading_count, 1);
    assert_eq!(shop.context.image_count, 1);
    assert!(shop.layout_highlights.contains("1 headings"));

    let news = harness
        .store
        .load_page_feature(&PageFeatureRecord::history_id("https://news.test"))
        .expect("load")
        .expect("news snapshot");
    assert_eq!(news.category, "news");
    assert_eq!(news.context.paragraph_count, 2);

    let gone = harness
        .store
        .load_page_feature(&PageFeatureRecord::history_id("https://gone.test"))
        .expect("load")
        .expect("unreachable origin still gets a snapshot");
    assert_eq!(gone.url, "https://gone.test/");
    assert_eq!(gone.category, FALLBACK_CATEGORY);
    assert_eq!(gone.context, PageContext::default());

    let second = harness
        .handlers
        .handle_history_sync()
        .await
        .expect("second sync");
    assert_eq!(second.stored, 2);
    assert_eq!(second.retained, 1);
    let history_records = harness
        .store
        .page_features_by(PageFeatureIndex::Source, &IndexKey::from(PageSource::History))
        .expect("records query");
    assert_eq!(history_records.len(), 3);
}

#[tokio::test]
async fn unreachable_history_page_keeps_existing_snapshot() {
    let enrichment = StubEnrichment::replying("dense grid");
    let harness = harness_with(
        HandlerSettings::default(),
        enrichment.clone(),
        Arc::new(StubFetcher::default()),
    );
    let earlier = PageFeatureRecord {
        id: PageFeatureRecord::history_id("https://kept.test"),
        url: "https://kept.test/".into(),
        origin: "https://kept.test".into(),
        source: PageSource::History,
        title: "Kept".into(),
        extracted_at: 1_000,
        visual_trend: "two column layout".into(),
        layout_highlights: String::new(),
        category: "technology".into(),
        text_sample: "rust compiler release".into(),
        viewport_summary: String::new(),
        context: PageContext::default(),
        raw_llm_response: None,
    };
    harness
        .store
        .put_page_feature(earlier.clone())
        .await
        .expect("seed snapshot");

    harness.history.record(vec![
        visit("https://kept.test/", None, 100),
        visit("https://fresh.test/", Some("Daily news digest"), 200),
    ]);
    let summary = harness
        .handlers
        .handle_history_sync()
        .await
        .expect("sync completes");

    assert_eq!(summary.fetch_failed, 2);
    assert_eq!(summary.retained, 1);
    assert_eq!(summary.stored, 1);
    assert_eq!(summary.enriched, 0);
    assert_eq!(enrichment.calls.load(Ordering::SeqCst), 0);

    let kept = harness
        .store
        .load_page_feature(&earlier.id)
        .expect("load")
        .expect("snapshot kept");
    assert_eq!(kept.visual_trend, "two column layout");
    assert_eq!(kept.extracted_at, 1_000);

    let fresh = harness
        .store
        .load_page_feature(&PageFeatureRecord::history_id("https://fresh.test"))
        .expect("load")
        .expect("fallback snapshot");
    assert_eq!(fresh.title, "Daily news digest");
    assert_eq!(fresh.category, "news");
    assert!(fresh.raw_llm_response.is_none());
}

#[tokio::test]
async fn history_sync_counts_enriched_snapshots() {
    let fetcher = Arc::new(StubFetcher::with_pages(&[(
        "https://a.test/",
        "<body><p>hello</p></body>",
    )]));
    let harness = harness_with(
        HandlerSettings::default(),
        StubEnrichment::replying("plain single column"),
        fetcher,
    );
    harness
        .history
        .record(vec![visit("https://a.test/", None, 10)]);

    let summary = harness
        .handlers
        .handle_history_sync()
        .await
        .expect("sync completes");
    assert_eq!(summary.enriched, 1);

    let record = harness
        .store
        .load_page_feature(&PageFeatureRecord::history_id("https://a.test"))
        .expect("load")
        .expect("snapshot");
    assert_eq!(record.visual_trend, "plain single column");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn history_fetches_respect_concurrency_limit() {
    let urls: Vec<String> = (0..6).map(|i| format!("https://site{i}.test/")).collect();
    let pages: Vec<(&str, &str)> = urls
        .iter()
        .map(|url| (url.as_str(), "<body><p>x</p></body>"))
        .collect();
    let fetcher = Arc::new(StubFetcher {
        delay: Duration::from_millis(30),
        ..StubFetcher::with_pages(&pages)
    });

    let mut settings = HandlerSettings::default();
    settings.history.concurrency = 2;
    let harness = harness_with(settings, StubEnrichment::offline(), fetcher.clone());
    harness
        .history
        .record(urls.iter().map(|url| visit(url, None, 100)));

    let summary = harness
        .handlers
        .handle_history_sync()
        .await
        .expect("sync completes");

    assert_eq!(summary.stored, 6);
    let peak = fetcher.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak concurrency {peak}");
    assert!(peak >= 1);
}
