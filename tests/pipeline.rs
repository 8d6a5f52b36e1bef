// tests/pipeline.rs
//
// Full cycles against mock adapters and a recording sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use url::Url;

use news_harvester::error::{FetchError, PublishError};
use news_harvester::ingest::config::Registry;
use news_harvester::ingest::pipeline::{CycleSignals, Orchestrator, PipelineCfg};
use news_harvester::ingest::providers::AdapterSet;
use news_harvester::ingest::types::{
    DynamicOptions, FetchAdapter, FetchContext, FetchResult, RawItem, Selectors, SourceDefinition,
    SourceKind,
};
use news_harvester::notify::{Article, Sink};
use news_harvester::store::SeenStore;

/// Returns canned `(title, url)` pairs per source name.
#[derive(Default)]
struct CannedAdapter {
    pages: HashMap<String, Vec<(&'static str, &'static str)>>,
}

impl CannedAdapter {
    fn with(mut self, source: &str, items: Vec<(&'static str, &'static str)>) -> Self {
        self.pages.insert(source.to_string(), items);
        self
    }
}

#[async_trait]
impl FetchAdapter for CannedAdapter {
    async fn fetch(&self, source: &SourceDefinition, _ctx: &FetchContext) -> FetchResult {
        let now = Utc::now();
        Ok(self
            .pages
            .get(&source.name)
            .map(|items| {
                items
                    .iter()
                    .map(|(title, url)| RawItem {
                        source_name: source.name.clone(),
                        title: title.to_string(),
                        url: url.to_string(),
                        published_at: None,
                        fetched_at: now,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
    fn name(&self) -> &'static str {
        "canned"
    }
}

/// Never renders; gives up when its deadline passes.
struct HangingAdapter;

#[async_trait]
impl FetchAdapter for HangingAdapter {
    async fn fetch(&self, _source: &SourceDefinition, ctx: &FetchContext) -> FetchResult {
        tokio::select! {
            _ = tokio::time::sleep(ctx.timeout) => Err(FetchError::Timeout { after: ctx.timeout }),
            _ = ctx.cancel.cancelled() => Err(FetchError::Cancelled),
        }
    }
    fn name(&self) -> &'static str {
        "hanging"
    }
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Article>>,
    fail: bool,
}

#[async_trait]
impl Sink for RecordingSink {
    async fn publish(&self, article: &Article) -> Result<(), PublishError> {
        if self.fail {
            return Err(PublishError::Rejected {
                status: 400,
                body: "nope".into(),
            });
        }
        self.sent.lock().push(article.clone());
        Ok(())
    }
    fn name(&self) -> &'static str {
        "recording"
    }
}

fn source(name: &str, kind: SourceKind, keywords: &[&str]) -> SourceDefinition {
    let slug = name.to_lowercase().replace(' ', "-");
    SourceDefinition {
        name: name.to_string(),
        kind,
        location: Url::parse(&format!("https://{slug}.example/")).unwrap(),
        selectors: Selectors {
            container: "div".into(),
            ..Selectors::default()
        },
        link_prefix: String::new(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        exclude_keywords: vec![],
        enabled: true,
        dynamic: DynamicOptions::default(),
        timeout: None,
    }
}

fn cfg() -> PipelineCfg {
    PipelineCfg {
        fetch_timeout: Duration::from_millis(300),
        publish_delay: Duration::ZERO,
        ..PipelineCfg::default()
    }
}

fn orchestrator(
    canned: CannedAdapter,
    sink: Arc<RecordingSink>,
    store: Arc<SeenStore>,
) -> Orchestrator {
    let canned: Arc<dyn FetchAdapter> = Arc::new(canned);
    let adapters = AdapterSet::new(canned.clone(), Arc::new(HangingAdapter), canned);
    Orchestrator::new(adapters, store, sink, cfg())
}

fn three_items() -> Vec<(&'static str, &'static str)> {
    vec![
        ("Flood warning issued", "https://a.example/news/1"),
        ("Council passes budget", "https://a.example/news/2"),
        ("Tram line closed", "https://a.example/news/3"),
    ]
}

#[tokio::test]
async fn second_cycle_publishes_nothing_new() {
    let store = Arc::new(SeenStore::in_memory().unwrap());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(
        CannedAdapter::default().with("Site A", three_items()),
        sink.clone(),
        store,
    );
    let registry = Registry::new(vec![source("Site A", SourceKind::Static, &[])]);

    let first = orch.run_cycle(&registry, &CycleSignals::new()).await.unwrap();
    assert_eq!(
        (first.items_fetched, first.items_filtered, first.items_deduped, first.items_published),
        (3, 0, 0, 3)
    );
    assert!(!first.has_failures());

    let second = orch.run_cycle(&registry, &CycleSignals::new()).await.unwrap();
    assert_eq!(
        (second.items_fetched, second.items_filtered, second.items_deduped, second.items_published),
        (3, 0, 3, 0)
    );
    assert_eq!(sink.sent.lock().len(), 3);
}

#[tokio::test]
async fn items_of_one_source_are_published_in_fetch_order() {
    let store = Arc::new(SeenStore::in_memory().unwrap());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(
        CannedAdapter::default().with("Site A", three_items()),
        sink.clone(),
        store,
    );
    let registry = Registry::new(vec![source("Site A", SourceKind::Static, &[])]);
    orch.run_cycle(&registry, &CycleSignals::new()).await.unwrap();

    let titles: Vec<String> = sink.sent.lock().iter().map(|a| a.title.clone()).collect();
    assert_eq!(
        titles,
        vec!["Flood warning issued", "Council passes budget", "Tram line closed"]
    );
}

#[tokio::test]
async fn same_article_from_two_sources_is_published_once() {
    let store = Arc::new(SeenStore::in_memory().unwrap());
    let sink = Arc::new(RecordingSink::default());
    let canned = CannedAdapter::default()
        .with("Site A", vec![("Storm hits coast", "https://shared.example/story")])
        .with(
            "Site B",
            vec![("Storm hits the coast tonight", "https://shared.example/story?utm_source=b")],
        );
    let orch = orchestrator(canned, sink.clone(), store);
    let registry = Registry::new(vec![
        source("Site A", SourceKind::Static, &[]),
        source("Site B", SourceKind::Rss, &[]),
    ]);

    let summary = orch.run_cycle(&registry, &CycleSignals::new()).await.unwrap();
    assert_eq!(summary.items_fetched, 2);
    assert_eq!(summary.items_published, 1);
    assert_eq!(summary.items_deduped, 1);
    assert_eq!(sink.sent.lock().len(), 1);
}

#[tokio::test]
async fn keyword_and_exclude_rules_drop_items() {
    let store = Arc::new(SeenStore::in_memory().unwrap());
    let sink = Arc::new(RecordingSink::default());
    let canned = CannedAdapter::default().with(
        "Site A",
        vec![
            ("Storm hits coast", "https://a.example/1"),
            ("Budget passes", "https://a.example/2"),
            ("Storm sale: umbrellas 50% off", "https://a.example/3"),
        ],
    );
    let orch = orchestrator(canned, sink.clone(), store);
    let mut src = source("Site A", SourceKind::Static, &["storm"]);
    src.exclude_keywords = vec!["sale".into()];
    let registry = Registry::new(vec![src]);

    let summary = orch.run_cycle(&registry, &CycleSignals::new()).await.unwrap();
    assert_eq!(summary.items_fetched, 3);
    assert_eq!(summary.items_filtered, 2);
    assert_eq!(summary.items_published, 1);
    assert_eq!(sink.sent.lock()[0].title, "Storm hits coast");
}

#[tokio::test]
async fn dynamic_timeout_fails_only_that_source() {
    let store = Arc::new(SeenStore::in_memory().unwrap());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(
        CannedAdapter::default().with("Site A", three_items()),
        sink.clone(),
        store,
    );
    let registry = Registry::new(vec![
        source("Site A", SourceKind::Static, &[]),
        source("Social feed", SourceKind::Dynamic, &[]),
    ]);

    let summary = orch.run_cycle(&registry, &CycleSignals::new()).await.unwrap();
    assert_eq!(summary.sources_attempted, 2);
    assert_eq!(summary.sources_failed, 1);
    assert_eq!(summary.items_published, 3);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].source, "Social feed");
    assert_eq!(summary.failures[0].kind, "timeout");
    assert!(summary.has_failures());
}

#[tokio::test]
async fn failed_publish_is_counted_and_not_retried() {
    let store = Arc::new(SeenStore::in_memory().unwrap());
    let sink = Arc::new(RecordingSink {
        fail: true,
        ..RecordingSink::default()
    });
    let orch = orchestrator(
        CannedAdapter::default().with("Site A", three_items()),
        sink,
        store,
    );
    let registry = Registry::new(vec![source("Site A", SourceKind::Static, &[])]);

    let first = orch.run_cycle(&registry, &CycleSignals::new()).await.unwrap();
    assert_eq!(first.publish_failures, 3);
    assert_eq!(first.items_published, 0);
    assert!(first.has_failures());

    let second = orch.run_cycle(&registry, &CycleSignals::new()).await.unwrap();
    assert_eq!(second.items_deduped, 3);
    assert_eq!(second.publish_failures, 0);
}

#[tokio::test]
async fn stop_signal_skips_sources_not_yet_started() {
    let store = Arc::new(SeenStore::in_memory().unwrap());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(
        CannedAdapter::default().with("Site A", three_items()),
        sink.clone(),
        store,
    );
    let registry = Registry::new(vec![
        source("Site A", SourceKind::Static, &[]),
        source("Site B", SourceKind::Static, &[]),
    ]);
    let signals = CycleSignals::new();
    signals.stop.cancel();

    let summary = orch.run_cycle(&registry, &signals).await.unwrap();
    assert_eq!(summary.sources_skipped, 2);
    assert_eq!(summary.sources_attempted, 0);
    assert!(sink.sent.lock().is_empty());
}

#[tokio::test]
async fn disabled_sources_are_not_fetched() {
    let store = Arc::new(SeenStore::in_memory().unwrap());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(
        CannedAdapter::default().with("Site A", three_items()),
        sink.clone(),
        store,
    );
    let mut off = source("Site A", SourceKind::Static, &[]);
    off.enabled = false;

    let summary = orch
        .run_cycle(&Registry::new(vec![off]), &CycleSignals::new())
        .await
        .unwrap();
    assert_eq!(summary.sources_attempted, 0);
    assert_eq!(summary.items_fetched, 0);
}
