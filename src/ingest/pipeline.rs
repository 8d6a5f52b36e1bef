// src/ingest/pipeline.rs
//! One harvest cycle: fetch every enabled source, filter, claim identities, publish.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{FetchError, PublishError, StoreError};
use crate::ingest::config::Registry;
use crate::ingest::ensure_metrics_described;
use crate::ingest::filter;
use crate::ingest::providers::AdapterSet;
use crate::ingest::types::{FetchContext, RawItem, SourceDefinition};
use crate::notify::{Article, Sink};
use crate::store::{ArticleIdentity, Claim, SeenMeta, SeenStore, SimilarityRule};

/// Extra time an adapter gets past its own deadline to clean up (browser sessions).
const FETCH_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PipelineCfg {
    pub fetch_timeout: Duration,
    pub max_concurrent_fetches: usize,
    pub publish_timeout: Duration,
    pub publish_delay: Duration,
    pub max_concurrent_publishes: usize,
    pub similarity: Option<SimilarityRule>,
}

impl Default for PipelineCfg {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            max_concurrent_fetches: 4,
            publish_timeout: Duration::from_secs(15),
            publish_delay: Duration::from_secs(1),
            max_concurrent_publishes: 2,
            similarity: None,
        }
    }
}

impl PipelineCfg {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            fetch_timeout: s.scraping.request_timeout(),
            max_concurrent_fetches: s.scraping.max_concurrent_fetches.max(1),
            publish_timeout: Duration::from_secs(s.output.publish_timeout_secs.max(1)),
            publish_delay: Duration::from_millis(s.output.publish_delay_ms),
            max_concurrent_publishes: s.output.max_concurrent_publishes.max(1),
            similarity: s.dedup.similarity_threshold.map(|threshold| SimilarityRule {
                threshold,
                window: Duration::from_secs(s.dedup.similarity_window_hours.saturating_mul(3600)),
            }),
        }
    }
}

/// `stop`: start no further fetches. `abort`: cancel in-flight work and leave
/// unclaimed items for the next cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleSignals {
    pub stop: CancellationToken,
    pub abort: CancellationToken,
}

impl CycleSignals {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: String,
    pub kind: String,
    pub error: String,
}

/// Counters of one finished cycle. `sources_attempted + sources_skipped` equals the
/// number of enabled sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_attempted: usize,
    pub sources_failed: usize,
    pub sources_skipped: usize,
    pub items_fetched: usize,
    pub items_filtered: usize,
    pub items_deduped: usize,
    pub items_published: usize,
    pub publish_failures: usize,
    #[serde(default)]
    pub failures: Vec<SourceFailure>,
}

impl CycleSummary {
    pub fn has_failures(&self) -> bool {
        self.sources_failed > 0 || self.publish_failures > 0
    }
}

enum FetchOutcome {
    Fetched(Vec<RawItem>),
    Failed(FetchError),
    Skipped,
}

#[derive(Default)]
struct GroupTally {
    deduped: usize,
    published: usize,
    publish_failures: usize,
}

pub struct Orchestrator {
    adapters: AdapterSet,
    store: Arc<SeenStore>,
    sink: Arc<dyn Sink>,
    cfg: PipelineCfg,
}

impl Orchestrator {
    pub fn new(adapters: AdapterSet, store: Arc<SeenStore>, sink: Arc<dyn Sink>, cfg: PipelineCfg) -> Self {
        Self {
            adapters,
            store,
            sink,
            cfg,
        }
    }

    pub fn store(&self) -> &Arc<SeenStore> {
        &self.store
    }

    /// Run one cycle over `registry`. Only a store failure fails the cycle; source
    /// and publish failures are counted in the summary.
    pub async fn run_cycle(
        &self,
        registry: &Registry,
        signals: &CycleSignals,
    ) -> Result<CycleSummary, StoreError> {
        ensure_metrics_described();
        let mut summary = CycleSummary {
            started_at: Utc::now(),
            ..CycleSummary::default()
        };

        let sources: Vec<SourceDefinition> = registry.enabled().cloned().collect();
        let outcomes = self.fetch_all(&sources, signals).await;

        let mut groups: Vec<Vec<RawItem>> = Vec::new();
        for (source, outcome) in sources.iter().zip(outcomes) {
            match outcome {
                FetchOutcome::Skipped => summary.sources_skipped += 1,
                FetchOutcome::Failed(e) => {
                    summary.sources_attempted += 1;
                    summary.sources_failed += 1;
                    counter!("harvest_sources_failed_total", "kind" => e.kind()).increment(1);
                    tracing::warn!(source = %source.name, kind = e.kind(), error = %e, "source fetch failed");
                    summary.failures.push(SourceFailure {
                        source: source.name.clone(),
                        kind: e.kind().to_string(),
                        error: e.to_string(),
                    });
                }
                FetchOutcome::Fetched(items) => {
                    summary.sources_attempted += 1;
                    summary.items_fetched += items.len();
                    let before = items.len();
                    let kept: Vec<RawItem> = items
                        .into_iter()
                        .filter(|it| filter::passes(it, source))
                        .collect();
                    summary.items_filtered += before - kept.len();
                    tracing::debug!(
                        source = %source.name,
                        fetched = before,
                        kept = kept.len(),
                        "source fetched"
                    );
                    if !kept.is_empty() {
                        groups.push(kept);
                    }
                }
            }
        }

        let tallies: Vec<GroupTally> = stream::iter(groups)
            .map(|group| self.claim_and_publish(group, signals))
            .buffer_unordered(self.cfg.max_concurrent_publishes.max(1))
            .try_collect()
            .await?;
        for t in tallies {
            summary.items_deduped += t.deduped;
            summary.items_published += t.published;
            summary.publish_failures += t.publish_failures;
        }

        summary.finished_at = Utc::now();

        counter!("harvest_cycles_total").increment(1);
        counter!("harvest_items_fetched_total").increment(summary.items_fetched as u64);
        counter!("harvest_items_filtered_total").increment(summary.items_filtered as u64);
        counter!("harvest_items_deduped_total").increment(summary.items_deduped as u64);
        counter!("harvest_items_published_total").increment(summary.items_published as u64);
        counter!("harvest_publish_failures_total").increment(summary.publish_failures as u64);
        gauge!("harvest_last_cycle_ts").set(summary.finished_at.timestamp() as f64);

        tracing::info!(
            attempted = summary.sources_attempted,
            failed = summary.sources_failed,
            skipped = summary.sources_skipped,
            fetched = summary.items_fetched,
            filtered = summary.items_filtered,
            deduped = summary.items_deduped,
            published = summary.items_published,
            publish_failures = summary.publish_failures,
            "cycle finished"
        );
        Ok(summary)
    }

    /// Fetch all sources concurrently; results come back in `sources` order.
    async fn fetch_all(&self, sources: &[SourceDefinition], signals: &CycleSignals) -> Vec<FetchOutcome> {
        let permits = Arc::new(Semaphore::new(self.cfg.max_concurrent_fetches.max(1)));
        let mut set = JoinSet::new();

        for (idx, source) in sources.iter().cloned().enumerate() {
            let permits = permits.clone();
            let adapter = self.adapters.for_kind(source.kind);
            let signals = signals.clone();
            let default_timeout = self.cfg.fetch_timeout;

            set.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = signals.stop.cancelled() => return (idx, FetchOutcome::Skipped),
                    p = permits.acquire_owned() => match p {
                        Ok(p) => p,
                        Err(_) => return (idx, FetchOutcome::Skipped),
                    },
                };
                if signals.stop.is_cancelled() {
                    return (idx, FetchOutcome::Skipped);
                }

                let timeout = source.timeout.unwrap_or(default_timeout);
                let ctx = FetchContext::new(timeout, signals.abort.clone());
                let started = Instant::now();
                let result = tokio::time::timeout(timeout.saturating_add(FETCH_GRACE), adapter.fetch(&source, &ctx))
                    .await
                    .unwrap_or(Err(FetchError::Timeout { after: timeout }));
                histogram!("harvest_fetch_ms", "adapter" => adapter.name())
                    .record(started.elapsed().as_millis() as f64);

                let outcome = match result {
                    Ok(items) => FetchOutcome::Fetched(items),
                    Err(FetchError::Cancelled) => FetchOutcome::Skipped,
                    Err(e) => FetchOutcome::Failed(e),
                };
                (idx, outcome)
            });
        }

        let mut outcomes: Vec<Option<FetchOutcome>> = sources.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(e) => tracing::error!(error = %e, "fetch task panicked"),
            }
        }
        outcomes
            .into_iter()
            .map(|o| {
                o.unwrap_or_else(|| FetchOutcome::Failed(FetchError::RenderFailure("fetch task panicked".into())))
            })
            .collect()
    }

    /// Claim and publish one source's items in order, pacing consecutive sends.
    async fn claim_and_publish(
        &self,
        items: Vec<RawItem>,
        signals: &CycleSignals,
    ) -> Result<GroupTally, StoreError> {
        let mut tally = GroupTally::default();
        let mut sent_any = false;

        for item in items {
            if signals.abort.is_cancelled() {
                break;
            }
            let identity = ArticleIdentity::for_item(&item);
            match self.claim(&identity, &item).await? {
                Claim::Seen => {
                    tally.deduped += 1;
                    continue;
                }
                Claim::NearDuplicate { of } => {
                    tracing::debug!(source = %item.source_name, title = %item.title, of = %of, "near-duplicate skipped");
                    tally.deduped += 1;
                    continue;
                }
                Claim::Recorded => {}
            }

            if sent_any && !self.cfg.publish_delay.is_zero() {
                tokio::time::sleep(self.cfg.publish_delay).await;
            }
            sent_any = true;

            let article = Article::from_item(identity, &item);
            let sent = tokio::time::timeout(self.cfg.publish_timeout, self.sink.publish(&article))
                .await
                .unwrap_or(Err(PublishError::Timeout));
            match sent {
                Ok(()) => {
                    tally.published += 1;
                    tracing::debug!(source = %article.source, title = %article.title, "published");
                }
                Err(e) => {
                    tally.publish_failures += 1;
                    tracing::warn!(
                        source = %article.source,
                        identity = %article.identity,
                        sink = self.sink.name(),
                        error = %e,
                        "publish failed; article stays recorded"
                    );
                }
            }
        }
        Ok(tally)
    }

    async fn claim(&self, identity: &ArticleIdentity, item: &RawItem) -> Result<Claim, StoreError> {
        let store = self.store.clone();
        let identity = identity.clone();
        let rule = self.cfg.similarity;
        let meta = SeenMeta {
            source: item.source_name.clone(),
            title: Some(item.title.clone()),
            url: Some(item.url.clone()),
            seen_at: Utc::now(),
        };
        tokio::task::spawn_blocking(move || store.claim(&identity, &meta, rule))
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}
