// tests/scheduler.rs
//
// Scheduler lifecycle: once mode, graceful stop, stop during a slow fetch, fatal store,
// and the tick cadence under a paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::tempdir;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use news_harvester::error::{FetchError, PublishError};
use news_harvester::ingest::config::{Registry, RegistryHandle};
use news_harvester::ingest::pipeline::{Orchestrator, PipelineCfg};
use news_harvester::ingest::providers::AdapterSet;
use news_harvester::ingest::scheduler::{RunMode, RunState, Scheduler, SchedulerCfg};
use news_harvester::ingest::types::{
    DynamicOptions, FetchAdapter, FetchContext, FetchResult, RawItem, Selectors, SourceDefinition,
    SourceKind,
};
use news_harvester::notify::{Article, Sink};
use news_harvester::status::load_last_cycle;
use news_harvester::store::{ArticleIdentity, SeenMeta, SeenStore};

/// One item per source, URL derived from the source name.
struct OneItem;

#[async_trait]
impl FetchAdapter for OneItem {
    async fn fetch(&self, source: &SourceDefinition, _ctx: &FetchContext) -> FetchResult {
        Ok(vec![RawItem {
            source_name: source.name.clone(),
            title: format!("Headline from {}", source.name),
            url: format!("{}story", source.location),
            published_at: None,
            fetched_at: Utc::now(),
        }])
    }
    fn name(&self) -> &'static str {
        "one-item"
    }
}

/// Signals `started`, then blocks until cancelled.
struct Blocking {
    started: Arc<Notify>,
}

#[async_trait]
impl FetchAdapter for Blocking {
    async fn fetch(&self, _source: &SourceDefinition, ctx: &FetchContext) -> FetchResult {
        self.started.notify_one();
        ctx.cancel.cancelled().await;
        Err(FetchError::Cancelled)
    }
    fn name(&self) -> &'static str {
        "blocking"
    }
}

/// Reports each fetch start, then takes the next scripted duration (the last one repeats).
struct Paced {
    durations: Vec<Duration>,
    calls: AtomicUsize,
    starts: mpsc::UnboundedSender<Instant>,
}

#[async_trait]
impl FetchAdapter for Paced {
    async fn fetch(&self, source: &SourceDefinition, _ctx: &FetchContext) -> FetchResult {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.starts.send(Instant::now());
        let last = self.durations.len() - 1;
        tokio::time::sleep(self.durations[n.min(last)]).await;
        Ok(vec![RawItem {
            source_name: source.name.clone(),
            title: format!("Update {n}"),
            url: format!("{}update/{n}", source.location),
            published_at: None,
            fetched_at: Utc::now(),
        }])
    }
    fn name(&self) -> &'static str {
        "paced"
    }
}

struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn publish(&self, _article: &Article) -> Result<(), PublishError> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "null"
    }
}

fn source(name: &str, kind: SourceKind) -> SourceDefinition {
    SourceDefinition {
        name: name.to_string(),
        kind,
        location: Url::parse(&format!("https://{}.example/", name.to_lowercase())).unwrap(),
        selectors: Selectors {
            container: "div".into(),
            ..Selectors::default()
        },
        link_prefix: String::new(),
        keywords: vec![],
        exclude_keywords: vec![],
        enabled: true,
        dynamic: DynamicOptions::default(),
        timeout: None,
    }
}

fn orchestrator(
    store: Arc<SeenStore>,
    dynamic: Arc<dyn FetchAdapter>,
    max_concurrent_fetches: usize,
) -> Arc<Orchestrator> {
    orchestrator_with(store, Arc::new(OneItem), dynamic, max_concurrent_fetches)
}

fn orchestrator_with(
    store: Arc<SeenStore>,
    plain: Arc<dyn FetchAdapter>,
    dynamic: Arc<dyn FetchAdapter>,
    max_concurrent_fetches: usize,
) -> Arc<Orchestrator> {
    let adapters = AdapterSet::new(plain.clone(), dynamic, plain);
    let cfg = PipelineCfg {
        fetch_timeout: Duration::from_secs(30),
        max_concurrent_fetches,
        publish_delay: Duration::ZERO,
        ..PipelineCfg::default()
    };
    Arc::new(Orchestrator::new(adapters, store, Arc::new(NullSink), cfg))
}

fn drain(rx: &mut broadcast::Receiver<RunState>) -> Vec<RunState> {
    let mut seen = Vec::new();
    while let Ok(s) = rx.try_recv() {
        seen.push(s);
    }
    seen
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn once_runs_one_cycle_and_writes_state() {
    let dir = tempdir().unwrap();
    let state_path = dir.path().join("state").join("last_cycle.json");
    let store = Arc::new(SeenStore::open(dir.path().join("seen.db")).unwrap());

    let stale = ArticleIdentity::derive("Old", "", "https://old.example/story");
    store
        .record_if_absent(
            &stale,
            &SeenMeta {
                source: "Old".into(),
                title: None,
                url: None,
                seen_at: Utc::now() - chrono::Duration::days(30),
            },
        )
        .unwrap();

    let registry = RegistryHandle::new(Registry::new(vec![
        source("Alpha", SourceKind::Static),
        source("Beta", SourceKind::Rss),
    ]));
    let cfg = SchedulerCfg {
        cleanup_every_cycles: 1,
        retention: Duration::from_secs(7 * 86_400),
        state_path: Some(state_path.clone()),
        ..SchedulerCfg::default()
    };
    let scheduler = Scheduler::new(orchestrator(store.clone(), Arc::new(OneItem), 4), registry, cfg);
    let handle = scheduler.handle();
    assert_eq!(handle.state(), RunState::Stopped);

    let report = scheduler
        .run(RunMode::Once, CancellationToken::new())
        .await
        .expect("once run");
    assert_eq!(report.cycles, 1);
    assert!(!report.has_failures());
    assert_eq!(handle.state(), RunState::Stopped);

    let last = handle.last_cycle().expect("last cycle published");
    assert_eq!(last.items_published, 2);

    let saved = load_last_cycle(&state_path).await.expect("state file");
    assert_eq!(saved, last);

    assert!(!store.exists(&stale).unwrap(), "retention cleanup ran");
    assert_eq!(store.stats().unwrap().total_records, 2);
}

#[tokio::test]
async fn forever_stops_on_shutdown_between_cycles() {
    let store = Arc::new(SeenStore::in_memory().unwrap());
    let registry = RegistryHandle::new(Registry::new(vec![source("Alpha", SourceKind::Static)]));
    let cfg = SchedulerCfg {
        interval: Duration::from_secs(3600),
        ..SchedulerCfg::default()
    };
    let scheduler = Scheduler::new(orchestrator(store, Arc::new(OneItem), 4), registry, cfg);
    let handle = scheduler.handle();
    let mut transitions = handle.transitions();

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(RunMode::Forever, shutdown.clone()));

    wait_until(|| handle.last_cycle().is_some()).await;
    assert_eq!(handle.state(), RunState::Running);

    shutdown.cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("scheduler stops promptly")
        .unwrap()
        .unwrap();
    assert_eq!(report.cycles, 1);
    assert_eq!(handle.state(), RunState::Stopped);
    assert_eq!(
        drain(&mut transitions),
        vec![RunState::Running, RunState::Stopping, RunState::Stopped],
        "stop while idle still passes through Stopping"
    );
}

#[tokio::test]
async fn shutdown_mid_cycle_skips_pending_and_aborts_slow_fetch() {
    let store = Arc::new(SeenStore::in_memory().unwrap());
    let started = Arc::new(Notify::new());
    let blocking = Arc::new(Blocking {
        started: started.clone(),
    });
    // One fetch slot: the dynamic source holds it, the static one waits behind it.
    let registry = RegistryHandle::new(Registry::new(vec![
        source("Social", SourceKind::Dynamic),
        source("Alpha", SourceKind::Static),
    ]));
    let cfg = SchedulerCfg {
        interval: Duration::from_secs(3600),
        shutdown_grace: Duration::from_millis(100),
        ..SchedulerCfg::default()
    };
    let scheduler = Scheduler::new(orchestrator(store, blocking, 1), registry, cfg);
    let mut handle = scheduler.handle();
    let mut transitions = handle.transitions();

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(RunMode::Forever, shutdown.clone()));

    started.notified().await;
    shutdown.cancel();
    assert_eq!(handle.wait_for(RunState::Stopping).await, RunState::Stopping);

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("scheduler stops within the grace bounds")
        .unwrap()
        .unwrap();
    let last = report.last.expect("cycle completed");
    assert_eq!(last.sources_attempted + last.sources_skipped, 2);
    assert_eq!(last.sources_skipped, 2);
    assert_eq!(last.items_published, 0);
    assert_eq!(handle.state(), RunState::Stopped);
    assert_eq!(
        drain(&mut transitions),
        vec![RunState::Running, RunState::Stopping, RunState::Stopped]
    );
}

#[tokio::test]
async fn store_failure_is_fatal_in_once_mode() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seen.db");
    let store = Arc::new(SeenStore::open(&path).unwrap());
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("DROP TABLE seen;").unwrap();
    }

    let registry = RegistryHandle::new(Registry::new(vec![source("Alpha", SourceKind::Static)]));
    let scheduler = Scheduler::new(
        orchestrator(store, Arc::new(OneItem), 4),
        registry,
        SchedulerCfg::default(),
    );
    let handle = scheduler.handle();

    let result = scheduler.run(RunMode::Once, CancellationToken::new()).await;
    assert!(result.is_err());
    assert_eq!(handle.state(), RunState::Stopped);
    assert!(handle.last_cycle().is_none());
}

#[tokio::test(start_paused = true)]
async fn interval_runs_from_cycle_start_without_backlog() {
    let store = Arc::new(SeenStore::in_memory().unwrap());
    let (starts_tx, mut starts) = mpsc::unbounded_channel();
    // Two cycles overrun a 1s interval by 2.5x, then cycles get quick.
    let paced = Arc::new(Paced {
        durations: vec![
            Duration::from_millis(2_500),
            Duration::from_millis(2_500),
            Duration::from_millis(100),
        ],
        calls: AtomicUsize::new(0),
        starts: starts_tx,
    });
    let registry = RegistryHandle::new(Registry::new(vec![source("Alpha", SourceKind::Static)]));
    let cfg = SchedulerCfg {
        interval: Duration::from_secs(1),
        cleanup_every_cycles: 0,
        ..SchedulerCfg::default()
    };
    let scheduler = Scheduler::new(
        orchestrator_with(store, paced, Arc::new(OneItem), 4),
        registry,
        cfg,
    );

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(RunMode::Forever, shutdown.clone()));

    let mut at = Vec::new();
    for _ in 0..5 {
        at.push(starts.recv().await.expect("cycle started"));
    }
    shutdown.cancel();
    let report = run.await.unwrap().unwrap();

    let gaps: Vec<Duration> = at.windows(2).map(|w| w[1] - w[0]).collect();
    let close_to = |gap: Duration, expected_ms: u64| {
        let expected = Duration::from_millis(expected_ms);
        gap >= expected && gap - expected < Duration::from_millis(20)
    };
    // Overrun: the next cycle follows right after the slow one, once.
    assert!(close_to(gaps[0], 2_500), "{gaps:?}");
    assert!(close_to(gaps[1], 2_500), "{gaps:?}");
    // Missed ticks are not replayed: the quick cycle is followed by a full interval,
    // measured from its start, not a burst of queued triggers.
    assert!(close_to(gaps[2], 1_000), "{gaps:?}");
    assert!(close_to(gaps[3], 1_000), "{gaps:?}");
    assert_eq!(report.cycles, 5);
}
