// src/ingest/scheduler.rs
//! Drives cycles on a fixed period and owns the run state.
//!
//! States move `Stopped -> Running -> Stopping -> Stopped`; only the scheduler writes
//! them, everyone else observes through a [`SchedulerHandle`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::StoreError;
use crate::ingest::config::RegistryHandle;
use crate::ingest::pipeline::{CycleSignals, CycleSummary, Orchestrator};
use crate::status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Exactly one cycle.
    Once,
    /// Until the shutdown token fires.
    Forever,
}

#[derive(Debug, Clone)]
pub struct SchedulerCfg {
    pub interval: Duration,
    /// How long an in-flight cycle may keep going after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Final bound after the abort signal before the cycle is dropped.
    pub abort_grace: Duration,
    /// 0 disables periodic cleanup.
    pub cleanup_every_cycles: u64,
    pub retention: Duration,
    pub max_consecutive_store_failures: u32,
    pub state_path: Option<PathBuf>,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(30),
            abort_grace: Duration::from_secs(5),
            cleanup_every_cycles: 60,
            retention: Duration::from_secs(7 * 86_400),
            max_consecutive_store_failures: 3,
            state_path: None,
        }
    }
}

impl SchedulerCfg {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            interval: s.scraping.interval(),
            shutdown_grace: Duration::from_secs(s.scheduler.shutdown_grace_secs),
            cleanup_every_cycles: s.scheduler.cleanup_every_cycles,
            retention: s.storage.retention(),
            max_consecutive_store_failures: s.scheduler.max_consecutive_store_failures.max(1),
            state_path: Some(s.storage.state_path.clone()),
            ..Self::default()
        }
    }
}

/// Read side of the scheduler: current state and the last finished cycle.
#[derive(Clone)]
pub struct SchedulerHandle {
    state: watch::Receiver<RunState>,
    last_cycle: watch::Receiver<Option<CycleSummary>>,
    transitions: broadcast::Sender<RunState>,
}

impl SchedulerHandle {
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.last_cycle.borrow().clone()
    }

    /// Every state change from now on, in order. `state()` only shows the latest.
    pub fn transitions(&self) -> broadcast::Receiver<RunState> {
        self.transitions.subscribe()
    }

    /// Resolve once the state equals `target` (immediately if it already does).
    pub async fn wait_for(&mut self, target: RunState) -> RunState {
        // Err only means the scheduler is gone; report whatever was last published.
        let _ = self.state.wait_for(|s| *s == target).await;
        *self.state.borrow()
    }
}

/// Totals of a `run` call.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub cycles: u64,
    pub cycles_with_failures: u64,
    pub store_failures: u64,
    pub last: Option<CycleSummary>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.cycles_with_failures > 0 || self.store_failures > 0
    }
}

enum CycleOutcome {
    Done(CycleSummary),
    StoreFailed(StoreError),
    Abandoned,
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    registry: RegistryHandle,
    cfg: SchedulerCfg,
    state_tx: watch::Sender<RunState>,
    last_tx: watch::Sender<Option<CycleSummary>>,
    transitions_tx: broadcast::Sender<RunState>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, registry: RegistryHandle, cfg: SchedulerCfg) -> Self {
        let (state_tx, _) = watch::channel(RunState::Stopped);
        let (last_tx, _) = watch::channel(None);
        let (transitions_tx, _) = broadcast::channel(16);
        Self {
            orchestrator,
            registry,
            cfg,
            state_tx,
            last_tx,
            transitions_tx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            state: self.state_tx.subscribe(),
            last_cycle: self.last_tx.subscribe(),
            transitions: self.transitions_tx.clone(),
        }
    }

    fn set_state(&self, s: RunState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == s {
                return false;
            }
            *current = s;
            true
        });
        if changed {
            // Err only means nobody is subscribed.
            let _ = self.transitions_tx.send(s);
            tracing::debug!(state = ?s, "scheduler state");
        }
    }

    /// Run cycles until done. Fatal only on repeated store failures (immediately in
    /// `Once` mode).
    pub async fn run(self, mode: RunMode, shutdown: CancellationToken) -> Result<RunReport, StoreError> {
        self.set_state(RunState::Running);
        let mut report = RunReport::default();
        let mut consecutive_store_failures: u32 = 0;

        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.set_state(RunState::Stopping);
                    break;
                }
                _ = ticker.tick() => {}
            }

            match self.run_one(&shutdown).await {
                CycleOutcome::Done(summary) => {
                    consecutive_store_failures = 0;
                    report.cycles += 1;
                    if summary.has_failures() {
                        report.cycles_with_failures += 1;
                    }
                    self.finish_cycle(&summary).await;
                    report.last = Some(summary);
                    if self.cleanup_due(report.cycles) {
                        self.cleanup().await;
                    }
                }
                CycleOutcome::StoreFailed(e) => {
                    consecutive_store_failures += 1;
                    report.store_failures += 1;
                    tracing::error!(
                        error = %e,
                        consecutive = consecutive_store_failures,
                        "cycle failed on the store"
                    );
                    if mode == RunMode::Once
                        || consecutive_store_failures >= self.cfg.max_consecutive_store_failures
                    {
                        self.set_state(RunState::Stopped);
                        return Err(e);
                    }
                }
                CycleOutcome::Abandoned => {
                    tracing::warn!("in-flight cycle dropped after abort bound");
                    break;
                }
            }

            if mode == RunMode::Once {
                break;
            }
            if shutdown.is_cancelled() {
                self.set_state(RunState::Stopping);
                break;
            }
        }

        self.set_state(RunState::Stopped);
        tracing::info!(cycles = report.cycles, "scheduler stopped");
        Ok(report)
    }

    async fn run_one(&self, shutdown: &CancellationToken) -> CycleOutcome {
        let signals = CycleSignals::new();
        let registry = self.registry.snapshot();
        let orchestrator = self.orchestrator.clone();
        let cycle_signals = signals.clone();
        let mut cycle =
            tokio::spawn(async move { orchestrator.run_cycle(&registry, &cycle_signals).await });

        tokio::select! {
            joined = &mut cycle => return outcome(joined),
            _ = shutdown.cancelled() => {}
        }

        self.set_state(RunState::Stopping);
        signals.stop.cancel();
        tracing::info!(grace = ?self.cfg.shutdown_grace, "shutdown requested, letting cycle finish");
        if let Ok(joined) = tokio::time::timeout(self.cfg.shutdown_grace, &mut cycle).await {
            return outcome(joined);
        }

        tracing::warn!("grace period over, aborting in-flight fetches");
        signals.abort.cancel();
        match tokio::time::timeout(self.cfg.abort_grace, &mut cycle).await {
            Ok(joined) => outcome(joined),
            Err(_) => {
                cycle.abort();
                CycleOutcome::Abandoned
            }
        }
    }

    async fn finish_cycle(&self, summary: &CycleSummary) {
        self.last_tx.send_replace(Some(summary.clone()));
        if let Some(path) = &self.cfg.state_path {
            if let Err(e) = status::save_last_cycle(path, summary).await {
                tracing::warn!(path = %path.display(), error = %e, "write last-cycle state");
            }
        }
    }

    fn cleanup_due(&self, cycles: u64) -> bool {
        self.cfg.cleanup_every_cycles > 0 && cycles > 0 && cycles % self.cfg.cleanup_every_cycles == 0
    }

    async fn cleanup(&self) {
        let store = self.orchestrator.store().clone();
        let retention = self.cfg.retention;
        match tokio::task::spawn_blocking(move || store.purge_older_than(retention)).await {
            Ok(Ok(removed)) => tracing::info!(removed, "retention cleanup"),
            Ok(Err(e)) => tracing::warn!(error = %e, "retention cleanup failed"),
            Err(e) => tracing::warn!(error = %e, "retention cleanup task failed"),
        }
    }
}

fn outcome(joined: Result<Result<CycleSummary, StoreError>, JoinError>) -> CycleOutcome {
    match joined {
        Ok(Ok(summary)) => CycleOutcome::Done(summary),
        Ok(Err(e)) => CycleOutcome::StoreFailed(e),
        Err(e) => CycleOutcome::StoreFailed(StoreError::Worker(e.to_string())),
    }
}
