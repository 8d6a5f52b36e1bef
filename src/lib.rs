// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod error;
pub mod ingest;
pub mod notify;
pub mod status;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::config::Settings;
pub use crate::ingest::config::{Registry, RegistryHandle};
pub use crate::ingest::pipeline::{CycleSignals, CycleSummary, Orchestrator, PipelineCfg};
pub use crate::ingest::scheduler::{RunMode, RunState, Scheduler, SchedulerCfg, SchedulerHandle};
pub use crate::notify::{Article, Sink};
pub use crate::store::{ArticleIdentity, SeenStore};
