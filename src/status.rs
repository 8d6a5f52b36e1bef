// src/status.rs
//! Last-cycle state file, Prometheus recorder and the optional status endpoint.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::ingest::pipeline::CycleSummary;
use crate::ingest::scheduler::{RunState, SchedulerHandle};
use crate::store::{SeenStore, StoreStats};

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Persist the summary atomically (temp file + rename).
pub async fn save_last_cycle(path: &Path, summary: &CycleSummary) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(summary)?;
    let tmp = temp_path(path);
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, path).await
}

/// Missing or unreadable state reads as "no cycle yet".
pub async fn load_last_cycle(path: &Path) -> Option<CycleSummary> {
    let s = fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&s) {
        Ok(summary) => Some(summary),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable state file");
            None
        }
    }
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        crate::ingest::ensure_metrics_described();
        Ok(Self { handle })
    }
}

#[derive(Clone)]
pub struct StatusState {
    pub scheduler: SchedulerHandle,
    pub store: Arc<SeenStore>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Serialize)]
struct StatsResp {
    state: RunState,
    store: Option<StoreStats>,
    last_cycle: Option<CycleSummary>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stats", get(stats))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

async fn stats(State(state): State<StatusState>) -> Json<StatsResp> {
    let store = state.store.clone();
    let store_stats = match tokio::task::spawn_blocking(move || store.stats()).await {
        Ok(Ok(s)) => Some(s),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "store stats");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "store stats task");
            None
        }
    };
    Json(StatsResp {
        state: state.scheduler.state(),
        store: store_stats,
        last_cycle: state.scheduler.last_cycle(),
    })
}

async fn render_metrics(State(state): State<StatusState>) -> String {
    state
        .metrics
        .as_ref()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Serve the status router on `listen` until `shutdown` fires.
pub async fn serve(listen: &str, state: StatusState, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("status.listen {listen:?} is not a socket address"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding status endpoint on {addr}"))?;
    tracing::info!(%addr, "status endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("status endpoint")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_path_sits_next_to_target() {
        assert_eq!(
            temp_path(Path::new("data/last_cycle.json")),
            PathBuf::from("data/last_cycle.json.tmp")
        );
    }
}
