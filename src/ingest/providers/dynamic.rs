// src/ingest/providers/dynamic.rs
//! Headless-browser adapter for pages that only show content after scripts run
//! (social feeds, SPA news pages).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use super::webdriver::{to_webdriver_cookie, Session, WebDriverClient};
use crate::error::FetchError;
use crate::ingest::extract::extract_items;
use crate::ingest::normalize_items;
use crate::ingest::types::{FetchAdapter, FetchContext, FetchResult, SourceDefinition};

const READY_SCRIPT: &str = "return document.readyState === 'complete' \
    && document.querySelector(arguments[0]) !== null;";
const SCROLL_SCRIPT: &str = "window.scrollBy(0, 800); return true;";

#[derive(Debug, Clone)]
pub struct BrowserCfg {
    pub render_timeout: Duration,
    pub settle: Duration,
    pub poll_interval: Duration,
    pub scroll_pause: Duration,
    pub headless: bool,
    pub user_agent: String,
    pub max_items: usize,
}

impl Default for BrowserCfg {
    fn default() -> Self {
        Self {
            render_timeout: Duration::from_secs(30),
            settle: Duration::from_secs(2),
            poll_interval: Duration::from_millis(250),
            scroll_pause: Duration::from_secs(1),
            headless: true,
            user_agent: String::new(),
            max_items: 20,
        }
    }
}

pub struct DynamicAdapter {
    driver: WebDriverClient,
    sessions: Arc<Semaphore>,
    cfg: BrowserCfg,
}

impl DynamicAdapter {
    /// `max_sessions` caps concurrently open browser sessions; every fetch gets its
    /// own session, so DOM state never interleaves between sources.
    pub fn new(driver: WebDriverClient, max_sessions: usize, cfg: BrowserCfg) -> Self {
        Self {
            driver,
            sessions: Arc::new(Semaphore::new(max_sessions.max(1))),
            cfg,
        }
    }

    fn capabilities(&self) -> Value {
        let mut args = vec![
            "--disable-gpu".to_string(),
            "--no-sandbox".to_string(),
            "--window-size=1280,800".to_string(),
        ];
        if self.cfg.headless {
            args.push("--headless=new".to_string());
        }
        if !self.cfg.user_agent.is_empty() {
            args.push(format!("--user-agent={}", self.cfg.user_agent));
        }
        json!({
            "browserName": "chrome",
            "goog:chromeOptions": { "args": args }
        })
    }

    async fn render(
        &self,
        session: &Session,
        source: &SourceDefinition,
        ctx: &FetchContext,
    ) -> Result<String, FetchError> {
        session
            .set_page_load_timeout(self.cfg.render_timeout)
            .await?;

        if let Some(path) = &source.dynamic.cookies_path {
            // Cookies can only be set for the current origin, so visit it first.
            let cookies = load_cookies(path).await?;
            let origin = source.location.origin().ascii_serialization();
            session.navigate(&origin).await?;
            for c in cookies {
                session.add_cookie(c).await?;
            }
        }

        session.navigate(source.location.as_str()).await?;
        self.wait_ready(session, source.wait_for(), ctx).await?;
        pause(self.cfg.settle, ctx).await?;

        for _ in 0..source.dynamic.scroll_steps {
            session.execute(SCROLL_SCRIPT, json!([])).await?;
            pause(self.cfg.scroll_pause, ctx).await?;
        }

        session.source().await
    }

    async fn wait_ready(
        &self,
        session: &Session,
        selector: &str,
        ctx: &FetchContext,
    ) -> Result<(), FetchError> {
        loop {
            if ctx.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let ready = session.execute(READY_SCRIPT, json!([selector])).await?;
            if ready.as_bool() == Some(true) {
                return Ok(());
            }
            pause(self.cfg.poll_interval, ctx).await?;
        }
    }
}

/// Sleep that wakes up early on cancellation.
async fn pause(d: Duration, ctx: &FetchContext) -> Result<(), FetchError> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(FetchError::Cancelled),
        _ = tokio::time::sleep(d) => Ok(()),
    }
}

async fn load_cookies(path: &std::path::Path) -> Result<Vec<Value>, FetchError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| FetchError::RenderFailure(format!("cookies {}: {e}", path.display())))?;
    let list: Vec<Value> = serde_json::from_str(&raw)
        .map_err(|e| FetchError::RenderFailure(format!("cookies {}: {e}", path.display())))?;
    Ok(list.iter().filter_map(to_webdriver_cookie).collect())
}

#[async_trait]
impl FetchAdapter for DynamicAdapter {
    async fn fetch(&self, source: &SourceDefinition, ctx: &FetchContext) -> FetchResult {
        let _permit = tokio::select! {
            p = self.sessions.clone().acquire_owned() => p.map_err(|_| FetchError::Cancelled)?,
            _ = ctx.cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        let session = self.driver.new_session(self.capabilities()).await?;
        let budget = self.cfg.render_timeout.min(ctx.timeout);
        let rendered = tokio::time::timeout(budget, self.render(&session, source, ctx)).await;
        // Deleting the session also aborts a render that is stuck in the browser.
        session.close().await;

        let html = match rendered {
            Ok(Ok(html)) => html,
            Ok(Err(FetchError::Timeout { .. })) | Err(_) => {
                return Err(FetchError::Timeout { after: budget })
            }
            Ok(Err(e)) => return Err(e),
        };

        let extracted = extract_items(&html, source, Utc::now(), self.cfg.max_items)?;
        tracing::debug!(
            source = %source.name,
            items = extracted.items.len(),
            malformed = extracted.malformed,
            "rendered page extracted"
        );
        Ok(normalize_items(extracted.items))
    }

    fn name(&self) -> &'static str {
        "dynamic"
    }
}
