// src/ingest/providers/mod.rs
pub mod dynamic;
pub mod rss;
pub mod static_html;
pub mod webdriver;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use url::Url;

use crate::config::Settings;
use crate::error::{ConfigError, FetchError};
use crate::ingest::types::{FetchAdapter, FetchContext, SourceKind};

use dynamic::{BrowserCfg, DynamicAdapter};
use rss::RssAdapter;
use static_html::StaticHtmlAdapter;
use webdriver::WebDriverClient;

/// Shared HTTP client for page/feed fetches.
pub fn http_client(user_agent: &str, timeout: Duration) -> Result<Client, ConfigError> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))
}

/// GET `url` as text; non-2xx is an error, cancellation wins over a pending request.
pub(crate) async fn get_text(
    client: &Client,
    url: &Url,
    ctx: &FetchContext,
) -> Result<String, FetchError> {
    if ctx.is_cancelled() {
        return Err(FetchError::Cancelled);
    }
    let result = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(FetchError::Cancelled),
        r = request_text(client, url, ctx.timeout) => r,
    };
    result.map_err(|e| match e {
        FetchError::Timeout { .. } => FetchError::Timeout { after: ctx.timeout },
        other => other,
    })
}

async fn request_text(client: &Client, url: &Url, timeout: Duration) -> Result<String, FetchError> {
    let resp = client.get(url.clone()).timeout(timeout).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
        });
    }
    Ok(resp.text().await?)
}

/// Adapter dispatch by `SourceKind`.
#[derive(Clone)]
pub struct AdapterSet {
    static_html: Arc<dyn FetchAdapter>,
    dynamic: Arc<dyn FetchAdapter>,
    rss: Arc<dyn FetchAdapter>,
}

impl AdapterSet {
    pub fn new(
        static_html: Arc<dyn FetchAdapter>,
        dynamic: Arc<dyn FetchAdapter>,
        rss: Arc<dyn FetchAdapter>,
    ) -> Self {
        Self {
            static_html,
            dynamic,
            rss,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let scraping = &settings.scraping;
        let client = http_client(&scraping.user_agent, scraping.request_timeout())?;

        let browser = &settings.browser;
        let driver = WebDriverClient::new(
            &browser.webdriver_url,
            browser.render_timeout().saturating_add(Duration::from_secs(5)),
        )?;
        let cfg = BrowserCfg {
            render_timeout: browser.render_timeout(),
            settle: Duration::from_millis(browser.settle_ms),
            headless: browser.headless,
            user_agent: scraping.user_agent.clone(),
            max_items: scraping.max_items_per_source,
            ..BrowserCfg::default()
        };

        Ok(Self::new(
            Arc::new(StaticHtmlAdapter::new(
                client.clone(),
                scraping.max_items_per_source,
            )),
            Arc::new(DynamicAdapter::new(driver, browser.max_sessions, cfg)),
            Arc::new(RssAdapter::new(client, scraping.max_items_per_source)),
        ))
    }

    pub fn for_kind(&self, kind: SourceKind) -> Arc<dyn FetchAdapter> {
        match kind {
            SourceKind::Static => self.static_html.clone(),
            SourceKind::Dynamic => self.dynamic.clone(),
            SourceKind::Rss => self.rss.clone(),
        }
    }
}
