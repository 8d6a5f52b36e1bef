// src/notify/mod.rs
pub mod discord;
pub mod log;
pub mod slack;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use once_cell::sync::OnceCell;
use regex::{Captures, Regex};
use reqwest::Client;
use serde::Serialize;

use crate::config::{OutputConfig, SinkKind};
use crate::error::{ConfigError, PublishError};
use crate::ingest::types::RawItem;
use crate::store::ArticleIdentity;

pub use discord::DiscordSink;
pub use log::LogSink;
pub use slack::SlackSink;
pub use telegram::TelegramSink;

/// What a sink receives for one newly seen item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Article {
    pub identity: ArticleIdentity,
    pub source: String,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
}

impl Article {
    pub fn from_item(identity: ArticleIdentity, item: &RawItem) -> Self {
        Self {
            identity,
            source: item.source_name.clone(),
            title: item.title.clone(),
            url: item.url.clone(),
            published_at: item.published_at,
        }
    }

    /// Local wall-clock label like `14:05 19.10.2026`; empty when unknown.
    pub fn timestamp_label(&self) -> String {
        self.published_at
            .map(|t| t.with_timezone(&Local).format("%H:%M %d.%m.%Y").to_string())
            .unwrap_or_default()
    }
}

/// Destination articles are forwarded to.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    async fn publish(&self, article: &Article) -> Result<(), PublishError>;
    fn name(&self) -> &'static str;
}

/// Fill `{source} {title} {url} {timestamp}` with values passed through `escape`.
/// Single pass over the template: braces inside the values are left as they are.
pub fn render_message(template: &str, article: &Article, escape: impl Fn(&str) -> String) -> String {
    static RE_PLACEHOLDER: OnceCell<Regex> = OnceCell::new();
    let re = RE_PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{(source|title|url|timestamp)\}").unwrap());
    re.replace_all(template, |caps: &Captures| match &caps[1] {
        "source" => escape(&article.source),
        "title" => escape(&article.title),
        "url" => escape(&article.url),
        _ => escape(&article.timestamp_label()),
    })
    .into_owned()
}

fn env_required(key: &'static str) -> Result<String, PublishError> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(PublishError::NotConfigured(key))
}

/// Build the configured sink. Missing credentials are a startup error.
pub fn build_sink(cfg: &OutputConfig) -> Result<Arc<dyn Sink>, ConfigError> {
    let timeout = Duration::from_secs(cfg.publish_timeout_secs.max(1));
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ConfigError::Invalid(format!("sink http client: {e}")))?;
    let not_configured = |e: PublishError| ConfigError::Invalid(format!("{:?} sink: {e}", cfg.sink));

    let sink: Arc<dyn Sink> = match cfg.sink {
        SinkKind::Log => Arc::new(LogSink::new(cfg.message_format.clone())),
        SinkKind::Telegram => Arc::new(
            TelegramSink::from_env(client, cfg.message_format.clone()).map_err(not_configured)?,
        ),
        SinkKind::Discord => Arc::new(
            DiscordSink::from_env(client)
                .map_err(not_configured)?
                .with_timeout(timeout),
        ),
        SinkKind::Slack => Arc::new(SlackSink::from_env(client).map_err(not_configured)?),
    };
    tracing::info!(sink = sink.name(), "output sink ready");
    Ok(sink)
}
