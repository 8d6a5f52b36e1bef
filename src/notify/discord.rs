// src/notify/discord.rs
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{env_required, Article, Sink};
use crate::error::PublishError;

const EMBED_TITLE_MAX: usize = 256;

#[derive(Clone)]
pub struct DiscordSink {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl DiscordSink {
    pub fn new(client: Client, webhook: String) -> Self {
        Self {
            webhook,
            client,
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    /// Reads `DISCORD_WEBHOOK_URL`.
    pub fn from_env(client: Client) -> Result<Self, PublishError> {
        Ok(Self::new(client, env_required("DISCORD_WEBHOOK_URL")?))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    /// 500ms doubling per attempt, capped at 32s.
    fn backoff(attempt: u8) -> Duration {
        let shift = attempt.saturating_sub(1).min(6);
        Duration::from_millis(500u64 << shift)
    }
}

#[async_trait]
impl Sink for DiscordSink {
    async fn publish(&self, article: &Article) -> Result<(), PublishError> {
        let payload = DiscordWebhookPayload::embed(article);

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            let err = match res {
                Ok(rsp) if rsp.status().is_success() => return Ok(()),
                Ok(rsp) => {
                    let status = rsp.status();
                    let body = rsp.text().await.unwrap_or_default();
                    let err = PublishError::Rejected {
                        status: status.as_u16(),
                        body,
                    };
                    // Only rate limits and server errors are worth another try.
                    if !(status.as_u16() == 429 || status.is_server_error()) {
                        return Err(err);
                    }
                    err
                }
                Err(e) => PublishError::from(e),
            };

            if attempt >= self.max_retries {
                return Err(err);
            }
            tracing::debug!(attempt, error = %err, "discord webhook failed, backing off");
            tokio::time::sleep(Self::backoff(attempt)).await;
        }
    }

    fn name(&self) -> &'static str {
        "discord"
    }
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    url: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

#[derive(Serialize)]
struct DiscordWebhookPayload {
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

impl DiscordWebhookPayload {
    fn embed(article: &Article) -> Self {
        let title: String = if article.title.chars().count() > EMBED_TITLE_MAX {
            let mut t: String = article.title.chars().take(EMBED_TITLE_MAX - 3).collect();
            t.push_str("...");
            t
        } else {
            article.title.clone()
        };
        Self {
            content: None,
            embeds: vec![DiscordEmbed {
                title,
                url: article.url.clone(),
                description: format!("📰 {}", article.source),
                timestamp: article.published_at.map(|t| t.to_rfc3339()),
            }],
        }
    }
}
