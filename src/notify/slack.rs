// src/notify/slack.rs
use async_trait::async_trait;
use reqwest::Client;

use super::{env_required, Article, Sink};
use crate::error::PublishError;

pub struct SlackSink {
    webhook_url: String,
    client: Client,
}

impl SlackSink {
    /// Reads `SLACK_WEBHOOK_URL`.
    pub fn from_env(client: Client) -> Result<Self, PublishError> {
        Ok(Self::new(client, env_required("SLACK_WEBHOOK_URL")?))
    }

    pub fn new(client: Client, url: String) -> Self {
        Self {
            webhook_url: url,
            client,
        }
    }
}

fn escape_mrkdwn(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn slack_text(article: &Article) -> String {
    let mut text = format!(
        "*{}*\n<{}|{}>",
        escape_mrkdwn(&article.source),
        article.url,
        escape_mrkdwn(&article.title)
    );
    let ts = article.timestamp_label();
    if !ts.is_empty() {
        text.push_str(&format!("\n{ts}"));
    }
    text
}

#[async_trait]
impl Sink for SlackSink {
    async fn publish(&self, article: &Article) -> Result<(), PublishError> {
        let body = serde_json::json!({ "text": slack_text(article) });
        let rsp = self.client.post(&self.webhook_url).json(&body).send().await?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body: rsp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ArticleIdentity;

    #[test]
    fn text_links_title() {
        let article = Article {
            identity: ArticleIdentity::from_stored("v1:x"),
            source: "A&B".into(),
            title: "x < y".into(),
            url: "https://x.example/a".into(),
            published_at: None,
        };
        assert_eq!(slack_text(&article), "*A&amp;B*\n<https://x.example/a|x &lt; y>");
    }
}
