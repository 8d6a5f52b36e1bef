// src/notify/telegram.rs
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{env_required, render_message, Article, Sink};
use crate::error::PublishError;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

const MARKDOWN_V2_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
    '\\',
];

/// Escape text for Telegram MarkdownV2.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        if MARKDOWN_V2_SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Posts to a channel via the Bot API. A message rejected for its markup is re-sent
/// once as plain text.
pub struct TelegramSink {
    client: Client,
    api_base: String,
    token: String,
    chat_id: String,
    template: String,
}

impl TelegramSink {
    pub fn new(client: Client, token: String, chat_id: String, template: String) -> Self {
        Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            token,
            chat_id,
            template,
        }
    }

    /// Reads `TELEGRAM_BOT_TOKEN` and `TELEGRAM_CHANNEL_ID`.
    pub fn from_env(client: Client, template: String) -> Result<Self, PublishError> {
        let token = env_required("TELEGRAM_BOT_TOKEN")?;
        let chat_id = env_required("TELEGRAM_CHANNEL_ID")?;
        Ok(Self::new(client, token, chat_id, template))
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn plain_text(article: &Article) -> String {
        format!("📰 {}\n{}\n🔗 {}", article.source, article.title, article.url)
    }

    async fn send(&self, text: &str, markdown: bool) -> Result<(), PublishError> {
        let mut body = json!({
            "chat_id": self.chat_id,
            "text": text,
            "disable_web_page_preview": false,
        });
        if markdown {
            body["parse_mode"] = json!("MarkdownV2");
        }
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let rsp = self.client.post(url).json(&body).send().await?;
        let status = rsp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = rsp.text().await.unwrap_or_default();
        Err(PublishError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Sink for TelegramSink {
    async fn publish(&self, article: &Article) -> Result<(), PublishError> {
        let message = render_message(&self.template, article, escape_markdown_v2);
        match self.send(&message, true).await {
            Ok(()) => Ok(()),
            Err(PublishError::Rejected { status, body }) if status != 429 => {
                tracing::warn!(
                    source = %article.source,
                    status,
                    body = %body,
                    "telegram rejected markdown, retrying as plain text"
                );
                self.send(&Self::plain_text(article), false).await
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markdown_v2_specials() {
        assert_eq!(
            escape_markdown_v2("Price up 2.5% (again)!"),
            "Price up 2\\.5% \\(again\\)\\!"
        );
        assert_eq!(escape_markdown_v2("a_b*c"), "a\\_b\\*c");
    }
}
