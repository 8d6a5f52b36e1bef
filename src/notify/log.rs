// src/notify/log.rs
use async_trait::async_trait;

use super::{render_message, Article, Sink};
use crate::error::PublishError;

/// Writes each article to the log. Default sink; needs no credentials.
pub struct LogSink {
    template: String,
}

impl LogSink {
    pub fn new(template: String) -> Self {
        Self { template }
    }
}

#[async_trait]
impl Sink for LogSink {
    async fn publish(&self, article: &Article) -> Result<(), PublishError> {
        let message = render_message(&self.template, article, |s| s.to_string());
        tracing::info!(
            target: "news_harvester::publish",
            source = %article.source,
            identity = %article.identity,
            url = %article.url,
            "{message}"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
