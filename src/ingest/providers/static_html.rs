// src/ingest/providers/static_html.rs
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;

use super::get_text;
use crate::ingest::extract::extract_items;
use crate::ingest::normalize_items;
use crate::ingest::types::{FetchAdapter, FetchContext, FetchResult, SourceDefinition};

/// Plain HTTP GET + CSS selector extraction.
pub struct StaticHtmlAdapter {
    client: Client,
    max_items: usize,
}

impl StaticHtmlAdapter {
    pub fn new(client: Client, max_items: usize) -> Self {
        Self { client, max_items }
    }
}

#[async_trait]
impl FetchAdapter for StaticHtmlAdapter {
    async fn fetch(&self, source: &SourceDefinition, ctx: &FetchContext) -> FetchResult {
        let body = get_text(&self.client, &source.location, ctx).await?;
        let extracted = extract_items(&body, source, Utc::now(), self.max_items)?;
        tracing::debug!(
            source = %source.name,
            items = extracted.items.len(),
            malformed = extracted.malformed,
            "page extracted"
        );
        Ok(normalize_items(extracted.items))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
