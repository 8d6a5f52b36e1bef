// src/ingest/types.rs
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

/// Scraping strategy of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Static,
    Dynamic,
    Rss,
}

impl SourceKind {
    /// Accepts the canonical names plus the legacy aliases of older configs.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" | "web" | "html" => Some(SourceKind::Static),
            "dynamic" | "playwright" | "twitter" | "browser" => Some(SourceKind::Dynamic),
            "rss" | "atom" | "feed" => Some(SourceKind::Rss),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Static => "static",
            SourceKind::Dynamic => "dynamic",
            SourceKind::Rss => "rss",
        }
    }
}

/// CSS selectors used to cut a page into items.
/// `title`/`link` = None means "use the container itself" (link: or its first `<a>`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selectors {
    pub container: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub timestamp: Option<String>,
}

impl Selectors {
    pub fn dynamic_default() -> Self {
        Self {
            container: "article".to_string(),
            title: None,
            link: None,
            timestamp: Some("time".to_string()),
        }
    }
}

/// Browser-only knobs of a dynamic source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DynamicOptions {
    /// Selector whose presence means "content is ready". Defaults to the container.
    pub wait_for: Option<String>,
    pub scroll_steps: u32,
    pub cookies_path: Option<std::path::PathBuf>,
}

/// Validated, read-only description of one configured source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDefinition {
    pub name: String,
    pub kind: SourceKind,
    pub location: url::Url,
    pub selectors: Selectors,
    pub link_prefix: String,
    pub keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub enabled: bool,
    pub dynamic: DynamicOptions,
    pub timeout: Option<Duration>,
}

impl SourceDefinition {
    /// Base URL relative links are resolved against.
    pub fn link_base(&self) -> Option<url::Url> {
        if self.link_prefix.trim().is_empty() {
            return Some(self.location.clone());
        }
        url::Url::parse(self.link_prefix.trim()).ok()
    }

    pub fn wait_for(&self) -> &str {
        self.dynamic
            .wait_for
            .as_deref()
            .unwrap_or(self.selectors.container.as_str())
    }
}

/// One harvested entry before filtering and dedup. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawItem {
    pub source_name: String,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

/// Deadline + cooperative cancellation handed to every adapter call.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl FetchContext {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub type FetchResult = Result<Vec<RawItem>, FetchError>;

/// Capability implemented by every scraping strategy. Implementations convert all
/// failures into `FetchError`; nothing else crosses this boundary.
#[async_trait::async_trait]
pub trait FetchAdapter: Send + Sync {
    async fn fetch(&self, source: &SourceDefinition, ctx: &FetchContext) -> FetchResult;
    fn name(&self) -> &'static str;
}
