// src/error.rs
//! Error taxonomy of the harvester.
//!
//! Per-source and per-item errors are contained where they happen and only show up
//! in cycle counters and logs. `ConfigError` at startup and a persistent
//! `StoreError` are the only ones that end the process.

use std::path::PathBuf;
use std::time::Duration;

/// Startup/configuration errors. `InvalidSource` is also used per entry while
/// loading the registry, where it is reported and the entry skipped.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("source #{index} ({name}): {reason}")]
    InvalidSource {
        index: usize,
        name: String,
        reason: String,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Why a single source produced nothing this cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("http status {status}")]
    HttpStatus { status: u16 },
    #[error("timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("render failure: {0}")]
    RenderFailure(String),
    #[error("unparsable response: {0}")]
    Parse(String),
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Short label used as a metrics/log tag.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Network(_) => "network",
            FetchError::HttpStatus { .. } => "http_status",
            FetchError::Timeout { .. } => "timeout",
            FetchError::RenderFailure(_) => "render",
            FetchError::Parse(_) => "parse",
            FetchError::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return FetchError::HttpStatus {
                status: status.as_u16(),
            };
        }
        if e.is_timeout() {
            return FetchError::Timeout {
                after: Duration::ZERO,
            };
        }
        FetchError::Network(e.to_string())
    }
}

/// A malformed entry inside an otherwise fine page. Always skipped silently.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("title selector matched nothing")]
    MissingTitle,
    #[error("link selector matched nothing")]
    MissingLink,
    #[error("cannot resolve link {0:?}")]
    UnresolvableLink(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store worker failed: {0}")]
    Worker(String),
    #[error("unsupported schema version {found} (expected {expected})")]
    Schema { found: String, expected: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("publish timed out")]
    Timeout,
    #[error("sink not configured: {0}")]
    NotConfigured(&'static str),
}

impl From<reqwest::Error> for PublishError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return PublishError::Timeout;
        }
        PublishError::Transport(e.to_string())
    }
}
