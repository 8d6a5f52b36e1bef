// src/ingest/config.rs
//! Source registry: loading, per-entry validation and hot reload of the sources file.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::ConfigError;
use crate::ingest::extract::{parse_selector, CompiledSelectors};
use crate::ingest::types::{DynamicOptions, Selectors, SourceDefinition, SourceKind};

pub const ENV_SOURCES_PATH: &str = "HARVESTER_SOURCES";
const DEFAULT_TOML: &str = "config/sources.toml";
const DEFAULT_JSON: &str = "config/sources.json";

#[derive(Debug, Default, Deserialize)]
struct RawSelectors {
    container: Option<String>,
    title: Option<String>,
    link: Option<String>,
    #[serde(alias = "time")]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    name: Option<String>,
    #[serde(alias = "type")]
    kind: Option<String>,
    #[serde(alias = "url")]
    location: Option<String>,
    selectors: Option<RawSelectors>,
    #[serde(default)]
    link_prefix: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    exclude_keywords: Vec<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    wait_for: Option<String>,
    #[serde(default)]
    scroll_steps: u32,
    cookies_path: Option<PathBuf>,
    timeout_secs: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

/// Immutable, name-unique set of sources. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    sources: Arc<[SourceDefinition]>,
}

impl Registry {
    /// Later entries whose name is already taken are dropped.
    pub fn new(sources: Vec<SourceDefinition>) -> Self {
        let mut seen = HashSet::new();
        let unique: Vec<SourceDefinition> = sources
            .into_iter()
            .filter(|s| {
                let fresh = seen.insert(s.name.clone());
                if !fresh {
                    tracing::warn!(source = %s.name, "duplicate source name dropped");
                }
                fresh
            })
            .collect();
        Self {
            sources: unique.into(),
        }
    }

    pub fn sources(&self) -> &[SourceDefinition] {
        &self.sources
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceDefinition> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&SourceDefinition> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Result of a load: the usable registry plus every entry that was turned away.
#[derive(Debug)]
pub struct LoadReport {
    pub registry: Registry,
    pub rejected: Vec<ConfigError>,
}

impl LoadReport {
    pub fn log_rejected(&self) {
        for e in &self.rejected {
            tracing::warn!(error = %e, "source entry rejected");
        }
    }
}

/// Load sources from an explicit path. Supports TOML or JSON formats.
pub fn load_registry_from(path: &Path) -> Result<LoadReport, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let entries = parse_entries(&content, &ext).map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })?;
    Ok(validate_entries(entries))
}

/// Same as [`load_registry_from`] for in-memory content; `hint_ext` is `toml` or `json`.
pub fn load_registry_str(content: &str, hint_ext: &str) -> Result<LoadReport, ConfigError> {
    let entries = parse_entries(content, hint_ext).map_err(|message| ConfigError::Parse {
        path: PathBuf::from("<inline>"),
        message,
    })?;
    Ok(validate_entries(entries))
}

/// Which sources file to use:
/// 1) explicit path (CLI / settings)
/// 2) $HARVESTER_SOURCES
/// 3) config/sources.toml
/// 4) config/sources.json
pub fn resolve_sources_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Ok(p) = std::env::var(ENV_SOURCES_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(pb);
        }
        return Err(ConfigError::Invalid(format!(
            "{ENV_SOURCES_PATH} points to non-existent path {}",
            pb.display()
        )));
    }
    for candidate in [DEFAULT_TOML, DEFAULT_JSON] {
        let pb = PathBuf::from(candidate);
        if pb.exists() {
            return Ok(pb);
        }
    }
    Err(ConfigError::Invalid(format!(
        "no sources file found (tried {DEFAULT_TOML}, {DEFAULT_JSON})"
    )))
}

pub fn load_registry_default(explicit: Option<&Path>) -> Result<(PathBuf, LoadReport), ConfigError> {
    let path = resolve_sources_path(explicit)?;
    let report = load_registry_from(&path)?;
    Ok((path, report))
}

fn parse_entries(s: &str, hint_ext: &str) -> Result<Vec<Value>, String> {
    let try_toml = hint_ext == "toml" || (hint_ext != "json" && s.contains("[[sources]]"));
    if try_toml {
        return parse_toml(s);
    }
    match parse_json(s) {
        Ok(v) => Ok(v),
        Err(json_err) if hint_ext != "json" => {
            parse_toml(s).map_err(|toml_err| format!("neither JSON ({json_err}) nor TOML ({toml_err})"))
        }
        Err(e) => Err(e),
    }
}

fn parse_toml(s: &str) -> Result<Vec<Value>, String> {
    #[derive(Deserialize)]
    struct TomlSources {
        #[serde(default)]
        sources: Vec<toml::Value>,
    }
    let doc: TomlSources = toml::from_str(s).map_err(|e| e.to_string())?;
    doc.sources
        .into_iter()
        .map(|v| serde_json::to_value(v).map_err(|e| e.to_string()))
        .collect()
}

fn parse_json(s: &str) -> Result<Vec<Value>, String> {
    let v: Value = serde_json::from_str(s).map_err(|e| e.to_string())?;
    match v {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => match obj.remove("sources") {
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err("`sources` must be an array".to_string()),
            None => Ok(Vec::new()),
        },
        _ => Err("expected an array or an object with `sources`".to_string()),
    }
}

fn validate_entries(entries: Vec<Value>) -> LoadReport {
    let mut accepted: Vec<SourceDefinition> = Vec::new();
    let mut rejected = Vec::new();
    let mut names = HashSet::new();

    for (index, value) in entries.into_iter().enumerate() {
        let label = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>")
            .trim()
            .to_string();
        let reject = |reason: String| ConfigError::InvalidSource {
            index,
            name: label.clone(),
            reason,
        };

        let raw: RawSource = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                rejected.push(reject(e.to_string()));
                continue;
            }
        };
        match build_source(raw) {
            Ok(def) if !names.insert(def.name.to_lowercase()) => {
                rejected.push(reject("duplicate name, first definition wins".to_string()));
            }
            Ok(def) => accepted.push(def),
            Err(reason) => rejected.push(reject(reason)),
        }
    }

    LoadReport {
        registry: Registry::new(accepted),
        rejected,
    }
}

fn build_source(raw: RawSource) -> Result<SourceDefinition, String> {
    let name = raw.name.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err("missing name".to_string());
    }

    let kind = match raw.kind.as_deref() {
        None => SourceKind::Static,
        Some(k) => SourceKind::parse(k).ok_or_else(|| format!("unknown kind {k:?}"))?,
    };

    let loc = raw
        .location
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or("missing location")?;
    let location = parse_http_url(loc).map_err(|e| format!("location: {e}"))?;

    let link_prefix = raw.link_prefix.trim().to_string();
    if !link_prefix.is_empty() {
        parse_http_url(&link_prefix).map_err(|e| format!("link_prefix: {e}"))?;
    }

    let selectors = build_selectors(kind, raw.selectors.unwrap_or_default())?;
    if kind != SourceKind::Rss {
        CompiledSelectors::compile(&selectors)?;
    }

    let wait_for = raw.wait_for.map(|w| w.trim().to_string()).filter(|w| !w.is_empty());
    if let Some(w) = &wait_for {
        parse_selector(w)?;
    }

    let timeout = match raw.timeout_secs {
        Some(0) => return Err("timeout_secs must be positive".to_string()),
        Some(s) => Some(Duration::from_secs(s)),
        None => None,
    };

    Ok(SourceDefinition {
        name: name.to_string(),
        kind,
        location,
        selectors,
        link_prefix,
        keywords: clean_keywords(raw.keywords),
        exclude_keywords: clean_keywords(raw.exclude_keywords),
        enabled: raw.enabled,
        dynamic: DynamicOptions {
            wait_for,
            scroll_steps: raw.scroll_steps,
            cookies_path: raw.cookies_path,
        },
        timeout,
    })
}

fn build_selectors(kind: SourceKind, raw: RawSelectors) -> Result<Selectors, String> {
    let clean = |s: Option<String>| s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let (container, title, link, timestamp) = (
        clean(raw.container),
        clean(raw.title),
        clean(raw.link),
        clean(raw.timestamp),
    );
    match kind {
        SourceKind::Rss => Ok(Selectors::default()),
        SourceKind::Static => Ok(Selectors {
            container: container.ok_or("static source needs selectors.container")?,
            title,
            link,
            timestamp,
        }),
        SourceKind::Dynamic => {
            let defaults = Selectors::dynamic_default();
            Ok(Selectors {
                container: container.unwrap_or(defaults.container),
                title,
                link,
                timestamp: timestamp.or(defaults.timestamp),
            })
        }
    }
}

fn parse_http_url(s: &str) -> Result<Url, String> {
    let url = Url::parse(s).map_err(|e| format!("{s:?}: {e}"))?;
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(url),
        _ => Err(format!("{s:?} is not an absolute http(s) URL")),
    }
}

/// Trim, drop empties, dedup case-insensitively (first spelling kept).
fn clean_keywords(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty() && seen.insert(k.to_lowercase()))
        .collect()
}

/* ----------------------------
Shared handle + hot reload
---------------------------- */

/// Swappable registry shared by the scheduler and the reload watcher. Cycles take a
/// snapshot at start, so a reload never changes a cycle in flight.
#[derive(Clone, Default)]
pub struct RegistryHandle {
    inner: Arc<RwLock<Registry>>,
}

impl RegistryHandle {
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    pub fn snapshot(&self) -> Registry {
        self.inner.read().clone()
    }

    pub fn replace(&self, registry: Registry) {
        *self.inner.write() = registry;
    }
}

/// Poll `path` mtime every `poll` and swap in the reloaded registry. A file that
/// fails to load keeps the previous registry.
pub fn spawn_reload_watcher(
    handle: RegistryHandle,
    path: PathBuf,
    poll: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_mtime: Option<SystemTime> = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .ok();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
            let Ok(mtime) = tokio::fs::metadata(&path).await.and_then(|m| m.modified()) else {
                continue;
            };
            if last_mtime.is_some_and(|prev| mtime <= prev) {
                continue;
            }
            last_mtime = Some(mtime);

            match load_registry_from(&path) {
                Ok(report) => {
                    report.log_rejected();
                    tracing::info!(
                        path = %path.display(),
                        sources = report.registry.len(),
                        rejected = report.rejected.len(),
                        "sources reloaded"
                    );
                    handle.replace(report.registry);
                }
                Err(e) => tracing::warn!(error = %e, "sources reload failed, keeping previous"),
            }
        }
    })
}
