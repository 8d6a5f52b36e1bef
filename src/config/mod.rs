// src/config/mod.rs
//! Runtime settings (`config/harvester.toml`). Every field has a default, so a
//! missing file simply means defaults; credentials only come from the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::error::ConfigError;

pub const ENV_CONFIG_PATH: &str = "HARVESTER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/harvester.toml";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const DEFAULT_MESSAGE_FORMAT: &str = "📰 *{source}*\n{title}\n🔗 {url}\n⏰ {timestamp}";

/// Upper bound for the cycle interval (one year).
pub const MAX_INTERVAL_MINUTES: u64 = 365 * 24 * 60;

/// Whole days as a duration, saturating instead of overflowing.
pub fn days(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(86_400))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    pub interval_minutes: u64,
    pub request_timeout_secs: u64,
    pub max_items_per_source: usize,
    pub max_concurrent_fetches: usize,
    pub user_agent: String,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 10,
            request_timeout_secs: 30,
            max_items_per_source: 20,
            max_concurrent_fetches: 4,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ScrapingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.clamp(1, MAX_INTERVAL_MINUTES) * 60)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    pub max_sessions: usize,
    pub render_timeout_secs: u64,
    pub settle_ms: u64,
    pub headless: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://127.0.0.1:9515".to_string(),
            max_sessions: 2,
            render_timeout_secs: 30,
            settle_ms: 2_000,
            headless: true,
        }
    }
}

impl BrowserConfig {
    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub keep_days: u64,
    pub state_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/news.db"),
            keep_days: 7,
            state_path: PathBuf::from("data/last_cycle.json"),
        }
    }
}

impl StorageConfig {
    pub fn retention(&self) -> Duration {
        days(self.keep_days)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// 0..=100; None disables near-duplicate suppression.
    pub similarity_threshold: Option<u8>,
    pub similarity_window_hours: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: None,
            similarity_window_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Log,
    Telegram,
    Discord,
    Slack,
}

impl SinkKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" | "stdout" => Some(SinkKind::Log),
            "telegram" => Some(SinkKind::Telegram),
            "discord" => Some(SinkKind::Discord),
            "slack" => Some(SinkKind::Slack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub sink: SinkKind,
    pub publish_timeout_secs: u64,
    pub publish_delay_ms: u64,
    pub max_concurrent_publishes: usize,
    pub message_format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::Log,
            publish_timeout_secs: 15,
            publish_delay_ms: 1_000,
            max_concurrent_publishes: 2,
            message_format: DEFAULT_MESSAGE_FORMAT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub shutdown_grace_secs: u64,
    pub cleanup_every_cycles: u64,
    pub max_consecutive_store_failures: u32,
    /// 0 disables hot reload of the sources file.
    pub reload_poll_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: 30,
            cleanup_every_cycles: 60,
            max_consecutive_store_failures: 3,
            reload_poll_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sources_path: Option<PathBuf>,
    pub scraping: ScrapingConfig,
    pub browser: BrowserConfig,
    pub storage: StorageConfig,
    pub dedup: DedupConfig,
    pub output: OutputConfig,
    pub scheduler: SchedulerConfig,
    pub status: StatusConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load from an explicit file (TOML, or JSON by extension) and apply env overrides.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let mut cfg = if is_json {
            serde_json::from_str::<Settings>(&data).map_err(|e| e.to_string())
        } else {
            toml::from_str::<Settings>(&data).map_err(|e| e.to_string())
        }
        .map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Resolution order: explicit path, `$HARVESTER_CONFIG`, `config/harvester.toml`,
    /// built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(p) = explicit {
            return Self::load_from_file(p);
        }
        if let Ok(p) = env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(ConfigError::Invalid(format!(
                    "{ENV_CONFIG_PATH} points to non-existent path {}",
                    pb.display()
                )));
            }
            return Self::load_from_file(&pb);
        }
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default.exists() {
            return Self::load_from_file(&default);
        }
        let mut cfg = Settings::default();
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = env::var("SCRAPE_INTERVAL") {
            self.scraping.interval_minutes = v
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("SCRAPE_INTERVAL={v:?} is not a number")))?;
        }
        if let Ok(v) = env::var("HARVESTER_SINK") {
            self.output.sink = SinkKind::parse(&v)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown sink {v:?}")))?;
        }
        if let Ok(v) = env::var("HARVESTER_DB_PATH") {
            self.storage.database_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("HARVESTER_SOURCES") {
            self.sources_path = Some(PathBuf::from(v));
        }

        // Sanitize
        if let Some(t) = self.dedup.similarity_threshold {
            self.dedup.similarity_threshold = Some(t.min(100));
        }
        self.scraping.max_concurrent_fetches = self.scraping.max_concurrent_fetches.max(1);
        self.output.max_concurrent_publishes = self.output.max_concurrent_publishes.max(1);
        Ok(())
    }
}
