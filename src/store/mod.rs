// src/store/mod.rs
//! Durable "already seen" set backed by one SQLite file.
//!
//! All access goes through a single connection behind a mutex, which serializes
//! check-and-insert. Every write is its own autocommit transaction with
//! `synchronous=FULL`, so a successful claim is on disk before the call returns.
//! Methods block; async callers go through `spawn_blocking`.

pub mod identity;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::StoreError;
pub use identity::ArticleIdentity;
use identity::{normalize_title, title_similarity};

pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS seen (
    identity         TEXT PRIMARY KEY,
    first_seen_at    INTEGER NOT NULL,
    source           TEXT NOT NULL,
    title            TEXT,
    normalized_title TEXT,
    url              TEXT,
    duplicate_of     TEXT
);
CREATE INDEX IF NOT EXISTS idx_seen_first_seen ON seen(first_seen_at);
CREATE INDEX IF NOT EXISTS idx_seen_source ON seen(source);
";

/// What gets written next to an identity.
#[derive(Debug, Clone)]
pub struct SeenMeta {
    pub source: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub seen_at: DateTime<Utc>,
}

/// Near-duplicate check applied by [`SeenStore::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimilarityRule {
    /// Token-sort similarity (0..=100) at or above which titles count as the same story.
    pub threshold: u8,
    pub window: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Newly recorded; the caller owns publishing it.
    Recorded,
    /// Identity already present.
    Seen,
    /// Recorded, but as a re-worded copy of an earlier story.
    NearDuplicate { of: ArticleIdentity },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_records: u64,
    pub oldest_record: Option<DateTime<Utc>>,
    pub newest_record: Option<DateTime<Utc>>,
    pub by_source: BTreeMap<String, u64>,
}

pub struct SeenStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SeenStore {
    /// Open (or create) the database file, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::init(conn, Some(path.to_path_buf()))?;
        info!(path = %path.display(), "seen store opened");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;

        let found: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match found {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(found) => {
                return Err(StoreError::Schema {
                    found,
                    expected: SCHEMA_VERSION,
                })
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn exists(&self, identity: &ArticleIdentity) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        exists_locked(&conn, identity)
    }

    /// Atomic insert; true iff this call inserted the identity.
    pub fn record_if_absent(
        &self,
        identity: &ArticleIdentity,
        meta: &SeenMeta,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        insert_locked(&conn, identity, meta, None)
    }

    /// Check-and-record with an optional near-duplicate check, all under one lock.
    pub fn claim(
        &self,
        identity: &ArticleIdentity,
        meta: &SeenMeta,
        rule: Option<SimilarityRule>,
    ) -> Result<Claim, StoreError> {
        let conn = self.conn.lock();
        if exists_locked(&conn, identity)? {
            return Ok(Claim::Seen);
        }

        let similar = match (rule, meta.title.as_deref()) {
            (Some(rule), Some(title)) => find_similar(&conn, title, meta.seen_at, rule)?,
            _ => None,
        };
        if !insert_locked(&conn, identity, meta, similar.as_ref())? {
            return Ok(Claim::Seen);
        }
        Ok(match similar {
            Some(of) => {
                debug!(source = %meta.source, identity = %identity, of = %of, "near-duplicate recorded");
                Claim::NearDuplicate { of }
            }
            None => Claim::Recorded,
        })
    }

    /// Remove records first seen more than `age` ago.
    pub fn purge_older_than(&self, age: Duration) -> Result<usize, StoreError> {
        self.purge_older_than_at(Utc::now(), age)
    }

    /// Remove exactly the records with `first_seen_at < now - age`.
    pub fn purge_older_than_at(&self, now: DateTime<Utc>, age: Duration) -> Result<usize, StoreError> {
        let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
        let cutoff = now
            .checked_sub_signed(age)
            .map(|t| t.timestamp_millis())
            .unwrap_or(i64::MIN);
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM seen WHERE first_seen_at < ?1", params![cutoff])?;
        Ok(removed)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock();
        let (total, oldest, newest): (i64, Option<i64>, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MIN(first_seen_at), MAX(first_seen_at) FROM seen",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut stmt =
            conn.prepare("SELECT source, COUNT(*) FROM seen GROUP BY source ORDER BY source")?;
        let by_source = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .map(|r| r.map(|(s, n)| (s, n.max(0) as u64)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(StoreStats {
            total_records: total.max(0) as u64,
            oldest_record: oldest.and_then(DateTime::from_timestamp_millis),
            newest_record: newest.and_then(DateTime::from_timestamp_millis),
            by_source,
        })
    }
}

fn exists_locked(conn: &Connection, identity: &ArticleIdentity) -> Result<bool, StoreError> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM seen WHERE identity = ?1",
            params![identity.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn insert_locked(
    conn: &Connection,
    identity: &ArticleIdentity,
    meta: &SeenMeta,
    duplicate_of: Option<&ArticleIdentity>,
) -> Result<bool, StoreError> {
    let normalized = meta.title.as_deref().map(normalize_title);
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO seen
         (identity, first_seen_at, source, title, normalized_title, url, duplicate_of)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            identity.as_str(),
            meta.seen_at.timestamp_millis(),
            meta.source,
            meta.title,
            normalized,
            meta.url,
            duplicate_of.map(ArticleIdentity::as_str),
        ],
    )?;
    Ok(inserted == 1)
}

/// First original (non-duplicate) record inside the window whose normalized title is
/// similar enough.
fn find_similar(
    conn: &Connection,
    title: &str,
    now: DateTime<Utc>,
    rule: SimilarityRule,
) -> Result<Option<ArticleIdentity>, StoreError> {
    let normalized = normalize_title(title);
    if normalized.is_empty() {
        return Ok(None);
    }
    let window = chrono::Duration::from_std(rule.window).unwrap_or(chrono::Duration::MAX);
    let since = now
        .checked_sub_signed(window)
        .map(|t| t.timestamp_millis())
        .unwrap_or(i64::MIN);

    let mut stmt = conn.prepare(
        "SELECT identity, normalized_title FROM seen
         WHERE first_seen_at >= ?1 AND duplicate_of IS NULL
           AND normalized_title IS NOT NULL AND normalized_title != ''
         ORDER BY first_seen_at",
    )?;
    let rows = stmt.query_map(params![since], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (id, existing) = row?;
        if title_similarity(&normalized, &existing) >= rule.threshold {
            return Ok(Some(ArticleIdentity::from_stored(id)));
        }
    }
    Ok(None)
}
