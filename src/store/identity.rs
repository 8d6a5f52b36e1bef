// src/store/identity.rs
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::ingest::types::RawItem;

/// Prefix versioning the derivation; bump it when the inputs below change.
pub const IDENTITY_VERSION: &str = "v1";

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "ref", "mc_cid", "mc_eid"];
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "in", "on", "at", "to", "for", "of", "and", "is", "are", "was", "were",
];

/// Deterministic "same article" key, e.g. `v1:3f5a…`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArticleIdentity(String);

impl ArticleIdentity {
    /// URL-based when the URL parses (source name excluded, so the same link seen
    /// through two sources collapses), otherwise `(source, normalized title)`.
    pub fn derive(source_name: &str, title: &str, url: &str) -> Self {
        let digest = match normalize_url(url) {
            Some(normalized) => sha256_hex(&["url", &normalized]),
            None => sha256_hex(&["title", source_name.trim(), &normalize_title(title)]),
        };
        Self(format!("{IDENTITY_VERSION}:{digest}"))
    }

    pub fn for_item(item: &RawItem) -> Self {
        Self::derive(&item.source_name, &item.title, &item.url)
    }

    /// Wrap a value read back from storage.
    pub fn from_stored(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArticleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(p.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn is_tracking_param(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k.starts_with("utm_") || TRACKING_PARAMS.contains(&k.as_str())
}

/// Canonical form of an article URL: lower-case host, no fragment, no default port,
/// tracking params removed, remaining query pairs sorted, trailing `/` trimmed.
/// None for anything that is not an absolute http(s) URL.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let trimmed = url.path().trim_end_matches('/').to_string();
    url.set_path(&trimmed);

    let mut out = url.to_string();
    if url.query().is_none() {
        while out.ends_with('/') {
            out.pop();
        }
    }
    Some(out)
}

/// Lower-case, punctuation stripped, stop-words dropped. Used for title-based
/// identities and near-duplicate comparison.
pub fn normalize_title(title: &str) -> String {
    let cleaned: String = title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    cleaned
        .split_whitespace()
        .filter(|w| !STOP_WORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Token-sort similarity in 0..=100 between two already normalized titles.
pub fn title_similarity(a: &str, b: &str) -> u8 {
    let sorted = |s: &str| {
        let mut tokens: Vec<&str> = s.split_whitespace().collect();
        tokens.sort_unstable();
        tokens.join(" ")
    };
    let (a, b) = (sorted(a), sorted(b));
    if a.is_empty() && b.is_empty() {
        return 100;
    }
    (strsim::normalized_levenshtein(&a, &b) * 100.0).round() as u8
}
