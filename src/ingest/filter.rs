// src/ingest/filter.rs
//! Keyword rules applied per source. Matching is plain case-insensitive substring
//! search over the title; "rate" matches "corporate".

use crate::ingest::types::{RawItem, SourceDefinition};

fn contains_ci(haystack_lower: &str, needle: &str) -> bool {
    let n = needle.trim().to_lowercase();
    !n.is_empty() && haystack_lower.contains(&n)
}

/// True when `keywords` is empty or the title contains at least one of them.
pub fn keep<S: AsRef<str>>(item: &RawItem, keywords: &[S]) -> bool {
    if keywords.is_empty() {
        return true;
    }
    let title = item.title.to_lowercase();
    keywords.iter().any(|k| contains_ci(&title, k.as_ref()))
}

/// True when the title contains any exclude keyword.
pub fn is_excluded<S: AsRef<str>>(item: &RawItem, exclude: &[S]) -> bool {
    let title = item.title.to_lowercase();
    exclude.iter().any(|k| contains_ci(&title, k.as_ref()))
}

/// Full per-source decision: exclusions first, then keywords.
pub fn passes(item: &RawItem, source: &SourceDefinition) -> bool {
    !is_excluded(item, &source.exclude_keywords) && keep(item, &source.keywords)
}
