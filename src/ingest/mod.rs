// src/ingest/mod.rs
pub mod config;
pub mod extract;
pub mod filter;
pub mod pipeline;
pub mod providers;
pub mod scheduler;
pub mod types;

use crate::ingest::types::RawItem;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

/// Titles longer than this are cut and suffixed with `...`.
pub const MAX_TITLE_CHARS: usize = 280;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("harvest_cycles_total", "Completed pipeline cycles.");
        describe_counter!(
            "harvest_sources_failed_total",
            "Source fetches that failed, by error kind."
        );
        describe_counter!(
            "harvest_items_fetched_total",
            "Items returned by adapters after normalization."
        );
        describe_counter!(
            "harvest_items_filtered_total",
            "Items dropped by keyword/exclude rules."
        );
        describe_counter!(
            "harvest_items_deduped_total",
            "Items dropped because their identity was already seen."
        );
        describe_counter!(
            "harvest_items_published_total",
            "Items handed to the sink successfully."
        );
        describe_counter!(
            "harvest_publish_failures_total",
            "Items recorded as seen whose publish failed."
        );
        describe_counter!(
            "harvest_items_malformed_total",
            "Page entries skipped because title or link could not be extracted."
        );
        describe_histogram!("harvest_fetch_ms", "Per-source fetch time in milliseconds.");
        describe_gauge!(
            "harvest_last_cycle_ts",
            "Unix ts when the last pipeline cycle finished."
        );
    });
}

/// Normalize scraped text: decode entities, strip tags, collapse whitespace, trim.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Collapse whitespace (incl. NBSP, which \s covers in unicode mode)
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out.trim().to_string()
}

/// Normalized, length-capped title.
pub fn normalize_title(s: &str) -> String {
    let out = normalize_text(s);
    if out.chars().count() > MAX_TITLE_CHARS {
        let mut cut: String = out.chars().take(MAX_TITLE_CHARS).collect();
        cut.push_str("...");
        return cut;
    }
    out
}

/// Uniform post-fetch step shared by all adapters. Returns None for items that end
/// up with an empty title or URL.
pub fn normalize_item(mut item: RawItem) -> Option<RawItem> {
    item.title = normalize_title(&item.title);
    item.url = item.url.split_whitespace().collect::<String>();
    if item.title.is_empty() || item.url.is_empty() {
        return None;
    }
    Some(item)
}

pub fn normalize_items(items: Vec<RawItem>) -> Vec<RawItem> {
    items.into_iter().filter_map(normalize_item).collect()
}
