// src/ingest/extract.rs
//! Container/selector extraction shared by the static and dynamic adapters.
//! The dynamic adapter feeds the rendered page source through the same code.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use metrics::counter;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{ExtractionError, FetchError};
use crate::ingest::normalize_text;
use crate::ingest::types::{RawItem, Selectors, SourceDefinition};

/// Selectors compiled once per page.
pub struct CompiledSelectors {
    container: Selector,
    title: Option<Selector>,
    link: Option<Selector>,
    timestamp: Option<Selector>,
    anchor: Selector,
}

pub fn parse_selector(s: &str) -> Result<Selector, String> {
    Selector::parse(s).map_err(|e| format!("invalid selector {s:?}: {e}"))
}

impl CompiledSelectors {
    pub fn compile(sel: &Selectors) -> Result<Self, String> {
        let opt = |s: &Option<String>| -> Result<Option<Selector>, String> {
            match s.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                Some(s) => parse_selector(s).map(Some),
                None => Ok(None),
            }
        };
        Ok(Self {
            container: parse_selector(sel.container.trim())?,
            title: opt(&sel.title)?,
            link: opt(&sel.link)?,
            timestamp: opt(&sel.timestamp)?,
            anchor: parse_selector("a[href]")?,
        })
    }
}

/// Result of cutting one page into items.
#[derive(Debug, Default)]
pub struct Extracted {
    pub items: Vec<RawItem>,
    pub malformed: usize,
}

/// Extract up to `limit` items from `html`. Entries lacking a title or link are
/// counted as malformed and skipped; only a broken selector fails the whole page.
pub fn extract_items(
    html: &str,
    source: &SourceDefinition,
    fetched_at: DateTime<Utc>,
    limit: usize,
) -> Result<Extracted, FetchError> {
    let compiled = CompiledSelectors::compile(&source.selectors).map_err(FetchError::Parse)?;
    let base = source.link_base();
    let doc = Html::parse_document(html);

    let mut out = Extracted::default();
    for container in doc.select(&compiled.container) {
        if out.items.len() >= limit {
            break;
        }
        match extract_one(container, &compiled, base.as_ref()) {
            Ok((title, url, published_at)) => out.items.push(RawItem {
                source_name: source.name.clone(),
                title,
                url,
                published_at,
                fetched_at,
            }),
            Err(e) => {
                tracing::debug!(source = %source.name, error = %e, "skipping malformed entry");
                out.malformed += 1;
            }
        }
    }

    if out.malformed > 0 {
        counter!("harvest_items_malformed_total").increment(out.malformed as u64);
    }
    Ok(out)
}

fn element_text(el: ElementRef<'_>) -> String {
    normalize_text(&el.text().collect::<Vec<_>>().join(" "))
}

fn extract_one(
    container: ElementRef<'_>,
    sel: &CompiledSelectors,
    base: Option<&Url>,
) -> Result<(String, String, Option<DateTime<Utc>>), ExtractionError> {
    let title_el = match &sel.title {
        Some(s) => container
            .select(s)
            .next()
            .ok_or(ExtractionError::MissingTitle)?,
        None => container,
    };
    let mut title = element_text(title_el);

    let ts_el = sel
        .timestamp
        .as_ref()
        .and_then(|s| container.select(s).next());
    let ts_text = ts_el.map(element_text).unwrap_or_default();
    // Sites often render the time inside the headline element.
    if !ts_text.is_empty() && title.contains(&ts_text) {
        title = normalize_text(&title.replace(&ts_text, ""));
    }
    if title.is_empty() {
        return Err(ExtractionError::MissingTitle);
    }

    let link_el = match &sel.link {
        Some(s) => container.select(s).next(),
        None if container.value().name() == "a" => Some(container),
        None => container.select(&sel.anchor).next(),
    }
    .ok_or(ExtractionError::MissingLink)?;
    let href = link_el
        .value()
        .attr("href")
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(ExtractionError::MissingLink)?;
    let url =
        resolve_link(href, base).ok_or_else(|| ExtractionError::UnresolvableLink(href.into()))?;

    let published_at = ts_el.and_then(|el| {
        el.value()
            .attr("datetime")
            .and_then(parse_timestamp)
            .or_else(|| parse_timestamp(&ts_text))
    });

    Ok((title, url, published_at))
}

/// Absolute http(s) links pass through; anything else is joined onto `base`.
pub fn resolve_link(href: &str, base: Option<&Url>) -> Option<String> {
    let href = href.trim();
    let resolved = match Url::parse(href) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(href).ok()?,
        Err(_) => return None,
    };
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

const DATETIME_FORMATS: &[&str] = &[
    "%d.%m.%Y %H:%M",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%d %B %Y, %H:%M",
];
const DATE_FORMATS: &[&str] = &["%d.%m.%Y", "%Y-%m-%d"];

fn local_to_utc(ndt: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&ndt)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Best-effort timestamp parsing. Zone-less values are read as local time; a bare
/// `HH:MM` means today.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M") {
        return local_to_utc(Local::now().date_naive().and_time(t));
    }
    for f in DATETIME_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, f) {
            return local_to_utc(ndt);
        }
    }
    for f in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, f) {
            return d.and_hms_opt(0, 0, 0).and_then(local_to_utc);
        }
    }
    None
}
