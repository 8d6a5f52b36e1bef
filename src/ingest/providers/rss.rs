use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use quick_xml::de::from_str;
use reqwest::Client;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use super::get_text;
use crate::error::FetchError;
use crate::ingest::extract::{parse_timestamp, resolve_link};
use crate::ingest::normalize_items;
use crate::ingest::types::{FetchAdapter, FetchContext, FetchResult, RawItem, SourceDefinition};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entry: Vec<AtomEntry>,
}
#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<AtomText>,
    #[serde(rename = "link", default)]
    link: Vec<AtomLink>,
    updated: Option<String>,
    published: Option<String>,
}
#[derive(Debug, Deserialize)]
struct AtomText {
    #[serde(rename = "$text", default)]
    text: String,
}
#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
        .and_then(|x| Utc.timestamp_opt(x, 0).single())
}

/// Parse an RSS 2.0 or Atom document into raw items (at most `limit`).
pub fn parse_feed(
    xml: &str,
    source: &SourceDefinition,
    fetched_at: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<RawItem>, FetchError> {
    let xml_clean = scrub_html_entities_for_xml(xml);
    if !["<rss", "<feed"].iter().any(|root| xml_clean.contains(root)) {
        return Err(FetchError::Parse("no <rss> or <feed> element".to_string()));
    }
    let base = source.link_base();
    let item = |title: String, href: &str, published_at| {
        resolve_link(href, base.as_ref()).map(|url| RawItem {
            source_name: source.name.clone(),
            title,
            url,
            published_at,
            fetched_at,
        })
    };

    let out: Vec<RawItem> = match from_str::<Rss>(&xml_clean) {
        Ok(rss) => rss
            .channel
            .item
            .into_iter()
            .filter_map(|it| {
                let published = it
                    .pub_date
                    .as_deref()
                    .and_then(|d| parse_rfc2822(d).or_else(|| parse_timestamp(d)));
                item(
                    it.title.unwrap_or_default(),
                    it.link.as_deref().unwrap_or_default(),
                    published,
                )
            })
            .take(limit)
            .collect(),
        Err(rss_err) => {
            let feed: AtomFeed = from_str(&xml_clean).map_err(|atom_err| {
                FetchError::Parse(format!("neither RSS ({rss_err}) nor Atom ({atom_err})"))
            })?;
            feed.entry
                .into_iter()
                .filter_map(|e| {
                    let href = e
                        .link
                        .iter()
                        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
                        .and_then(|l| l.href.clone())
                        .unwrap_or_default();
                    let published = e
                        .published
                        .as_deref()
                        .or(e.updated.as_deref())
                        .and_then(parse_timestamp);
                    item(e.title.map(|t| t.text).unwrap_or_default(), &href, published)
                })
                .take(limit)
                .collect()
        }
    };

    Ok(normalize_items(out))
}

/// RSS/Atom feeds fetched over HTTP.
pub struct RssAdapter {
    client: Client,
    max_items: usize,
}

impl RssAdapter {
    pub fn new(client: Client, max_items: usize) -> Self {
        Self { client, max_items }
    }
}

#[async_trait]
impl FetchAdapter for RssAdapter {
    async fn fetch(&self, source: &SourceDefinition, ctx: &FetchContext) -> FetchResult {
        let body = get_text(&self.client, &source.location, ctx).await?;
        parse_feed(&body, source, Utc::now(), self.max_items)
    }

    fn name(&self) -> &'static str {
        "rss"
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
