use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::feed::freshness::{UpdateHint, UpdatePeriod};
use crate::storage::{Feed, NewArticle};
use crate::util::{clean_text, dedupe_by_id, derive_id, first_img_src};

/// Errors from feed parsing. Only a structurally unparseable document fails;
/// missing or malformed optional fields degrade to `None`.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Structurally invalid feed document: {0}")]
    Invalid(String),
}

/// Which XML dialect the document speaks. Detected from the root element:
/// a top-level `feed` node means Atom, anything else is treated as RSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Rss,
    Atom,
}

/// Normalized output of a parse: the feed's own metadata, its articles, and
/// any syndication update hint the document declared.
#[derive(Debug)]
pub struct ParsedFeed {
    pub feed: Feed,
    pub articles: Vec<NewArticle>,
    pub hint: Option<UpdateHint>,
}

/// Parses raw feed bytes fetched from `source_url` into the canonical model.
///
/// Both dialects normalize to the same shape: titles and summaries are
/// entity-decoded and trimmed, article identity follows the
/// guid → link → title → synthetic cascade through the deterministic id
/// encoder, and the article list is deduplicated by id keeping the first
/// occurrence in source order.
pub fn parse_feed(bytes: &[u8], source_url: &str) -> Result<ParsedFeed, ParseError> {
    let scan = pre_scan(bytes)?;

    let parsed = feed_rs::parser::parse(bytes).map_err(|e| ParseError::Invalid(e.to_string()))?;

    let feed_title = clean_text(parsed.title.map(|t| t.content))
        .unwrap_or_else(|| source_url.to_string());
    let html_url = parsed
        .links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .map(|l| l.href.clone());
    let image = parsed
        .logo
        .map(|i| i.uri)
        .or(parsed.icon.map(|i| i.uri));

    let feed = Feed {
        id: derive_id(source_url),
        title: feed_title.clone(),
        url: source_url.to_string(),
        description: clean_text(parsed.description.map(|t| t.content)),
        image,
        html_url,
        last_updated: parsed.updated.map(|dt| dt.to_rfc3339()),
        folder_id: None,
        last_published_at: None,
        last_published_ts: None,
        expires_ts: None,
        etag: None,
        last_modified: None,
    };

    let articles: Vec<NewArticle> = parsed
        .entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| match scan.dialect {
            Dialect::Rss => map_rss_entry(entry, index, source_url, &feed_title),
            Dialect::Atom => map_atom_entry(entry, index, source_url, &feed_title),
        })
        .collect();

    Ok(ParsedFeed {
        feed,
        articles: dedupe_by_id(articles, |a| &a.id),
        hint: scan.hint(),
    })
}

// ============================================================================
// Dialect Mappers
// ============================================================================

/// RSS 2.0 item mapping: guid-based identity, `description` as the summary,
/// enclosure/media first for the thumbnail.
fn map_rss_entry(entry: Entry, index: usize, source_url: &str, feed_title: &str) -> NewArticle {
    let link = entry.links.first().map(|l| l.href.clone());
    let description = clean_text(entry.summary.map(|t| t.content));
    let content = entry.content.and_then(|c| c.body);
    let published_at = entry.published.map(rfc3339);
    let updated_at = entry.updated.map(rfc3339);

    let raw_id = resolve_raw_id(
        &entry.id,
        link.as_deref(),
        entry.title.as_ref().map(|t| t.content.as_str()),
        source_url,
        entry.published,
        index,
    );

    let thumbnail = thumbnail_from_media(&entry.media)
        .or_else(|| html_thumbnail(content.as_deref(), description.as_deref()))
        .and_then(|t| absolutize(&t, link.as_deref(), source_url));

    NewArticle {
        id: derive_id(&raw_id),
        feed_id: Some(derive_id(source_url)),
        remote_id: None,
        title: clean_text(entry.title.map(|t| t.content)).unwrap_or_else(|| "Untitled".into()),
        link,
        source: Some(feed_title.to_string()),
        published_at,
        updated_at,
        description,
        content,
        thumbnail,
    }
}

/// Atom entry mapping: atom:id identity, `rel="alternate"` link preferred,
/// `updated` is authoritative where RSS leans on `pubDate`.
fn map_atom_entry(entry: Entry, index: usize, source_url: &str, feed_title: &str) -> NewArticle {
    let link = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref() == Some("alternate"))
        .or_else(|| entry.links.iter().find(|l| l.rel.is_none()))
        .or_else(|| entry.links.first())
        .map(|l| l.href.clone());
    let description = clean_text(entry.summary.map(|t| t.content));
    let content = entry.content.and_then(|c| c.body);
    let published_at = entry.published.map(rfc3339);
    let updated_at = entry.updated.map(rfc3339);

    let raw_id = resolve_raw_id(
        &entry.id,
        link.as_deref(),
        entry.title.as_ref().map(|t| t.content.as_str()),
        source_url,
        entry.published.or(entry.updated),
        index,
    );

    let thumbnail = thumbnail_from_media(&entry.media)
        .or_else(|| html_thumbnail(content.as_deref(), description.as_deref()))
        .and_then(|t| absolutize(&t, link.as_deref(), source_url));

    NewArticle {
        id: derive_id(&raw_id),
        feed_id: Some(derive_id(source_url)),
        remote_id: None,
        title: clean_text(entry.title.map(|t| t.content)).unwrap_or_else(|| "Untitled".into()),
        link,
        source: Some(feed_title.to_string()),
        published_at,
        updated_at,
        description,
        content,
        thumbnail,
    }
}

/// Identity resolution cascade: dialect id → link → title → synthetic.
///
/// The synthetic fallback folds the source URL and a timestamp (or the item's
/// position) together so two undated, untitled items in one document still
/// get distinct, stable ids.
fn resolve_raw_id(
    entry_id: &str,
    link: Option<&str>,
    title: Option<&str>,
    source_url: &str,
    timestamp: Option<DateTime<Utc>>,
    index: usize,
) -> String {
    let trimmed = entry_id.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    if let Some(link) = link {
        if !link.trim().is_empty() {
            return link.trim().to_string();
        }
    }
    if let Some(title) = title {
        if !title.trim().is_empty() {
            return title.trim().to_string();
        }
    }
    let stamp = timestamp
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(index as i64);
    format!("{source_url}#{stamp}")
}

fn rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ============================================================================
// Thumbnails (steps 1-3; the og:image network lookup lives in thumbnail.rs)
// ============================================================================

/// Enclosure/media-content URL first, then declared media thumbnails.
fn thumbnail_from_media(media: &[feed_rs::model::MediaObject]) -> Option<String> {
    for object in media {
        for content in &object.content {
            let is_image = content
                .content_type
                .as_ref()
                .map(|m| m.to_string().starts_with("image"))
                .unwrap_or(false);
            if is_image {
                if let Some(url) = &content.url {
                    return Some(url.to_string());
                }
            }
        }
        if let Some(thumb) = object.thumbnails.first() {
            return Some(thumb.image.uri.clone());
        }
    }
    None
}

/// First `<img src>` in the item's HTML, content before description.
fn html_thumbnail(content: Option<&str>, description: Option<&str>) -> Option<String> {
    content
        .and_then(first_img_src)
        .or_else(|| description.and_then(first_img_src))
}

/// Resolves a possibly-relative thumbnail URL against the article link,
/// falling back to the feed URL. Unresolvable values are dropped.
fn absolutize(thumbnail: &str, link: Option<&str>, source_url: &str) -> Option<String> {
    if thumbnail.starts_with("http://") || thumbnail.starts_with("https://") {
        return Some(thumbnail.to_string());
    }
    let base = link.unwrap_or(source_url);
    url::Url::parse(base)
        .ok()?
        .join(thumbnail)
        .ok()
        .map(|u| u.to_string())
}

// ============================================================================
// Raw Pre-Scan
// ============================================================================

struct PreScan {
    dialect: Dialect,
    update_period: Option<UpdatePeriod>,
    update_frequency: Option<u32>,
}

impl PreScan {
    fn hint(&self) -> Option<UpdateHint> {
        self.update_period.map(|period| UpdateHint {
            period,
            frequency: self.update_frequency.unwrap_or(1),
        })
    }
}

/// One cheap pass over the raw XML: determines the dialect from the root
/// element and captures the syndication module's update hints, which feed-rs
/// does not surface.
fn pre_scan(bytes: &[u8]) -> Result<PreScan, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut dialect = None;
    let mut update_period = None;
    let mut update_frequency = None;
    let mut capture: Option<&'static str> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.name();
                let local = local_name(name.as_ref());
                if dialect.is_none() {
                    dialect = Some(if local == b"feed" {
                        Dialect::Atom
                    } else {
                        Dialect::Rss
                    });
                }
                capture = match local {
                    b"updatePeriod" => Some("period"),
                    b"updateFrequency" => Some("frequency"),
                    _ => None,
                };
            }
            Ok(Event::Text(t)) => {
                if let Some(kind) = capture.take() {
                    if let Ok(text) = t.unescape() {
                        match kind {
                            "period" => update_period = UpdatePeriod::parse(&text),
                            "frequency" => update_frequency = text.trim().parse().ok(),
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::End(_)) => capture = None,
            Ok(Event::Eof) => break,
            Err(e) => {
                // The structural verdict belongs to feed-rs; a pre-scan error
                // only matters if we never even saw a root element.
                if dialect.is_none() {
                    return Err(ParseError::Invalid(e.to_string()));
                }
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    let dialect = dialect.ok_or_else(|| ParseError::Invalid("no root element".to_string()))?;
    Ok(PreScan {
        dialect,
        update_period,
        update_frequency,
    })
}

fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}
