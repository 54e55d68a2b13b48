//! Feed parser (P). Pure functions over a fetched feed document. Grounded
//! on `entry_content.py` (content/author/category/date extraction) and
//! `content/media.py` (media URL/platform metadata priority chains),
//! layered over `feed_rs`'s typed model instead of Python's duck-typed
//! `feedparser` entries (§9: replace runtime reflection with an explicit
//! `EntryRecord`).

use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Feed as ParsedFeed, FeedType as ParsedFeedType, MediaObject};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashSet;

use crate::models::FeedType;

pub const MAX_ENTRIES_PER_REFRESH: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NoFeedData,
    NoEntries,
    ParsingError,
}

#[derive(Debug, Clone)]
pub struct FeedMeta {
    pub title: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub feed_type: FeedType,
    pub website: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EntryRecord {
    pub title: String,
    pub url: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub categories: Vec<String>,
    pub media_url: Option<String>,
    pub platform_metadata: Value,
    pub published_at: Option<DateTime<Utc>>,
}

/// Parses raw feed bytes into `(FeedMeta, entries)`, or a classified
/// failure. Entries are capped at `MAX_ENTRIES_PER_REFRESH` to bound
/// fan-out (§5).
pub fn parse_feed(bytes: &[u8]) -> Result<(FeedMeta, Vec<EntryRecord>), ErrorKind> {
    if bytes.is_empty() {
        return Err(ErrorKind::NoFeedData);
    }
    let parsed = feed_rs::parser::parse(bytes).map_err(|_| ErrorKind::ParsingError)?;
    if parsed.entries.is_empty() {
        return Err(ErrorKind::NoEntries);
    }

    let meta = extract_feed_meta(&parsed);
    let entries: Vec<EntryRecord> = parsed
        .entries
        .iter()
        .take(MAX_ENTRIES_PER_REFRESH)
        .filter_map(extract_entry)
        .collect();
    if entries.is_empty() {
        return Err(ErrorKind::NoEntries);
    }
    Ok((meta, entries))
}

fn extract_feed_meta(feed: &ParsedFeed) -> FeedMeta {
    let feed_type = match feed.feed_type {
        ParsedFeedType::Atom => FeedType::Atom,
        ParsedFeedType::RSS0 | ParsedFeedType::RSS1 | ParsedFeedType::RSS2 => FeedType::Rss,
        ParsedFeedType::JSON => FeedType::Rss,
    };
    // feed-rs folds RDF (RSS1) into the RSS1 variant; RDF-specific feeds
    // are tagged separately by namespace sniffing elsewhere in the corpus,
    // but feed-rs gives us no direct signal here so RSS1 maps to Rdf.
    let feed_type = if matches!(feed.feed_type, ParsedFeedType::RSS1) {
        FeedType::Rdf
    } else {
        feed_type
    };

    FeedMeta {
        title: feed
            .title
            .as_ref()
            .map(|t| decode_html_entities(&t.content))
            .unwrap_or_default(),
        description: feed
            .description
            .as_ref()
            .map(|d| truncate(&d.content, 500)),
        language: feed.language.clone().map(|l| normalize_language(&l)),
        feed_type,
        website: feed.links.first().map(|l| l.href.clone()),
    }
}

fn extract_entry(entry: &Entry) -> Option<EntryRecord> {
    let url = entry.links.first().map(|l| l.href.clone())?;
    let title = entry
        .title
        .as_ref()
        .map(|t| decode_html_entities(&t.content))
        .unwrap_or_default();

    let content = extract_content(entry);
    let summary = entry.summary.as_ref().map(|s| s.content.clone());
    let author = extract_author(entry);
    let categories = extract_categories(entry);
    let (media_url, platform_metadata) = extract_media(entry, summary.as_deref(), content.as_deref());
    let published_at = extract_published(entry);

    Some(EntryRecord {
        title,
        url,
        summary,
        content,
        author,
        categories,
        media_url,
        platform_metadata,
        published_at,
    })
}

/// Content is drawn ONLY from dedicated content tags, in priority order.
/// `feed-rs` doesn't distinguish `media:description` from `content:encoded`
/// at the API level; both land in `entry.content` or `entry.summary`
/// depending on feed dialect, so the priority chain here is
/// `entry.content` (maps to `atom:content`/`content:encoded`) then, absent
/// that, `entry.media.description`. It is never fabricated from the plain
/// summary.
fn extract_content(entry: &Entry) -> Option<String> {
    for media in &entry.media {
        if let Some(desc) = &media.description {
            if !desc.content.is_empty() {
                return Some(desc.content.clone());
            }
        }
    }
    entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .filter(|b| !b.is_empty())
}

fn extract_author(entry: &Entry) -> Option<String> {
    if entry.authors.is_empty() {
        return None;
    }
    let names: Vec<String> = entry
        .authors
        .iter()
        .map(|p| {
            if !p.name.is_empty() {
                p.name.clone()
            } else {
                p.email.clone().unwrap_or_default()
            }
        })
        .filter(|n| !n.is_empty())
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join(", "))
    }
}

/// Merges category terms with Dublin Core subjects, deduped while
/// preserving first occurrence.
fn extract_categories(entry: &Entry) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for cat in &entry.categories {
        let term = cat.term.trim();
        if !term.is_empty() && seen.insert(term.to_lowercase()) {
            out.push(term.to_string());
        }
    }
    out
}

fn media_thumbnail_url(objs: &[MediaObject]) -> Option<String> {
    objs.iter()
        .flat_map(|m| m.thumbnails.iter())
        .map(|t| t.image.uri.clone())
        .next()
}

fn media_image_content_url(objs: &[MediaObject]) -> Option<String> {
    objs.iter().find_map(|m| {
        m.content.iter().find_map(|c| {
            let is_image = c
                .content_type
                .as_ref()
                .map(|ct| ct.ty().as_str() == "image")
                .unwrap_or(false);
            if is_image {
                c.url.as_ref().map(|u| u.to_string())
            } else {
                None
            }
        })
    })
}

static IMG_SRC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)<img[^>]+src="([^"]+)""#).unwrap());
static OG_IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]+property="og:image"[^>]+content="([^"]+)""#).unwrap()
});
static YOUTUBE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:youtu\.be/|youtube\.com/watch\?v=)([\w-]{6,})").unwrap());

/// Media URL priority chain (§4.P) then platform metadata extraction
/// (YouTube id, podcast audio enclosures).
fn extract_media(
    entry: &Entry,
    summary: Option<&str>,
    content: Option<&str>,
) -> (Option<String>, Value) {
    let media_url = media_thumbnail_url(&entry.media)
        .or_else(|| media_image_content_url(&entry.media))
        .or_else(|| {
            entry.links.iter().find_map(|l| {
                let is_image_enclosure = l
                    .media_type
                    .as_deref()
                    .map(|mt| mt.starts_with("image/"))
                    .unwrap_or(false);
                if is_image_enclosure {
                    Some(l.href.clone())
                } else {
                    None
                }
            })
        })
        .or_else(|| {
            for haystack in [summary, content].into_iter().flatten() {
                if let Some(caps) = IMG_SRC_RE.captures(haystack) {
                    return Some(caps[1].to_string());
                }
                if let Some(caps) = OG_IMAGE_RE.captures(haystack) {
                    return Some(caps[1].to_string());
                }
            }
            None
        });

    let mut metadata = serde_json::Map::new();
    if let Some(link) = entry.links.iter().find(|l| l.href.contains("youtube.com") || l.href.contains("youtu.be")) {
        if let Some(caps) = YOUTUBE_ID_RE.captures(&link.href) {
            metadata.insert("youtube_video_id".into(), json!(caps[1].to_string()));
        }
    }
    if let Some(channel_id) = youtube_channel_id(entry) {
        metadata.insert("youtube_channel_id".into(), json!(channel_id));
    }
    for media in &entry.media {
        for content_obj in &media.content {
            let is_audio = content_obj
                .content_type
                .as_ref()
                .map(|ct| ct.ty().as_str() == "audio")
                .unwrap_or(false);
            if is_audio {
                if let Some(url) = &content_obj.url {
                    metadata.insert("podcast_audio_url".into(), json!(url.to_string()));
                }
                if let Some(dur) = content_obj.duration {
                    metadata.insert("duration_seconds".into(), json!(dur.as_secs()));
                }
            }
        }
        if let Some(community) = &media.community {
            if let Some(rating) = &community.star_rating {
                metadata.insert("rating".into(), json!(rating.average));
            }
            if let Some(stats) = &community.statistics {
                metadata.insert("views".into(), json!(stats.views));
            }
        }
    }

    (media_url, Value::Object(metadata))
}

/// YouTube channel feeds (`.../feeds/videos.xml?channel_id=...`) carry a
/// `<yt:channelId>` element per entry; feed-rs surfaces unrecognized
/// namespaced elements through `Entry::extensions` rather than a typed
/// field.
fn youtube_channel_id(entry: &Entry) -> Option<String> {
    entry
        .extensions
        .get("yt")
        .and_then(|ns| ns.get("channelId"))
        .and_then(|values| values.first())
        .and_then(|ext| ext.value.clone())
}

fn extract_published(entry: &Entry) -> Option<DateTime<Utc>> {
    entry.published.or(entry.updated)
}

/// Bounded re-decode: HTML entities are decoded up to 3 times to defuse
/// double-encoding (`&amp;amp;` -> `&amp;` -> `&`) without looping forever
/// on pathological input.
pub fn decode_html_entities(input: &str) -> String {
    let mut s = input.to_string();
    for _ in 0..3 {
        let decoded = html_escape::decode_html_entities(&s).to_string();
        if decoded == s {
            break;
        }
        s = decoded;
    }
    s
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn normalize_language(lang: &str) -> String {
    let lang = lang.trim();
    let mut parts = lang.splitn(2, |c| c == '-' || c == '_');
    let primary = parts.next().unwrap_or("").to_lowercase();
    match parts.next() {
        Some(region) if !region.is_empty() => format!("{primary}-{}", region.to_uppercase()),
        _ => primary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_bytes() {
        assert_eq!(parse_feed(b""), Err(ErrorKind::NoFeedData));
    }

    #[test]
    fn normalizes_language_region() {
        assert_eq!(normalize_language("en-us"), "en-US");
        assert_eq!(normalize_language("FR"), "fr");
    }

    #[test]
    fn bounded_entity_redecode_terminates() {
        let input = "&amp;amp;amp;amp;amp;amp;".to_string();
        let out = decode_html_entities(&input);
        assert!(!out.is_empty());
    }

    #[test]
    fn categories_dedupe_case_insensitively() {
        let entry = Entry {
            categories: vec![
                feed_rs::model::Category {
                    term: "Tech".into(),
                    scheme: None,
                    label: None,
                },
                feed_rs::model::Category {
                    term: "tech".into(),
                    scheme: None,
                    label: None,
                },
                feed_rs::model::Category {
                    term: "Rust".into(),
                    scheme: None,
                    label: None,
                },
            ],
            ..Default::default()
        };
        assert_eq!(extract_categories(&entry), vec!["Tech", "Rust"]);
    }
}
