use feed_rs::model::{Entry, FeedType, Link};
use feed_rs::parser;
use thiserror::Error;

use crate::util::{clean_link, collapse_whitespace, non_empty, strip_control_chars};

/// Title given to items that carry a link but no title.
const UNTITLED: &str = "Untitled";

/// Whole-document parse failures. Per-item problems never surface here; they
/// are counted in [`ParsedFeed::skipped`].
#[derive(Debug, Error)]
pub enum ParseError {
    /// The payload is not a readable RSS or Atom document
    #[error("Parse error: {0}")]
    Malformed(String),
    /// The payload is a feed, but not one of the supported formats
    #[error("Unsupported feed format: {0}")]
    UnsupportedFormat(String),
}

/// The two feed families the parser front end understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    /// RSS 0.9x, 1.0 (RDF) and 2.0
    Rss,
    /// Atom 1.0
    Atom,
}

impl FeedFormat {
    fn from_feed_type(feed_type: &FeedType) -> Result<Self, ParseError> {
        match feed_type {
            FeedType::RSS0 | FeedType::RSS1 | FeedType::RSS2 => Ok(Self::Rss),
            FeedType::Atom => Ok(Self::Atom),
            FeedType::JSON => Err(ParseError::UnsupportedFormat("JSON Feed".to_string())),
        }
    }

    /// Pick the item's canonical link.
    ///
    /// Atom entries can carry several links (`alternate`, `enclosure`,
    /// `replies`, ...); the article link is the alternate one. RSS items carry a
    /// single `<link>`.
    fn item_link(self, links: &[Link]) -> Option<String> {
        let chosen = match self {
            Self::Rss => links.first(),
            Self::Atom => links
                .iter()
                .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
                .or_else(|| links.first()),
        };
        chosen.and_then(|l| non_empty(&l.href)).map(|href| clean_link(&href))
    }

    /// RSS `<author>` is an email address, optionally followed by the display
    /// name in parentheses; Atom authors carry a plain name.
    fn item_author(self, entry: &Entry) -> Option<String> {
        let raw = entry.authors.first().and_then(|p| non_empty(&p.name))?;
        match self {
            Self::Atom => Some(raw),
            Self::Rss => match (raw.find('('), raw.rfind(')')) {
                (Some(open), Some(close)) if open < close => {
                    non_empty(&raw[open + 1..close]).or(Some(raw))
                }
                _ => Some(raw),
            },
        }
    }
}

/// A parser-produced, not-yet-persisted candidate item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDraft {
    /// Source-provided unique id (`<guid>` / `<id>`); `None` when absent
    pub guid: Option<String>,
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    /// Unix seconds
    pub published_at: Option<i64>,
    pub summary: Option<String>,
    pub content: Option<String>,
}

/// Result of parsing one feed document.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub format: FeedFormat,
    /// Channel/feed title, if the document has one
    pub title: Option<String>,
    drafts: Vec<ItemDraft>,
    /// Items dropped because they had neither a title nor a link
    pub skipped: usize,
}

impl ParsedFeed {
    /// Drafts in document order. The iterator is `Clone`, so callers can
    /// restart or make several passes.
    pub fn drafts(&self) -> std::slice::Iter<'_, ItemDraft> {
        self.drafts.iter()
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }
}

/// Parse a raw feed payload into normalized item drafts.
///
/// `content_type` is only used to produce a better diagnostic when a server
/// returns an HTML page instead of a feed. `base_url` (normally the source URL)
/// resolves relative links.
///
/// # Errors
///
/// - [`ParseError::Malformed`] when the document cannot be parsed at all
/// - [`ParseError::UnsupportedFormat`] for JSON Feed documents
pub fn parse_feed(
    bytes: &[u8],
    content_type: Option<&str>,
    base_url: Option<&str>,
) -> Result<ParsedFeed, ParseError> {
    // Keep feed-rs from synthesizing ids: an absent guid must stay absent so
    // identity falls back to the link, then the title.
    let feed_parser = parser::Builder::new()
        .base_uri(base_url)
        .id_generator(|_links, _title, _uri| String::new())
        .build();

    let feed = feed_parser.parse(bytes).map_err(|e| {
        let looks_like_html = content_type
            .map(|ct| ct.to_ascii_lowercase().contains("html"))
            .unwrap_or(false);
        if looks_like_html {
            ParseError::Malformed(format!("{} (server returned an HTML page)", e))
        } else {
            ParseError::Malformed(e.to_string())
        }
    })?;

    let format = FeedFormat::from_feed_type(&feed.feed_type)?;
    let title = feed
        .title
        .as_ref()
        .map(|t| collapse_whitespace(&strip_control_chars(&t.content)))
        .filter(|t| !t.is_empty());

    let mut skipped = 0;
    let mut drafts = Vec::with_capacity(feed.entries.len());
    for entry in &feed.entries {
        match normalize_entry(format, entry) {
            Some(draft) => drafts.push(draft),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::debug!(
            skipped = skipped,
            kept = drafts.len(),
            "Skipped feed items with neither title nor link"
        );
    }

    Ok(ParsedFeed {
        format,
        title,
        drafts,
        skipped,
    })
}

/// Normalize one entry into a draft; `None` means the item is malformed.
fn normalize_entry(format: FeedFormat, entry: &Entry) -> Option<ItemDraft> {
    let title = entry
        .title
        .as_ref()
        .map(|t| collapse_whitespace(&strip_control_chars(&t.content)))
        .filter(|t| !t.is_empty());
    let link = format.item_link(&entry.links);

    if title.is_none() && link.is_none() {
        return None;
    }

    let summary = entry.summary.as_ref().and_then(|s| non_empty(&s.content));
    let content = entry
        .content
        .as_ref()
        .and_then(|c| c.body.as_deref())
        .and_then(non_empty);

    Some(ItemDraft {
        guid: non_empty(&entry.id),
        title: title.unwrap_or_else(|| UNTITLED.to_string()),
        link,
        author: format.item_author(entry),
        published_at: entry.published.or(entry.updated).map(|dt| dt.timestamp()),
        summary,
        content,
    })
}
