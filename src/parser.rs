use std::collections::HashSet;

use feed_rs::model::{Entry, Link};
use feed_rs::parser::{self, ParseErrorKind, ParseFeedError};
use sha2::{Digest, Sha256};

use crate::error::ParseError;
use crate::model::{FeedItem, RawFeedDocument};

/// Normalize an RSS, Atom or JSON Feed document into items, newest first.
///
/// Entries without a date get the fetch time. Entries with neither title nor
/// link carry nothing to identify them by and are skipped.
pub fn parse(doc: &RawFeedDocument) -> Result<Vec<FeedItem>, ParseError> {
    let feed = parser::parse(doc.content.as_slice()).map_err(|e| classify(e, doc))?;

    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(feed.entries.len());
    for entry in feed.entries {
        let Some(item) = normalize(entry, doc) else {
            continue;
        };
        if seen.insert(item.id.clone()) {
            items.push(item);
        }
    }

    // Stable sort keeps document order among equal timestamps
    items.sort_by(|a, b| b.published.cmp(&a.published));
    Ok(items)
}

fn normalize(entry: Entry, doc: &RawFeedDocument) -> Option<FeedItem> {
    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty());
    let link = main_link(&entry.links);

    if title.is_none() && link.is_none() {
        return None;
    }

    let title = title.unwrap_or_else(|| "Untitled".to_string());
    let link = link.unwrap_or_default();
    let published = entry.published.or(entry.updated).unwrap_or(doc.fetched_at);
    let summary = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    Some(FeedItem {
        id: item_id(&link, &title),
        source_id: doc.source_id.clone(),
        title,
        link,
        published,
        summary,
    })
}

/// Prefer the alternate link (Atom), otherwise the first one.
fn main_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .map(|l| l.href.trim().to_string())
        .filter(|href| !href.is_empty())
}

/// Stable identifier for deduplication: SHA-256 over link and title.
pub fn item_id(link: &str, title: &str) -> String {
    let input = format!("{}|{}", link.trim(), title.trim());
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

fn classify(err: ParseFeedError, doc: &RawFeedDocument) -> ParseError {
    match err {
        ParseFeedError::ParseError(ParseErrorKind::NoFeedRoot) => {
            ParseError::UnsupportedFormat("no RSS, Atom or JSON Feed root".to_string())
        }
        ParseFeedError::JsonUnsupportedVersion(version) => {
            ParseError::UnsupportedFormat(format!("JSON Feed version {}", version))
        }
        other if is_html(doc) => {
            ParseError::UnsupportedFormat(format!("HTML document: {}", other))
        }
        other => ParseError::Malformed(other.to_string()),
    }
}

fn is_html(doc: &RawFeedDocument) -> bool {
    doc.content_type
        .as_deref()
        .map(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}
