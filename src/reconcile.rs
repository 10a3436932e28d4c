//! Identity derivation and the field-level merge between freshly parsed items
//! and what is already stored for a source.
//!
//! The merge only ever touches source-owned fields. Labels and `ingested_at`
//! are not part of [`ArticleFields`], so no plan produced here can overwrite
//! them.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::feed::ItemDraft;
use crate::storage::StoredItem;
use crate::util::{normalize_link, normalize_title};

/// Recorded on articles whose source supplied neither a summary nor content.
pub const NO_CONTENT_REASON: &str = "source provided no body text";

/// Derive the per-source identity key of a draft.
///
/// Precedence: the source's own guid, then a digest of the normalized link,
/// then a digest of the normalized title and publication time.
pub fn identity_key(draft: &ItemDraft) -> String {
    if let Some(guid) = draft.guid.as_deref() {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    if let Some(link) = draft.link.as_deref().filter(|l| !l.trim().is_empty()) {
        return format!("link:{:x}", Sha256::digest(normalize_link(link).as_bytes()));
    }

    let input = format!(
        "{}|{}",
        normalize_title(&draft.title),
        draft
            .published_at
            .map(|p| p.to_string())
            .unwrap_or_default()
    );
    format!("title:{:x}", Sha256::digest(input.as_bytes()))
}

/// Source-owned article fields, as written by ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleFields {
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published_at: i64,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub no_content_reason: Option<String>,
}

impl ArticleFields {
    fn from_draft(draft: &ItemDraft, published_fallback: i64) -> Self {
        let no_content_reason = if draft.summary.is_none() && draft.content.is_none() {
            Some(NO_CONTENT_REASON.to_string())
        } else {
            None
        };
        Self {
            title: draft.title.clone(),
            link: draft.link.clone(),
            author: draft.author.clone(),
            published_at: draft.published_at.unwrap_or(published_fallback),
            summary: draft.summary.clone(),
            content: draft.content.clone(),
            no_content_reason,
        }
    }

    fn matches(&self, stored: &StoredItem) -> bool {
        self.title == stored.title
            && self.link == stored.link
            && self.author == stored.author
            && self.published_at == stored.published_at
            && self.summary == stored.summary
            && self.content == stored.content
            && self.no_content_reason == stored.no_content_reason
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArticle {
    pub identity_key: String,
    pub fields: ArticleFields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleUpdate {
    pub id: i64,
    pub fields: ArticleFields,
}

/// Per-poll counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Items the parser dropped for lacking both title and link
    pub skipped_malformed: usize,
    /// Later occurrences of a key already seen in the same document
    pub duplicates: usize,
}

impl BatchStats {
    /// True when the poll changed nothing in the store.
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.updated == 0
    }
}

/// Writes to apply for one source poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertBatch {
    pub inserts: Vec<NewArticle>,
    pub updates: Vec<ArticleUpdate>,
    pub stats: BatchStats,
}

/// Plan the inserts and updates that bring stored items in line with `drafts`.
///
/// `existing` holds the stored rows of the same source whose keys appear in
/// the drafts (extra rows are ignored). `now` is the ingestion time used when a
/// new item has no publication date.
pub fn plan<'a, I>(drafts: I, existing: &[StoredItem], skipped: usize, now: i64) -> UpsertBatch
where
    I: IntoIterator<Item = &'a ItemDraft>,
{
    let by_key: HashMap<&str, &StoredItem> = existing
        .iter()
        .map(|item| (item.identity_key.as_str(), item))
        .collect();

    let mut batch = UpsertBatch {
        stats: BatchStats {
            skipped_malformed: skipped,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut seen = HashSet::new();

    for draft in drafts {
        let key = identity_key(draft);
        if !seen.insert(key.clone()) {
            batch.stats.duplicates += 1;
            continue;
        }

        match by_key.get(key.as_str()) {
            None => {
                batch.inserts.push(NewArticle {
                    identity_key: key,
                    fields: ArticleFields::from_draft(draft, now),
                });
                batch.stats.inserted += 1;
            }
            Some(stored) => {
                // A missing date keeps the stored one instead of the ingestion-time fallback
                let fields = ArticleFields::from_draft(draft, stored.published_at);
                if fields.matches(stored) {
                    batch.stats.unchanged += 1;
                } else {
                    batch.updates.push(ArticleUpdate {
                        id: stored.id,
                        fields,
                    });
                    batch.stats.updated += 1;
                }
            }
        }
    }

    batch
}

/// Keys of `drafts` in document order, first occurrence only.
pub fn distinct_keys<'a, I>(drafts: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a ItemDraft>,
{
    let mut seen = HashSet::new();
    drafts
        .into_iter()
        .map(identity_key)
        .filter(|key| seen.insert(key.clone()))
        .collect()
}
