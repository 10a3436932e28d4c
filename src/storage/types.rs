use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-owned per-article metadata (`read`, `starred`, free-form keys).
pub type Labels = serde_json::Map<String, serde_json::Value>;

/// Upper bound on a single page of [`ArticleQuery`] results.
pub const MAX_PAGE_SIZE: i64 = 500;

// ============================================================================
// Error Types
// ============================================================================

/// Store errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock past the busy timeout
    #[error("Database is locked by another process")]
    Locked,

    /// Schema creation failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A referenced row does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Caller-supplied value rejected before reaching SQLite
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Stored labels column is not a JSON object
    #[error("Corrupt labels for article {id}: {source}")]
    CorruptLabels {
        id: i64,
        #[source]
        source: serde_json::Error,
    },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[source] sqlx::Error),
}

/// Every `?` on a sqlx result goes through lock classification.
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        Self::from_sqlx(err)
    }
}

impl DatabaseError {
    /// Classify a sqlx error, mapping lock contention to [`DatabaseError::Locked`].
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Sources
// ============================================================================

/// A polled feed endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: i64,
    pub url: String,
    pub name: String,
    pub category_id: Option<i64>,
    /// Sorted, deduplicated
    pub tags: Vec<String>,
    /// Seconds; `None` means the process-wide default applies
    pub poll_interval: Option<i64>,
    pub enabled: bool,
    pub last_polled_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
    pub consecutive_failures: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub created_at: i64,
}

impl Source {
    /// Effective poll interval in seconds.
    pub fn interval_or(&self, default_secs: i64) -> i64 {
        self.poll_interval.unwrap_or(default_secs)
    }
}

/// Fields for creating or syncing a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSource {
    pub url: String,
    pub name: String,
    /// Category name; created on demand
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub poll_interval: Option<i64>,
    pub enabled: bool,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SourceRow {
    pub id: i64,
    pub url: String,
    pub name: String,
    pub category_id: Option<i64>,
    pub poll_interval: Option<i64>,
    pub enabled: bool,
    pub last_polled_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
    pub consecutive_failures: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub created_at: i64,
}

impl SourceRow {
    pub(crate) fn into_source(self, tags: Vec<String>) -> Source {
        Source {
            id: self.id,
            url: self.url,
            name: self.name,
            category_id: self.category_id,
            tags,
            poll_interval: self.poll_interval,
            enabled: self.enabled,
            last_polled_at: self.last_polled_at,
            last_error: self.last_error,
            last_error_at: self.last_error_at,
            consecutive_failures: self.consecutive_failures,
            etag: self.etag,
            last_modified: self.last_modified,
            created_at: self.created_at,
        }
    }
}

/// Outcome of a configuration sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub disabled: usize,
}

/// HTTP caching validators retained between polls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheHints {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

// ============================================================================
// Categories
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

// ============================================================================
// Articles
// ============================================================================

/// A persisted feed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub source_id: i64,
    pub identity_key: String,
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published_at: i64,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub no_content_reason: Option<String>,
    pub ingested_at: i64,
    pub updated_at: Option<i64>,
    pub labels: Labels,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub source_id: i64,
    pub identity_key: String,
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published_at: i64,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub no_content_reason: Option<String>,
    pub ingested_at: i64,
    pub updated_at: Option<i64>,
    pub labels: String,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Result<Article, DatabaseError> {
        let labels = parse_labels(self.id, &self.labels)?;
        Ok(Article {
            id: self.id,
            source_id: self.source_id,
            identity_key: self.identity_key,
            title: self.title,
            link: self.link,
            author: self.author,
            published_at: self.published_at,
            summary: self.summary,
            content: self.content,
            no_content_reason: self.no_content_reason,
            ingested_at: self.ingested_at,
            updated_at: self.updated_at,
            labels,
        })
    }
}

pub(crate) fn parse_labels(id: i64, raw: &str) -> Result<Labels, DatabaseError> {
    serde_json::from_str(raw).map_err(|source| DatabaseError::CorruptLabels { id, source })
}

/// Source-owned fields of an article as last written by ingestion.
///
/// This is the reconciler's view of an existing row: labels and timestamps
/// owned by other parties are deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredItem {
    pub id: i64,
    pub identity_key: String,
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published_at: i64,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub no_content_reason: Option<String>,
}

/// Filter and page for article reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticleQuery {
    pub source_id: Option<i64>,
    pub category_id: Option<i64>,
    /// Only articles with `published_at < published_before`
    pub published_before: Option<i64>,
    /// Only articles with `published_at >= published_after`
    pub published_after: Option<i64>,
    pub skip: i64,
    /// `None` or anything above [`MAX_PAGE_SIZE`] is clamped to it
    pub limit: Option<i64>,
}

impl ArticleQuery {
    pub(crate) fn page_size(&self) -> i64 {
        self.limit.unwrap_or(MAX_PAGE_SIZE).clamp(0, MAX_PAGE_SIZE)
    }
}
