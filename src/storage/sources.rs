use std::collections::{BTreeSet, HashMap, HashSet};

use sqlx::{QueryBuilder, SqliteConnection};

use super::categories::ensure_category_in;
use super::schema::Database;
use super::types::{DatabaseError, NewSource, Source, SourceRow, SyncReport};
use crate::config::{MAX_POLL_INTERVAL_SECS, MIN_POLL_INTERVAL_SECS};
use crate::util::{collapse_whitespace, strip_control_chars, validate_source_url};

const SOURCE_COLUMNS: &str = "id, url, name, category_id, poll_interval, enabled, last_polled_at, \
     last_error, last_error_at, consecutive_failures, etag, last_modified, created_at";

/// Sanitize tags: control characters stripped, whitespace collapsed, empties
/// dropped; returned sorted and deduplicated.
fn clean_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|t| collapse_whitespace(&strip_control_chars(t)))
        .filter(|t| !t.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn clean_name(name: &str, url: &str) -> String {
    let name = collapse_whitespace(&strip_control_chars(name));
    if name.is_empty() {
        url.to_string()
    } else {
        name
    }
}

fn checked_url(url: &str) -> Result<String, DatabaseError> {
    validate_source_url(url)
        .map(|_| url.trim().to_string())
        .map_err(|e| DatabaseError::InvalidInput(format!("{}: {}", url, e)))
}

fn checked_interval(interval: Option<i64>) -> Result<Option<i64>, DatabaseError> {
    match interval {
        Some(secs) if !(MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&secs) => {
            Err(DatabaseError::InvalidInput(format!(
                "poll interval {}s outside {}..={}",
                secs, MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS
            )))
        }
        _ => Ok(interval),
    }
}

fn not_found(id: i64) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "Source",
        id,
    }
}

async fn replace_tags(
    conn: &mut SqliteConnection,
    source_id: i64,
    tags: &[String],
) -> Result<(), DatabaseError> {
    sqlx::query("DELETE FROM source_tags WHERE source_id = ?")
        .bind(source_id)
        .execute(&mut *conn)
        .await?;

    if tags.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<sqlx::Sqlite> =
        QueryBuilder::new("INSERT INTO source_tags (source_id, tag) ");
    builder.push_values(tags, |mut b, tag| {
        b.push_bind(source_id).push_bind(tag);
    });
    builder.build().execute(&mut *conn).await?;
    Ok(())
}

async fn tags_for(conn: &mut SqliteConnection, source_id: i64) -> Result<Vec<String>, DatabaseError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT tag FROM source_tags WHERE source_id = ? ORDER BY tag")
            .bind(source_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

impl Database {
    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Insert a new source, creating its category if needed. Returns its ID.
    ///
    /// The URL must be an absolute http(s) URL and must not already exist; a
    /// per-source interval must lie within the configured poll interval bounds.
    pub async fn insert_source(&self, source: &NewSource) -> Result<i64, DatabaseError> {
        let url = checked_url(&source.url)?;
        let poll_interval = checked_interval(source.poll_interval)?;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let category_id = match source.category.as_deref() {
            Some(name) => Some(ensure_category_in(&mut tx, name).await?),
            None => None,
        };

        let row: (i64,) = sqlx::query_as(
            "INSERT INTO sources (url, name, category_id, poll_interval, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&url)
        .bind(clean_name(&source.name, &url))
        .bind(category_id)
        .bind(poll_interval)
        .bind(source.enabled)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        replace_tags(&mut tx, row.0, &clean_tags(&source.tags)).await?;
        tx.commit().await?;
        Ok(row.0)
    }

    pub async fn get_source(&self, id: i64) -> Result<Option<Source>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        let row: Option<SourceRow> =
            sqlx::query_as(&format!("SELECT {} FROM sources WHERE id = ?", SOURCE_COLUMNS))
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
        match row {
            Some(row) => {
                let tags = tags_for(&mut conn, id).await?;
                Ok(Some(row.into_source(tags)))
            }
            None => Ok(None),
        }
    }

    /// All sources ordered by ID, tags included.
    pub async fn list_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let rows: Vec<SourceRow> =
            sqlx::query_as(&format!("SELECT {} FROM sources ORDER BY id", SOURCE_COLUMNS))
                .fetch_all(&self.pool)
                .await?;

        let tag_rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT source_id, tag FROM source_tags ORDER BY source_id, tag")
                .fetch_all(&self.pool)
                .await?;
        let mut tags: HashMap<i64, Vec<String>> = HashMap::new();
        for (source_id, tag) in tag_rows {
            tags.entry(source_id).or_default().push(tag);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let source_tags = tags.remove(&row.id).unwrap_or_default();
                row.into_source(source_tags)
            })
            .collect())
    }

    pub async fn set_source_enabled(&self, id: i64, enabled: bool) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE sources SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    /// Move a source into a category, or to uncategorized with `None`.
    pub async fn set_source_category(
        &self,
        id: i64,
        category_id: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE sources SET category_id = ? WHERE id = ?")
            .bind(category_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    /// Replace the tag set of a source.
    pub async fn set_source_tags(&self, id: i64, tags: &[String]) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(not_found(id));
        }
        replace_tags(&mut tx, id, &clean_tags(tags)).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete a source together with its articles and tags.
    ///
    /// Returns the number of articles removed.
    pub async fn delete_source(&self, id: i64) -> Result<u64, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let (articles,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles WHERE source_id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        // Articles and tags go with it via ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(not_found(id));
        }

        tx.commit().await?;
        tracing::info!(source_id = id, articles = articles, "Deleted source");
        Ok(articles as u64)
    }

    /// Make the stored source list match `sources`, keyed by URL.
    ///
    /// New URLs are inserted; existing ones get their name, category, tags,
    /// interval and enabled flag updated. With `disable_missing`, stored
    /// sources absent from `sources` are disabled (never deleted). Runs in one
    /// transaction.
    pub async fn sync_sources(
        &self,
        sources: &[NewSource],
        disable_missing: bool,
    ) -> Result<SyncReport, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut report = SyncReport::default();
        let mut tx = self.pool.begin().await?;
        let mut synced_urls = HashSet::new();

        for source in sources {
            let url = checked_url(&source.url)?;
            let poll_interval = checked_interval(source.poll_interval)?;
            if !synced_urls.insert(url.clone()) {
                return Err(DatabaseError::InvalidInput(format!(
                    "Duplicate source URL: {}",
                    url
                )));
            }

            let name = clean_name(&source.name, &url);
            let tags = clean_tags(&source.tags);
            let category_id = match source.category.as_deref() {
                Some(category) => Some(ensure_category_in(&mut tx, category).await?),
                None => None,
            };

            let existing: Option<SourceRow> = sqlx::query_as(&format!(
                "SELECT {} FROM sources WHERE url = ?",
                SOURCE_COLUMNS
            ))
            .bind(&url)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                None => {
                    let (id,): (i64,) = sqlx::query_as(
                        "INSERT INTO sources (url, name, category_id, poll_interval, enabled, created_at)
                         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
                    )
                    .bind(&url)
                    .bind(&name)
                    .bind(category_id)
                    .bind(poll_interval)
                    .bind(source.enabled)
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await?;
                    replace_tags(&mut tx, id, &tags).await?;
                    tracing::info!(source_id = id, url = %url, "Added source");
                    report.created += 1;
                }
                Some(row) => {
                    let stored_tags = tags_for(&mut tx, row.id).await?;
                    let unchanged = row.name == name
                        && row.category_id == category_id
                        && row.poll_interval == poll_interval
                        && row.enabled == source.enabled
                        && stored_tags == tags;
                    if unchanged {
                        report.unchanged += 1;
                        continue;
                    }

                    sqlx::query(
                        "UPDATE sources SET name = ?, category_id = ?, poll_interval = ?, enabled = ?
                         WHERE id = ?",
                    )
                    .bind(&name)
                    .bind(category_id)
                    .bind(poll_interval)
                    .bind(source.enabled)
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await?;
                    if stored_tags != tags {
                        replace_tags(&mut tx, row.id, &tags).await?;
                    }
                    tracing::debug!(source_id = row.id, url = %url, "Updated source from configuration");
                    report.updated += 1;
                }
            }
        }

        if disable_missing {
            let enabled: Vec<(i64, String)> =
                sqlx::query_as("SELECT id, url FROM sources WHERE enabled = 1")
                    .fetch_all(&mut *tx)
                    .await?;
            for (id, url) in enabled {
                if synced_urls.contains(&url) {
                    continue;
                }
                sqlx::query("UPDATE sources SET enabled = 0 WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                tracing::info!(source_id = id, url = %url, "Disabled source missing from configuration");
                report.disabled += 1;
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    // ========================================================================
    // Poll Bookkeeping
    // ========================================================================

    /// Record a `304 Not Modified` poll: counts as success, articles untouched.
    pub async fn record_not_modified(&self, source_id: i64, now: i64) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE sources SET last_polled_at = ?, consecutive_failures = 0,
                 last_error = NULL, last_error_at = NULL
             WHERE id = ?",
        )
        .bind(now)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(not_found(source_id));
        }
        Ok(())
    }

    /// Record a failed poll. Returns the new consecutive failure count.
    ///
    /// `last_polled_at` is left alone so it keeps meaning "last successful poll".
    pub async fn record_poll_failure(
        &self,
        source_id: i64,
        error: &str,
        now: i64,
    ) -> Result<i64, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE sources SET consecutive_failures = consecutive_failures + 1,
                 last_error = ?, last_error_at = ?
             WHERE id = ? RETURNING consecutive_failures",
        )
        .bind(error)
        .bind(now)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.0).ok_or_else(|| not_found(source_id))
    }
}
