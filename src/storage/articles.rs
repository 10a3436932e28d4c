use sqlx::{QueryBuilder, Sqlite};

use super::schema::Database;
use super::types::{
    parse_labels, Article, ArticleDbRow, ArticleQuery, CacheHints, DatabaseError, Labels,
    StoredItem,
};
use crate::feed::ParsedFeed;
use crate::reconcile::{self, BatchStats};

/// Rows per multi-row statement. 11 bound columns * 50 stays well under
/// SQLite's 999 parameter limit.
const BATCH_SIZE: usize = 50;

const ARTICLE_COLUMNS: &str = "id, source_id, identity_key, title, link, author, published_at, \
     summary, content, no_content_reason, ingested_at, updated_at, labels";

/// Append the WHERE clause shared by `list_articles` and `count_articles`.
fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &ArticleQuery) {
    builder.push(" WHERE 1 = 1");
    if let Some(source_id) = query.source_id {
        builder.push(" AND source_id = ").push_bind(source_id);
    }
    if let Some(category_id) = query.category_id {
        builder
            .push(" AND source_id IN (SELECT id FROM sources WHERE category_id = ")
            .push_bind(category_id)
            .push(")");
    }
    if let Some(before) = query.published_before {
        builder.push(" AND published_at < ").push_bind(before);
    }
    if let Some(after) = query.published_after {
        builder.push(" AND published_at >= ").push_bind(after);
    }
}

impl Database {
    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Apply one successful poll atomically.
    ///
    /// Marks the source as polled (failures reset, error cleared, caching hints
    /// stored), reconciles `parsed` against the stored articles and writes the
    /// resulting inserts and updates. Either all of it commits or none of it
    /// does. Labels and `ingested_at` of existing articles are never written.
    pub async fn apply_poll(
        &self,
        source_id: i64,
        parsed: &ParsedFeed,
        cache: &CacheHints,
        now: i64,
    ) -> Result<BatchStats, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        // First statement is a write, so the transaction holds the write lock
        // before it reads existing rows
        let result = sqlx::query(
            "UPDATE sources SET last_polled_at = ?, consecutive_failures = 0,
                 last_error = NULL, last_error_at = NULL, etag = ?, last_modified = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(&cache.etag)
        .bind(&cache.last_modified)
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "Source",
                id: source_id,
            });
        }

        let keys = reconcile::distinct_keys(parsed.drafts());
        let mut existing: Vec<StoredItem> = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT id, identity_key, title, link, author, published_at, summary, content, \
                 no_content_reason FROM articles WHERE source_id = ",
            );
            builder.push_bind(source_id);
            builder.push(" AND identity_key IN (");
            let mut separated = builder.separated(", ");
            for key in chunk {
                separated.push_bind(key);
            }
            separated.push_unseparated(")");

            let rows: Vec<StoredItem> = builder.build_query_as().fetch_all(&mut *tx).await?;
            existing.extend(rows);
        }

        let batch = reconcile::plan(parsed.drafts(), &existing, parsed.skipped, now);

        for chunk in batch.inserts.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO articles (source_id, identity_key, title, link, author, published_at, \
                 summary, content, no_content_reason, ingested_at, labels) ",
            );
            builder.push_values(chunk, |mut b, article| {
                let f = &article.fields;
                b.push_bind(source_id)
                    .push_bind(&article.identity_key)
                    .push_bind(&f.title)
                    .push_bind(&f.link)
                    .push_bind(&f.author)
                    .push_bind(f.published_at)
                    .push_bind(&f.summary)
                    .push_bind(&f.content)
                    .push_bind(&f.no_content_reason)
                    .push_bind(now)
                    .push_bind("{}");
            });
            builder.build().execute(&mut *tx).await?;
        }

        for update in &batch.updates {
            let f = &update.fields;
            sqlx::query(
                "UPDATE articles SET title = ?, link = ?, author = ?, published_at = ?,
                     summary = ?, content = ?, no_content_reason = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(&f.title)
            .bind(&f.link)
            .bind(&f.author)
            .bind(f.published_at)
            .bind(&f.summary)
            .bind(&f.content)
            .bind(&f.no_content_reason)
            .bind(now)
            .bind(update.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(batch.stats)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// One page of articles, newest first (`published_at DESC, id DESC`).
    pub async fn list_articles(&self, query: &ArticleQuery) -> Result<Vec<Article>, DatabaseError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM articles", ARTICLE_COLUMNS));
        push_filters(&mut builder, query);
        builder
            .push(" ORDER BY published_at DESC, id DESC LIMIT ")
            .push_bind(query.page_size())
            .push(" OFFSET ")
            .push_bind(query.skip.max(0));

        let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ArticleDbRow::into_article).collect()
    }

    /// Total number of articles matching the filters of `query` (paging ignored).
    pub async fn count_articles(&self, query: &ArticleQuery) -> Result<i64, DatabaseError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM articles");
        push_filters(&mut builder, query);
        let (count,): (i64,) = builder.build_query_as().fetch_one(&self.pool).await?;
        Ok(count)
    }

    pub async fn get_article(&self, id: i64) -> Result<Option<Article>, DatabaseError> {
        let row: Option<ArticleDbRow> =
            sqlx::query_as(&format!("SELECT {} FROM articles WHERE id = ?", ARTICLE_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(ArticleDbRow::into_article).transpose()
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Delete a source's articles published strictly before `before`.
    ///
    /// Returns the number of articles removed. The source itself and its
    /// polling state are left alone.
    pub async fn purge_articles(&self, source_id: i64, before: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM articles WHERE source_id = ? AND published_at < ?")
            .bind(source_id)
            .bind(before)
            .execute(&self.pool)
            .await?;
        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(source_id = source_id, purged = purged, before = before, "Purged articles");
        }
        Ok(purged)
    }

    // ========================================================================
    // Labels
    // ========================================================================

    /// Merge `patch` into an article's labels (JSON merge patch, RFC 7396).
    ///
    /// Keys in the patch are set and keys not named are left alone. Two
    /// behaviours go beyond a plain additive merge and are intentional: a
    /// `null` value deletes that key, and a nested object is merged into the
    /// stored object recursively rather than replacing it. Arrays and scalars
    /// replace whatever was stored. Returns the resulting labels.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `patch` is not a JSON object, `NotFound` if the
    /// article does not exist.
    pub async fn merge_labels(
        &self,
        id: i64,
        patch: &serde_json::Value,
    ) -> Result<Labels, DatabaseError> {
        if !patch.is_object() {
            return Err(DatabaseError::InvalidInput(
                "Label patch must be a JSON object".to_string(),
            ));
        }

        // json_patch() runs inside one UPDATE, so concurrent merges on the same
        // article serialize on the write lock and none is lost
        let row: Option<(String,)> = sqlx::query_as(
            "UPDATE articles SET labels = json_patch(labels, ?) WHERE id = ? RETURNING labels",
        )
        .bind(patch.to_string())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((raw,)) => parse_labels(id, &raw),
            None => Err(DatabaseError::NotFound {
                entity: "Article",
                id,
            }),
        }
    }
}
