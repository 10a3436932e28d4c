use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and create the schema.
    ///
    /// `":memory:"` opens a private in-memory database (one connection, so all
    /// queries see the same data).
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Locked` if another process holds the database
    /// past the busy timeout, `DatabaseError::Migration` if schema creation
    /// fails, and `DatabaseError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", path)
        };

        // busy_timeout=5000: writers from concurrent polls wait for the lock
        // instead of failing with SQLITE_BUSY. Set per connection via pragma().
        let options = SqliteConnectOptions::from_str(&url)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        // In-memory: a single connection that is never recycled, otherwise the
        // data disappears with it. Shared-cache table locks would also surface
        // as SQLITE_LOCKED under concurrent polls.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::Other(inner) => DatabaseError::Migration(inner.to_string()),
            locked => locked,
        })?;
        Ok(db)
    }

    /// Create all tables and indexes in a single transaction.
    ///
    /// Every statement uses `IF NOT EXISTS`, so reopening an existing database
    /// is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                name TEXT UNIQUE NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                category_id INTEGER REFERENCES categories(id) ON DELETE SET NULL,
                poll_interval INTEGER,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_polled_at INTEGER,
                last_error TEXT,
                last_error_at INTEGER,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                etag TEXT,
                last_modified TEXT,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_tags (
                source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                tag TEXT NOT NULL,
                PRIMARY KEY (source_id, tag)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY,
                source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                identity_key TEXT NOT NULL,
                title TEXT NOT NULL,
                link TEXT,
                author TEXT,
                published_at INTEGER NOT NULL,
                summary TEXT,
                content TEXT,
                no_content_reason TEXT,
                ingested_at INTEGER NOT NULL,
                updated_at INTEGER,
                labels TEXT NOT NULL DEFAULT '{}',
                UNIQUE(source_id, identity_key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // list_articles() for one source: WHERE source_id = ? ORDER BY published_at DESC, id DESC
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_source_published \
             ON articles(source_id, published_at DESC, id DESC)",
        )
        .execute(&mut *tx)
        .await?;

        // Unfiltered listing
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_published ON articles(published_at DESC, id DESC)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sources_category ON sources(category_id)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
