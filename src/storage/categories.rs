use sqlx::SqliteConnection;

use super::schema::Database;
use super::types::{Category, DatabaseError};
use crate::util::strip_control_chars;

/// Strip control characters and surrounding whitespace; reject empty names.
pub(crate) fn sanitize_category_name(name: &str) -> Result<String, DatabaseError> {
    let sanitized = strip_control_chars(name);
    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        return Err(DatabaseError::InvalidInput(
            "Category name cannot be empty or whitespace-only".to_string(),
        ));
    }
    Ok(trimmed.to_owned())
}

/// Get-or-create a category by name on an open connection or transaction.
pub(crate) async fn ensure_category_in(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<i64, DatabaseError> {
    let clean_name = sanitize_category_name(name)?;
    // The no-op DO UPDATE makes RETURNING yield the existing row's id
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO categories (name) VALUES (?)
         ON CONFLICT(name) DO UPDATE SET name = excluded.name
         RETURNING id",
    )
    .bind(&clean_name)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.0)
}

impl Database {
    // ========================================================================
    // Category Operations
    // ========================================================================

    /// Create a new category, returning its ID.
    ///
    /// Fails if a category with the same (sanitized) name already exists.
    pub async fn create_category(&self, name: &str) -> Result<i64, DatabaseError> {
        let clean_name = sanitize_category_name(name)?;
        let row: (i64,) = sqlx::query_as("INSERT INTO categories (name) VALUES (?) RETURNING id")
            .bind(&clean_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Return the ID of the named category, creating it if needed.
    pub async fn ensure_category(&self, name: &str) -> Result<i64, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        ensure_category_in(&mut conn, name).await
    }

    pub async fn rename_category(&self, id: i64, new_name: &str) -> Result<(), DatabaseError> {
        let clean_name = sanitize_category_name(new_name)?;
        let result = sqlx::query("UPDATE categories SET name = ? WHERE id = ?")
            .bind(&clean_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "Category",
                id,
            });
        }
        Ok(())
    }

    /// Delete a category. Sources in it become uncategorized (NULL).
    pub async fn delete_category(&self, id: i64) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE sources SET category_id = NULL WHERE category_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM categories WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "Category",
                id,
            });
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>, DatabaseError> {
        let categories = sqlx::query_as("SELECT id, name FROM categories ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(categories)
    }
}
