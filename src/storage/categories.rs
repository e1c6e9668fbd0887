use anyhow::Result;

use super::db::Database;

impl Database {
    // ========================================================================
    // Category Operations
    // ========================================================================
    //
    // Categories are not rows of their own; they materialize from the
    // '/'-joined `category_path` strings on feeds. Only the UI's
    // expanded/collapsed state is persisted directly.

    /// Distinct category paths currently in use, ordered.
    pub async fn list_category_paths(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT category_path FROM feeds WHERE category_path != '' ORDER BY category_path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    /// Persist a category's expanded/collapsed state across restarts.
    pub async fn set_category_expanded(&self, path: &str, expanded: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO categories_expanded_state (path, expanded)
            VALUES (?, ?)
            ON CONFLICT(path) DO UPDATE SET expanded = excluded.expanded
        "#,
        )
        .bind(path)
        .bind(expanded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All persisted expanded states as `(path, expanded)`.
    pub async fn get_category_expanded_states(&self) -> Result<Vec<(String, bool)>> {
        let rows: Vec<(String, bool)> =
            sqlx::query_as("SELECT path, expanded FROM categories_expanded_state ORDER BY path")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}
