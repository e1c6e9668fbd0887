use anyhow::Result;

use super::db::Database;
use super::types::{DatabaseError, Feed, FeedDbRow, FeedKind};

/// URL of the sentinel feed that adopts favorited articles when their
/// original feed is deleted. Not a fetchable source; always disabled and
/// hidden from the timeline.
const ARCHIVED_FEED_URL: &str = "gleaner:archived";

/// Columns + unread aggregation shared by every feed listing query.
const FEED_SELECT: &str = r#"
    SELECT
        f.id, f.title, f.url, f.kind, f.config_json, f.category_path,
        f.refresh_interval_secs, f.last_fetch_at, f.last_error,
        f.update_interval_est_secs, f.order_rank, f.hidden_from_timeline,
        f.auto_extract_full, f.image_gallery, f.disabled, f.consecutive_failures,
        COUNT(CASE WHEN a.is_read = 0 AND a.is_hidden = 0 THEN 1 END) AS unread_count
    FROM feeds f
    LEFT JOIN articles a ON f.id = a.feed_id
"#;

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Insert a feed, deduplicating by URL.
    ///
    /// If the URL already exists, the existing row's title is refreshed and
    /// its id returned, so repeated adds are idempotent.
    pub async fn insert_feed(
        &self,
        url: &str,
        title: &str,
        kind: FeedKind,
        config_json: Option<&str>,
        category_path: &str,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, url, kind, config_json, category_path)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET title = excluded.title
            RETURNING id
        "#,
        )
        .bind(title)
        .bind(url)
        .bind(kind.as_str())
        .bind(config_json)
        .bind(category_path)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// All feeds with unread counts, in display order (rank, then title).
    ///
    /// The sentinel archive feed is excluded; its articles surface only
    /// through the favorites filter.
    pub async fn get_feeds_with_unread_counts(&self) -> Result<Vec<Feed>> {
        let sql = format!(
            "{} WHERE f.url != ? GROUP BY f.id ORDER BY f.order_rank, f.title",
            FEED_SELECT
        );
        let rows: Vec<FeedDbRow> = sqlx::query_as(&sql)
            .bind(ARCHIVED_FEED_URL)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Look up a single feed by id.
    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let sql = format!("{} WHERE f.id = ? GROUP BY f.id", FEED_SELECT);
        let row: Option<FeedDbRow> = sqlx::query_as(&sql)
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(FeedDbRow::into_feed))
    }

    /// Look up a feed by its source URL.
    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>> {
        let sql = format!("{} WHERE f.url = ? GROUP BY f.id", FEED_SELECT);
        let row: Option<FeedDbRow> = sqlx::query_as(&sql)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(FeedDbRow::into_feed))
    }

    /// Delete a feed, preserving favorites.
    ///
    /// Favorited articles are reparented onto the hidden sentinel feed before
    /// the delete; everything else goes with the ON DELETE CASCADE. Runs in
    /// one transaction so a crash cannot strand favorites.
    ///
    /// Returns `true` if the feed existed.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let archive_id = Self::archived_feed_id_tx(&mut tx).await?;
        if archive_id == feed_id {
            // The sentinel itself is not deletable.
            return Ok(false);
        }

        let reparented = sqlx::query(
            "UPDATE articles SET feed_id = ? WHERE feed_id = ? AND is_favorite = 1",
        )
        .bind(archive_id)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let deleted = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        if reparented > 0 {
            tracing::info!(
                feed_id = feed_id,
                favorites = reparented,
                "Preserved favorites from deleted feed"
            );
        }

        Ok(deleted > 0)
    }

    /// Find or create the sentinel feed that adopts orphaned favorites.
    async fn archived_feed_id_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, url, kind, hidden_from_timeline, disabled)
            VALUES ('Archived favorites', ?, 'standard', 1, 1)
            ON CONFLICT(url) DO UPDATE SET title = title
            RETURNING id
        "#,
        )
        .bind(ARCHIVED_FEED_URL)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.0)
    }

    // ========================================================================
    // Feed Mutations
    // ========================================================================

    /// Rename a feed.
    pub async fn rename_feed(&self, feed_id: i64, title: &str) -> Result<()> {
        sqlx::query("UPDATE feeds SET title = ? WHERE id = ?")
            .bind(title)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a feed to a different category path.
    pub async fn set_feed_category(&self, feed_id: i64, category_path: &str) -> Result<()> {
        sqlx::query("UPDATE feeds SET category_path = ? WHERE id = ?")
            .bind(category_path)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Update a feed's display rank.
    pub async fn set_feed_order_rank(&self, feed_id: i64, rank: i64) -> Result<()> {
        sqlx::query("UPDATE feeds SET order_rank = ? WHERE id = ?")
            .bind(rank)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Set or clear the per-feed refresh interval. `None` inherits the
    /// global cadence.
    pub async fn set_feed_refresh_interval(
        &self,
        feed_id: i64,
        interval_secs: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE feeds SET refresh_interval_secs = ? WHERE id = ?")
            .bind(interval_secs)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Enable or disable a feed.
    pub async fn set_feed_disabled(&self, feed_id: i64, disabled: bool) -> Result<()> {
        sqlx::query("UPDATE feeds SET disabled = ? WHERE id = ?")
            .bind(disabled)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace a feed's parser configuration (e.g. persisting the IMAP
    /// last-seen UID after a run).
    pub async fn set_feed_config(&self, feed_id: i64, config_json: &str) -> Result<()> {
        sqlx::query("UPDATE feeds SET config_json = ? WHERE id = ?")
            .bind(config_json)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Fetch Bookkeeping
    // ========================================================================

    /// Record a successful refresh: stamp last_fetch_at, clear the error,
    /// reset the failure counter, and persist the adaptive-interval estimate.
    pub async fn complete_feed_refresh(
        &self,
        feed_id: i64,
        interval_est_secs: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE feeds
            SET last_fetch_at = ?,
                last_error = '',
                consecutive_failures = 0,
                update_interval_est_secs = COALESCE(?, update_interval_est_secs)
            WHERE id = ?
        "#,
        )
        .bind(now)
        .bind(interval_est_secs)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed refresh: store the error and bump the consecutive
    /// failure counter. Returns the new counter value so the scheduler can
    /// decide on suspension.
    pub async fn record_feed_error(
        &self,
        feed_id: i64,
        error: &str,
    ) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            UPDATE feeds
            SET last_error = ?, consecutive_failures = consecutive_failures + 1
            WHERE id = ?
            RETURNING consecutive_failures
        "#,
        )
        .bind(error)
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Persist the scheduler's adaptive-interval estimate so restarts keep
    /// the learned cadence.
    pub async fn set_feed_interval_est(&self, feed_id: i64, est_secs: i64) -> Result<()> {
        sqlx::query("UPDATE feeds SET update_interval_est_secs = ? WHERE id = ?")
            .bind(est_secs)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reset the consecutive failure counter (manual refresh clears
    /// error-suspension).
    pub async fn reset_feed_failures(&self, feed_id: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE feeds SET consecutive_failures = 0 WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, FeedKind, NewArticle};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn favorite_article(fp: &str) -> NewArticle {
        NewArticle {
            fingerprint: fp.to_string(),
            title: format!("Article {}", fp),
            is_favorite: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_feed_dedups_by_url() {
        let db = test_db().await;
        let a = db
            .insert_feed("https://example.com/a.xml", "A", FeedKind::Standard, None, "")
            .await
            .unwrap();
        let b = db
            .insert_feed("https://example.com/a.xml", "A2", FeedKind::Standard, None, "")
            .await
            .unwrap();
        assert_eq!(a, b);

        let feed = db.get_feed(a).await.unwrap().unwrap();
        assert_eq!(&*feed.title, "A2");
    }

    #[tokio::test]
    async fn test_delete_feed_preserves_favorites() {
        let db = test_db().await;
        let feed_id = db
            .insert_feed("https://example.com/a.xml", "A", FeedKind::Standard, None, "")
            .await
            .unwrap();

        db.insert_article(feed_id, &favorite_article("fav")).await.unwrap();
        db.insert_article(
            feed_id,
            &NewArticle {
                fingerprint: "plain".into(),
                title: "Plain".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(db.delete_feed(feed_id).await.unwrap());

        // The plain article is gone with the cascade; the favorite survives
        // under the sentinel feed.
        assert_eq!(db.count_favorites().await.unwrap(), 1);
        assert!(db.get_feed(feed_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_feed_error_increments() {
        let db = test_db().await;
        let feed_id = db
            .insert_feed("https://example.com/a.xml", "A", FeedKind::Standard, None, "")
            .await
            .unwrap();

        assert_eq!(db.record_feed_error(feed_id, "boom").await.unwrap(), 1);
        assert_eq!(db.record_feed_error(feed_id, "boom").await.unwrap(), 2);

        db.complete_feed_refresh(feed_id, None).await.unwrap();
        let feed = db.get_feed(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.consecutive_failures, 0);
        assert!(feed.last_error.is_empty());
    }
}
