use anyhow::Result;
use sqlx::QueryBuilder;

use super::db::Database;
use super::types::{Article, ArticleDbRow, ArticleFilter, ArticleQuery, LocalFlagChange, NewArticle};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: i64 = 2000;

/// Default page size when the caller does not specify a limit
const DEFAULT_LIMIT: i64 = 500;

/// Rows removed per iteration of the size-based cleanup loop
const CLEANUP_BATCH: i64 = 200;

const ARTICLE_COLUMNS: &str = r#"
    a.id, a.feed_id, a.fingerprint, a.url, a.title, a.translated_title,
    a.published_at, a.ingested_at, a.content, a.thumbnail_url, a.audio_url,
    a.video_url, a.is_read, a.is_favorite, a.is_hidden, a.is_read_later,
    a.summary, a.upstream_id, a.no_translate, a.category
"#;

impl Database {
    // ========================================================================
    // Ingest Support
    // ========================================================================

    /// Look up an article by its dedup key. Returns `(id, has_content)` so
    /// the ingestor can decide whether a content backfill is worthwhile.
    pub async fn find_article_by_fingerprint(
        &self,
        feed_id: i64,
        fingerprint: &str,
    ) -> Result<Option<(i64, bool)>> {
        let row: Option<(i64, bool)> = sqlx::query_as(
            r#"
            SELECT id, content IS NOT NULL AND content != ''
            FROM articles
            WHERE feed_id = ? AND fingerprint = ?
        "#,
        )
        .bind(feed_id)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Insert a single article produced by the ingest pipeline.
    ///
    /// The UNIQUE(feed_id, fingerprint) constraint is the last line of
    /// defense against concurrent duplicates; `INSERT OR IGNORE` keeps a
    /// race from failing the whole fetch. Returns the new row id, or `None`
    /// if another writer got there first.
    pub async fn insert_article(
        &self,
        feed_id: i64,
        article: &NewArticle,
    ) -> Result<Option<i64>> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO articles (
                feed_id, fingerprint, url, title, translated_title,
                published_at, ingested_at,
                content, thumbnail_url, audio_url, video_url,
                is_read, is_favorite, is_hidden, is_read_later,
                summary, upstream_id, no_translate, category, flags_updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(feed_id)
        .bind(&article.fingerprint)
        .bind(&article.url)
        .bind(&article.title)
        .bind(&article.translated_title)
        .bind(article.published_at)
        .bind(now)
        .bind(&article.content)
        .bind(&article.thumbnail_url)
        .bind(&article.audio_url)
        .bind(&article.video_url)
        .bind(article.is_read)
        .bind(article.is_favorite)
        .bind(article.is_hidden)
        .bind(article.is_read_later)
        .bind(&article.summary)
        .bind(&article.upstream_id)
        .bind(article.no_translate)
        .bind(&article.category)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    /// Backfill content for an article that was stored without it. User
    /// state (read/favorite/hidden) is untouched.
    pub async fn backfill_article_content(&self, article_id: i64, content: &str) -> Result<()> {
        sqlx::query(
            "UPDATE articles SET content = ? WHERE id = ? AND (content IS NULL OR content = '')",
        )
        .bind(content)
        .bind(article_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Paginated article listing per the API contract.
    ///
    /// Hidden articles never appear. When neither a feed nor a category is
    /// requested (the timeline view), feeds flagged `hidden_from_timeline`
    /// are excluded too.
    pub async fn list_articles(&self, query: &ArticleQuery) -> Result<Vec<Article>> {
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_ARTICLES);

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM articles a JOIN feeds f ON a.feed_id = f.id WHERE a.is_hidden = 0",
            ARTICLE_COLUMNS
        ));

        if let Some(feed_id) = query.feed_id {
            builder.push(" AND a.feed_id = ");
            builder.push_bind(feed_id);
        } else if let Some(category) = &query.category {
            // The feed lives at or under the path, or a rule moved the
            // article there directly.
            builder.push(" AND (f.category_path = ");
            builder.push_bind(category.clone());
            builder.push(" OR f.category_path LIKE ");
            builder.push_bind(format!("{}/%", category));
            builder.push(" OR a.category = ");
            builder.push_bind(category.clone());
            builder.push(")");
        } else if !matches!(
            query.filter,
            ArticleFilter::Favorites | ArticleFilter::ReadLater
        ) {
            // Feeds flagged out of the timeline stay reachable through the
            // favorites and read-later views (the archive sentinel lives
            // there), just not in the default listing.
            builder.push(" AND f.hidden_from_timeline = 0");
        }

        match query.filter {
            ArticleFilter::All => {}
            ArticleFilter::Unread => {
                builder.push(" AND a.is_read = 0");
            }
            ArticleFilter::Favorites => {
                builder.push(" AND a.is_favorite = 1");
            }
            ArticleFilter::ReadLater => {
                builder.push(" AND a.is_read_later = 1");
            }
            ArticleFilter::ImageGallery => {
                builder.push(" AND f.image_gallery = 1 AND a.thumbnail_url IS NOT NULL");
            }
        }

        builder.push(" ORDER BY a.published_at DESC, a.ingested_at DESC LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(query.offset);

        let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    /// Get a single article by id.
    pub async fn get_article_by_id(&self, article_id: i64) -> Result<Option<Article>> {
        let sql = format!(
            "SELECT {} FROM articles a WHERE a.id = ?",
            ARTICLE_COLUMNS
        );
        let row: Option<ArticleDbRow> = sqlx::query_as(&sql)
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(ArticleDbRow::into_article))
    }

    /// Unread (and not hidden) count for one feed.
    pub async fn unread_count(&self, feed_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM articles WHERE feed_id = ? AND is_read = 0 AND is_hidden = 0",
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Total number of favorited articles across all feeds.
    pub async fn count_favorites(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles WHERE is_favorite = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Total article count for a feed (hidden included).
    pub async fn count_articles_for_feed(&self, feed_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Set the read flag (idempotent), returns whether a row changed.
    ///
    /// The `is_read != ?` guard keeps repeated calls from touching
    /// `flags_updated_at`, which would otherwise re-queue the article for
    /// the upstream push cycle.
    pub async fn set_article_read(&self, article_id: i64, read: bool) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE articles SET is_read = ?, flags_updated_at = ? WHERE id = ? AND is_read != ?",
        )
        .bind(read)
        .bind(now)
        .bind(article_id)
        .bind(read)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically toggle the favorite flag, returning the new value.
    ///
    /// Uses SQLite's RETURNING clause so the toggle and readback are one
    /// operation, preventing TOCTOU races between concurrent callers.
    pub async fn toggle_article_favorite(&self, article_id: i64) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result: (bool,) = sqlx::query_as(
            r#"
            UPDATE articles SET is_favorite = NOT is_favorite, flags_updated_at = ?
            WHERE id = ? RETURNING is_favorite
        "#,
        )
        .bind(now)
        .bind(article_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(result.0)
    }

    /// Set the read-later flag (idempotent).
    pub async fn set_article_read_later(&self, article_id: i64, read_later: bool) -> Result<()> {
        sqlx::query("UPDATE articles SET is_read_later = ? WHERE id = ?")
            .bind(read_later)
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark all articles read for a feed, returning how many changed.
    pub async fn mark_all_read_for_feed(&self, feed_id: i64) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE articles SET is_read = 1, flags_updated_at = ? WHERE feed_id = ? AND is_read = 0",
        )
        .bind(now)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Upstream Flag Reconciliation
    // ========================================================================

    /// Local read/favorite changes on upstream-tagged articles since the
    /// given push cursor, oldest first.
    pub async fn local_flag_changes_since(&self, cursor: i64) -> Result<Vec<LocalFlagChange>> {
        let rows: Vec<LocalFlagChange> = sqlx::query_as(
            r#"
            SELECT upstream_id, is_read, is_favorite, flags_updated_at
            FROM articles
            WHERE upstream_id IS NOT NULL AND flags_updated_at > ?
            ORDER BY flags_updated_at
        "#,
        )
        .bind(cursor)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Apply a remote flag state under last-writer-wins.
    ///
    /// The remote wins on equal timestamps (`<=`), which is the tie-break
    /// that keeps multiple devices converging on the remote state. Returns
    /// whether a local row was updated.
    pub async fn apply_remote_flags(
        &self,
        upstream_id: &str,
        is_read: bool,
        is_favorite: bool,
        remote_ts: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE articles
            SET is_read = ?, is_favorite = ?, flags_updated_at = ?
            WHERE upstream_id = ? AND flags_updated_at <= ?
        "#,
        )
        .bind(is_read)
        .bind(is_favorite)
        .bind(remote_ts)
        .bind(upstream_id)
        .bind(remote_ts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Remove old articles, then shrink the database under the size budget.
    ///
    /// Pass 1 deletes articles older than `max_age_days` that are neither
    /// favorited nor saved for later. Pass 2 (file-backed databases only)
    /// deletes the oldest read non-favorites in batches until the file fits
    /// `max_size_bytes`. Favorites survive both passes unconditionally.
    /// Finishes with a VACUUM to reclaim the space.
    ///
    /// Returns the number of rows deleted.
    pub async fn cleanup(
        &self,
        max_age_days: i64,
        max_size_bytes: Option<u64>,
    ) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let age_cutoff = now - max_age_days * 86_400;
        let mut deleted: u64 = 0;

        let result = sqlx::query(
            r#"
            DELETE FROM articles
            WHERE COALESCE(published_at, ingested_at) < ?
              AND is_favorite = 0
              AND is_read_later = 0
        "#,
        )
        .bind(age_cutoff)
        .execute(&self.pool)
        .await?;
        deleted += result.rows_affected();

        if let Some(budget) = max_size_bytes {
            // Fold the WAL into the main file so the size check is honest.
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await
                .ok();

            while self.file_size().is_some_and(|size| size > budget) {
                let result = sqlx::query(
                    r#"
                    DELETE FROM articles
                    WHERE id IN (
                        SELECT id FROM articles
                        WHERE is_read = 1 AND is_favorite = 0
                        ORDER BY COALESCE(published_at, ingested_at)
                        LIMIT ?
                    )
                "#,
                )
                .bind(CLEANUP_BATCH)
                .execute(&self.pool)
                .await?;

                if result.rows_affected() == 0 {
                    // Nothing deletable is left; the budget cannot be met
                    // without touching favorites or unread articles.
                    tracing::warn!(
                        budget_bytes = budget,
                        "Size cleanup exhausted deletable articles above budget"
                    );
                    break;
                }
                deleted += result.rows_affected();

                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                    .execute(&self.pool)
                    .await
                    .ok();
            }
        }

        if deleted > 0 {
            sqlx::query("VACUUM").execute(&self.pool).await?;
        }

        tracing::info!(deleted = deleted, max_age_days = max_age_days, "Article cleanup complete");
        Ok(deleted)
    }
}
