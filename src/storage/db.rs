use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

/// Highest schema version this build understands. A database stamped with a
/// newer version refuses to open (`DatabaseError::SchemaIncompatible`).
const SCHEMA_VERSION: i64 = 1;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    /// On-disk location; `None` for in-memory databases (tests)
    pub(crate) path: Option<PathBuf>,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// The connection is configured with WAL journaling so readers are never
    /// blocked by the single writer, and a 5 s busy timeout so transient lock
    /// contention between concurrent refreshes resolves automatically.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Busy` if another process has the database
    /// locked, `DatabaseError::SchemaIncompatible` if the file was written
    /// by a newer version, and `DatabaseError::Sqlx` otherwise.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Set database file permissions BEFORE pool creation so there is no
        // window where the file exists with default umask permissions.
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.exists() {
                    // Pre-create the file with mode(0o600) atomically; setting the
                    // mode at creation time eliminates the create-then-chmod window.
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite reports the error at connect_with.
                }
            }
        }

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from)?
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("busy_timeout", "5000");
        // SQLite is single-writer; 5 connections covers peak concurrent readers
        // (fetch-pool lookups + API listings) alongside the writer. An
        // in-memory database exists per connection, so it gets exactly one.
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from)?;

        let db = Self {
            pool,
            path: if path == ":memory:" {
                None
            } else {
                Some(PathBuf::from(path))
            },
        };

        db.check_schema_version().await?;
        // A lock during migration is still a lock; anything else is a
        // genuine schema-setup failure.
        db.migrate().await.map_err(|e| match DatabaseError::from(e) {
            busy @ DatabaseError::Busy { .. } => busy,
            other => DatabaseError::Migration(other.to_string()),
        })?;
        Ok(db)
    }

    /// Size of the database file in bytes, or `None` for in-memory databases.
    pub fn file_size(&self) -> Option<u64> {
        self.path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
    }

    /// Fold the WAL into the main file (shutdown and cleanup both want an
    /// honest on-disk state).
    pub async fn checkpoint(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Refuse to open databases stamped by a newer schema.
    async fn check_schema_version(&self) -> Result<(), DatabaseError> {
        let (found,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;

        if found > SCHEMA_VERSION {
            return Err(DatabaseError::SchemaIncompatible {
                found,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All schema changes are wrapped in a single transaction; if any step
    /// fails the database stays in its previous consistent state. All
    /// statements use `IF NOT EXISTS` so re-running on an existing database
    /// is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Per-connection settings, outside the transaction
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                url TEXT UNIQUE NOT NULL,
                kind TEXT NOT NULL DEFAULT 'standard',
                config_json TEXT,
                category_path TEXT NOT NULL DEFAULT '',
                refresh_interval_secs INTEGER,
                last_fetch_at INTEGER,
                last_error TEXT NOT NULL DEFAULT '',
                update_interval_est_secs INTEGER,
                order_rank INTEGER NOT NULL DEFAULT 0,
                hidden_from_timeline INTEGER NOT NULL DEFAULT 0,
                auto_extract_full INTEGER NOT NULL DEFAULT 0,
                image_gallery INTEGER NOT NULL DEFAULT 0,
                disabled INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                fingerprint TEXT NOT NULL,
                url TEXT,
                title TEXT NOT NULL,
                translated_title TEXT,
                published_at INTEGER,
                ingested_at INTEGER NOT NULL,
                content TEXT,
                thumbnail_url TEXT,
                audio_url TEXT,
                video_url TEXT,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_favorite INTEGER NOT NULL DEFAULT 0,
                is_hidden INTEGER NOT NULL DEFAULT 0,
                is_read_later INTEGER NOT NULL DEFAULT 0,
                summary TEXT,
                upstream_id TEXT,
                no_translate INTEGER NOT NULL DEFAULT 0,
                category TEXT,
                flags_updated_at INTEGER NOT NULL DEFAULT 0,
                UNIQUE(feed_id, fingerprint)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Listing per feed, newest first
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_feed_published ON articles(feed_id, published_at DESC)",
        )
        .execute(&mut *tx)
        .await?;
        // Unread-count aggregation
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_read_feed ON articles(is_read, feed_id)",
        )
        .execute(&mut *tx)
        .await?;
        // Timeline view across feeds
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_published ON articles(published_at DESC)",
        )
        .execute(&mut *tx)
        .await?;
        // Favorites listing and cleanup guards
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_favorite ON articles(is_favorite, published_at DESC)",
        )
        .execute(&mut *tx)
        .await?;
        // Upstream flag reconciliation
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_upstream ON articles(upstream_id) WHERE upstream_id IS NOT NULL",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rules (
                id INTEGER PRIMARY KEY,
                order_rank INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                definition_json TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                encrypted INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories_expanded_state (
                path TEXT PRIMARY KEY,
                expanded INTEGER NOT NULL DEFAULT 1
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}
