use anyhow::Result;

use super::db::Database;

impl Database {
    // ========================================================================
    // Settings Rows
    // ========================================================================
    //
    // Raw key/value access. Encryption and the typed descriptor schema live
    // in `crate::settings`; these methods only move strings in and out of
    // the table.

    /// Get a raw setting row: `(value, encrypted)`.
    pub async fn get_setting_raw(&self, key: &str) -> Result<Option<(String, bool)>> {
        let row: Option<(String, bool)> =
            sqlx::query_as("SELECT value, encrypted FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    /// Upsert a raw setting row.
    pub async fn set_setting_raw(&self, key: &str, value: &str, encrypted: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, encrypted)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, encrypted = excluded.encrypted
        "#,
        )
        .bind(key)
        .bind(value)
        .bind(encrypted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All setting rows as `(key, value, encrypted)`, ordered by key.
    pub async fn all_settings_raw(&self) -> Result<Vec<(String, String, bool)>> {
        let rows: Vec<(String, String, bool)> =
            sqlx::query_as("SELECT key, value, encrypted FROM settings ORDER BY key")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_get_setting_missing() {
        let db = test_db().await;
        assert!(db.get_setting_raw("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_and_get_setting() {
        let db = test_db().await;
        db.set_setting_raw("refresh.global_interval", "3600", false)
            .await
            .unwrap();

        let (value, encrypted) = db
            .get_setting_raw("refresh.global_interval")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, "3600");
        assert!(!encrypted);
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let db = test_db().await;
        db.set_setting_raw("k", "v1", false).await.unwrap();
        db.set_setting_raw("k", "v2", true).await.unwrap();

        let (value, encrypted) = db.get_setting_raw("k").await.unwrap().unwrap();
        assert_eq!(value, "v2");
        assert!(encrypted);
    }
}
