//! Typed settings on top of the raw key/value table.
//!
//! The schema is a closed set of [`SettingDescriptor`]s; the core reads and
//! writes only keys declared here (plus the `secret.` namespace for
//! per-feed credentials, which is implicitly `string` + encrypted). The API
//! layer adapts this schema to clients; encrypted values are opaque to it.
//!
//! Encrypted keys migrate transparently: a read that finds legacy plaintext
//! re-encrypts it in place and logs a one-time notice.

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::crypto;
use crate::storage::Database;

// ============================================================================
// Descriptor Schema
// ============================================================================

/// Value type of a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingType {
    Int,
    String,
    Bool,
}

/// One declared setting: key, type, default, and whether it is sealed at
/// rest.
#[derive(Debug, Clone, Copy)]
pub struct SettingDescriptor {
    pub key: &'static str,
    pub ty: SettingType,
    pub default: &'static str,
    pub encrypted: bool,
}

const fn desc(
    key: &'static str,
    ty: SettingType,
    default: &'static str,
    encrypted: bool,
) -> SettingDescriptor {
    SettingDescriptor {
        key,
        ty,
        default,
        encrypted,
    }
}

/// The closed settings schema. Everything the core reads is declared here.
pub const DESCRIPTORS: &[SettingDescriptor] = &[
    // Scheduling
    desc("refresh.global_interval_secs", SettingType::Int, "0", false), // 0 = adaptive
    desc("network.concurrency_override", SettingType::Int, "0", false), // 0 = probe-driven
    desc("network.allow_localhost_feeds", SettingType::Bool, "false", false),
    // Cleanup defaults
    desc("cleanup.max_age_days", SettingType::Int, "90", false),
    desc("cleanup.max_size_bytes", SettingType::Int, "0", false), // 0 = unlimited
    // Translation capability
    desc("translate.enabled", SettingType::Bool, "false", false),
    desc("translate.target_lang", SettingType::String, "en", false),
    desc("deepl_api_key", SettingType::String, "", true),
    // Upstream aggregator sync
    desc("upstream.endpoint", SettingType::String, "", false),
    desc("upstream.username", SettingType::String, "", false),
    desc("upstream.password", SettingType::String, "", true),
    desc("upstream.session_token", SettingType::String, "", true),
    desc("upstream.sync_interval_secs", SettingType::Int, "900", false),
    desc("upstream.pull_cursor", SettingType::Int, "0", false),
    desc("upstream.push_cursor", SettingType::Int, "0", false),
];

/// Namespace for ad-hoc credentials (IMAP account passwords referenced by
/// feed configs). Implicitly `string` + encrypted.
const SECRET_PREFIX: &str = "secret.";

/// Look up a key's descriptor, if declared.
pub fn descriptor(key: &str) -> Option<&'static SettingDescriptor> {
    DESCRIPTORS.iter().find(|d| d.key == key)
}

fn is_encrypted_key(key: &str) -> bool {
    key.starts_with(SECRET_PREFIX) || descriptor(key).is_some_and(|d| d.encrypted)
}

fn is_known_key(key: &str) -> bool {
    key.starts_with(SECRET_PREFIX) || descriptor(key).is_some()
}

// ============================================================================
// Settings Store
// ============================================================================

/// Settings facade owned by the `Core`; cheap to clone.
#[derive(Clone)]
pub struct SettingsStore {
    db: Database,
    /// Keys already reported as migrated, so the notice logs once per key
    /// per process even if the write-back races.
    migration_logged: Arc<Mutex<HashSet<String>>>,
}

impl SettingsStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            migration_logged: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Read a setting, decrypting and migrating as needed.
    ///
    /// Missing keys return the declared default (empty string for the
    /// `secret.` namespace). A value that fails to decrypt — typically a
    /// database moved from another machine — degrades to an empty string
    /// with a warning rather than an error.
    pub async fn get(&self, key: &str) -> Result<String> {
        if !is_known_key(key) {
            anyhow::bail!("Unknown setting key: {}", key);
        }

        let stored = self.db.get_setting_raw(key).await?;
        let default = descriptor(key).map(|d| d.default).unwrap_or("");

        let Some((value, _)) = stored else {
            return Ok(default.to_string());
        };

        if !is_encrypted_key(key) {
            return Ok(value);
        }

        if crypto::is_ciphertext(&value) {
            return match crypto::decrypt(&value) {
                Ok(plain) => Ok(plain),
                Err(e) => {
                    tracing::warn!(key = key, error = %e, "Failed to decrypt setting; returning empty value");
                    Ok(String::new())
                }
            };
        }

        // Legacy plaintext row: encrypt in place and report once.
        let sealed = crypto::encrypt(&value)?;
        self.db.set_setting_raw(key, &sealed, true).await?;

        let first_time = self
            .migration_logged
            .lock()
            .expect("migration set poisoned")
            .insert(key.to_string());
        if first_time {
            tracing::info!(key = key, "Migrated plaintext setting to encrypted storage");
        }

        Ok(value)
    }

    /// Write a setting, validating its declared type and sealing encrypted
    /// keys. Writes of encrypted keys always produce fresh ciphertext.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let Some(ty) = descriptor(key).map(|d| d.ty).or_else(|| {
            key.starts_with(SECRET_PREFIX).then_some(SettingType::String)
        }) else {
            anyhow::bail!("Unknown setting key: {}", key);
        };

        match ty {
            SettingType::Int => {
                value
                    .parse::<i64>()
                    .map_err(|_| anyhow::anyhow!("Setting {} expects an integer, got {:?}", key, value))?;
            }
            SettingType::Bool => {
                if value != "true" && value != "false" {
                    anyhow::bail!("Setting {} expects true/false, got {:?}", key, value);
                }
            }
            SettingType::String => {}
        }

        if is_encrypted_key(key) {
            let sealed = crypto::encrypt(value)?;
            self.db.set_setting_raw(key, &sealed, true).await?;
        } else {
            self.db.set_setting_raw(key, value, false).await?;
        }
        Ok(())
    }

    /// Convenience typed reads. Defaults cover unset and unparseable values.
    pub async fn get_i64(&self, key: &str) -> Result<i64> {
        let raw = self.get(key).await?;
        Ok(raw
            .parse()
            .unwrap_or_else(|_| descriptor(key).and_then(|d| d.default.parse().ok()).unwrap_or(0)))
    }

    pub async fn get_bool(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await? == "true")
    }

    /// Full settings map for the API layer. Encrypted keys surface their
    /// stored (sealed) form, never the plaintext.
    pub async fn all_opaque(&self) -> Result<BTreeMap<String, String>> {
        let mut map: BTreeMap<String, String> = DESCRIPTORS
            .iter()
            .map(|d| (d.key.to_string(), d.default.to_string()))
            .collect();
        for (key, value, _) in self.db.all_settings_raw().await? {
            map.insert(key, value);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SettingsStore {
        SettingsStore::new(Database::open(":memory:").await.unwrap())
    }

    #[tokio::test]
    async fn test_default_for_unset_key() {
        let store = test_store().await;
        assert_eq!(store.get("cleanup.max_age_days").await.unwrap(), "90");
        assert_eq!(store.get_i64("upstream.sync_interval_secs").await.unwrap(), 900);
    }

    #[tokio::test]
    async fn test_unknown_key_rejected() {
        let store = test_store().await;
        assert!(store.get("no.such.key").await.is_err());
        assert!(store.set("no.such.key", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_type_validation() {
        let store = test_store().await;
        assert!(store.set("cleanup.max_age_days", "abc").await.is_err());
        assert!(store.set("translate.enabled", "yes").await.is_err());
        store.set("cleanup.max_age_days", "30").await.unwrap();
        store.set("translate.enabled", "true").await.unwrap();
        assert!(store.get_bool("translate.enabled").await.unwrap());
    }

    #[tokio::test]
    async fn test_encrypted_roundtrip_and_opacity() {
        let store = test_store().await;
        store.set("deepl_api_key", "plain-key").await.unwrap();

        // Reads give back the plaintext...
        assert_eq!(store.get("deepl_api_key").await.unwrap(), "plain-key");

        // ...but the stored form and the API map are sealed.
        let (stored, encrypted) = store
            .db
            .get_setting_raw("deepl_api_key")
            .await
            .unwrap()
            .unwrap();
        assert!(encrypted);
        assert!(crypto::is_ciphertext(&stored));
        assert_ne!(stored, "plain-key");

        let map = store.all_opaque().await.unwrap();
        assert!(crypto::is_ciphertext(&map["deepl_api_key"]));
    }

    #[tokio::test]
    async fn test_two_writes_differ() {
        let store = test_store().await;
        store.set("upstream.password", "pw").await.unwrap();
        let (first, _) = store.db.get_setting_raw("upstream.password").await.unwrap().unwrap();
        store.set("upstream.password", "pw").await.unwrap();
        let (second, _) = store.db.get_setting_raw("upstream.password").await.unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_plaintext_migration_on_read() {
        let store = test_store().await;

        // Preload a legacy plaintext row directly.
        store
            .db
            .set_setting_raw("deepl_api_key", "legacy-plain", false)
            .await
            .unwrap();

        // First read returns the plaintext and rewrites the row sealed.
        assert_eq!(store.get("deepl_api_key").await.unwrap(), "legacy-plain");
        let (stored, _) = store.db.get_setting_raw("deepl_api_key").await.unwrap().unwrap();
        assert!(crypto::is_ciphertext(&stored));

        // Second read still returns the plaintext, now via decryption.
        assert_eq!(store.get("deepl_api_key").await.unwrap(), "legacy-plain");
    }

    #[tokio::test]
    async fn test_migration_notice_logged_once() {
        let store = test_store().await;
        store
            .db
            .set_setting_raw("deepl_api_key", "legacy", false)
            .await
            .unwrap();

        store.get("deepl_api_key").await.unwrap();
        store.get("deepl_api_key").await.unwrap();

        let logged = store.migration_logged.lock().unwrap();
        assert_eq!(logged.len(), 1);
    }

    #[tokio::test]
    async fn test_secret_namespace_is_encrypted() {
        let store = test_store().await;
        store.set("secret.imap.newsletter", "imap-pw").await.unwrap();

        assert_eq!(store.get("secret.imap.newsletter").await.unwrap(), "imap-pw");
        let (stored, encrypted) = store
            .db
            .get_setting_raw("secret.imap.newsletter")
            .await
            .unwrap()
            .unwrap();
        assert!(encrypted);
        assert!(crypto::is_ciphertext(&stored));
    }
}
