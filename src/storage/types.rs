use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by the article store.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A second process holds the database write lock
    #[error("Cannot use the database: another gleaner process is holding it (SQLite code {code})")]
    Busy { code: String },

    /// Schema setup failed partway; the transaction was rolled back
    #[error("Schema setup failed: {0}")]
    Migration(String),

    /// The database was created by a newer, incompatible version
    #[error("Database schema version {found} is newer than supported version {supported}")]
    SchemaIncompatible { found: i64, supported: i64 },

    /// Any other driver error
    #[error(transparent)]
    Sqlx(sqlx::Error),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        // SQLite packs the primary result code into the low byte of the
        // extended code it reports (e.g. 517 = SQLITE_BUSY_SNAPSHOT).
        // Primary codes 5 (BUSY) and 6 (LOCKED) mean a second writer has
        // the file; everything else passes through untouched.
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            let primary = code.parse::<u32>().map(|c| c & 0xff);
            if matches!(primary, Ok(5) | Ok(6)) {
                return DatabaseError::Busy { code };
            }
        }
        DatabaseError::Sqlx(err)
    }
}

// ============================================================================
// Feed Kind & Parser Configuration
// ============================================================================

/// Source format of a feed, selecting which parser the ingest pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    /// RSS 2.0 / Atom 1.0 over HTTP
    Standard,
    /// XPath extraction over an HTML page
    XpathHtml,
    /// XPath extraction over an XML document
    XpathXml,
    /// User script under the scripts directory emitting feed XML on stdout
    Script,
    /// IMAP mailbox folder treated as a newsletter feed
    Imap,
    /// Mirrored from the upstream aggregator's sync protocol
    Upstream,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Standard => "standard",
            FeedKind::XpathHtml => "xpath_html",
            FeedKind::XpathXml => "xpath_xml",
            FeedKind::Script => "script",
            FeedKind::Imap => "imap",
            FeedKind::Upstream => "upstream",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(FeedKind::Standard),
            "xpath_html" => Some(FeedKind::XpathHtml),
            "xpath_xml" => Some(FeedKind::XpathXml),
            "script" => Some(FeedKind::Script),
            "imap" => Some(FeedKind::Imap),
            "upstream" => Some(FeedKind::Upstream),
            _ => None,
        }
    }
}

/// XPath selector set for the `xpath_html` / `xpath_xml` kinds.
///
/// `items_xpath` selects the item nodes; the remaining selectors are
/// evaluated relative to each item node. All are optional except
/// `items_xpath`; missing selectors leave the corresponding field empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XpathConfig {
    pub items_xpath: String,
    #[serde(default)]
    pub title_xpath: Option<String>,
    #[serde(default)]
    pub url_xpath: Option<String>,
    #[serde(default)]
    pub content_xpath: Option<String>,
    #[serde(default)]
    pub author_xpath: Option<String>,
    #[serde(default)]
    pub timestamp_xpath: Option<String>,
    /// chrono format string for `timestamp_xpath` values (e.g. `%Y-%m-%d %H:%M`)
    #[serde(default)]
    pub timestamp_format: Option<String>,
    #[serde(default)]
    pub thumbnail_xpath: Option<String>,
    #[serde(default)]
    pub category_xpath: Option<String>,
    #[serde(default)]
    pub uid_xpath: Option<String>,
}

/// Configuration for the `script` kind: a path relative to the scripts root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptConfig {
    pub path: String,
}

/// Configuration for the `imap` kind.
///
/// The password is never stored here; `password_key` names an encrypted
/// settings entry holding the credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImapConfig {
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    /// Settings key (encrypted) holding the account password
    pub password_key: String,
    #[serde(default = "default_imap_folder")]
    pub folder: String,
    /// Highest message UID already ingested; 0 means fetch everything
    #[serde(default)]
    pub last_seen_uid: u32,
}

fn default_imap_port() -> u16 {
    993
}

fn default_imap_folder() -> String {
    "INBOX".to_string()
}

/// Configuration for the `upstream` kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamFeedConfig {
    /// The feed's identifier on the upstream aggregator
    pub upstream_feed_id: String,
}

// ============================================================================
// Helper Row Types
// ============================================================================

/// Internal row type for Feed queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub kind: String,
    pub config_json: Option<String>,
    pub category_path: String,
    pub refresh_interval_secs: Option<i64>,
    pub last_fetch_at: Option<i64>,
    pub last_error: String,
    pub update_interval_est_secs: Option<i64>,
    pub order_rank: i64,
    pub hidden_from_timeline: bool,
    pub auto_extract_full: bool,
    pub image_gallery: bool,
    pub disabled: bool,
    pub consecutive_failures: i64,
    pub unread_count: i64,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            title: Arc::from(self.title),
            url: self.url,
            kind: FeedKind::parse(&self.kind).unwrap_or(FeedKind::Standard),
            config_json: self.config_json,
            category_path: self.category_path,
            refresh_interval_secs: self.refresh_interval_secs,
            last_fetch_at: self.last_fetch_at,
            last_error: self.last_error,
            update_interval_est_secs: self.update_interval_est_secs,
            order_rank: self.order_rank,
            hidden_from_timeline: self.hidden_from_timeline,
            auto_extract_full: self.auto_extract_full,
            image_gallery: self.image_gallery,
            disabled: self.disabled,
            consecutive_failures: self.consecutive_failures,
            unread_count: self.unread_count,
        }
    }
}

/// Internal row type for Article queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub fingerprint: String,
    pub url: Option<String>,
    pub title: String,
    pub translated_title: Option<String>,
    pub published_at: Option<i64>,
    pub ingested_at: i64,
    pub content: Option<String>,
    pub thumbnail_url: Option<String>,
    pub audio_url: Option<String>,
    pub video_url: Option<String>,
    pub is_read: bool,
    pub is_favorite: bool,
    pub is_hidden: bool,
    pub is_read_later: bool,
    pub summary: Option<String>,
    pub upstream_id: Option<String>,
    pub no_translate: bool,
    pub category: Option<String>,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            feed_id: self.feed_id,
            fingerprint: self.fingerprint,
            url: self.url.map(Arc::from),
            title: Arc::from(self.title),
            translated_title: self.translated_title.map(Arc::from),
            published_at: self.published_at,
            ingested_at: self.ingested_at,
            content: self.content.map(Arc::from),
            thumbnail_url: self.thumbnail_url,
            audio_url: self.audio_url,
            video_url: self.video_url,
            is_read: self.is_read,
            is_favorite: self.is_favorite,
            is_hidden: self.is_hidden,
            is_read_later: self.is_read_later,
            summary: self.summary.map(Arc::from),
            upstream_id: self.upstream_id,
            no_translate: self.no_translate,
            category: self.category,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed data from database.
///
/// `title` uses `Arc<str>` for cheap cloning into the task snapshots
/// published on the progress bus.
#[derive(Debug, Clone)]
pub struct Feed {
    pub id: i64,
    pub title: Arc<str>,
    pub url: String,
    pub kind: FeedKind,
    pub config_json: Option<String>,
    /// '/'-joined category segments; empty string means uncategorized
    pub category_path: String,
    /// Per-feed refresh override in seconds; `None` follows the global cadence
    pub refresh_interval_secs: Option<i64>,
    pub last_fetch_at: Option<i64>,
    /// Empty string on success
    pub last_error: String,
    /// Persisted adaptive-interval estimate so restarts keep the cadence
    pub update_interval_est_secs: Option<i64>,
    pub order_rank: i64,
    pub hidden_from_timeline: bool,
    pub auto_extract_full: bool,
    pub image_gallery: bool,
    pub disabled: bool,
    pub consecutive_failures: i64,
    pub unread_count: i64,
}

impl Feed {
    /// Deserialize the kind-specific parser configuration.
    pub fn config<T: serde::de::DeserializeOwned + Default>(&self) -> anyhow::Result<T> {
        match &self.config_json {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(T::default()),
        }
    }
}

/// Article data from database.
///
/// String fields use `Arc<str>` for cheap cloning between the store, the
/// rules engine, and API listings.
#[derive(Debug, Clone)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub fingerprint: String,
    pub url: Option<Arc<str>>,
    pub title: Arc<str>,
    pub translated_title: Option<Arc<str>>,
    pub published_at: Option<i64>,
    pub ingested_at: i64,
    pub content: Option<Arc<str>>,
    pub thumbnail_url: Option<String>,
    pub audio_url: Option<String>,
    pub video_url: Option<String>,
    pub is_read: bool,
    pub is_favorite: bool,
    pub is_hidden: bool,
    pub is_read_later: bool,
    pub summary: Option<Arc<str>>,
    pub upstream_id: Option<String>,
    /// Ingest-time hint that translation can be skipped
    pub no_translate: bool,
    /// Category override set by a `move_to_category` rule action
    pub category: Option<String>,
}

/// Insert payload produced by the ingest pipeline after rules have run.
#[derive(Debug, Clone, Default)]
pub struct NewArticle {
    pub fingerprint: String,
    pub url: Option<String>,
    pub title: String,
    pub translated_title: Option<String>,
    pub published_at: Option<i64>,
    pub content: Option<String>,
    pub thumbnail_url: Option<String>,
    pub audio_url: Option<String>,
    pub video_url: Option<String>,
    pub summary: Option<String>,
    pub upstream_id: Option<String>,
    pub is_read: bool,
    pub is_favorite: bool,
    pub is_hidden: bool,
    pub is_read_later: bool,
    pub no_translate: bool,
    pub category: Option<String>,
}

/// Listing filter for article queries, mirroring the API contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArticleFilter {
    #[default]
    All,
    Unread,
    Favorites,
    ReadLater,
    ImageGallery,
}

impl ArticleFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(ArticleFilter::All),
            "unread" => Some(ArticleFilter::Unread),
            "favorites" => Some(ArticleFilter::Favorites),
            "read_later" => Some(ArticleFilter::ReadLater),
            "image_gallery" => Some(ArticleFilter::ImageGallery),
            _ => None,
        }
    }
}

/// Parameters for paginated article listings.
#[derive(Debug, Clone, Default)]
pub struct ArticleQuery {
    pub feed_id: Option<i64>,
    /// Category path prefix; matches feeds under the path and rule-moved articles
    pub category: Option<String>,
    pub filter: ArticleFilter,
    pub limit: Option<i64>,
    pub offset: i64,
}

/// A stored rule row; `definition_json` deserializes to `rules::RuleDef`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RuleRow {
    pub id: i64,
    pub order_rank: i64,
    pub enabled: bool,
    pub definition_json: String,
}

/// Local flag change queued for the upstream push cycle.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LocalFlagChange {
    pub upstream_id: String,
    pub is_read: bool,
    pub is_favorite: bool,
    pub flags_updated_at: i64,
}
