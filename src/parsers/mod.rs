//! Source-format parsers.
//!
//! Every feed kind funnels into one canonical shape: a parser takes its
//! input (fetched bytes, script output, an IMAP folder) and produces a
//! sequence of [`CanonicalItem`]s. Parsers never touch the article store;
//! the ingest pipeline is the only writer.

pub mod imap;
pub mod script;
pub mod standard;
pub mod xpath;

use sha2::{Digest, Sha256};
use thiserror::Error;

// ============================================================================
// Canonical Item
// ============================================================================

/// A normalized item as produced by any parser, before rules and dedup.
#[derive(Debug, Clone, Default)]
pub struct CanonicalItem {
    /// Stable id from the source (guid, Message-ID, upstream item id); may
    /// be empty
    pub source_id: String,
    pub canonical_url: Option<String>,
    pub title: String,
    pub content_html: Option<String>,
    pub published_at: Option<i64>,
    pub author: Option<String>,
    pub thumbnail_url: Option<String>,
    pub audio_url: Option<String>,
    pub video_url: Option<String>,
    pub categories: Vec<String>,
}

impl CanonicalItem {
    /// Dedup key within a feed: the source id when present, else the
    /// normalized URL, else a hash of title + timestamp.
    pub fn fingerprint(&self) -> String {
        let source_id = self.source_id.trim();
        if !source_id.is_empty() {
            return source_id.to_string();
        }

        if let Some(url) = self.canonical_url.as_deref() {
            if let Some(normalized) = normalize_url(url) {
                return normalized;
            }
        }

        let input = format!(
            "{}|{}",
            self.title,
            self.published_at.map(|p| p.to_string()).unwrap_or_default()
        );
        let hash = Sha256::digest(input.as_bytes());
        format!("{:x}", hash)
    }
}

/// Canonical URL form for fingerprinting: parsed, fragment stripped,
/// scheme/host lowercased by the url crate. Unparseable URLs fall through
/// to the hash path.
fn normalize_url(raw: &str) -> Option<String> {
    let mut url = url::Url::parse(raw.trim()).ok()?;
    url.set_fragment(None);
    Some(url.to_string())
}

// ============================================================================
// Parse Errors
// ============================================================================

/// Failures from the parser family, mapped onto the core error taxonomy.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Payload rejected by the feed/XML parser; not retried
    #[error("Malformed feed: {0}")]
    Malformed(String),

    /// Invalid parser configuration (bad XPath, bad script path)
    #[error("Parser configuration error: {0}")]
    Config(String),

    /// User script failed; carries the captured stderr tail
    #[error("Script failed ({status}): {stderr_tail}")]
    Script { status: String, stderr_tail: String },

    /// IMAP session failure
    #[error("IMAP error: {0}")]
    Imap(String),
}
