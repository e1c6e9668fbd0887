//! Standard RSS 2.0 / Atom 1.0 parser on top of feed-rs.
//!
//! feed-rs folds the common media extensions (`media:content`, RSS
//! `enclosure`) into its media model; we classify those by MIME type into
//! the thumbnail/audio/video slots of the canonical item.

use super::{CanonicalItem, ParseError};

/// Parse a fetched feed document into canonical items.
///
/// Encoding is handled by feed-rs from the declared or sniffed charset.
/// A document that is not recognizable RSS/Atom surfaces as
/// [`ParseError::Malformed`] with the parser's diagnostic.
pub fn parse(bytes: &[u8]) -> Result<Vec<CanonicalItem>, ParseError> {
    let feed = feed_rs::parser::parse(bytes).map_err(|e| ParseError::Malformed(e.to_string()))?;

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let canonical_url = entry.links.first().map(|l| l.href.clone());
            let published_at = entry.published.or(entry.updated).map(|dt| dt.timestamp());
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());
            let content_html = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content));
            let author = entry
                .authors
                .first()
                .map(|a| a.name.clone())
                .filter(|n| !n.is_empty());
            let categories = entry
                .categories
                .into_iter()
                .map(|c| c.term)
                .filter(|t| !t.is_empty())
                .collect();

            let (thumbnail_url, audio_url, video_url) = extract_media(&entry.media);

            CanonicalItem {
                source_id: entry.id,
                canonical_url,
                title,
                content_html,
                published_at,
                author,
                thumbnail_url,
                audio_url,
                video_url,
                categories,
            }
        })
        .collect();

    Ok(items)
}

/// Pick the first usable thumbnail, audio, and video URL from the entry's
/// media objects. Explicit `media:thumbnail` wins over an image-typed
/// content URL.
fn extract_media(
    media: &[feed_rs::model::MediaObject],
) -> (Option<String>, Option<String>, Option<String>) {
    let mut thumbnail = None;
    let mut audio = None;
    let mut video = None;

    for object in media {
        if thumbnail.is_none() {
            thumbnail = object.thumbnails.first().map(|t| t.image.uri.clone());
        }

        for content in &object.content {
            let Some(url) = content.url.as_ref() else {
                continue;
            };
            let mime = content
                .content_type
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_default();

            if mime.starts_with("image/") {
                thumbnail.get_or_insert_with(|| url.to_string());
            } else if mime.starts_with("audio/") {
                audio.get_or_insert_with(|| url.to_string());
            } else if mime.starts_with("video/") {
                video.get_or_insert_with(|| url.to_string());
            }
        }
    }

    (thumbnail, audio, video)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rss_basics() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Example</title>
  <item>
    <guid>item-1</guid>
    <title>First Post</title>
    <link>https://example.com/1</link>
    <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate>
    <description>Hello</description>
  </item>
</channel></rss>"#;

        let items = parse(rss.as_bytes()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "First Post");
        assert_eq!(items[0].canonical_url.as_deref(), Some("https://example.com/1"));
        assert!(items[0].published_at.is_some());
        assert_eq!(items[0].content_html.as_deref(), Some("Hello"));
    }

    #[test]
    fn test_parse_atom_uses_entry_id() {
        let atom = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example</title>
  <id>urn:feed</id>
  <updated>2024-01-01T00:00:00Z</updated>
  <entry>
    <id>urn:entry:1</id>
    <title>Atom Entry</title>
    <updated>2024-01-01T00:00:00Z</updated>
    <link href="https://example.com/atom/1"/>
  </entry>
</feed>"#;

        let items = parse(atom.as_bytes()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].fingerprint(), "urn:entry:1");
    }

    #[test]
    fn test_enclosure_maps_to_audio() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Podcast</title>
  <item>
    <guid>ep-1</guid>
    <title>Episode 1</title>
    <enclosure url="https://example.com/ep1.mp3" length="1234" type="audio/mpeg"/>
  </item>
</channel></rss>"#;

        let items = parse(rss.as_bytes()).unwrap();
        assert_eq!(
            items[0].audio_url.as_deref(),
            Some("https://example.com/ep1.mp3")
        );
    }

    #[test]
    fn test_malformed_document_is_rejected() {
        let err = parse(b"<html><body>not a feed</body></html>").unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn test_untitled_entries_get_placeholder() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>X</title>
  <item><guid>1</guid></item>
</channel></rss>"#;

        let items = parse(rss.as_bytes()).unwrap();
        assert_eq!(items[0].title, "Untitled");
    }
}
