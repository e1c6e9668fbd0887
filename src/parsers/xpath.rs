//! XPath-driven extraction for pages and documents that are not feeds.
//!
//! Two flavors share one engine: the XML flavor evaluates XPaths directly
//! over the document; the HTML flavor first normalizes the page through an
//! HTML5 parser into well-formed XML (real-world HTML is rarely valid XML),
//! then evaluates the same way. `items_xpath` selects the item nodes; the
//! per-field XPaths are evaluated relative to each item node.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sxd_document::parser as xml_parser;
use sxd_xpath::{nodeset::Node, Context, Factory, Value, XPath};

use super::{CanonicalItem, ParseError};
use crate::storage::XpathConfig;

/// Parse an XML document with the configured selectors.
///
/// An `items_xpath` that selects nothing is not an error; the feed simply
/// has no items right now.
pub fn parse_xml(text: &str, config: &XpathConfig) -> Result<Vec<CanonicalItem>, ParseError> {
    let package = xml_parser::parse(text)
        .map_err(|e| ParseError::Malformed(format!("invalid XML: {:?}", e)))?;
    let document = package.as_document();

    let selectors = Selectors::compile(config)?;
    let context = Context::new();

    let value = selectors
        .items
        .evaluate(&context, document.root())
        .map_err(|e| ParseError::Config(format!("items_xpath failed: {}", e)))?;

    let Value::Nodeset(nodes) = value else {
        // A non-node result (string/number) selects nothing.
        return Ok(Vec::new());
    };

    let mut items = Vec::new();
    for node in nodes.document_order() {
        items.push(selectors.extract_item(&context, node, config));
    }
    Ok(items)
}

/// Parse an HTML page with the configured selectors.
pub fn parse_html(text: &str, config: &XpathConfig) -> Result<Vec<CanonicalItem>, ParseError> {
    let xml = normalize_html(text);
    parse_xml(&xml, config)
}

// ============================================================================
// Compiled Selectors
// ============================================================================

struct Selectors {
    items: XPath,
    title: Option<XPath>,
    url: Option<XPath>,
    content: Option<XPath>,
    author: Option<XPath>,
    timestamp: Option<XPath>,
    thumbnail: Option<XPath>,
    category: Option<XPath>,
    uid: Option<XPath>,
}

impl Selectors {
    /// Compile every configured XPath up front so a typo surfaces as one
    /// `config_error` instead of failing per item.
    fn compile(config: &XpathConfig) -> Result<Self, ParseError> {
        let factory = Factory::new();

        if config.items_xpath.trim().is_empty() {
            return Err(ParseError::Config("items_xpath is required".to_string()));
        }

        Ok(Selectors {
            items: build(&factory, "items_xpath", &config.items_xpath)?,
            title: build_opt(&factory, "title_xpath", config.title_xpath.as_deref())?,
            url: build_opt(&factory, "url_xpath", config.url_xpath.as_deref())?,
            content: build_opt(&factory, "content_xpath", config.content_xpath.as_deref())?,
            author: build_opt(&factory, "author_xpath", config.author_xpath.as_deref())?,
            timestamp: build_opt(&factory, "timestamp_xpath", config.timestamp_xpath.as_deref())?,
            thumbnail: build_opt(&factory, "thumbnail_xpath", config.thumbnail_xpath.as_deref())?,
            category: build_opt(&factory, "category_xpath", config.category_xpath.as_deref())?,
            uid: build_opt(&factory, "uid_xpath", config.uid_xpath.as_deref())?,
        })
    }

    fn extract_item<'d>(
        &self,
        context: &Context<'d>,
        node: Node<'d>,
        config: &XpathConfig,
    ) -> CanonicalItem {
        let title = self
            .eval_string(context, &self.title, node)
            .unwrap_or_else(|| "Untitled".to_string());
        let published_at = self
            .eval_string(context, &self.timestamp, node)
            .and_then(|raw| parse_timestamp(&raw, config.timestamp_format.as_deref()));

        CanonicalItem {
            source_id: self.eval_string(context, &self.uid, node).unwrap_or_default(),
            canonical_url: self.eval_string(context, &self.url, node),
            title,
            content_html: self.eval_string(context, &self.content, node),
            published_at,
            author: self.eval_string(context, &self.author, node),
            thumbnail_url: self.eval_string(context, &self.thumbnail, node),
            audio_url: None,
            video_url: None,
            categories: self.eval_strings(context, &self.category, node),
        }
    }

    /// Evaluate a relative XPath to a single trimmed string; empty results
    /// become `None`.
    fn eval_string<'d>(
        &self,
        context: &Context<'d>,
        xpath: &Option<XPath>,
        node: Node<'d>,
    ) -> Option<String> {
        let xpath = xpath.as_ref()?;
        let value = xpath.evaluate(context, node).ok()?;
        let text = match value {
            Value::Nodeset(ns) => ns.document_order_first()?.string_value(),
            other => other.string(),
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Evaluate a relative XPath to all matching strings (categories).
    fn eval_strings<'d>(
        &self,
        context: &Context<'d>,
        xpath: &Option<XPath>,
        node: Node<'d>,
    ) -> Vec<String> {
        let Some(xpath) = xpath.as_ref() else {
            return Vec::new();
        };
        let Ok(value) = xpath.evaluate(context, node) else {
            return Vec::new();
        };
        match value {
            Value::Nodeset(ns) => ns
                .document_order()
                .into_iter()
                .map(|n| n.string_value().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            other => {
                let s = other.string();
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    Vec::new()
                } else {
                    vec![trimmed.to_string()]
                }
            }
        }
    }
}

fn build(factory: &Factory, name: &str, expr: &str) -> Result<XPath, ParseError> {
    factory
        .build(expr)
        .map_err(|e| ParseError::Config(format!("invalid {}: {}", name, e)))?
        .ok_or_else(|| ParseError::Config(format!("empty {}", name)))
}

fn build_opt(
    factory: &Factory,
    name: &str,
    expr: Option<&str>,
) -> Result<Option<XPath>, ParseError> {
    match expr {
        Some(e) if !e.trim().is_empty() => Ok(Some(build(factory, name, e)?)),
        _ => Ok(None),
    }
}

// ============================================================================
// Timestamp Parsing
// ============================================================================

/// Parse a scraped timestamp with the configured format string, falling
/// back to RFC 3339 / RFC 2822. Returns `None` on failure; the ingestor
/// substitutes the ingest time.
fn parse_timestamp(raw: &str, format: Option<&str>) -> Option<i64> {
    if let Some(fmt) = format {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.timestamp());
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc().timestamp());
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
        }
        tracing::debug!(raw = raw, format = fmt, "Timestamp did not match configured format");
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.timestamp());
    }
    None
}

// ============================================================================
// HTML Normalization
// ============================================================================

/// Re-serialize an HTML5 parse tree as well-formed XML so the XPath engine
/// can evaluate over it. Tag and attribute names come out lowercased by the
/// HTML5 parser, comments and doctypes are dropped, and text/attribute
/// values are entity-escaped.
fn normalize_html(text: &str) -> String {
    let document = scraper::Html::parse_document(text);
    let mut out = String::with_capacity(text.len());
    if let Some(root) = document.tree.root().children().find(|n| n.value().is_element()) {
        write_node(&mut out, root);
    }
    out
}

fn write_node(out: &mut String, node: ego_tree::NodeRef<'_, scraper::node::Node>) {
    use scraper::node::Node as HtmlNode;

    match node.value() {
        HtmlNode::Element(el) => {
            out.push('<');
            out.push_str(el.name());
            for (name, value) in el.attrs() {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                escape_into(out, value);
                out.push('"');
            }

            if node.children().next().is_none() {
                out.push_str("/>");
                return;
            }

            out.push('>');
            for child in node.children() {
                write_node(out, child);
            }
            out.push_str("</");
            out.push_str(el.name());
            out.push('>');
        }
        HtmlNode::Text(text) => {
            escape_into(out, &text);
        }
        // Comments, doctypes, and processing instructions have no XPath
        // surface worth preserving.
        _ => {}
    }
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(items: &str) -> XpathConfig {
        XpathConfig {
            items_xpath: items.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_xml_items_with_relative_fields() {
        let xml = r#"<catalog>
  <entry><name>First</name><href>https://example.com/1</href><id>e1</id></entry>
  <entry><name>Second</name><href>https://example.com/2</href><id>e2</id></entry>
</catalog>"#;

        let cfg = XpathConfig {
            title_xpath: Some("name".into()),
            url_xpath: Some("href".into()),
            uid_xpath: Some("id".into()),
            ..config("/catalog/entry")
        };

        let items = parse_xml(xml, &cfg).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "First");
        assert_eq!(items[0].canonical_url.as_deref(), Some("https://example.com/1"));
        assert_eq!(items[1].fingerprint(), "e2");
    }

    #[test]
    fn test_empty_items_result_is_zero_items() {
        let xml = "<catalog></catalog>";
        let items = parse_xml(xml, &config("/catalog/entry")).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_invalid_items_xpath_is_config_error() {
        let err = parse_xml("<a/>", &config("//[broken")).unwrap_err();
        assert!(matches!(err, ParseError::Config(_)));
    }

    #[test]
    fn test_timestamp_with_configured_format() {
        let xml = r#"<list><row><t>Post</t><when>2024-03-01 18:30</when></row></list>"#;
        let cfg = XpathConfig {
            title_xpath: Some("t".into()),
            timestamp_xpath: Some("when".into()),
            timestamp_format: Some("%Y-%m-%d %H:%M".into()),
            ..config("/list/row")
        };

        let items = parse_xml(xml, &cfg).unwrap();
        let expected = NaiveDateTime::parse_from_str("2024-03-01 18:30", "%Y-%m-%d %H:%M")
            .unwrap()
            .and_utc()
            .timestamp();
        assert_eq!(items[0].published_at, Some(expected));
    }

    #[test]
    fn test_unparseable_timestamp_left_unset() {
        let xml = r#"<list><row><when>yesterday-ish</when></row></list>"#;
        let cfg = XpathConfig {
            timestamp_xpath: Some("when".into()),
            timestamp_format: Some("%Y-%m-%d".into()),
            ..config("/list/row")
        };

        let items = parse_xml(xml, &cfg).unwrap();
        assert_eq!(items[0].published_at, None);
    }

    #[test]
    fn test_html_flavor_handles_unclosed_tags() {
        let html = r#"<html><body>
          <div class="post"><h2>Title One</h2><a href="/one">link<p>stray
          </div>
          <div class="post"><h2>Title Two</h2><a href="/two">link</a></div>
        </body></html>"#;

        let cfg = XpathConfig {
            title_xpath: Some("h2".into()),
            url_xpath: Some("a/@href".into()),
            ..config("//div[@class='post']")
        };

        let items = parse_html(html, &cfg).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Title One");
        assert_eq!(items[0].canonical_url.as_deref(), Some("/one"));
        assert_eq!(items[1].title, "Title Two");
    }

    #[test]
    fn test_html_attribute_escaping_survives_roundtrip() {
        let html = r#"<html><body><p title="a &amp; b <c>">text &amp; more</p></body></html>"#;
        let cfg = XpathConfig {
            title_xpath: Some("@title".into()),
            ..config("//p")
        };

        let items = parse_html(html, &cfg).unwrap();
        assert_eq!(items[0].title, "a & b <c>");
    }

    #[test]
    fn test_category_xpath_collects_all_matches() {
        let xml = r#"<list><row><tag>rust</tag><tag>async</tag></row></list>"#;
        let cfg = XpathConfig {
            category_xpath: Some("tag".into()),
            ..config("/list/row")
        };

        let items = parse_xml(xml, &cfg).unwrap();
        assert_eq!(items[0].categories, vec!["rust".to_string(), "async".to_string()]);
    }
}
