use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during feed-URL validation.
///
/// These cover both parsing failures and the SSRF policy: feed URLs come
/// from users and are fetched by the pool, so anything pointing into the
/// local network is refused unless explicitly permitted.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost and the allow-localhost setting is off.
    #[error("Localhost not allowed (enable network.allow_localhost_feeds to permit it)")]
    Localhost,
}

/// Validates a URL for use as a feed source.
///
/// Rejects non-HTTP(S) schemes, localhost (unless `allow_localhost`, which
/// mirrors the `network.allow_localhost_feeds` setting), and private IP
/// ranges (RFC 1918, link-local, unique-local IPv6).
///
/// # Errors
///
/// Returns [`UrlValidationError`] describing the first policy violation.
pub fn validate_feed_url(url_str: &str, allow_localhost: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if let Some(host) = url.host_str() {
        // Strip brackets from IPv6 addresses for parsing
        let host_for_parse = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let parsed_ip = host_for_parse.parse::<IpAddr>().ok();
        let is_loopback =
            host == "localhost" || parsed_ip.as_ref().is_some_and(is_loopback_ip);

        if is_loopback {
            if allow_localhost {
                return Ok(url);
            }
            return Err(UrlValidationError::Localhost);
        }

        if let Some(ip) = parsed_ip {
            if is_private_ip(&ip) {
                return Err(UrlValidationError::PrivateIp(ip.to_string()));
            }
        }
    }

    Ok(url)
}

/// Loopback check that sees through IPv4-mapped IPv6 literals
/// (`[::ffff:127.0.0.1]` is still 127.0.0.1).
fn is_loopback_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(mapped) => mapped.is_loopback(),
            None => v6.is_loopback(),
        },
    }
}

/// Check if an IP address is in a private/internal range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_link_local() || v4.is_unspecified() || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            // An IPv4-mapped address is judged by its embedded IPv4 rules,
            // otherwise `::ffff:192.168.1.1` would sail past the gate.
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(mapped));
            }
            // Unique local addresses (fc00::/7) and link-local (fe80::/10)
            let segments = v6.segments();
            v6.is_unspecified()
                || (segments[0] & 0xfe00) == 0xfc00
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_public_urls() {
        assert!(validate_feed_url("https://example.com/feed.xml", false).is_ok());
        assert!(validate_feed_url("http://example.com/rss", false).is_ok());
    }

    #[test]
    fn test_rejects_non_http_schemes() {
        assert!(matches!(
            validate_feed_url("file:///etc/passwd", false),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            validate_feed_url("ftp://example.com/feed", false),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_localhost_gated_by_setting() {
        assert!(matches!(
            validate_feed_url("http://localhost:8080/feed", false),
            Err(UrlValidationError::Localhost)
        ));
        assert!(matches!(
            validate_feed_url("http://127.0.0.1/feed", false),
            Err(UrlValidationError::Localhost)
        ));
        assert!(matches!(
            validate_feed_url("http://[::1]/feed", false),
            Err(UrlValidationError::Localhost)
        ));

        assert!(validate_feed_url("http://localhost:8080/feed", true).is_ok());
        assert!(validate_feed_url("http://127.0.0.1/feed", true).is_ok());
    }

    #[test]
    fn test_rejects_private_ranges() {
        assert!(matches!(
            validate_feed_url("http://192.168.1.1/feed", false),
            Err(UrlValidationError::PrivateIp(_))
        ));
        assert!(matches!(
            validate_feed_url("http://10.0.0.5/feed", false),
            Err(UrlValidationError::PrivateIp(_))
        ));
        assert!(matches!(
            validate_feed_url("http://[fc00::1]/feed", false),
            Err(UrlValidationError::PrivateIp(_))
        ));
    }

    #[test]
    fn test_ipv4_mapped_ipv6_loopback_rejected() {
        assert!(matches!(
            validate_feed_url("http://[::ffff:127.0.0.1]/feed", false),
            Err(UrlValidationError::Localhost)
        ));
        // The gate opens with the setting, same as plain loopback.
        assert!(validate_feed_url("http://[::ffff:127.0.0.1]/feed", true).is_ok());
    }

    #[test]
    fn test_ipv4_mapped_ipv6_private_rejected() {
        assert!(matches!(
            validate_feed_url("http://[::ffff:192.168.1.1]/feed", false),
            Err(UrlValidationError::PrivateIp(_))
        ));
        assert!(matches!(
            validate_feed_url("http://[::ffff:10.0.0.5]/feed", false),
            Err(UrlValidationError::PrivateIp(_))
        ));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            validate_feed_url("not a url at all", false),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }
}
