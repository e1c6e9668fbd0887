//! IMAP newsletter ingestion.
//!
//! A configured mailbox folder is treated as a feed: each message since the
//! last seen UID becomes one item, with the subject as title, the parsed
//! body as content, the `Date` header as timestamp, and the `Message-ID` as
//! source id. The session is torn down after every run; UID state is the
//! only thing carried between runs.
//!
//! The imap crate is synchronous, so the whole session runs on the blocking
//! pool and the caller awaits it as one suspension point.

use secrecy::{ExposeSecret, SecretString};

use super::{CanonicalItem, ParseError};
use crate::storage::ImapConfig;

/// Items from one IMAP run plus the UID high-water mark to persist.
#[derive(Debug)]
pub struct ImapBatch {
    pub items: Vec<CanonicalItem>,
    pub last_seen_uid: u32,
}

/// Fetch messages newer than the configured last-seen UID.
pub async fn fetch(config: ImapConfig, password: SecretString) -> Result<ImapBatch, ParseError> {
    tokio::task::spawn_blocking(move || fetch_blocking(&config, &password))
        .await
        .map_err(|e| ParseError::Imap(format!("IMAP task panicked: {}", e)))?
}

fn fetch_blocking(config: &ImapConfig, password: &SecretString) -> Result<ImapBatch, ParseError> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .map_err(|e| ParseError::Imap(format!("TLS setup failed: {}", e)))?;

    let client = imap::connect(
        (config.server.as_str(), config.port),
        config.server.as_str(),
        &tls,
    )
    .map_err(|e| ParseError::Imap(format!("connect failed: {}", e)))?;

    let mut session = client
        .login(&config.username, password.expose_secret())
        .map_err(|(e, _)| ParseError::Imap(format!("login failed: {}", e)))?;

    let result = fetch_from_session(&mut session, config);

    // Teardown regardless of the fetch outcome.
    if let Err(e) = session.logout() {
        tracing::debug!(server = %config.server, error = %e, "IMAP logout failed");
    }

    result
}

fn fetch_from_session(
    session: &mut imap::Session<native_tls::TlsStream<std::net::TcpStream>>,
    config: &ImapConfig,
) -> Result<ImapBatch, ParseError> {
    session
        .select(&config.folder)
        .map_err(|e| ParseError::Imap(format!("cannot select folder {}: {}", config.folder, e)))?;

    let query = if config.last_seen_uid > 0 {
        format!("UID {}:*", config.last_seen_uid + 1)
    } else {
        "ALL".to_string()
    };

    let uids = session
        .uid_search(&query)
        .map_err(|e| ParseError::Imap(format!("search failed: {}", e)))?;

    // "UID n:*" always matches at least the newest message, even when its
    // UID is below n, so filter explicitly.
    let mut uids: Vec<u32> = uids
        .into_iter()
        .filter(|&uid| uid > config.last_seen_uid)
        .collect();
    uids.sort_unstable();

    if uids.is_empty() {
        return Ok(ImapBatch {
            items: Vec::new(),
            last_seen_uid: config.last_seen_uid,
        });
    }

    let set = uids
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let messages = session
        .uid_fetch(&set, "RFC822")
        .map_err(|e| ParseError::Imap(format!("fetch failed: {}", e)))?;

    let mut items = Vec::new();
    let mut last_seen_uid = config.last_seen_uid;

    for message in messages.iter() {
        let uid = message.uid.unwrap_or(0);
        last_seen_uid = last_seen_uid.max(uid);

        let Some(body) = message.body() else {
            continue;
        };
        match parse_message(body, uid) {
            Some(item) => items.push(item),
            None => {
                tracing::warn!(uid = uid, folder = %config.folder, "Skipping unparseable message");
            }
        }
    }

    Ok(ImapBatch {
        items,
        last_seen_uid,
    })
}

fn parse_message(raw: &[u8], uid: u32) -> Option<CanonicalItem> {
    let parsed = mail_parser::MessageParser::default().parse(raw)?;

    let title = parsed
        .subject()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "(no subject)".to_string());
    let content_html = parsed
        .body_html(0)
        .map(|c| c.to_string())
        .or_else(|| parsed.body_text(0).map(|c| c.to_string()));
    let published_at = parsed.date().map(|d| d.to_timestamp());
    let author = parsed
        .from()
        .and_then(|addrs| addrs.first())
        .and_then(|addr| {
            addr.name
                .as_ref()
                .or(addr.address.as_ref())
                .map(|s| s.to_string())
        });
    let source_id = parsed
        .message_id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("imap-uid-{}", uid));

    Some(CanonicalItem {
        source_id,
        canonical_url: None,
        title,
        content_html,
        published_at,
        author,
        thumbnail_url: None,
        audio_url: None,
        video_url: None,
        categories: Vec::new(),
    })
}
