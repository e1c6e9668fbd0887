//! Upstream aggregator synchronization.
//!
//! Reconciles read/favorite state with an external aggregator account in
//! both directions: a periodic cycle pulls remote flag changes since the
//! pull cursor and pushes local changes since the push cursor. Conflicts
//! resolve last-writer-wins at item granularity, ties to the remote side,
//! so multiple devices converge. Cursors advance only after a complete
//! pull+push cycle; a transient failure simply replays next time.
//!
//! Articles for upstream-kind feeds arrive through [`UpstreamClient::
//! pull_feed_items`], tagged with the upstream item id so later flag
//! changes can be pushed back.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::parsers::CanonicalItem;
use crate::settings::SettingsStore;
use crate::storage::Database;

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    changes: Vec<RemoteFlagChange>,
    /// Server clock at response time; becomes the next pull cursor
    server_time: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoteFlagChange {
    item_id: String,
    is_read: bool,
    is_favorite: bool,
    updated_at: i64,
}

#[derive(Debug, Serialize)]
struct PushRequest {
    changes: Vec<RemoteFlagChange>,
}

#[derive(Debug, Deserialize)]
struct ItemsResponse {
    items: Vec<RemoteItem>,
}

#[derive(Debug, Deserialize)]
struct RemoteItem {
    id: String,
    url: Option<String>,
    title: String,
    content: Option<String>,
    author: Option<String>,
    published_at: Option<i64>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    is_favorite: bool,
}

/// An upstream article plus the flag state it arrived with.
#[derive(Debug)]
pub struct UpstreamItem {
    pub item: CanonicalItem,
    pub upstream_id: String,
    pub is_read: bool,
    pub is_favorite: bool,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub pulled: usize,
    pub pushed: usize,
}

// ============================================================================
// Client
// ============================================================================

#[derive(Clone)]
pub struct UpstreamClient {
    db: Database,
    settings: SettingsStore,
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(db: Database, settings: SettingsStore, client: reqwest::Client) -> Self {
        Self {
            db,
            settings,
            client,
        }
    }

    /// Sync is active only when an endpoint is configured.
    pub async fn is_configured(&self) -> bool {
        self.settings
            .get("upstream.endpoint")
            .await
            .map(|e| !e.is_empty())
            .unwrap_or(false)
    }

    async fn endpoint(&self) -> Result<String> {
        let endpoint = self.settings.get("upstream.endpoint").await?;
        if endpoint.is_empty() {
            anyhow::bail!("Upstream sync is not configured");
        }
        Ok(endpoint.trim_end_matches('/').to_string())
    }

    /// Session token, logging in if none is cached. The token persists as
    /// an encrypted setting so restarts resume the session.
    async fn token(&self) -> Result<String> {
        let cached = self.settings.get("upstream.session_token").await?;
        if !cached.is_empty() {
            return Ok(cached);
        }
        self.login().await
    }

    async fn login(&self) -> Result<String> {
        let endpoint = self.endpoint().await?;
        let username = self.settings.get("upstream.username").await?;
        let password = self.settings.get("upstream.password").await?;

        let response = self
            .client
            .post(format!("{}/api/login", endpoint))
            .json(&LoginRequest {
                username: &username,
                password: &password,
            })
            .send()
            .await
            .context("Upstream login request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Upstream login rejected: status {}", response.status());
        }

        let body: LoginResponse = response
            .json()
            .await
            .context("Upstream login response malformed")?;

        self.settings
            .set("upstream.session_token", &body.token)
            .await?;
        tracing::info!("Upstream session established");
        Ok(body.token)
    }

    /// Send an authenticated GET, re-logging-in once on 401 (expired
    /// session tokens are routine, not errors).
    async fn get_authed(&self, url: &str) -> Result<reqwest::Response> {
        let token = self.token().await?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .context("Upstream request failed")?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.settings.set("upstream.session_token", "").await?;
            let token = self.login().await?;
            let retried = self
                .client
                .get(url)
                .bearer_auth(&token)
                .send()
                .await
                .context("Upstream request failed after re-login")?;
            return Ok(retried);
        }
        Ok(response)
    }

    // ========================================================================
    // Pull + Push
    // ========================================================================

    /// One full reconciliation cycle. Cursors move only when both halves
    /// complete.
    pub async fn sync_cycle(&self) -> Result<SyncStats> {
        let pull_cursor = self.settings.get_i64("upstream.pull_cursor").await?;
        let push_cursor = self.settings.get_i64("upstream.push_cursor").await?;

        // Pull remote flag changes and apply them under last-writer-wins.
        let endpoint = self.endpoint().await?;
        let response = self
            .get_authed(&format!(
                "{}/api/changes?since={}",
                endpoint, pull_cursor
            ))
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("Upstream pull failed: status {}", response.status());
        }
        let remote: ChangesResponse = response
            .json()
            .await
            .context("Upstream changes response malformed")?;

        let mut pulled = 0;
        for change in &remote.changes {
            if self
                .db
                .apply_remote_flags(
                    &change.item_id,
                    change.is_read,
                    change.is_favorite,
                    change.updated_at,
                )
                .await?
            {
                pulled += 1;
            }
        }

        // Push local flag changes made since the last successful push.
        let local = self.db.local_flag_changes_since(push_cursor).await?;
        let next_push_cursor = local
            .iter()
            .map(|c| c.flags_updated_at)
            .max()
            .unwrap_or(push_cursor);
        let pushed = local.len();

        if !local.is_empty() {
            let payload = PushRequest {
                changes: local
                    .into_iter()
                    .map(|c| RemoteFlagChange {
                        item_id: c.upstream_id,
                        is_read: c.is_read,
                        is_favorite: c.is_favorite,
                        updated_at: c.flags_updated_at,
                    })
                    .collect(),
            };

            let token = self.token().await?;
            let response = self
                .client
                .post(format!("{}/api/flags", endpoint))
                .bearer_auth(&token)
                .json(&payload)
                .send()
                .await
                .context("Upstream push failed")?;
            if !response.status().is_success() {
                anyhow::bail!("Upstream push rejected: status {}", response.status());
            }
        }

        // Both halves succeeded: advance the cursors.
        self.settings
            .set("upstream.pull_cursor", &remote.server_time.to_string())
            .await?;
        self.settings
            .set("upstream.push_cursor", &next_push_cursor.to_string())
            .await?;

        tracing::debug!(pulled = pulled, pushed = pushed, "Upstream sync cycle complete");
        Ok(SyncStats { pulled, pushed })
    }

    /// Fetch the current items of one upstream feed (the "parser" for
    /// upstream-kind feeds).
    pub async fn pull_feed_items(&self, upstream_feed_id: &str) -> Result<Vec<UpstreamItem>> {
        let endpoint = self.endpoint().await?;
        let response = self
            .get_authed(&format!(
                "{}/api/items?feed_id={}",
                endpoint, upstream_feed_id
            ))
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("Upstream items fetch failed: status {}", response.status());
        }

        let body: ItemsResponse = response
            .json()
            .await
            .context("Upstream items response malformed")?;

        Ok(body
            .items
            .into_iter()
            .map(|remote| UpstreamItem {
                item: CanonicalItem {
                    source_id: remote.id.clone(),
                    canonical_url: remote.url,
                    title: remote.title,
                    content_html: remote.content,
                    published_at: remote.published_at,
                    author: remote.author,
                    thumbnail_url: None,
                    audio_url: None,
                    video_url: None,
                    categories: Vec::new(),
                },
                upstream_id: remote.id,
                is_read: remote.is_read,
                is_favorite: remote.is_favorite,
            })
            .collect())
    }

    /// Periodic sync loop; failures are transient and logged, the next
    /// cycle replays from the unadvanced cursors.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let interval_secs = self
                .settings
                .get_i64("upstream.sync_interval_secs")
                .await
                .unwrap_or(900)
                .max(60);

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval_secs as u64)) => {}
                _ = shutdown.cancelled() => break,
            }

            if !self.is_configured().await {
                continue;
            }
            match self.sync_cycle().await {
                Ok(stats) => {
                    if stats.pulled > 0 || stats.pushed > 0 {
                        tracing::info!(
                            pulled = stats.pulled,
                            pushed = stats.pushed,
                            "Upstream sync applied changes"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Upstream sync cycle failed; will retry");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FeedKind, NewArticle};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (Database, UpstreamClient) {
        let db = Database::open(":memory:").await.unwrap();
        let settings = SettingsStore::new(db.clone());
        settings.set("upstream.endpoint", &server.uri()).await.unwrap();
        settings.set("upstream.username", "reader").await.unwrap();
        settings.set("upstream.password", "pw").await.unwrap();
        let client = UpstreamClient::new(db.clone(), settings, reqwest::Client::new());
        (db, client)
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-1"})))
            .mount(server)
            .await;
    }

    async fn seed_upstream_article(db: &Database, upstream_id: &str) -> i64 {
        let feed_id = db
            .insert_feed("gleaner-upstream:1", "Up", FeedKind::Upstream, None, "")
            .await
            .unwrap();
        db.insert_article(
            feed_id,
            &NewArticle {
                fingerprint: upstream_id.to_string(),
                title: "Synced".into(),
                upstream_id: Some(upstream_id.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap()
    }

    #[tokio::test]
    async fn test_pull_applies_remote_flags() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        let (db, client) = setup(&server).await;
        let article_id = seed_upstream_article(&db, "up-1").await;

        let future_ts = chrono::Utc::now().timestamp() + 60;
        Mock::given(method("GET"))
            .and(path("/api/changes"))
            .and(query_param("since", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "changes": [
                    {"item_id": "up-1", "is_read": true, "is_favorite": true, "updated_at": future_ts}
                ],
                "server_time": future_ts
            })))
            .mount(&server)
            .await;

        let stats = client.sync_cycle().await.unwrap();
        assert_eq!(stats.pulled, 1);

        let article = db.get_article_by_id(article_id).await.unwrap().unwrap();
        assert!(article.is_read);
        assert!(article.is_favorite);

        // The cursor advanced to the server clock.
        assert_eq!(
            client.settings.get_i64("upstream.pull_cursor").await.unwrap(),
            future_ts
        );
    }

    #[tokio::test]
    async fn test_push_sends_local_changes() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        let (db, client) = setup(&server).await;
        let article_id = seed_upstream_article(&db, "up-2").await;
        db.set_article_read(article_id, true).await.unwrap();

        Mock::given(method("GET"))
            .and(path("/api/changes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "changes": [], "server_time": 100
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/flags"))
            .and(body_partial_json(json!({
                "changes": [{"item_id": "up-2", "is_read": true}]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let stats = client.sync_cycle().await.unwrap();
        assert_eq!(stats.pushed, 1);

        // A second cycle pushes nothing: the cursor moved past the change.
        let stats = client.sync_cycle().await.unwrap();
        assert_eq!(stats.pushed, 0);
    }

    #[tokio::test]
    async fn test_cursor_frozen_on_push_failure() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        let (db, client) = setup(&server).await;
        let article_id = seed_upstream_article(&db, "up-3").await;
        db.set_article_read(article_id, true).await.unwrap();

        Mock::given(method("GET"))
            .and(path("/api/changes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "changes": [], "server_time": 555
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/flags"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(client.sync_cycle().await.is_err());

        // Neither cursor moved: the cycle replays next time.
        assert_eq!(client.settings.get_i64("upstream.pull_cursor").await.unwrap(), 0);
        assert_eq!(client.settings.get_i64("upstream.push_cursor").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_triggers_relogin() {
        let server = MockServer::start().await;
        let (db, client) = setup(&server).await;
        let _ = db;

        // Pre-cache a stale token so the first request 401s.
        client
            .settings
            .set("upstream.session_token", "stale")
            .await
            .unwrap();

        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/changes"))
            .and(wiremock::matchers::header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/changes"))
            .and(wiremock::matchers::header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "changes": [], "server_time": 42
            })))
            .mount(&server)
            .await;

        let stats = client.sync_cycle().await.unwrap();
        assert_eq!(stats, SyncStats::default());
    }

    #[tokio::test]
    async fn test_pull_feed_items_tags_upstream_id() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        let (_db, client) = setup(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/items"))
            .and(query_param("feed_id", "feed-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"id": "it-1", "title": "Remote One", "url": "https://example.com/1",
                     "content": "<p>hi</p>", "published_at": 1700000000,
                     "is_read": true, "is_favorite": false}
                ]
            })))
            .mount(&server)
            .await;

        let items = client.pull_feed_items("feed-9").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].upstream_id, "it-1");
        assert_eq!(items[0].item.fingerprint(), "it-1");
        assert!(items[0].is_read);
    }

    #[tokio::test]
    async fn test_unconfigured_endpoint_refuses() {
        let db = Database::open(":memory:").await.unwrap();
        let settings = SettingsStore::new(db.clone());
        let client = UpstreamClient::new(db, settings, reqwest::Client::new());
        assert!(!client.is_configured().await);
        assert!(client.sync_cycle().await.is_err());
    }
}
