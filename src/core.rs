//! The `Core` handle: one explicit struct owning the database, scheduler,
//! fetch pool, progress bus, and sync client. Subsystems receive it by
//! reference; nothing in the crate reaches for ambient globals. The thin
//! HTTP layer drives exactly the operations exposed here.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::DataDirs;
use crate::fetch::{FetchPool, Priority};
use crate::ingest::pipeline::RefreshPipeline;
use crate::progress::{ProgressBus, ProgressSnapshot};
use crate::sched::Scheduler;
use crate::settings::SettingsStore;
use crate::storage::{Article, ArticleQuery, Database, Feed, FeedKind};
use crate::sync::UpstreamClient;
use crate::util::validate_feed_url;

/// Grace period granted to in-flight tasks at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Initial pool size before the bandwidth probe reports in.
const INITIAL_CONCURRENCY: usize = 5;

/// Parameters for adding a feed.
#[derive(Debug, Clone, Default)]
pub struct AddFeedRequest {
    pub url: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub kind: Option<FeedKind>,
    /// Kind-specific parser configuration, JSON-encoded
    pub config_json: Option<String>,
}

pub struct Core {
    pub db: Database,
    pub settings: SettingsStore,
    pub scheduler: Arc<Scheduler>,
    pub pool: FetchPool,
    pub bus: Arc<ProgressBus>,
    pub upstream: Arc<UpstreamClient>,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl Core {
    /// Open the store and bring every subsystem up: scheduler tick loop,
    /// fetch pool, upstream sync loop, and a background bandwidth probe
    /// that sizes the pool.
    pub async fn start(dirs: &DataDirs) -> Result<Self> {
        let db_path = dirs
            .db_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
        let db = Database::open(db_path).await?;

        Self::start_with_db(db, dirs).await
    }

    /// Wiring entry point shared with tests (which pass an in-memory db).
    pub async fn start_with_db(db: Database, dirs: &DataDirs) -> Result<Self> {
        let settings = SettingsStore::new(db.clone());
        let bus = Arc::new(ProgressBus::new());
        let shutdown = CancellationToken::new();

        let client = reqwest::Client::builder()
            .user_agent(concat!("gleaner/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let upstream = Arc::new(UpstreamClient::new(
            db.clone(),
            settings.clone(),
            client.clone(),
        ));

        let scheduler = Scheduler::new(db.clone(), settings.clone());

        let pipeline = Arc::new(RefreshPipeline::new(
            db.clone(),
            settings.clone(),
            client.clone(),
            upstream.clone(),
            dirs.scripts_dir.clone(),
        ));

        let pool = FetchPool::new(
            pipeline,
            scheduler.clone(),
            bus.clone(),
            INITIAL_CONCURRENCY,
        );
        scheduler.attach_pool(pool.clone());
        scheduler.load_feeds().await?;

        tokio::spawn(scheduler.clone().run(shutdown.child_token()));
        tokio::spawn(upstream.clone().run(shutdown.child_token()));

        // Size the pool from measured capacity without delaying startup.
        {
            let scheduler = scheduler.clone();
            let client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.refresh_concurrency(&client).await {
                    tracing::warn!(error = %e, "Bandwidth probe failed; keeping default concurrency");
                }
            });
        }

        Ok(Self {
            db,
            settings,
            scheduler,
            pool,
            bus,
            upstream,
            client,
            shutdown,
        })
    }

    /// Graceful shutdown: stop the loops, drain the pool with a grace
    /// period, then checkpoint the store.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.shutdown(SHUTDOWN_GRACE).await;
        if let Err(e) = self.db.checkpoint().await {
            tracing::warn!(error = %e, "Final checkpoint failed");
        }
        tracing::info!("Core shut down");
    }

    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Ordered feed list with unread counters.
    pub async fn list_feeds(&self) -> Result<Vec<Feed>> {
        self.db.get_feeds_with_unread_counts().await
    }

    /// Add (or rediscover) a feed. HTTP-kind URLs are validated against
    /// the SSRF policy; localhost is allowed only when the corresponding
    /// setting is on. Returns the feed id and enqueues a first fetch at
    /// high priority.
    pub async fn add_feed(&self, request: AddFeedRequest) -> Result<i64> {
        let kind = request.kind.unwrap_or(FeedKind::Standard);

        let url = match kind {
            FeedKind::Standard | FeedKind::XpathHtml | FeedKind::XpathXml => {
                let allow_localhost = self
                    .settings
                    .get_bool("network.allow_localhost_feeds")
                    .await?;
                validate_feed_url(request.url.trim(), allow_localhost)?
                    .to_string()
            }
            // Script paths, IMAP accounts, and upstream ids are opaque
            // identifiers, not fetchable URLs.
            FeedKind::Script | FeedKind::Imap | FeedKind::Upstream => request.url.trim().to_string(),
        };
        if url.is_empty() {
            anyhow::bail!("Feed URL must not be empty");
        }

        let title = request.title.unwrap_or_else(|| url.clone());
        let category = request.category.unwrap_or_default();

        let feed_id = self
            .db
            .insert_feed(&url, &title, kind, request.config_json.as_deref(), &category)
            .await?;

        if let Some(feed) = self.db.get_feed(feed_id).await? {
            self.scheduler.track_feed(&feed);
        }
        // First fetch jumps the queue; failures surface as last_error.
        if let Err(e) = self.scheduler.request_now(feed_id, Priority::High).await {
            tracing::warn!(feed_id = feed_id, error = %e, "Initial fetch enqueue failed");
        }

        Ok(feed_id)
    }

    /// Delete a feed; favorites are preserved under the archive sentinel.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<bool> {
        self.scheduler.forget_feed(feed_id);
        self.db.delete_feed(feed_id).await
    }

    /// Enqueue a high-priority refresh; returns immediately.
    pub async fn refresh_feed(&self, feed_id: i64) -> Result<()> {
        self.scheduler.request_now(feed_id, Priority::High).await
    }

    /// Enqueue every enabled feed at normal priority.
    pub async fn refresh_all(&self) -> Result<usize> {
        self.scheduler.request_all().await
    }

    /// Toggle a feed's participation in scheduling.
    pub async fn set_feed_disabled(&self, feed_id: i64, disabled: bool) -> Result<()> {
        self.db.set_feed_disabled(feed_id, disabled).await?;
        if disabled {
            self.scheduler.disable(feed_id);
        } else {
            self.scheduler.enable(feed_id);
        }
        Ok(())
    }

    // ========================================================================
    // Article Operations
    // ========================================================================

    /// Paginated article listing (`all`, `unread`, `favorites`,
    /// `read_later`, `image_gallery`).
    pub async fn list_articles(&self, query: &ArticleQuery) -> Result<Vec<Article>> {
        self.db.list_articles(query).await
    }

    /// Idempotent read-state update.
    pub async fn set_article_read(&self, article_id: i64, read: bool) -> Result<bool> {
        self.db.set_article_read(article_id, read).await
    }

    /// Toggle favorite; returns the new state.
    pub async fn toggle_article_favorite(&self, article_id: i64) -> Result<bool> {
        self.db.toggle_article_favorite(article_id).await
    }

    /// Toggle read-later.
    pub async fn set_article_read_later(&self, article_id: i64, read_later: bool) -> Result<()> {
        self.db.set_article_read_later(article_id, read_later).await
    }

    /// Mark a whole feed read; returns how many articles changed.
    pub async fn mark_all_read(&self, feed_id: i64) -> Result<u64> {
        self.db.mark_all_read_for_feed(feed_id).await
    }

    /// Count a click-through for the progress counters.
    pub fn note_article_click(&self) -> u64 {
        self.bus.note_article_click()
    }

    /// Run the cleanup pass; returns rows deleted. `max_size_bytes` of 0
    /// means no size budget.
    pub async fn cleanup(&self, max_age_days: i64, max_size_bytes: u64) -> Result<u64> {
        let budget = (max_size_bytes > 0).then_some(max_size_bytes);
        self.db.cleanup(max_age_days, budget).await
    }

    // ========================================================================
    // Progress & Settings
    // ========================================================================

    /// Latest progress snapshot; cheap enough for 500 ms polling.
    pub fn progress(&self) -> ProgressSnapshot {
        self.bus.snapshot()
    }

    /// Settings map for the API; encrypted values stay opaque.
    pub async fn get_settings(&self) -> Result<std::collections::BTreeMap<String, String>> {
        self.settings.all_opaque().await
    }

    /// Write one setting. Scheduling- and network-relevant keys take
    /// effect on the next tick / probe.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.settings.set(key, value).await?;
        if key == "network.concurrency_override" {
            self.scheduler.refresh_concurrency(&self.client).await?;
        }
        Ok(())
    }

    /// Persist a category's expanded/collapsed UI state.
    pub async fn set_category_expanded(&self, path: &str, expanded: bool) -> Result<()> {
        self.db.set_category_expanded(path, expanded).await
    }
}
