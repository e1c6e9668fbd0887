//! The refresh pipeline: what one fetch-pool task actually does.
//!
//! Selects the parser by feed kind, runs it (with the HTTP fetch for the
//! kinds that need one), hands the items to the ingestor, and records the
//! outcome on the feed row. Cancellation is checked between stages; the
//! stages that block (HTTP, script, IMAP, db writes) observe it at their
//! own suspension points.

use std::path::PathBuf;
use std::sync::Arc;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use super::{Ingestor, TranslateOptions, UpstreamMeta};
use crate::fetch::{http, FetchError, FetchStats, RefreshTask, TaskRunner};
use crate::parsers::{standard, xpath, CanonicalItem};
use crate::rules::RulesEngine;
use crate::settings::SettingsStore;
use crate::storage::{
    Database, Feed, FeedKind, ImapConfig, ScriptConfig, UpstreamFeedConfig, XpathConfig,
};
use crate::sync::UpstreamClient;

pub struct RefreshPipeline {
    db: Database,
    settings: SettingsStore,
    client: reqwest::Client,
    ingestor: Ingestor,
    upstream: Arc<UpstreamClient>,
    scripts_dir: PathBuf,
}

impl RefreshPipeline {
    pub fn new(
        db: Database,
        settings: SettingsStore,
        client: reqwest::Client,
        upstream: Arc<UpstreamClient>,
        scripts_dir: PathBuf,
    ) -> Self {
        Self {
            ingestor: Ingestor::new(db.clone()),
            db,
            settings,
            client,
            upstream,
            scripts_dir,
        }
    }

    async fn translate_options(&self) -> TranslateOptions {
        let enabled = self
            .settings
            .get_bool("translate.enabled")
            .await
            .unwrap_or(false);
        let target_lang = self
            .settings
            .get("translate.target_lang")
            .await
            .unwrap_or_default();
        TranslateOptions {
            enabled,
            target_lang,
        }
    }

    /// Produce the item batch for a feed according to its kind. Parsers
    /// stay store-pure; everything returned here is handed to the
    /// ingestor, the only writer.
    async fn parse_feed(
        &self,
        feed: &Feed,
        cancel: &CancellationToken,
    ) -> Result<Batch, FetchError> {
        match feed.kind {
            FeedKind::Standard => {
                let bytes = http::fetch_bytes(&self.client, &feed.url, cancel).await?;
                Ok(Batch::Plain(standard::parse(&bytes)?))
            }
            FeedKind::XpathHtml => {
                let config: XpathConfig = feed
                    .config()
                    .map_err(|e| FetchError::Config(e.to_string()))?;
                let bytes = http::fetch_bytes(&self.client, &feed.url, cancel).await?;
                let text = String::from_utf8_lossy(&bytes);
                Ok(Batch::Plain(xpath::parse_html(&text, &config)?))
            }
            FeedKind::XpathXml => {
                let config: XpathConfig = feed
                    .config()
                    .map_err(|e| FetchError::Config(e.to_string()))?;
                let bytes = http::fetch_bytes(&self.client, &feed.url, cancel).await?;
                let text = String::from_utf8_lossy(&bytes);
                Ok(Batch::Plain(xpath::parse_xml(&text, &config)?))
            }
            FeedKind::Script => {
                let config: ScriptConfig = feed
                    .config()
                    .map_err(|e| FetchError::Config(e.to_string()))?;
                Ok(Batch::Plain(
                    crate::parsers::script::run(&self.scripts_dir, &config).await?,
                ))
            }
            FeedKind::Imap => {
                let mut config: ImapConfig = feed
                    .config()
                    .map_err(|e| FetchError::Config(e.to_string()))?;
                if config.password_key.is_empty() {
                    return Err(FetchError::Config(
                        "IMAP feed has no password_key configured".to_string(),
                    ));
                }
                let password = self
                    .settings
                    .get(&config.password_key)
                    .await
                    .map_err(|e| FetchError::Config(e.to_string()))?;

                let batch =
                    crate::parsers::imap::fetch(config.clone(), SecretString::from(password))
                        .await?;

                // Persist the UID high-water mark so the next run starts
                // where this one stopped.
                if batch.last_seen_uid != config.last_seen_uid {
                    config.last_seen_uid = batch.last_seen_uid;
                    let json = serde_json::to_string(&config)
                        .map_err(|e| FetchError::Store(e.to_string()))?;
                    self.db
                        .set_feed_config(feed.id, &json)
                        .await
                        .map_err(|e| FetchError::Store(e.to_string()))?;
                }
                Ok(Batch::Plain(batch.items))
            }
            FeedKind::Upstream => {
                let config: UpstreamFeedConfig = feed
                    .config()
                    .map_err(|e| FetchError::Config(e.to_string()))?;
                if config.upstream_feed_id.is_empty() {
                    return Err(FetchError::Config(
                        "Upstream feed has no upstream_feed_id configured".to_string(),
                    ));
                }
                let items = self
                    .upstream
                    .pull_feed_items(&config.upstream_feed_id)
                    .await
                    .map_err(|e| FetchError::Transport(e.to_string()))?;
                Ok(Batch::Upstream(
                    items
                        .into_iter()
                        .map(|u| {
                            (
                                u.item,
                                UpstreamMeta {
                                    upstream_id: u.upstream_id,
                                    is_read: u.is_read,
                                    is_favorite: u.is_favorite,
                                },
                            )
                        })
                        .collect(),
                ))
            }
        }
    }
}

enum Batch {
    Plain(Vec<CanonicalItem>),
    Upstream(Vec<(CanonicalItem, UpstreamMeta)>),
}

impl Batch {
    fn newest_published_at(&self) -> Option<i64> {
        let iter: Box<dyn Iterator<Item = &CanonicalItem>> = match self {
            Batch::Plain(items) => Box::new(items.iter()),
            Batch::Upstream(items) => Box::new(items.iter().map(|(item, _)| item)),
        };
        iter.filter_map(|i| i.published_at).max()
    }
}

#[async_trait::async_trait]
impl TaskRunner for RefreshPipeline {
    async fn run(
        &self,
        task: &RefreshTask,
        cancel: &CancellationToken,
    ) -> Result<FetchStats, FetchError> {
        let feed = self
            .db
            .get_feed(task.feed_id)
            .await
            .map_err(|e| FetchError::Store(e.to_string()))?
            .ok_or_else(|| FetchError::Store(format!("feed {} vanished", task.feed_id)))?;

        // Rules compile once per load, per task run, so mid-run rule edits
        // apply from the next fetch onward.
        let rules = RulesEngine::load(&self.db)
            .await
            .map_err(|e| FetchError::Store(e.to_string()))?;
        let translate = self.translate_options().await;

        let batch = match self.parse_feed(&feed, cancel).await {
            Ok(batch) => batch,
            Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
            Err(e) => {
                // Parser/transport errors become the feed's last_error and
                // count toward suspension; the item count is simply zero.
                if let Err(db_err) = self.db.record_feed_error(feed.id, &e.to_string()).await {
                    tracing::warn!(feed_id = feed.id, error = %db_err, "Failed to record feed error");
                }
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let newest_published_at = batch.newest_published_at();
        let stats = match batch {
            Batch::Plain(items) => {
                self.ingestor
                    .ingest(&feed, items, &rules, &translate)
                    .await
            }
            Batch::Upstream(items) => {
                self.ingestor
                    .ingest_upstream(&feed, items, &rules, &translate)
                    .await
            }
        }
        .map_err(|e| FetchError::Store(e.to_string()))?;

        self.db
            .complete_feed_refresh(feed.id, None)
            .await
            .map_err(|e| FetchError::Store(e.to_string()))?;

        if stats.new_items > 0 {
            tracing::info!(
                feed_id = feed.id,
                title = %feed.title,
                new_items = stats.new_items,
                hidden = stats.hidden,
                "Feed refreshed"
            );
        }

        Ok(FetchStats {
            new_items: stats.new_items,
            newest_published_at,
        })
    }
}
