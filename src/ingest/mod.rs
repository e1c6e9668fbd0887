//! The ingest pipeline: the only writer of articles.
//!
//! Parsers hand over canonical items; the ingestor deduplicates them
//! against the store, clamps implausible timestamps, runs the rules engine,
//! and inserts what is genuinely new. Existing articles may get their empty
//! content backfilled but never have read/favorite state flipped.

pub mod lang;
pub mod pipeline;

use anyhow::Result;
use std::sync::Arc;

use crate::parsers::CanonicalItem;
use crate::rules::RulesEngine;
use crate::storage::{Database, Feed, NewArticle};

/// Grace window before a claimed publication time counts as "from the
/// future" and is renormalized to the ingest time.
const FUTURE_GRACE_SECS: i64 = 3600;

/// Summarization capability the ingestor may call when configured. The
/// core never depends on a concrete provider.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, title: &str, content_html: &str) -> Result<String>;
}

/// Translation capability; same contract as [`Summarizer`].
#[async_trait::async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String>;
}

/// Translation configuration snapshot taken from settings per run.
#[derive(Debug, Clone, Default)]
pub struct TranslateOptions {
    pub enabled: bool,
    pub target_lang: String,
}

/// Flag state and identity an upstream-mirrored item arrives with.
#[derive(Debug, Clone)]
pub struct UpstreamMeta {
    pub upstream_id: String,
    pub is_read: bool,
    pub is_favorite: bool,
}

/// Outcome of ingesting one parsed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Articles inserted this run
    pub new_items: usize,
    /// Existing articles whose empty content was backfilled
    pub backfilled: usize,
    /// Of the new articles, how many a rule hid at ingest
    pub hidden: usize,
}

/// Ingest stage; cheap to clone alongside the database handle. Optional
/// capability providers are consulted for new items only — the core knows
/// the interfaces, never the implementations.
#[derive(Clone)]
pub struct Ingestor {
    db: Database,
    summarizer: Option<Arc<dyn Summarizer>>,
    translator: Option<Arc<dyn Translator>>,
}

impl Ingestor {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            summarizer: None,
            translator: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Ingest one parsed batch for a feed.
    ///
    /// Items for a single feed are processed sequentially; the fetch pool
    /// guarantees no two tasks run for the same feed, so per-feed commits
    /// are serialized by construction.
    pub async fn ingest(
        &self,
        feed: &Feed,
        items: Vec<CanonicalItem>,
        rules: &RulesEngine,
        translate: &TranslateOptions,
    ) -> Result<IngestStats> {
        let tagged = items.into_iter().map(|item| (item, None)).collect();
        self.ingest_inner(feed, tagged, rules, translate).await
    }

    /// Ingest items mirrored from the upstream aggregator. The upstream id
    /// and the flag state the item arrived with are applied before rules
    /// run, so later flag changes can be pushed back.
    pub async fn ingest_upstream(
        &self,
        feed: &Feed,
        items: Vec<(CanonicalItem, UpstreamMeta)>,
        rules: &RulesEngine,
        translate: &TranslateOptions,
    ) -> Result<IngestStats> {
        let tagged = items
            .into_iter()
            .map(|(item, meta)| (item, Some(meta)))
            .collect();
        self.ingest_inner(feed, tagged, rules, translate).await
    }

    async fn ingest_inner(
        &self,
        feed: &Feed,
        items: Vec<(CanonicalItem, Option<UpstreamMeta>)>,
        rules: &RulesEngine,
        translate: &TranslateOptions,
    ) -> Result<IngestStats> {
        let now = chrono::Utc::now().timestamp();
        let mut stats = IngestStats::default();

        for (item, meta) in items {
            let fingerprint = item.fingerprint();

            if let Some((article_id, has_content)) = self
                .db
                .find_article_by_fingerprint(feed.id, &fingerprint)
                .await?
            {
                // Known item: optionally backfill content, never touch
                // read/favorite state, never count as new.
                if !has_content {
                    if let Some(content) = item.content_html.as_deref() {
                        if !content.is_empty() {
                            self.db.backfill_article_content(article_id, content).await?;
                            stats.backfilled += 1;
                        }
                    }
                }
                continue;
            }

            let published_at = clamp_published(item.published_at, now);

            let no_translate = translate.enabled
                && lang::no_translate_needed(
                    &item.title,
                    item.content_html.as_deref(),
                    &translate.target_lang,
                );

            let mut article = NewArticle {
                fingerprint,
                url: item.canonical_url,
                title: item.title,
                published_at: Some(published_at),
                content: item.content_html,
                thumbnail_url: item.thumbnail_url,
                audio_url: item.audio_url,
                video_url: item.video_url,
                summary: None,
                upstream_id: None,
                no_translate,
                ..Default::default()
            };
            if let Some(meta) = meta {
                article.upstream_id = Some(meta.upstream_id);
                article.is_read = meta.is_read;
                article.is_favorite = meta.is_favorite;
            }

            rules.apply(&mut article, feed.id, &feed.category_path, now);

            // Capability calls happen only for items that will be stored,
            // and their failures cost nothing but the enrichment.
            if translate.enabled && !article.no_translate {
                if let Some(translator) = &self.translator {
                    match translator
                        .translate(&article.title, &translate.target_lang)
                        .await
                    {
                        Ok(translated) => article.translated_title = Some(translated),
                        Err(e) => {
                            tracing::debug!(feed_id = feed.id, error = %e, "Title translation failed");
                        }
                    }
                }
            }
            if let Some(summarizer) = &self.summarizer {
                if article.summary.is_none() {
                    if let Some(content) = article.content.clone() {
                        match summarizer.summarize(&article.title, &content).await {
                            Ok(summary) => article.summary = Some(summary),
                            Err(e) => {
                                tracing::debug!(feed_id = feed.id, error = %e, "Summarization failed");
                            }
                        }
                    }
                }
            }

            if self.db.insert_article(feed.id, &article).await?.is_some() {
                stats.new_items += 1;
                if article.is_hidden {
                    stats.hidden += 1;
                }
            }
        }

        Ok(stats)
    }
}

/// Clamp a claimed publication time into sanity: absent timestamps become
/// the ingest time, and anything more than an hour in the future is
/// renormalized to the ingest time (logged, since it usually means a feed
/// with a broken clock).
fn clamp_published(published: Option<i64>, now: i64) -> i64 {
    match published {
        Some(ts) if ts > now + FUTURE_GRACE_SECS => {
            tracing::debug!(
                claimed = ts,
                now = now,
                "Future publication time renormalized to ingest time"
            );
            now
        }
        Some(ts) => ts,
        None => now,
    }
}
