//! The adaptive scheduler.
//!
//! Owns per-feed cadence state (interval estimate, next-due time, failure
//! counter) under one lock, emits refresh tasks into the fetch pool on a
//! 1 s tick, and learns from task outcomes delivered through the pool's
//! [`ResultSink`] callback. The lock is held only to copy or update state,
//! never across I/O.
//!
//! Cadence: a smoothed estimate of the time between publications, pulled
//! toward the observed gap when items arrive and stretched by 25% when a
//! fetch comes back empty, bounded to [5 min, 24 h] and jittered ±10% so
//! hundreds of feeds never line up into a thundering herd.

use anyhow::Result;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::fetch::{
    probe, FetchPool, Priority, RefreshReason, RefreshTask, ResultSink, SubmitError, TaskOutcome,
};
use crate::settings::SettingsStore;
use crate::storage::{Database, Feed};

/// Cadence bounds.
const MIN_INTERVAL_SECS: i64 = 5 * 60;
const MAX_INTERVAL_SECS: i64 = 24 * 3600;
const DEFAULT_INTERVAL_SECS: i64 = 3600;

/// Smoothing weights for the interval estimate.
const EST_KEEP: f64 = 0.7;
const EST_OBSERVED: f64 = 0.3;
/// Stretch factor applied after an empty fetch.
const EST_STRETCH: f64 = 1.25;

/// Failure backoff: base unit doubled per consecutive failure, capped.
const BACKOFF_BASE_SECS: i64 = 60;
const BACKOFF_CAP_SECS: i64 = 2 * 3600;

/// Consecutive failures before a feed is excluded from automatic
/// scheduling until a manual refresh.
const SUSPEND_AFTER_FAILURES: u32 = 10;

/// Jitter applied to every computed due time.
const JITTER_FRACTION: f64 = 0.10;

/// The scheduler tick cadence, exposed for the run loop.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Per-Feed State
// ============================================================================

struct FeedSched {
    title: Arc<str>,
    enabled: bool,
    /// Smoothed publication-gap estimate, seconds
    interval_est: i64,
    next_due_at: i64,
    failures: u32,
    suspended: bool,
    /// Per-feed fixed interval; `None` inherits the global cadence
    fixed_interval: Option<i64>,
    /// Newest publication timestamp seen across all fetches
    last_publish_seen: Option<i64>,
    /// First emission after startup carries `PostStartup` instead of `Due`
    startup_pending: bool,
}

/// Read-only cadence snapshot for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedInfo {
    pub interval_est_secs: i64,
    pub next_due_at: i64,
    pub failures: u32,
    pub suspended: bool,
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct Scheduler {
    db: Database,
    settings: SettingsStore,
    state: Mutex<HashMap<i64, FeedSched>>,
    pool: OnceLock<FetchPool>,
}

impl Scheduler {
    pub fn new(db: Database, settings: SettingsStore) -> Arc<Self> {
        Arc::new(Self {
            db,
            settings,
            state: Mutex::new(HashMap::new()),
            pool: OnceLock::new(),
        })
    }

    /// Wire up the fetch pool after construction (the pool needs the
    /// scheduler as its result sink, so the two cannot be built in one
    /// expression).
    pub fn attach_pool(&self, pool: FetchPool) {
        if self.pool.set(pool).is_err() {
            tracing::warn!("Fetch pool attached twice; keeping the first");
        }
    }

    fn pool(&self) -> Option<&FetchPool> {
        self.pool.get()
    }

    // ========================================================================
    // Feed Tracking
    // ========================================================================

    /// (Re)load cadence state for all feeds from the store. Newly seen
    /// feeds are due immediately with `PostStartup`; known feeds keep
    /// their in-memory state.
    pub async fn load_feeds(&self) -> Result<()> {
        let feeds = self.db.get_feeds_with_unread_counts().await?;
        let now = chrono::Utc::now().timestamp();

        let mut state = self.state.lock().expect("scheduler state poisoned");
        for feed in &feeds {
            state
                .entry(feed.id)
                .and_modify(|s| {
                    s.title = feed.title.clone();
                    s.enabled = !feed.disabled;
                    s.fixed_interval = feed.refresh_interval_secs;
                })
                .or_insert_with(|| FeedSched {
                    title: feed.title.clone(),
                    enabled: !feed.disabled,
                    interval_est: feed
                        .update_interval_est_secs
                        .unwrap_or(DEFAULT_INTERVAL_SECS)
                        .clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS),
                    next_due_at: now,
                    failures: feed.consecutive_failures.max(0) as u32,
                    suspended: feed.consecutive_failures as u32 >= SUSPEND_AFTER_FAILURES,
                    fixed_interval: feed.refresh_interval_secs,
                    last_publish_seen: None,
                    startup_pending: true,
                });
        }

        // Drop state for feeds deleted out from under us.
        let live: std::collections::HashSet<i64> = feeds.iter().map(|f| f.id).collect();
        state.retain(|feed_id, _| live.contains(feed_id));

        Ok(())
    }

    /// Track one feed (called right after `add_feed`).
    pub fn track_feed(&self, feed: &Feed) {
        let now = chrono::Utc::now().timestamp();
        let mut state = self.state.lock().expect("scheduler state poisoned");
        state.entry(feed.id).or_insert_with(|| FeedSched {
            title: feed.title.clone(),
            enabled: !feed.disabled,
            interval_est: DEFAULT_INTERVAL_SECS,
            next_due_at: now,
            failures: 0,
            suspended: false,
            fixed_interval: feed.refresh_interval_secs,
            last_publish_seen: None,
            startup_pending: false,
        });
    }

    /// Stop tracking a deleted feed and cancel any queued task for it.
    pub fn forget_feed(&self, feed_id: i64) {
        {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            state.remove(&feed_id);
        }
        if let Some(pool) = self.pool() {
            pool.cancel(feed_id);
        }
    }

    /// Resume automatic scheduling for a feed.
    pub fn enable(&self, feed_id: i64) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        if let Some(s) = state.get_mut(&feed_id) {
            s.enabled = true;
            s.next_due_at = chrono::Utc::now().timestamp();
        }
    }

    /// Remove a feed from scheduling; a queued (not yet running) task is
    /// cancelled.
    pub fn disable(&self, feed_id: i64) {
        {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            if let Some(s) = state.get_mut(&feed_id) {
                s.enabled = false;
            }
        }
        if let Some(pool) = self.pool() {
            pool.cancel(feed_id);
        }
    }

    // ========================================================================
    // Task Emission
    // ========================================================================

    /// Bypass the interval check and enqueue a refresh right now. Clears
    /// the failure counter, which also lifts error-suspension — manual
    /// refresh is the documented way out of it.
    pub async fn request_now(&self, feed_id: i64, priority: Priority) -> Result<()> {
        let title = {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            let Some(s) = state.get_mut(&feed_id) else {
                anyhow::bail!("Unknown feed: {}", feed_id);
            };
            s.failures = 0;
            s.suspended = false;
            s.title.clone()
        };

        self.db.reset_feed_failures(feed_id).await?;

        let Some(pool) = self.pool() else {
            anyhow::bail!("Fetch pool not attached");
        };
        match pool.submit(RefreshTask {
            feed_id,
            title,
            priority,
            reason: RefreshReason::UserRequested,
        }) {
            Ok(()) | Err(SubmitError::Duplicate(_)) => Ok(()),
            Err(e @ SubmitError::ShuttingDown) => Err(e.into()),
        }
    }

    /// Enqueue every enabled feed at normal priority (the "refresh all"
    /// surface).
    pub async fn request_all(&self) -> Result<usize> {
        let feed_ids: Vec<i64> = {
            let state = self.state.lock().expect("scheduler state poisoned");
            state
                .iter()
                .filter(|(_, s)| s.enabled)
                .map(|(feed_id, _)| *feed_id)
                .collect()
        };

        let mut submitted = 0;
        for feed_id in feed_ids {
            if self.request_now(feed_id, Priority::Normal).await.is_ok() {
                submitted += 1;
            }
        }
        Ok(submitted)
    }

    /// One scheduler tick: emit every feed whose due time has passed and
    /// that has no task in flight. State is copied under the lock and
    /// submission happens after release.
    pub async fn tick(&self) -> Result<()> {
        let Some(pool) = self.pool() else {
            return Ok(());
        };
        let now = chrono::Utc::now().timestamp();

        let global_interval = self.settings.get_i64("refresh.global_interval_secs").await?;

        let due: Vec<(i64, Arc<str>, RefreshReason)> = {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            state
                .iter_mut()
                .filter(|(_, s)| s.enabled && !s.suspended && s.next_due_at <= now)
                .map(|(feed_id, s)| {
                    let reason = if s.startup_pending {
                        RefreshReason::PostStartup
                    } else {
                        RefreshReason::Due
                    };
                    s.startup_pending = false;
                    (*feed_id, s.title.clone(), reason)
                })
                .collect()
        };

        for (feed_id, title, reason) in due {
            if pool.has_task(feed_id) {
                continue;
            }
            match pool.submit(RefreshTask {
                feed_id,
                title,
                priority: Priority::Normal,
                reason,
            }) {
                Ok(()) => {
                    // Hold the feed out of the due set until its outcome
                    // lands; note_result computes the real next slot.
                    let mut state = self.state.lock().expect("scheduler state poisoned");
                    if let Some(s) = state.get_mut(&feed_id) {
                        s.next_due_at = now + self.effective_interval(s, global_interval);
                    }
                }
                Err(SubmitError::Duplicate(_)) => {}
                Err(SubmitError::ShuttingDown) => break,
            }
        }

        Ok(())
    }

    /// Run the tick loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    // ========================================================================
    // Cadence
    // ========================================================================

    /// Effective interval for a feed: per-feed fixed, else global fixed,
    /// else the adaptive estimate.
    fn effective_interval(&self, s: &FeedSched, global_interval: i64) -> i64 {
        if let Some(fixed) = s.fixed_interval {
            return fixed.max(MIN_INTERVAL_SECS);
        }
        if global_interval > 0 {
            return global_interval.max(MIN_INTERVAL_SECS);
        }
        s.interval_est
    }

    fn jitter(&self, interval: i64) -> i64 {
        let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        (interval as f64 * factor) as i64
    }

    /// Cadence snapshot for a feed.
    pub fn sched_info(&self, feed_id: i64) -> Option<SchedInfo> {
        let state = self.state.lock().expect("scheduler state poisoned");
        state.get(&feed_id).map(|s| SchedInfo {
            interval_est_secs: s.interval_est,
            next_due_at: s.next_due_at,
            failures: s.failures,
            suspended: s.suspended,
        })
    }

    /// Force a feed due (tests and the "sync now" diagnostics path).
    pub fn make_due(&self, feed_id: i64) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        if let Some(s) = state.get_mut(&feed_id) {
            s.next_due_at = chrono::Utc::now().timestamp();
        }
    }

    /// Probe network capacity and resize the fetch pool. An explicit
    /// `network.concurrency_override` setting wins over the probe.
    pub async fn refresh_concurrency(&self, client: &reqwest::Client) -> Result<usize> {
        let Some(pool) = self.pool() else {
            anyhow::bail!("Fetch pool not attached");
        };

        let override_n = self.settings.get_i64("network.concurrency_override").await?;
        let concurrency = if override_n > 0 {
            override_n as usize
        } else {
            probe::measure(client).await.concurrency()
        };

        pool.set_concurrency(concurrency);
        tracing::info!(concurrency = concurrency, "Fetch pool resized");
        Ok(concurrency)
    }
}

// ============================================================================
// Outcome Handling
// ============================================================================

#[async_trait::async_trait]
impl ResultSink for Scheduler {
    async fn note_result(&self, outcome: TaskOutcome) {
        let now = chrono::Utc::now().timestamp();
        let global_interval = self
            .settings
            .get_i64("refresh.global_interval_secs")
            .await
            .unwrap_or(0);

        // Compute the new cadence under the lock; persist after release.
        let persist_est = {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            let Some(s) = state.get_mut(&outcome.feed_id) else {
                return; // feed deleted while its task ran
            };

            match &outcome.result {
                Ok(stats) => {
                    s.failures = 0;
                    s.suspended = false;

                    if stats.new_items > 0 {
                        // Pull the estimate toward the observed gap since
                        // the previous newest publication.
                        let observed_gap = s
                            .last_publish_seen
                            .map(|seen| (now - seen).max(0))
                            .unwrap_or(s.interval_est);
                        s.interval_est = ((EST_KEEP * s.interval_est as f64
                            + EST_OBSERVED * observed_gap as f64)
                            as i64)
                            .clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);

                        if let Some(newest) = stats.newest_published_at {
                            s.last_publish_seen =
                                Some(s.last_publish_seen.unwrap_or(0).max(newest));
                        } else {
                            s.last_publish_seen = Some(now);
                        }
                    } else {
                        s.interval_est = ((s.interval_est as f64 * EST_STRETCH) as i64)
                            .clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
                    }

                    let interval = self.effective_interval(s, global_interval);
                    s.next_due_at = now + self.jitter(interval);
                    Some(s.interval_est)
                }
                Err(crate::fetch::FetchError::Cancelled) => {
                    // Neither success nor failure: try again one interval out.
                    let interval = self.effective_interval(s, global_interval);
                    s.next_due_at = now + self.jitter(interval);
                    None
                }
                Err(e) => {
                    s.failures += 1;
                    if s.failures >= SUSPEND_AFTER_FAILURES {
                        if !s.suspended {
                            tracing::warn!(
                                feed_id = outcome.feed_id,
                                failures = s.failures,
                                error = %e,
                                "Feed error-suspended until manual refresh"
                            );
                        }
                        s.suspended = true;
                    }

                    // Exponential backoff on top of the cadence; the
                    // estimate itself is not polluted by failures.
                    let exponent = s.failures.saturating_sub(1).min(16);
                    let backoff =
                        (BACKOFF_BASE_SECS << exponent).min(BACKOFF_CAP_SECS);
                    let interval = self.effective_interval(s, global_interval);
                    s.next_due_at = now + self.jitter(interval) + backoff;
                    None
                }
            }
        };

        if let Some(est) = persist_est {
            if let Err(e) = self.db.set_feed_interval_est(outcome.feed_id, est).await {
                tracing::warn!(feed_id = outcome.feed_id, error = %e, "Failed to persist interval estimate");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchError, FetchStats};
    use crate::storage::FeedKind;

    async fn setup() -> (Database, Arc<Scheduler>, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let settings = SettingsStore::new(db.clone());
        let scheduler = Scheduler::new(db.clone(), settings);
        let feed_id = db
            .insert_feed("https://example.com/f.xml", "F", FeedKind::Standard, None, "")
            .await
            .unwrap();
        scheduler.load_feeds().await.unwrap();
        (db, scheduler, feed_id)
    }

    fn ok_outcome(feed_id: i64, new_items: usize, newest: Option<i64>) -> TaskOutcome {
        TaskOutcome {
            feed_id,
            result: Ok(FetchStats {
                new_items,
                newest_published_at: newest,
            }),
        }
    }

    fn err_outcome(feed_id: i64) -> TaskOutcome {
        TaskOutcome {
            feed_id,
            result: Err(FetchError::Timeout),
        }
    }

    #[tokio::test]
    async fn test_empty_fetches_stretch_estimate_monotonically() {
        let (_db, scheduler, feed_id) = setup().await;

        let mut previous = scheduler.sched_info(feed_id).unwrap().interval_est_secs;
        for _ in 0..10 {
            scheduler.note_result(ok_outcome(feed_id, 0, None)).await;
            let est = scheduler.sched_info(feed_id).unwrap().interval_est_secs;
            assert!(est >= previous, "estimate must not shrink on empty fetches");
            previous = est;
        }
        assert!(previous <= MAX_INTERVAL_SECS);
    }

    #[tokio::test]
    async fn test_estimate_capped_at_max() {
        let (_db, scheduler, feed_id) = setup().await;

        for _ in 0..40 {
            scheduler.note_result(ok_outcome(feed_id, 0, None)).await;
        }
        assert_eq!(
            scheduler.sched_info(feed_id).unwrap().interval_est_secs,
            MAX_INTERVAL_SECS
        );
    }

    #[tokio::test]
    async fn test_active_feed_pulls_estimate_down_to_floor() {
        let (_db, scheduler, feed_id) = setup().await;

        // A feed that publishes every minute: the observed gap is tiny, so
        // the estimate decays toward the 5 min floor and never below it.
        let now = chrono::Utc::now().timestamp();
        let start = scheduler.sched_info(feed_id).unwrap().interval_est_secs;
        for cycle in 0..10 {
            scheduler
                .note_result(ok_outcome(feed_id, 1, Some(now - 600 + cycle * 60)))
                .await;
        }

        let est = scheduler.sched_info(feed_id).unwrap().interval_est_secs;
        assert!(est < start / 4, "estimate should have decayed, got {}", est);
        assert!(est >= MIN_INTERVAL_SECS);

        // Many more active cycles pin it to the floor.
        for _ in 0..30 {
            scheduler.note_result(ok_outcome(feed_id, 1, Some(now))).await;
        }
        assert_eq!(
            scheduler.sched_info(feed_id).unwrap().interval_est_secs,
            MIN_INTERVAL_SECS
        );
    }

    #[tokio::test]
    async fn test_failures_backoff_without_touching_estimate() {
        let (_db, scheduler, feed_id) = setup().await;
        let est_before = scheduler.sched_info(feed_id).unwrap().interval_est_secs;

        scheduler.note_result(err_outcome(feed_id)).await;
        scheduler.note_result(err_outcome(feed_id)).await;

        let info = scheduler.sched_info(feed_id).unwrap();
        assert_eq!(info.interval_est_secs, est_before);
        assert_eq!(info.failures, 2);
        assert!(!info.suspended);

        // Backoff pushes the due time past the plain interval.
        let now = chrono::Utc::now().timestamp();
        assert!(info.next_due_at > now + est_before / 2);
    }

    #[tokio::test]
    async fn test_ten_failures_suspend_feed() {
        let (_db, scheduler, feed_id) = setup().await;

        for _ in 0..10 {
            scheduler.note_result(err_outcome(feed_id)).await;
        }
        let info = scheduler.sched_info(feed_id).unwrap();
        assert!(info.suspended);
        assert_eq!(info.failures, 10);
    }

    #[tokio::test]
    async fn test_success_clears_failures() {
        let (_db, scheduler, feed_id) = setup().await;

        for _ in 0..3 {
            scheduler.note_result(err_outcome(feed_id)).await;
        }
        scheduler.note_result(ok_outcome(feed_id, 1, None)).await;

        let info = scheduler.sched_info(feed_id).unwrap();
        assert_eq!(info.failures, 0);
        assert!(!info.suspended);
    }

    #[tokio::test]
    async fn test_estimate_persisted_across_reload() {
        let (db, scheduler, feed_id) = setup().await;

        for _ in 0..5 {
            scheduler.note_result(ok_outcome(feed_id, 0, None)).await;
        }
        let est = scheduler.sched_info(feed_id).unwrap().interval_est_secs;

        let feed = db.get_feed(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.update_interval_est_secs, Some(est));

        // A fresh scheduler picks the persisted estimate back up.
        let settings = SettingsStore::new(db.clone());
        let fresh = Scheduler::new(db.clone(), settings);
        fresh.load_feeds().await.unwrap();
        assert_eq!(fresh.sched_info(feed_id).unwrap().interval_est_secs, est);
    }

    #[tokio::test]
    async fn test_global_fixed_interval_overrides_adaptive() {
        let (db, scheduler, feed_id) = setup().await;
        let settings = SettingsStore::new(db.clone());
        settings
            .set("refresh.global_interval_secs", "1800")
            .await
            .unwrap();

        scheduler.note_result(ok_outcome(feed_id, 1, None)).await;

        let info = scheduler.sched_info(feed_id).unwrap();
        let now = chrono::Utc::now().timestamp();
        let delta = info.next_due_at - now;
        // 1800 s ± 10% jitter.
        assert!((1500..=2100).contains(&delta), "delta was {}", delta);
    }
}
