//! In-process progress bus.
//!
//! The fetch pool publishes a fresh snapshot on every task transition; the
//! API layer samples the latest state (suitable for 500 ms polling) or
//! subscribes for push-style consumption. The bus keeps no history — only
//! the newest snapshot matters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// One queued or running task as exposed to pollers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskInfo {
    pub feed_id: i64,
    pub title: String,
    /// Unix seconds when the task entered the queue
    pub enqueued_at: i64,
    /// Unix seconds when a worker picked it up; `None` while queued
    pub started_at: Option<i64>,
    pub attempt: u32,
}

/// Live counters sampled by the API layer.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub is_running: bool,
    pub queue_task_count: usize,
    pub pool_task_count: usize,
    pub queue_tasks: Vec<TaskInfo>,
    pub pool_tasks: Vec<TaskInfo>,
    pub article_click_count: u64,
}

/// Publish/subscribe handle; cheap to clone, single latest-value semantics.
pub struct ProgressBus {
    tx: watch::Sender<ProgressSnapshot>,
    clicks: AtomicU64,
}

impl ProgressBus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProgressSnapshot::default());
        Self {
            tx,
            clicks: AtomicU64::new(0),
        }
    }

    /// Publish the pool's current queue/running state.
    pub fn publish(&self, queue_tasks: Vec<TaskInfo>, pool_tasks: Vec<TaskInfo>) {
        let snapshot = ProgressSnapshot {
            is_running: !queue_tasks.is_empty() || !pool_tasks.is_empty(),
            queue_task_count: queue_tasks.len(),
            pool_task_count: pool_tasks.len(),
            queue_tasks,
            pool_tasks,
            article_click_count: self.clicks.load(Ordering::Relaxed),
        };
        // send_replace never fails even with zero subscribers.
        self.tx.send_replace(snapshot);
    }

    /// Latest snapshot, with the click counter re-read at sample time.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let mut snapshot = self.tx.borrow().clone();
        snapshot.article_click_count = self.clicks.load(Ordering::Relaxed);
        snapshot
    }

    /// Subscribe for change notifications (the HTTP layer's long-poll path).
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    /// Count a user click-through on an article; returns the new total.
    pub fn note_article_click(&self) -> u64 {
        self.clicks.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}
