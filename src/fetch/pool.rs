//! Bounded-concurrency fetch pool.
//!
//! Two FIFO queues (high/normal) feed an admission gate sized by the
//! bandwidth probe. Admission favors high priority 3:1, with a freshness
//! rule that promotes any normal task older than 60 s so it cannot starve.
//! The pool defends the at-most-one-task-per-feed invariant even against a
//! buggy submitter, and resizing only moves the admission gate — running
//! tasks are never cancelled by a resize.
//!
//! Transition contract: the bus sees `running` before fetch I/O begins,
//! and a task leaves the pool only after the scheduler's `note_result` has
//! completed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{FetchError, FetchStats, Priority, RefreshTask, TaskOutcome};
use crate::progress::{ProgressBus, TaskInfo};

/// Consecutive high-priority admissions before a normal task gets a turn.
const HIGH_BURST: u32 = 3;

/// A normal task older than this is promoted ahead of high-priority work.
const STARVATION_AGE: Duration = Duration::from_secs(60);

/// Executes one refresh task end to end (fetch, parse, ingest, feed
/// bookkeeping). Implemented by the ingest pipeline.
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(
        &self,
        task: &RefreshTask,
        cancel: &CancellationToken,
    ) -> Result<FetchStats, FetchError>;
}

/// Receives every task outcome exactly once, after the task's side effects
/// are committed. Implemented by the scheduler.
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync + 'static {
    async fn note_result(&self, outcome: TaskOutcome);
}

/// Why a submit was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// A task for this feed is already queued or running
    #[error("A task for feed {0} is already queued or running")]
    Duplicate(i64),
    /// The pool is draining for shutdown
    #[error("The fetch pool is shutting down")]
    ShuttingDown,
}

struct QueuedEntry {
    task: RefreshTask,
    enqueued: Instant,
    enqueued_at: i64,
}

struct RunningEntry {
    title: Arc<str>,
    started_at: i64,
    cancel: CancellationToken,
}

struct PoolState {
    high: VecDeque<QueuedEntry>,
    normal: VecDeque<QueuedEntry>,
    queued_ids: HashSet<i64>,
    running: HashMap<i64, RunningEntry>,
    concurrency: usize,
    high_run: u32,
}

impl PoolState {
    /// Admission policy: starving normal work first, then the 3:1
    /// high/normal alternation, FIFO within each queue.
    fn next_task(&mut self) -> Option<QueuedEntry> {
        let normal_starving = self
            .normal
            .front()
            .is_some_and(|e| e.enqueued.elapsed() >= STARVATION_AGE);

        let pick_high = !self.high.is_empty()
            && !normal_starving
            && (self.high_run < HIGH_BURST || self.normal.is_empty());

        let entry = if pick_high {
            self.high_run += 1;
            self.high.pop_front()
        } else if let Some(entry) = self.normal.pop_front() {
            self.high_run = 0;
            Some(entry)
        } else {
            return None;
        }?;

        self.queued_ids.remove(&entry.task.feed_id);
        Some(entry)
    }

    fn queue_infos(&self) -> Vec<TaskInfo> {
        self.high
            .iter()
            .chain(self.normal.iter())
            .map(|e| TaskInfo {
                feed_id: e.task.feed_id,
                title: e.task.title.to_string(),
                enqueued_at: e.enqueued_at,
                started_at: None,
                attempt: 1,
            })
            .collect()
    }

    fn running_infos(&self) -> Vec<TaskInfo> {
        let mut infos: Vec<TaskInfo> = self
            .running
            .iter()
            .map(|(feed_id, e)| TaskInfo {
                feed_id: *feed_id,
                title: e.title.to_string(),
                enqueued_at: e.started_at,
                started_at: Some(e.started_at),
                attempt: 1,
            })
            .collect();
        infos.sort_by_key(|i| i.feed_id);
        infos
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    notify: Notify,
    runner: Arc<dyn TaskRunner>,
    sink: Arc<dyn ResultSink>,
    bus: Arc<ProgressBus>,
    accepting: AtomicBool,
    shutdown: CancellationToken,
}

impl PoolInner {
    fn publish(&self) {
        let (queued, running) = {
            let state = self.state.lock().expect("pool state poisoned");
            (state.queue_infos(), state.running_infos())
        };
        self.bus.publish(queued, running);
    }
}

/// Handle to the pool; cheap to clone.
#[derive(Clone)]
pub struct FetchPool {
    inner: Arc<PoolInner>,
}

impl FetchPool {
    /// Create the pool and start its dispatcher.
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        sink: Arc<dyn ResultSink>,
        bus: Arc<ProgressBus>,
        concurrency: usize,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                queued_ids: HashSet::new(),
                running: HashMap::new(),
                concurrency: concurrency.max(1),
                high_run: 0,
            }),
            notify: Notify::new(),
            runner,
            sink,
            bus,
            accepting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        });

        let dispatcher = inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatcher.notify.notified() => {}
                    _ = dispatcher.shutdown.cancelled() => break,
                }
                while Self::dispatch_one(&dispatcher) {}
            }
        });

        Self { inner }
    }

    /// Enqueue a task. Rejects duplicates per feed and refuses work during
    /// shutdown.
    pub fn submit(&self, task: RefreshTask) -> Result<(), SubmitError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }

        {
            let mut state = self.inner.state.lock().expect("pool state poisoned");
            let feed_id = task.feed_id;
            if state.queued_ids.contains(&feed_id) || state.running.contains_key(&feed_id) {
                return Err(SubmitError::Duplicate(feed_id));
            }

            let entry = QueuedEntry {
                enqueued: Instant::now(),
                enqueued_at: chrono::Utc::now().timestamp(),
                task,
            };
            state.queued_ids.insert(feed_id);
            match entry.task.priority {
                Priority::High => state.high.push_back(entry),
                Priority::Normal => state.normal.push_back(entry),
            }
        }

        self.inner.publish();
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Best-effort cancellation: a queued task is removed outright; a
    /// running task has its token fired and returns at its next suspension
    /// point. Returns whether there was anything to cancel.
    pub fn cancel(&self, feed_id: i64) -> bool {
        let (found, was_queued) = {
            let mut state = self.inner.state.lock().expect("pool state poisoned");
            if state.queued_ids.remove(&feed_id) {
                state.high.retain(|e| e.task.feed_id != feed_id);
                state.normal.retain(|e| e.task.feed_id != feed_id);
                (true, true)
            } else if let Some(entry) = state.running.get(&feed_id) {
                entry.cancel.cancel();
                (true, false)
            } else {
                (false, false)
            }
        };

        if was_queued {
            self.inner.publish();
        }
        found
    }

    /// Is a task queued or running for this feed?
    pub fn has_task(&self, feed_id: i64) -> bool {
        let state = self.inner.state.lock().expect("pool state poisoned");
        state.queued_ids.contains(&feed_id) || state.running.contains_key(&feed_id)
    }

    /// Current `(queued, running)` task lists for the progress bus and
    /// introspection.
    pub fn snapshot(&self) -> (Vec<TaskInfo>, Vec<TaskInfo>) {
        let state = self.inner.state.lock().expect("pool state poisoned");
        (state.queue_infos(), state.running_infos())
    }

    /// Resize the admission gate. Shrinking never cancels running tasks;
    /// the pool just stops admitting until it drains below the new limit.
    pub fn set_concurrency(&self, concurrency: usize) {
        {
            let mut state = self.inner.state.lock().expect("pool state poisoned");
            state.concurrency = concurrency.max(1);
        }
        self.inner.notify.notify_one();
    }

    pub fn concurrency(&self) -> usize {
        self.inner.state.lock().expect("pool state poisoned").concurrency
    }

    /// Drain for shutdown: stop admissions, drop the queue, give running
    /// tasks a grace period to finish, then cancel the stragglers.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.accepting.store(false, Ordering::SeqCst);

        {
            let mut state = self.inner.state.lock().expect("pool state poisoned");
            state.high.clear();
            state.normal.clear();
            state.queued_ids.clear();
        }
        self.inner.publish();

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && !self.idle() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if !self.idle() {
            let state = self.inner.state.lock().expect("pool state poisoned");
            tracing::warn!(
                remaining = state.running.len(),
                "Cancelling tasks still running after shutdown grace"
            );
            for entry in state.running.values() {
                entry.cancel.cancel();
            }
        }

        // Bounded wait for cancelled tasks to reach a suspension point.
        let drain_deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < drain_deadline && !self.idle() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.inner.shutdown.cancel();
    }

    fn idle(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("pool state poisoned")
            .running
            .is_empty()
    }

    /// Admit one task if there is capacity. Returns whether anything was
    /// admitted, so the dispatcher can keep going until the gate is full.
    fn dispatch_one(inner: &Arc<PoolInner>) -> bool {
        let (task, cancel) = {
            let mut state = inner.state.lock().expect("pool state poisoned");
            if state.running.len() >= state.concurrency {
                return false;
            }
            let Some(entry) = state.next_task() else {
                return false;
            };

            let cancel = CancellationToken::new();
            state.running.insert(
                entry.task.feed_id,
                RunningEntry {
                    title: entry.task.title.clone(),
                    started_at: chrono::Utc::now().timestamp(),
                    cancel: cancel.clone(),
                },
            );
            (entry.task, cancel)
        };

        // `running` is visible on the bus before any fetch I/O starts.
        inner.publish();

        let worker = inner.clone();
        tokio::spawn(async move {
            let feed_id = task.feed_id;

            let result = tokio::select! {
                result = worker.runner.run(&task, &cancel) => result,
                _ = cancel.cancelled() => Err(FetchError::Cancelled),
            };

            // note_result happens-after all of the task's inserts, and the
            // bus reports completion only after note_result returns.
            worker.sink.note_result(TaskOutcome { feed_id, result }).await;

            {
                let mut state = worker.state.lock().expect("pool state poisoned");
                state.running.remove(&feed_id);
            }
            worker.publish();
            worker.notify.notify_one();
        });

        true
    }
}
