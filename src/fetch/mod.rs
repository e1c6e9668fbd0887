//! The fetch side of the pipeline: task types, the deadline'd HTTP client
//! path, the bounded-concurrency pool, and the bandwidth probe that sizes
//! it.

pub mod http;
pub mod pool;
pub mod probe;

pub use pool::{FetchPool, ResultSink, SubmitError, TaskRunner};

use std::sync::Arc;
use thiserror::Error;

use crate::parsers::ParseError;

// ============================================================================
// Tasks
// ============================================================================

/// Why a refresh task exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    Due,
    UserRequested,
    PostStartup,
    PostNetworkChange,
}

/// Admission priority. High jumps ahead of due work but never preempts a
/// running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

/// One refresh task as submitted to the pool.
#[derive(Debug, Clone)]
pub struct RefreshTask {
    pub feed_id: i64,
    pub title: Arc<str>,
    pub priority: Priority,
    pub reason: RefreshReason,
}

/// What a completed fetch reports back to the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchStats {
    pub new_items: usize,
    /// Newest publication timestamp seen in this batch, for the adaptive
    /// interval estimate
    pub newest_published_at: Option<i64>,
}

/// Task outcome delivered to [`ResultSink::note_result`].
#[derive(Debug)]
pub struct TaskOutcome {
    pub feed_id: i64,
    pub result: Result<FetchStats, FetchError>,
}

// ============================================================================
// Error Taxonomy
// ============================================================================

/// Task-level failures, mirroring the core error taxonomy. Everything here
/// is recovered at the task boundary: it becomes the feed's `last_error`
/// and drives scheduler backoff, never a crash.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-layer failure (DNS, connect, TLS); retried once
    #[error("Request failed: {0}")]
    Transport(String),
    /// Deadline exceeded; retried once, then surfaced
    #[error("Request timed out")]
    Timeout,
    /// Non-2xx HTTP response
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Fewer bytes than Content-Length promised; retried once like any
    /// other interrupted transfer
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Parser rejected the payload; not retried
    #[error("Malformed feed: {0}")]
    Malformed(String),
    /// User script failed
    #[error("Script failed ({status}): {stderr_tail}")]
    Script { status: String, stderr_tail: String },
    /// IMAP session failure
    #[error("IMAP error: {0}")]
    Imap(String),
    /// Invalid parser/feed configuration; the feed needs user attention
    #[error("Configuration error: {0}")]
    Config(String),
    /// Database write failed; fatal for this task only
    #[error("Store error: {0}")]
    Store(String),
    /// Task observed cancellation at a suspension point
    #[error("Cancelled")]
    Cancelled,
}

impl From<ParseError> for FetchError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Malformed(msg) => FetchError::Malformed(msg),
            ParseError::Config(msg) => FetchError::Config(msg),
            ParseError::Script {
                status,
                stderr_tail,
            } => FetchError::Script {
                status,
                stderr_tail,
            },
            ParseError::Imap(msg) => FetchError::Imap(msg),
        }
    }
}

impl FetchError {
    /// Transport-level problems — including a transfer that died partway —
    /// get one retry; everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transport(_)
                | FetchError::Timeout
                | FetchError::IncompleteResponse { .. }
        )
    }
}
