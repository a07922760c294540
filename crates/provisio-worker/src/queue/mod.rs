//! Durable provisioning task queue backed by `SQLite`.
//!
//! Producers call [`TaskQueue::enqueue`]; workers claim tasks with
//! [`TaskQueue::dequeue`] and acknowledge them with `complete`, `retry` or
//! `fail`. A claim is a lease: if the worker dies before acknowledging, the
//! lease expires and the next `dequeue` hands the task out again. Delivery is
//! therefore at-least-once and the queue never deduplicates.

mod db;
mod models;
mod queries;

use std::path::Path;
use std::time::Duration;

pub use db::{DatabaseError, QueueDatabase};
pub use models::{StatusCounts, TaskAttempt, TaskHandle, TaskRow};

use crate::retry::TaskState;

/// Default delay before a newly enqueued task becomes visible.
pub const DEFAULT_ENQUEUE_DELAY_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// The claim expired and the task was handed to someone else.
    #[error("lease on task {0} is no longer held")]
    LeaseLost(String),

    #[error("task {task_id} is {state}, expected {expected}")]
    InvalidState {
        task_id: String,
        state: TaskState,
        expected: TaskState,
    },

    #[error("corrupt task record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.into())
    }
}

/// Handle to the shared queue. Cheap to clone; construct once per process
/// and pass to whatever enqueues or consumes tasks.
#[derive(Clone)]
pub struct TaskQueue {
    db: QueueDatabase,
}

impl TaskQueue {
    pub const fn new(db: QueueDatabase) -> Self {
        Self { db }
    }

    /// Open or create the queue database at `path`.
    pub async fn open(path: &Path) -> Result<Self, QueueError> {
        Ok(Self::new(QueueDatabase::open(path).await?))
    }

    /// Open an in-memory queue (for testing).
    pub async fn open_in_memory() -> Result<Self, QueueError> {
        Ok(Self::new(QueueDatabase::open_in_memory().await?))
    }

    pub const fn database(&self) -> &QueueDatabase {
        &self.db
    }
}

/// Whole seconds of `d`, saturating.
pub(crate) fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
