//! Task lifecycle and retry policy.
//!
//! ```text
//! pending ──dequeue──▶ running ──ok──▶ succeeded
//!    ▲                    │
//!    └──retry (delayed)───┤
//!                         └──retries exhausted──▶ failed
//! ```
//!
//! The attempt counter travels with the task row, so the decision below is
//! a pure function of that counter and the time the attempt failed.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Retries allowed after the initial attempt.
pub const MAX_RETRIES: u32 = 3;

/// Fixed delay before a failed attempt becomes visible again.
pub const RETRY_BACKOFF_SECS: u64 = 60;

/// Lifecycle state of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting in the queue, possibly not yet visible.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Provisioned. Terminal.
    Succeeded,
    /// Retries exhausted. Terminal.
    Failed,
}

impl TaskState {
    pub const ALL: [Self; 4] = [Self::Pending, Self::Running, Self::Succeeded, Self::Failed];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown task state: {s}"))
    }
}

/// What to do with a task whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the task back as `pending`, invisible until `not_before`.
    Retry { next_attempt: u32, not_before: i64 },
    /// Mark the task `failed`.
    GiveUp,
}

/// Bounded retries with a constant backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff: Duration::from_secs(RETRY_BACKOFF_SECS),
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub const fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Decide the fate of 0-based `attempt` that failed at `failed_at`.
    pub fn decide(&self, attempt: u32, failed_at: i64) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        let backoff = i64::try_from(self.backoff.as_secs()).unwrap_or(i64::MAX);
        RetryDecision::Retry {
            next_attempt: attempt + 1,
            not_before: failed_at.saturating_add(backoff),
        }
    }
}
