//! Task queue records.

use std::fmt;

use serde::{Deserialize, Serialize};

use provisio_core::ProvisioningRequest;

use crate::retry::TaskState;

use super::QueueError;

/// Task row from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    pub id: String,
    pub username: String,
    pub user_group: String,
    pub description: String,
    pub public_key: String,
    pub status: String,
    pub attempt: i64,
    pub visible_at: i64,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub deliveries: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
}

impl TaskRow {
    pub fn request(&self) -> ProvisioningRequest {
        ProvisioningRequest::new(
            self.username.clone(),
            self.user_group.clone(),
            self.description.clone(),
            self.public_key.clone(),
        )
    }

    pub fn state(&self) -> Result<TaskState, QueueError> {
        self.status.parse().map_err(QueueError::Corrupt)
    }
}

/// Returned to the producer on enqueue. Carries no provisioning outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    pub id: String,
    /// Earliest time (unix seconds) a worker may pick the task up.
    pub visible_at: i64,
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// One claimed delivery of a task, owned by the worker that dequeued it.
#[derive(Debug, Clone)]
pub struct TaskAttempt {
    pub task_id: String,
    /// 0-based; bounded by the retry policy.
    pub attempt: u32,
    pub request: ProvisioningRequest,
    /// Proves this worker still holds the claim when acknowledging.
    pub lease_token: String,
    pub lease_expires_at: i64,
    /// Total times the task was handed out, including crash redeliveries.
    pub deliveries: u32,
    /// When the task became visible for this attempt.
    pub visible_at: i64,
}

impl TryFrom<TaskRow> for TaskAttempt {
    type Error = QueueError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let request = row.request();
        let lease_token = row
            .lease_token
            .ok_or_else(|| QueueError::Corrupt(format!("claimed task {} has no lease", row.id)))?;
        Ok(Self {
            attempt: u32::try_from(row.attempt)
                .map_err(|_| QueueError::Corrupt(format!("task {} attempt out of range", row.id)))?,
            deliveries: u32::try_from(row.deliveries).unwrap_or(u32::MAX),
            lease_expires_at: row.lease_expires_at.unwrap_or(row.updated_at),
            visible_at: row.visible_at,
            task_id: row.id,
            request,
            lease_token,
        })
    }
}

/// Number of tasks in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}
