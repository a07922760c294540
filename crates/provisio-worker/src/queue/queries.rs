//! Queue operations.

use std::time::Duration;

use provisio_core::ProvisioningRequest;
use provisio_core::db::unix_timestamp;
use tracing::debug;

use crate::retry::TaskState;

use super::models::{StatusCounts, TaskAttempt, TaskHandle, TaskRow};
use super::{DatabaseError, QueueError, TaskQueue, secs};

impl TaskQueue {
    // =========================================================================
    // Producer side
    // =========================================================================

    /// Enqueue a provisioning request, visible to workers after `delay`.
    pub async fn enqueue(
        &self,
        request: &ProvisioningRequest,
        delay: Duration,
    ) -> Result<TaskHandle, QueueError> {
        self.enqueue_at(request, delay, unix_timestamp()).await
    }

    pub async fn enqueue_at(
        &self,
        request: &ProvisioningRequest,
        delay: Duration,
        now: i64,
    ) -> Result<TaskHandle, QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        let visible_at = now.saturating_add(secs(delay));

        sqlx::query(
            r"
            INSERT INTO tasks
                (id, username, user_group, description, public_key,
                 status, attempt, visible_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            ",
        )
        .bind(&id)
        .bind(&request.username)
        .bind(&request.group)
        .bind(&request.description)
        .bind(&request.public_key)
        .bind(visible_at)
        .bind(now)
        .bind(now)
        .execute(self.database().pool())
        .await?;

        debug!(task_id = %id, username = %request.username, visible_at, "Task enqueued");

        Ok(TaskHandle { id, visible_at })
    }

    // =========================================================================
    // Consumer side
    // =========================================================================

    /// Claim the next visible task for `lease`.
    pub async fn dequeue(&self, lease: Duration) -> Result<Option<TaskAttempt>, QueueError> {
        self.dequeue_at(lease, unix_timestamp()).await
    }

    /// Claim the oldest task that is pending and visible, or running with an
    /// expired lease (its worker is presumed dead).
    pub async fn dequeue_at(
        &self,
        lease: Duration,
        now: i64,
    ) -> Result<Option<TaskAttempt>, QueueError> {
        let token = uuid::Uuid::new_v4().to_string();
        let lease_expires_at = now.saturating_add(secs(lease));

        let row = sqlx::query_as::<_, TaskRow>(
            r"
            UPDATE tasks
            SET status = 'running',
                lease_token = ?,
                lease_expires_at = ?,
                deliveries = deliveries + 1,
                updated_at = ?
            WHERE id = (
                SELECT id FROM tasks
                WHERE (status = 'pending' AND visible_at <= ?)
                   OR (status = 'running' AND lease_expires_at <= ?)
                ORDER BY visible_at ASC, created_at ASC
                LIMIT 1
            )
            RETURNING *
            ",
        )
        .bind(&token)
        .bind(lease_expires_at)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(self.database().pool())
        .await?;

        row.map(TaskAttempt::try_from).transpose()
    }

    /// Acknowledge a successful attempt.
    pub async fn complete(&self, attempt: &TaskAttempt) -> Result<(), QueueError> {
        self.complete_at(attempt, unix_timestamp()).await
    }

    pub async fn complete_at(&self, attempt: &TaskAttempt, now: i64) -> Result<(), QueueError> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'succeeded', lease_token = NULL, lease_expires_at = NULL,
                last_error = NULL, updated_at = ?, finished_at = ?
            WHERE id = ? AND status = 'running' AND lease_token = ?
            ",
        )
        .bind(now)
        .bind(now)
        .bind(&attempt.task_id)
        .bind(&attempt.lease_token)
        .execute(self.database().pool())
        .await?;

        ensure_claimed(result.rows_affected(), attempt)
    }

    /// Return a failed attempt to the queue as `next_attempt`, hidden until
    /// `not_before`.
    pub async fn retry(
        &self,
        attempt: &TaskAttempt,
        next_attempt: u32,
        not_before: i64,
        error: &str,
    ) -> Result<(), QueueError> {
        self.retry_at(attempt, next_attempt, not_before, error, unix_timestamp())
            .await
    }

    pub async fn retry_at(
        &self,
        attempt: &TaskAttempt,
        next_attempt: u32,
        not_before: i64,
        error: &str,
        now: i64,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'pending', attempt = ?, visible_at = ?,
                lease_token = NULL, lease_expires_at = NULL,
                last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'running' AND lease_token = ?
            ",
        )
        .bind(i64::from(next_attempt))
        .bind(not_before)
        .bind(error)
        .bind(now)
        .bind(&attempt.task_id)
        .bind(&attempt.lease_token)
        .execute(self.database().pool())
        .await?;

        ensure_claimed(result.rows_affected(), attempt)
    }

    /// Move a task to the terminal `failed` state, keeping the request and
    /// the last error on the row for operator follow-up.
    pub async fn fail(&self, attempt: &TaskAttempt, error: &str) -> Result<(), QueueError> {
        self.fail_at(attempt, error, unix_timestamp()).await
    }

    pub async fn fail_at(
        &self,
        attempt: &TaskAttempt,
        error: &str,
        now: i64,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'failed', lease_token = NULL, lease_expires_at = NULL,
                last_error = ?, updated_at = ?, finished_at = ?
            WHERE id = ? AND status = 'running' AND lease_token = ?
            ",
        )
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(&attempt.task_id)
        .bind(&attempt.lease_token)
        .execute(self.database().pool())
        .await?;

        ensure_claimed(result.rows_affected(), attempt)
    }

    // =========================================================================
    // Operator side
    // =========================================================================

    /// Get a task by ID.
    pub async fn get(&self, id: &str) -> Result<TaskRow, QueueError> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.database().pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("task {id}")).into())
    }

    /// List tasks, newest first, optionally filtered by state.
    pub async fn list(
        &self,
        state: Option<TaskState>,
        limit: u32,
    ) -> Result<Vec<TaskRow>, QueueError> {
        let rows = if let Some(state) = state {
            sqlx::query_as::<_, TaskRow>(
                "SELECT * FROM tasks WHERE status = ? ORDER BY updated_at DESC, id LIMIT ?",
            )
            .bind(state.as_str())
            .bind(limit)
            .fetch_all(self.database().pool())
            .await?
        } else {
            sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks ORDER BY updated_at DESC, id LIMIT ?")
                .bind(limit)
                .fetch_all(self.database().pool())
                .await?
        };

        Ok(rows)
    }

    /// Terminal failures awaiting operator follow-up.
    pub async fn failures(&self, limit: u32) -> Result<Vec<TaskRow>, QueueError> {
        self.list(Some(TaskState::Failed), limit).await
    }

    /// Give a failed task a fresh set of attempts, visible immediately.
    pub async fn requeue(&self, id: &str) -> Result<TaskHandle, QueueError> {
        self.requeue_at(id, unix_timestamp()).await
    }

    pub async fn requeue_at(&self, id: &str, now: i64) -> Result<TaskHandle, QueueError> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'pending', attempt = 0, visible_at = ?,
                finished_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'failed'
            ",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.database().pool())
        .await?;

        if result.rows_affected() == 0 {
            let row = self.get(id).await?;
            return Err(QueueError::InvalidState {
                task_id: id.to_string(),
                state: row.state()?,
                expected: TaskState::Failed,
            });
        }

        Ok(TaskHandle {
            id: id.to_string(),
            visible_at: now,
        })
    }

    /// Task counts per state.
    pub async fn counts(&self) -> Result<StatusCounts, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(self.database().pool())
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status.parse::<TaskState>().map_err(QueueError::Corrupt)? {
                TaskState::Pending => counts.pending = n,
                TaskState::Running => counts.running = n,
                TaskState::Succeeded => counts.succeeded = n,
                TaskState::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}

fn ensure_claimed(rows_affected: u64, attempt: &TaskAttempt) -> Result<(), QueueError> {
    if rows_affected == 0 {
        return Err(QueueError::LeaseLost(attempt.task_id.clone()));
    }
    Ok(())
}
