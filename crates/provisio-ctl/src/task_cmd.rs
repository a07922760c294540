//! Queue subcommands.
//!
//! User-facing output uses writeln! to the given writer (stdout in the binary).

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;

use provisio_core::ProvisioningRequest;
use provisio_core::db::unix_timestamp;
use provisio_worker::TaskState;
use provisio_worker::queue::{DEFAULT_ENQUEUE_DELAY_SECS, TaskQueue, TaskRow};

use crate::key_file::read_public_key;
use crate::output::{relative, truncate};

/// Queue subcommand actions.
#[derive(Subcommand, Debug)]
pub enum TaskAction {
    /// Validate a provisioning request and add it to the queue
    Enqueue {
        /// OS login name
        #[arg(long)]
        username: String,
        /// Primary group (created if missing)
        #[arg(long)]
        group: String,
        /// Account comment, e.g. the person's full name
        #[arg(long)]
        description: String,
        /// Public key line
        #[arg(long, conflicts_with = "public_key_file", required_unless_present = "public_key_file")]
        public_key: Option<String>,
        /// Read the public key from a `.pub` file
        #[arg(long)]
        public_key_file: Option<PathBuf>,
        /// Seconds before a worker may pick the task up
        #[arg(long, default_value_t = DEFAULT_ENQUEUE_DELAY_SECS)]
        delay: u64,
    },
    /// Show one task
    Status {
        /// Task ID
        id: String,
    },
    /// List tasks, most recently updated first
    List {
        /// Only tasks in this state: pending, running, succeeded, failed
        #[arg(long)]
        status: Option<TaskState>,
        /// Maximum number of results
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },
    /// List tasks that exhausted their retries
    Failures {
        /// Maximum number of results
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },
    /// Give a failed task a fresh set of attempts
    Requeue {
        /// Task ID
        id: String,
    },
    /// Number of tasks in each state
    Counts,
}

/// Task as shown to operators. The public key is left out of listings.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskView<'a> {
    id: &'a str,
    username: &'a str,
    group: &'a str,
    description: &'a str,
    status: &'a str,
    attempt: i64,
    deliveries: i64,
    visible_at: i64,
    last_error: Option<&'a str>,
    created_at: i64,
    updated_at: i64,
    finished_at: Option<i64>,
}

impl<'a> From<&'a TaskRow> for TaskView<'a> {
    fn from(row: &'a TaskRow) -> Self {
        Self {
            id: &row.id,
            username: &row.username,
            group: &row.user_group,
            description: &row.description,
            status: &row.status,
            attempt: row.attempt,
            deliveries: row.deliveries,
            visible_at: row.visible_at,
            last_error: row.last_error.as_deref(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        }
    }
}

/// Execute a queue subcommand.
pub async fn run(
    queue: &TaskQueue,
    action: TaskAction,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    run_at(queue, action, json, out, unix_timestamp()).await
}

/// [`run`] with an explicit current time.
pub async fn run_at(
    queue: &TaskQueue,
    action: TaskAction,
    json: bool,
    out: &mut impl Write,
    now: i64,
) -> Result<()> {
    match action {
        TaskAction::Enqueue {
            username,
            group,
            description,
            public_key,
            public_key_file,
            delay,
        } => {
            let public_key = match (public_key, public_key_file) {
                (Some(key), _) => key,
                (None, Some(path)) => read_public_key(&path)?,
                (None, None) => anyhow::bail!("--public-key or --public-key-file is required"),
            };
            let request = ProvisioningRequest::new(username, group, description, public_key);
            request.validate().context("Request rejected")?;

            let handle = queue
                .enqueue_at(&request, Duration::from_secs(delay), now)
                .await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&handle)?)?;
            } else {
                writeln!(out, "Enqueued task {} for {request}", handle.id)?;
                writeln!(
                    out,
                    "  Visible:        {} ({})",
                    handle.visible_at,
                    relative(handle.visible_at, now)
                )?;
            }
        }
        TaskAction::Status { id } => {
            let row = queue.get(&id).await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&row)?)?;
            } else {
                write_detail(out, &row, now)?;
            }
        }
        TaskAction::List { status, limit } => {
            let rows = queue.list(status, limit).await?;
            write_rows(out, &rows, json, now)?;
        }
        TaskAction::Failures { limit } => {
            let rows = queue.failures(limit).await?;
            if json {
                write_views(out, &rows)?;
            } else if rows.is_empty() {
                writeln!(out, "No failed tasks.")?;
            } else {
                for row in &rows {
                    write_detail(out, row, now)?;
                    writeln!(out)?;
                }
                writeln!(out, "{} failed task(s)", rows.len())?;
            }
        }
        TaskAction::Requeue { id } => {
            let handle = queue.requeue_at(&id, now).await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&handle)?)?;
            } else {
                writeln!(out, "Task {} requeued.", handle.id)?;
            }
        }
        TaskAction::Counts => {
            let counts = queue.counts().await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&counts)?)?;
            } else {
                writeln!(out, "pending:   {}", counts.pending)?;
                writeln!(out, "running:   {}", counts.running)?;
                writeln!(out, "succeeded: {}", counts.succeeded)?;
                writeln!(out, "failed:    {}", counts.failed)?;
            }
        }
    }
    Ok(())
}

fn write_views(out: &mut impl Write, rows: &[TaskRow]) -> Result<()> {
    let views: Vec<TaskView<'_>> = rows.iter().map(TaskView::from).collect();
    writeln!(out, "{}", serde_json::to_string_pretty(&views)?)?;
    Ok(())
}

fn write_rows(out: &mut impl Write, rows: &[TaskRow], json: bool, now: i64) -> Result<()> {
    if json {
        return write_views(out, rows);
    }
    if rows.is_empty() {
        writeln!(out, "No tasks found.")?;
        return Ok(());
    }

    writeln!(
        out,
        "{:<36}  {:<16}  {:<10}  {:<7}  UPDATED",
        "ID", "USERNAME", "STATUS", "ATTEMPT"
    )?;
    for row in rows {
        writeln!(
            out,
            "{:<36}  {:<16}  {:<10}  {:<7}  {}",
            row.id,
            truncate(&row.username, 16),
            row.status,
            row.attempt,
            relative(row.updated_at, now),
        )?;
    }
    writeln!(out, "\n{} task(s)", rows.len())?;
    Ok(())
}

fn write_detail(w: &mut impl Write, row: &TaskRow, now: i64) -> std::io::Result<()> {
    writeln!(w, "  ID:             {}", row.id)?;
    writeln!(w, "  Username:       {}", row.username)?;
    writeln!(w, "  Group:          {}", row.user_group)?;
    writeln!(w, "  Description:    {}", row.description)?;
    writeln!(w, "  Public key:     {}", truncate(&row.public_key, 60))?;
    writeln!(w, "  Status:         {}", row.status)?;
    writeln!(w, "  Attempt:        {}", row.attempt)?;
    writeln!(w, "  Deliveries:     {}", row.deliveries)?;
    writeln!(
        w,
        "  Visible at:     {} ({})",
        row.visible_at,
        relative(row.visible_at, now)
    )?;
    if let Some(err) = &row.last_error {
        writeln!(w, "  Last error:     {err}")?;
    }
    if let Some(finished) = row.finished_at {
        writeln!(
            w,
            "  Finished at:    {finished} ({})",
            relative(finished, now)
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    async fn queue() -> TaskQueue {
        TaskQueue::open_in_memory().await.expect("queue")
    }

    fn enqueue_alice(public_key: &str) -> TaskAction {
        TaskAction::Enqueue {
            username: "alice".into(),
            group: "devs".into(),
            description: "Alice R".into(),
            public_key: Some(public_key.into()),
            public_key_file: None,
            delay: DEFAULT_ENQUEUE_DELAY_SECS,
        }
    }

    async fn exec(queue: &TaskQueue, action: TaskAction, json: bool) -> Result<String> {
        let mut out = Vec::new();
        run_at(queue, action, json, &mut out, NOW).await?;
        Ok(String::from_utf8(out).expect("utf-8 output"))
    }

    #[tokio::test]
    async fn enqueue_uses_default_delay() {
        let q = queue().await;
        let out = exec(&q, enqueue_alice("ssh-ed25519 AAAA alice"), true)
            .await
            .expect("enqueue");

        let handle: serde_json::Value = serde_json::from_str(&out).expect("json");
        assert_eq!(handle["visibleAt"], NOW + 300);
        assert!(handle.get("visible_at").is_none());

        let rows = q.list(Some(TaskState::Pending), 10).await.expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].public_key, "ssh-ed25519 AAAA alice");
    }

    #[tokio::test]
    async fn invalid_request_is_not_enqueued() {
        let q = queue().await;
        let err = exec(&q, enqueue_alice("not a key"), false)
            .await
            .expect_err("must reject");
        assert!(format!("{err:#}").contains("public key"));
        assert_eq!(q.counts().await.expect("counts").pending, 0);
    }

    #[tokio::test]
    async fn enqueue_reads_key_file() {
        let q = queue().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("id.pub");
        std::fs::write(&path, "ssh-ed25519 FROMFILE alice\n").expect("write");

        let action = TaskAction::Enqueue {
            username: "alice".into(),
            group: "devs".into(),
            description: "Alice R".into(),
            public_key: None,
            public_key_file: Some(path),
            delay: 0,
        };
        let out = exec(&q, action, false).await.expect("enqueue");
        assert!(out.contains("alice:devs"));
        assert!(out.contains("(now)"));

        let rows = q.list(None, 10).await.expect("list");
        assert_eq!(rows[0].public_key, "ssh-ed25519 FROMFILE alice");
    }

    #[tokio::test]
    async fn list_and_counts_reflect_queue() {
        let q = queue().await;
        exec(&q, enqueue_alice("ssh-ed25519 A"), false)
            .await
            .expect("enqueue");

        let listing = exec(
            &q,
            TaskAction::List {
                status: None,
                limit: 10,
            },
            false,
        )
        .await
        .expect("list");
        assert!(listing.contains("alice"));
        assert!(listing.contains("pending"));
        assert!(listing.contains("1 task(s)"));

        let counts = exec(&q, TaskAction::Counts, true).await.expect("counts");
        let counts: serde_json::Value = serde_json::from_str(&counts).expect("json");
        assert_eq!(counts["pending"], 1);
        assert_eq!(counts["failed"], 0);
    }

    #[tokio::test]
    async fn json_listing_omits_public_key() {
        let q = queue().await;
        exec(&q, enqueue_alice("ssh-ed25519 SECRETISH"), false)
            .await
            .expect("enqueue");
        let out = exec(
            &q,
            TaskAction::List {
                status: None,
                limit: 10,
            },
            true,
        )
        .await
        .expect("list");
        assert!(!out.contains("SECRETISH"));
        assert!(out.contains("\"username\": \"alice\""));
    }

    #[tokio::test]
    async fn json_failures_omit_public_key_and_lease() {
        let q = queue().await;
        q.enqueue_at(
            &ProvisioningRequest::new("alice", "devs", "Alice R", "ssh-ed25519 SECRETISH"),
            Duration::ZERO,
            NOW,
        )
        .await
        .expect("enqueue");
        let task = q
            .dequeue_at(Duration::from_secs(600), NOW)
            .await
            .expect("dequeue")
            .expect("task");
        q.fail_at(&task, "useradd exited 9", NOW + 1)
            .await
            .expect("fail");

        let out = exec(&q, TaskAction::Failures { limit: 10 }, true)
            .await
            .expect("failures");
        assert!(!out.contains("SECRETISH"));
        assert!(!out.contains("lease"));

        let views: serde_json::Value = serde_json::from_str(&out).expect("json");
        assert_eq!(views[0]["username"], "alice");
        assert_eq!(views[0]["description"], "Alice R");
        assert_eq!(views[0]["lastError"], "useradd exited 9");
        assert_eq!(views[0]["status"], "failed");
    }

    #[tokio::test]
    async fn requeue_of_pending_task_is_refused() {
        let q = queue().await;
        let handle = q
            .enqueue_at(
                &ProvisioningRequest::new("alice", "devs", "Alice R", "ssh-ed25519 A"),
                Duration::ZERO,
                NOW,
            )
            .await
            .expect("enqueue");

        let err = exec(&q, TaskAction::Requeue { id: handle.id }, false)
            .await
            .expect_err("pending task");
        assert!(err.to_string().contains("expected failed"));
    }

    #[tokio::test]
    async fn empty_failures_listing() {
        let q = queue().await;
        let out = exec(&q, TaskAction::Failures { limit: 10 }, false)
            .await
            .expect("failures");
        assert_eq!(out, "No failed tasks.\n");
    }

    #[tokio::test]
    async fn status_of_unknown_task_is_an_error() {
        let q = queue().await;
        assert!(
            exec(&q, TaskAction::Status { id: "nope".into() }, false)
                .await
                .is_err()
        );
    }
}
