//! Queue consumer: dequeues tasks, runs the provisioner, applies the retry
//! policy and acknowledges the outcome.
//!
//! Provisioning errors never escape [`Worker::process_next`]; they become
//! queue transitions and log lines. Only queue (database) errors propagate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::accounts::AccountManager;
use crate::clock::{Clock, SystemClock};
use crate::provisioner::Provisioner;
use crate::queue::{QueueError, TaskAttempt, TaskQueue};
use crate::retry::{RetryDecision, RetryPolicy};

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded {
        task_id: String,
    },
    Retrying {
        task_id: String,
        next_attempt: u32,
        not_before: i64,
    },
    Failed {
        task_id: String,
        error: String,
    },
    /// The lease expired mid-attempt; another worker owns the task now.
    LeaseLost {
        task_id: String,
    },
}

/// One lock per username so that duplicate deliveries for the same account
/// do not interleave within this process.
#[derive(Debug, Clone, Default)]
pub struct UsernameLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl UsernameLocks {
    pub async fn lock(&self, username: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop locks nobody holds or waits on.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(map.entry(username.to_string()).or_default())
        };
        entry.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Dequeue-provision-acknowledge loop body. Cheap to clone; all clones share
/// the queue, provisioner and username locks.
pub struct Worker<A> {
    queue: TaskQueue,
    provisioner: Arc<Provisioner<A>>,
    policy: RetryPolicy,
    lease: Duration,
    clock: Arc<dyn Clock>,
    locks: UsernameLocks,
}

impl<A> Clone for Worker<A> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            provisioner: Arc::clone(&self.provisioner),
            policy: self.policy,
            lease: self.lease,
            clock: Arc::clone(&self.clock),
            locks: self.locks.clone(),
        }
    }
}

impl<A: AccountManager + 'static> Worker<A> {
    pub fn new(queue: TaskQueue, provisioner: Provisioner<A>, lease: Duration) -> Self {
        Self {
            queue,
            provisioner: Arc::new(provisioner),
            policy: RetryPolicy::default(),
            lease,
            clock: Arc::new(SystemClock),
            locks: UsernameLocks::default(),
        }
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn provisioner(&self) -> &Provisioner<A> {
        &self.provisioner
    }

    pub const fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Process at most one visible task. `Ok(None)` means the queue had
    /// nothing visible.
    pub async fn process_next(&self) -> Result<Option<AttemptOutcome>, QueueError> {
        let Some(task) = self.queue.dequeue_at(self.lease, self.clock.now()).await? else {
            return Ok(None);
        };

        info!(
            task_id = %task.task_id,
            username = %task.request.username,
            attempt = task.attempt,
            deliveries = task.deliveries,
            "Provisioning attempt started"
        );

        let _guard = self.locks.lock(&task.request.username).await;
        let result = self.provisioner.provision(&task.request).await;
        let finished_at = self.clock.now();

        let outcome = match result {
            Ok(report) => {
                debug!(task_id = %task.task_id, ?report, "provisioning report");
                self.queue
                    .complete_at(&task, finished_at)
                    .await
                    .map(|()| AttemptOutcome::Succeeded {
                        task_id: task.task_id.clone(),
                    })
            }
            Err(err) => self.handle_failure(&task, &err.to_string(), finished_at).await,
        };

        match outcome {
            Err(QueueError::LeaseLost(task_id)) => {
                warn!(%task_id, "Lease lost before acknowledgement; task was redelivered");
                Ok(Some(AttemptOutcome::LeaseLost { task_id }))
            }
            other => other.map(Some),
        }
    }

    async fn handle_failure(
        &self,
        task: &TaskAttempt,
        error: &str,
        failed_at: i64,
    ) -> Result<AttemptOutcome, QueueError> {
        match self.policy.decide(task.attempt, failed_at) {
            RetryDecision::Retry {
                next_attempt,
                not_before,
            } => {
                warn!(
                    task_id = %task.task_id,
                    username = %task.request.username,
                    attempt = task.attempt,
                    next_attempt,
                    not_before,
                    error,
                    "Provisioning attempt failed, retry scheduled"
                );
                self.queue
                    .retry_at(task, next_attempt, not_before, error, failed_at)
                    .await?;
                Ok(AttemptOutcome::Retrying {
                    task_id: task.task_id.clone(),
                    next_attempt,
                    not_before,
                })
            }
            RetryDecision::GiveUp => {
                error!(
                    task_id = %task.task_id,
                    username = %task.request.username,
                    group = %task.request.group,
                    description = %task.request.description,
                    public_key = %task.request.public_key,
                    attempts = task.attempt + 1,
                    error,
                    "Provisioning failed permanently"
                );
                self.queue.fail_at(task, error, failed_at).await?;
                Ok(AttemptOutcome::Failed {
                    task_id: task.task_id.clone(),
                    error: error.to_string(),
                })
            }
        }
    }
}

/// Runs `concurrency` copies of a [`Worker`] until shutdown.
pub struct WorkerPool<A> {
    worker: Worker<A>,
    concurrency: usize,
    poll_interval: Duration,
}

impl<A: AccountManager + 'static> WorkerPool<A> {
    pub fn new(worker: Worker<A>, concurrency: usize, poll_interval: Duration) -> Self {
        Self {
            worker,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Poll until `shutdown` becomes `true`. In-flight attempts are finished
    /// before returning.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut set = JoinSet::new();
        for slot in 0..self.concurrency {
            let worker = self.worker.clone();
            let shutdown = shutdown.clone();
            let poll_interval = self.poll_interval;
            set.spawn(async move { poll_loop(slot, worker, poll_interval, shutdown).await });
        }

        info!(concurrency = self.concurrency, "Worker pool started");
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn poll_loop<A: AccountManager + 'static>(
    slot: usize,
    worker: Worker<A>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(slot, "Worker slot started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        match worker.process_next().await {
            // More work may be waiting.
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => error!(slot, error = %e, "Queue error"),
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!(slot, "Worker slot stopped");
}
