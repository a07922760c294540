//! Provisio Worker Library
//!
//! Asynchronous OS account provisioning:
//! - Durable `SQLite` task queue with delayed visibility and leases
//! - Retry policy with a fixed backoff and a terminal failure state
//! - Account backends (host system, in-memory) behind one trait
//! - Idempotent provisioning sequence and the worker pool that drives it

pub mod accounts;
pub mod clock;
pub mod provisioner;
pub mod queue;
pub mod retry;
pub mod worker;

pub use provisioner::{ProvisionReport, Provisioner, Step, StepError};
pub use queue::{QueueError, TaskQueue};
pub use retry::{RetryDecision, RetryPolicy, TaskState};
pub use worker::{AttemptOutcome, Worker, WorkerPool};
