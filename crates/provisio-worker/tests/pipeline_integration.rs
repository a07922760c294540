#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end tests for the provisioning pipeline.
//!
//! Producer enqueue → delayed visibility → worker attempt → retry/backoff →
//! terminal failure, driven by a manual clock against an in-memory queue and
//! the in-memory account backend.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use provisio_core::ProvisioningRequest;
use provisio_worker::accounts::{Capability, MemoryAccounts};
use provisio_worker::clock::{Clock, ManualClock};
use provisio_worker::provisioner::authorized_keys_path;
use provisio_worker::queue::DEFAULT_ENQUEUE_DELAY_SECS;
use provisio_worker::{AttemptOutcome, Provisioner, TaskQueue, TaskState, Worker, WorkerPool};

const LEASE: Duration = Duration::from_secs(600);
const T0: i64 = 1_700_000_000;

fn request(username: &str) -> ProvisioningRequest {
    ProvisioningRequest::new(
        username,
        "devs",
        "Alice R",
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 alice@laptop",
    )
}

async fn pipeline() -> (Worker<MemoryAccounts>, Arc<ManualClock>) {
    let queue = TaskQueue::open_in_memory().await.unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let provisioner = Provisioner::new(MemoryAccounts::new("/home"), "/home", "/bin/bash");
    let worker = Worker::new(queue, provisioner, LEASE).with_clock(clock.clone());
    (worker, clock)
}

#[tokio::test]
async fn alice_is_provisioned_after_the_default_delay() {
    let (worker, clock) = pipeline().await;
    let handle = worker
        .queue()
        .enqueue_at(
            &request("alice"),
            Duration::from_secs(DEFAULT_ENQUEUE_DELAY_SECS),
            T0,
        )
        .await
        .unwrap();
    assert_eq!(handle.visible_at, T0 + 300);

    // Not visible before the delay elapses.
    clock.set(T0 + 299);
    assert_eq!(worker.process_next().await.unwrap(), None);

    clock.set(T0 + 300);
    let outcome = worker.process_next().await.unwrap();
    assert_eq!(
        outcome,
        Some(AttemptOutcome::Succeeded {
            task_id: handle.id.clone()
        })
    );

    let state = worker.provisioner().accounts().snapshot();
    assert!(state.groups.contains("devs"));
    let alice = &state.accounts["alice"];
    assert_eq!(alice.primary_group, "devs");
    assert_eq!(alice.comment, "Alice R");
    assert_eq!(alice.shell, "/bin/bash");

    let ssh = &state.directories[Path::new("/home/alice/.ssh")];
    assert_eq!(ssh.mode, 0o700);
    assert_eq!(ssh.owner, Some(("alice".into(), "devs".into())));

    let keys = &state.files[&authorized_keys_path(Path::new("/home"), "alice")];
    assert_eq!(
        keys.content,
        b"ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 alice@laptop\n"
    );
    assert_eq!(keys.mode, 0o600);
    assert_eq!(keys.owner, Some(("alice".into(), "devs".into())));

    let row = worker.queue().get(&handle.id).await.unwrap();
    assert_eq!(row.state().unwrap(), TaskState::Succeeded);
}

#[tokio::test]
async fn permanently_failing_task_gets_four_attempts_then_fails() {
    let (worker, clock) = pipeline().await;
    worker
        .provisioner()
        .accounts()
        .fail_always(Capability::CreateAccount);
    let handle = worker
        .queue()
        .enqueue_at(&request("alice"), Duration::ZERO, T0)
        .await
        .unwrap();

    let mut attempts = 0;
    for expected_next in 1..=3 {
        let outcome = worker.process_next().await.unwrap();
        attempts += 1;
        assert_eq!(
            outcome,
            Some(AttemptOutcome::Retrying {
                task_id: handle.id.clone(),
                next_attempt: expected_next,
                not_before: clock.now() + 60,
            })
        );

        // Hidden for the backoff window, visible right at its end.
        clock.advance(59);
        assert_eq!(worker.process_next().await.unwrap(), None);
        clock.advance(1);
    }

    let outcome = worker.process_next().await.unwrap().unwrap();
    attempts += 1;
    assert!(matches!(outcome, AttemptOutcome::Failed { ref task_id, .. } if *task_id == handle.id));
    assert_eq!(attempts, 4);

    // Terminal: nothing more is handed out, however long we wait.
    clock.advance(86_400);
    assert_eq!(worker.process_next().await.unwrap(), None);
    assert_eq!(
        worker
            .provisioner()
            .accounts()
            .call_count(Capability::CreateAccount),
        4
    );

    let failures = worker.queue().failures(10).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].id, handle.id);
    assert_eq!(failures[0].attempt, 3);
    assert!(
        failures[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("create_account")
    );
}

#[tokio::test]
async fn transient_failure_recovers_on_a_later_attempt() {
    let (worker, clock) = pipeline().await;
    worker
        .provisioner()
        .accounts()
        .fail_times(Capability::WriteFile, 2);
    let handle = worker
        .queue()
        .enqueue_at(&request("alice"), Duration::ZERO, T0)
        .await
        .unwrap();

    for _ in 0..2 {
        assert!(matches!(
            worker.process_next().await.unwrap(),
            Some(AttemptOutcome::Retrying { .. })
        ));
        clock.advance(60);
    }
    assert!(matches!(
        worker.process_next().await.unwrap(),
        Some(AttemptOutcome::Succeeded { .. })
    ));

    let row = worker.queue().get(&handle.id).await.unwrap();
    assert_eq!(row.state().unwrap(), TaskState::Succeeded);
    assert_eq!(row.attempt, 2);
    assert_eq!(
        worker
            .provisioner()
            .accounts()
            .call_count(Capability::CreateAccount),
        1
    );
}

#[tokio::test]
async fn duplicate_requests_converge_on_one_account() {
    let (worker, _) = pipeline().await;
    let queue = worker.queue();
    let first = queue
        .enqueue_at(&request("alice"), Duration::ZERO, T0)
        .await
        .unwrap();
    let second = queue
        .enqueue_at(&request("alice"), Duration::ZERO, T0)
        .await
        .unwrap();
    assert_ne!(first.id, second.id);

    for _ in 0..2 {
        assert!(matches!(
            worker.process_next().await.unwrap(),
            Some(AttemptOutcome::Succeeded { .. })
        ));
    }

    let accounts = worker.provisioner().accounts();
    assert_eq!(accounts.call_count(Capability::CreateAccount), 1);
    assert_eq!(accounts.snapshot().accounts.len(), 1);
    assert_eq!(queue.counts().await.unwrap().succeeded, 2);
}

#[tokio::test]
async fn crashed_attempt_is_redelivered_after_lease_expiry() {
    let (worker, clock) = pipeline().await;
    let handle = worker
        .queue()
        .enqueue_at(&request("alice"), Duration::ZERO, T0)
        .await
        .unwrap();

    // A worker claims the task and dies without acknowledging.
    let abandoned = worker.queue().dequeue_at(LEASE, T0).await.unwrap().unwrap();
    assert_eq!(abandoned.task_id, handle.id);

    clock.set(T0 + 599);
    assert_eq!(worker.process_next().await.unwrap(), None);

    clock.set(T0 + 600);
    assert!(matches!(
        worker.process_next().await.unwrap(),
        Some(AttemptOutcome::Succeeded { .. })
    ));

    let row = worker.queue().get(&handle.id).await.unwrap();
    assert_eq!(row.deliveries, 2);
    // Redelivery is not a failed attempt.
    assert_eq!(row.attempt, 0);
}

#[tokio::test]
async fn failed_task_can_be_requeued_by_an_operator() {
    let (worker, clock) = pipeline().await;
    let accounts = worker.provisioner().accounts();
    accounts.fail_always(Capability::EnsureGroup);
    let handle = worker
        .queue()
        .enqueue_at(&request("alice"), Duration::ZERO, T0)
        .await
        .unwrap();

    while let Some(outcome) = worker.process_next().await.unwrap() {
        if matches!(outcome, AttemptOutcome::Failed { .. }) {
            break;
        }
        clock.advance(60);
    }

    accounts.heal();
    worker
        .queue()
        .requeue_at(&handle.id, clock.now())
        .await
        .unwrap();
    assert!(matches!(
        worker.process_next().await.unwrap(),
        Some(AttemptOutcome::Succeeded { .. })
    ));
}

#[tokio::test]
async fn pool_drains_queue_and_stops_on_shutdown() {
    let queue = TaskQueue::open_in_memory().await.unwrap();
    let provisioner = Provisioner::new(MemoryAccounts::new("/home"), "/home", "/bin/bash");
    let worker = Worker::new(queue.clone(), provisioner, LEASE);

    for name in ["alice", "bob", "carol", "dave"] {
        queue.enqueue(&request(name), Duration::ZERO).await.unwrap();
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let pool = WorkerPool::new(worker, 3, Duration::from_millis(10));
    let handle = tokio::spawn(pool.run(shutdown_rx));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if queue.counts().await.unwrap().succeeded == 4 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pool did not drain the queue"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
