//! Provisio Worker
//!
//! Consumes the provisioning queue and creates OS accounts with SSH access.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use provisio_core::config::load_settings;
use provisio_core::tracing_init::init_tracing;
use provisio_worker::accounts::{Privilege, SystemAccounts};
use provisio_worker::{Provisioner, TaskQueue, Worker, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "provisio-worker")]
#[command(version, about = "Provisio worker - provisions OS accounts from the task queue")]
struct Args {
    /// Settings file (defaults to ~/.config/provisio/settings.json)
    #[arg(long, env = "PROVISIO_CONFIG")]
    config: Option<PathBuf>,

    /// Queue database file path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Tasks processed in parallel
    #[arg(long)]
    concurrency: Option<usize>,

    /// Idle poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Seconds a claimed task stays invisible to other workers
    #[arg(long)]
    lease_secs: Option<u64>,

    /// Log level for provisio crates (overridden by `RUST_LOG`)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long, env = "PROVISIO_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref()).context("Failed to load settings")?;
    if let Some(path) = args.db_path {
        settings.worker.database_path = Some(path);
    }
    if let Some(n) = args.concurrency {
        settings.worker.concurrency = n;
    }
    if let Some(ms) = args.poll_interval_ms {
        settings.worker.poll_interval_ms = ms;
    }
    if let Some(secs) = args.lease_secs {
        settings.worker.lease_secs = secs;
    }
    if let Some(level) = args.log_level {
        settings.worker.log_level = level;
    }

    let level = &settings.worker.log_level;
    init_tracing(
        &format!("provisio_worker={level},provisio_core={level}"),
        args.log_json,
    );

    let db_path = settings.resolved_database_path()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        db_path = %db_path.display(),
        "Starting provisio-worker"
    );

    let queue = TaskQueue::open(&db_path)
        .await
        .with_context(|| format!("Failed to open queue at {}", db_path.display()))?;

    let accounts_cfg = &settings.accounts;
    let command_timeout = Duration::from_secs(accounts_cfg.command_timeout_secs);
    let lease = Duration::from_secs(settings.worker.lease_secs);
    // Eight steps, each bounded by the command timeout.
    if lease < command_timeout * 8 {
        warn!(
            lease_secs = lease.as_secs(),
            command_timeout_secs = command_timeout.as_secs(),
            "Lease is shorter than a worst-case attempt; tasks may be redelivered while running"
        );
    }

    let privilege = Privilege::resolve(accounts_cfg.privilege);
    info!(?privilege, home_root = %accounts_cfg.home_root.display(), "Account backend ready");
    let accounts = SystemAccounts::new(privilege, command_timeout);
    let provisioner = Provisioner::new(
        accounts,
        accounts_cfg.home_root.clone(),
        accounts_cfg.shell.clone(),
    );

    let worker = Worker::new(queue, provisioner, lease);
    let pool = WorkerPool::new(
        worker,
        settings.worker.concurrency,
        Duration::from_millis(settings.worker.poll_interval_ms),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let pool_handle = tokio::spawn(pool.run(shutdown_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    // The `true` parameter unsets $NOTIFY_SOCKET so account commands
    // don't inherit it.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    // In-flight attempts finish; anything cut short is redelivered after
    // its lease expires.
    let _ = shutdown_tx.send(true);
    pool_handle.await.context("Worker pool task panicked")?;

    info!("Worker stopped");
    Ok(())
}
