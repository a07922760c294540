//! Provisio CLI
//!
//! Enqueues provisioning requests and inspects the task queue shared with
//! `provisio-worker`.

use std::io;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::debug;

use provisio_core::config::load_settings;
use provisio_core::tracing_init::init_tracing;
use provisio_ctl::task_cmd::{self, TaskAction};
use provisio_worker::TaskQueue;

#[derive(Parser, Debug)]
#[command(name = "provisio")]
#[command(version, about = "Provisio - queue OS account provisioning requests", long_about = None)]
struct Cli {
    /// Settings file (defaults to ~/.config/provisio/settings.json)
    #[arg(long, global = true, env = "PROVISIO_CONFIG")]
    config: Option<PathBuf>,

    /// Queue database file path
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    action: TaskAction,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing("provisio_ctl=warn,provisio_worker=warn,provisio_core=warn", false);

    let mut settings = load_settings(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(path) = cli.db_path {
        settings.worker.database_path = Some(path);
    }
    let db_path = settings.resolved_database_path()?;
    debug!(db_path = %db_path.display(), "Opening queue");

    let queue = TaskQueue::open(&db_path)
        .await
        .with_context(|| format!("Failed to open queue at {}", db_path.display()))?;
    task_cmd::run(&queue, cli.action, cli.json, &mut io::stdout()).await
}
