//! Snapflow -- scheduling and execution engine for automated test campaigns.
//!
//! A poll loop decides which test configurations are due, records an
//! execution for each, and hands pending executions to a bounded worker pool.
//! Workers run the configuration's scripts in order, escalate the first
//! failure to the issue tracker, and mail a summary when done.

pub mod clock;
pub mod config;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod periodicity;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod storage;
pub mod tracker;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::clock::{Clock, SystemClock};
use crate::config::{LogFormat, LoggingConfig, SnapflowConfig};
use crate::notify::{Notifier, SmtpNotifier};
use crate::orchestrator::Orchestrator;
use crate::runner::ScriptRunner;
use crate::scheduler::{Scheduler, TickReport, WorkerPool};
use crate::storage::{FsLogStore, LogStore, SqliteStore};
use crate::tracker::{RedmineClient, TicketIssuer};

/// Longest prefix of `s` holding at most `max_chars` characters.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    if let Err(e) = installed {
        eprintln!("tracing subscriber already installed: {e}");
    }
}

/// Stderr subscriber for what happens before `init_logging` can run, such as
/// config resolution falling back past an unreadable file.
pub fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish()
}

/// The wired services of one process.
#[derive(Clone)]
pub struct Engine {
    pub store: SqliteStore,
    pub scheduler: Scheduler,
    pub orchestrator: Arc<Orchestrator>,
}

impl Engine {
    pub fn new(
        store: SqliteStore,
        logs: Arc<dyn LogStore>,
        runner: ScriptRunner,
        tickets: Arc<dyn TicketIssuer>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let repo = Arc::new(store.clone());
        let scheduler = Scheduler::new(repo.clone(), repo.clone(), clock.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            repo.clone(),
            repo,
            logs,
            runner,
            tickets,
            notifier,
            clock,
        ));
        Self { store, scheduler, orchestrator }
    }

    /// Build the production wiring from configuration.
    pub fn open(config: &SnapflowConfig) -> Result<Self> {
        tracing::info!(db_path = %config.storage.database_path, "Initializing database");
        let pool = storage::open_pool(&config.storage.database_path)?;
        let media_root = &config.storage.media_root;
        let tickets = RedmineClient::new(&config.tracker).context("Failed to build issue tracker client")?;
        let notifier = SmtpNotifier::new(&config.smtp).context("Failed to build SMTP notifier")?;

        Ok(Self::new(
            SqliteStore::new(pool),
            Arc::new(FsLogStore::new(media_root.clone())),
            ScriptRunner::new(&config.runner, media_root.clone()),
            Arc::new(tickets),
            Arc::new(notifier),
            Arc::new(SystemClock),
        ))
    }

    /// One scheduling pass, then run every execution it created to completion.
    pub async fn tick_and_drain(&self, workers: usize, capacity: usize) -> Result<TickReport> {
        let scheduler = self.scheduler.clone();
        let report = tokio::task::spawn_blocking(move || scheduler.tick())
            .await
            .context("scheduling pass panicked")??;

        let pool = WorkerPool::start(self.orchestrator.clone(), workers, capacity);
        for id in &report.pending {
            pool.submit(*id).await?;
        }
        pool.shutdown().await;
        Ok(report)
    }
}

/// Start the daemon: recovery sweep, worker pool, then the scheduler loop
/// until Ctrl-C.
pub async fn serve(config: SnapflowConfig) -> Result<()> {
    let engine = Engine::open(&config)?;

    let pool = WorkerPool::start(
        engine.orchestrator.clone(),
        config.scheduler.workers,
        config.scheduler.queue_capacity,
    );

    let orchestrator = engine.orchestrator.clone();
    let recovered = tokio::task::spawn_blocking(move || orchestrator.recover())
        .await
        .context("recovery sweep panicked")??;
    for id in recovered {
        pool.submit(id).await?;
    }

    tracing::info!(
        workers = config.scheduler.workers,
        poll_interval_secs = config.scheduler.poll_interval().as_secs(),
        "Snapflow engine running"
    );
    tokio::select! {
        _ = scheduler::run_scheduler_loop(engine.scheduler.clone(), &pool, config.scheduler.poll_interval()) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown requested, draining workers");
        }
    }
    pool.shutdown().await;
    Ok(())
}
