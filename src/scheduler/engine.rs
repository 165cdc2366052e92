use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::scheduler::{Scheduler, WorkerPool};

/// Main scheduler loop.
///
/// Ticks run inline, so a slow pass delays the next one instead of
/// overlapping it. Pending executions go to the worker pool.
pub async fn run_scheduler_loop(scheduler: Scheduler, pool: &WorkerPool, period: Duration) {
    info!(poll_interval_secs = period.as_secs(), "Scheduler engine started");

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        // Repository access is blocking SQLite I/O.
        let pass = scheduler.clone();
        match tokio::task::spawn_blocking(move || pass.tick()).await {
            Ok(Ok(report)) => {
                if !report.pending.is_empty() || !report.missed.is_empty() {
                    info!(
                        pending = report.pending.len(),
                        missed = report.missed.len(),
                        skipped = report.skipped.len(),
                        "Scheduling pass complete"
                    );
                }
                for id in report.pending {
                    if let Err(e) = pool.submit(id).await {
                        error!(execution_id = id, error = %e, "Failed to enqueue execution");
                    }
                }
            }
            Ok(Err(e)) => {
                error!(error = %format!("{e:#}"), "Scheduling pass failed");
            }
            Err(e) => {
                warn!(error = %e, "Scheduling pass panicked");
            }
        }
    }
}
