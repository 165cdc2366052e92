//! Scheduling decisions: which configurations get an execution on this tick.

pub mod engine;
pub mod queue;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::model::{Configuration, ConfigurationId, ExecutionId, ExecutionStatus};
use crate::periodicity::{self, PeriodicityError};
use crate::storage::{ConfigurationRepository, ExecutionStore};

pub use self::engine::run_scheduler_loop;
pub use self::queue::WorkerPool;

/// Outcome of evaluating one configuration at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Never ran before.
    FirstRun,
    /// At least one interval elapsed.
    Due,
    /// Two or more intervals elapsed: the cycle was missed, record it without running.
    Missed,
    NotYetDue,
}

impl Decision {
    /// Status of the execution to create, if any.
    pub fn status(self) -> Option<ExecutionStatus> {
        match self {
            Decision::FirstRun | Decision::Due => Some(ExecutionStatus::Pending),
            Decision::Missed => Some(ExecutionStatus::NonExecuted),
            Decision::NotYetDue => None,
        }
    }
}

/// Pure per-configuration decision. Same inputs, same answer.
pub fn decide(config: &Configuration, now: DateTime<Utc>) -> Result<Decision, PeriodicityError> {
    let delta = periodicity::delta(&config.periodicity)?;
    let Some(last) = config.last_execution else {
        return Ok(Decision::FirstRun);
    };
    let elapsed = now - last;
    Ok(if elapsed >= delta * 2 {
        Decision::Missed
    } else if elapsed >= delta {
        Decision::Due
    } else {
        Decision::NotYetDue
    })
}

/// What one scheduling pass did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TickReport {
    /// Executions created as `pending`; these need orchestrating.
    pub pending: Vec<ExecutionId>,
    /// Executions recorded directly as `non_executed`.
    pub missed: Vec<ExecutionId>,
    /// Configurations skipped because of a configuration error.
    pub skipped: Vec<ConfigurationId>,
    /// Configurations whose decision could not be persisted.
    pub failed: Vec<ConfigurationId>,
    /// Configurations another pass scheduled between our read and our write.
    pub superseded: Vec<ConfigurationId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpcomingRun {
    pub at: DateTime<Utc>,
    pub configuration_id: ConfigurationId,
    pub name: String,
    pub scripts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverdueConfiguration {
    pub configuration_id: ConfigurationId,
    pub name: String,
    pub expected_at: DateTime<Utc>,
    pub delay_secs: i64,
}

/// The scheduler service. Owns no state of its own; everything goes through
/// the injected repository, store and clock.
#[derive(Clone)]
pub struct Scheduler {
    configs: Arc<dyn ConfigurationRepository>,
    executions: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(
        configs: Arc<dyn ConfigurationRepository>,
        executions: Arc<dyn ExecutionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { configs, executions, clock }
    }

    fn in_scope(&self, now: DateTime<Utc>) -> Result<Vec<Configuration>> {
        Ok(self
            .configs
            .list_active()?
            .into_iter()
            .filter(|c| c.in_scope(now))
            .collect())
    }

    /// One scheduling pass. Blocks on repository I/O.
    ///
    /// A bad configuration is logged and skipped; only a failure to list
    /// configurations aborts the pass.
    pub fn tick(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for config in self.in_scope(now)? {
            let decision = match decide(&config, now) {
                Ok(d) => d,
                Err(e) => {
                    warn!(config_id = config.id, name = %config.name, error = %e, "skipping configuration");
                    report.skipped.push(config.id);
                    continue;
                }
            };
            let Some(status) = decision.status() else {
                debug!(config_id = config.id, "not yet due");
                continue;
            };

            match self
                .executions
                .create_scheduled(config.id, status, now, config.last_execution)
            {
                Ok(None) => {
                    info!(config_id = config.id, "already scheduled by a concurrent pass");
                    report.superseded.push(config.id);
                }
                Ok(Some(execution)) => {
                    info!(
                        config_id = config.id,
                        execution_id = execution.id,
                        ?decision,
                        %status,
                        "execution scheduled"
                    );
                    match status {
                        ExecutionStatus::NonExecuted => report.missed.push(execution.id),
                        _ => report.pending.push(execution.id),
                    }
                }
                Err(e) => {
                    error!(config_id = config.id, error = %e, "failed to record scheduling decision");
                    report.failed.push(config.id);
                }
            }
        }

        Ok(report)
    }

    /// Configurations the next tick would act on.
    pub fn due_now(&self) -> Result<Vec<(Configuration, Decision)>> {
        let now = self.clock.now();
        let mut due = Vec::new();
        for config in self.in_scope(now)? {
            match decide(&config, now) {
                Ok(Decision::NotYetDue) => {}
                Ok(d) => due.push((config, d)),
                Err(e) => warn!(config_id = config.id, error = %e, "skipping configuration"),
            }
        }
        Ok(due)
    }

    /// Planned runs in the next `hours`, soonest first.
    pub fn upcoming(&self, hours: u64) -> Result<Vec<UpcomingRun>> {
        let now = self.clock.now();
        let mut runs = Vec::new();
        for config in self.configs.list_active()? {
            match periodicity::next_executions_within(&config, now, hours) {
                Ok(times) => runs.extend(times.into_iter().map(|at| UpcomingRun {
                    at,
                    configuration_id: config.id,
                    name: config.name.clone(),
                    scripts: config.script_ids.len(),
                })),
                Err(e) => warn!(config_id = config.id, error = %e, "skipping configuration"),
            }
        }
        runs.sort_by_key(|r| (r.at, r.configuration_id));
        Ok(runs)
    }

    /// Active configurations that missed at least one full interval.
    pub fn overdue(&self) -> Result<Vec<OverdueConfiguration>> {
        let now = self.clock.now();
        let mut overdue = Vec::new();
        for config in self.configs.list_active()? {
            let (late, delay) = match periodicity::is_overdue(&config, now) {
                Ok(v) => v,
                Err(e) => {
                    warn!(config_id = config.id, error = %e, "skipping configuration");
                    continue;
                }
            };
            if late {
                overdue.push(OverdueConfiguration {
                    configuration_id: config.id,
                    name: config.name.clone(),
                    expected_at: now - delay,
                    delay_secs: delay.num_seconds(),
                });
            }
        }
        overdue.sort_by_key(|o| std::cmp::Reverse(o.delay_secs));
        Ok(overdue)
    }
}

/// `1d 3h 12m`-style rendering for CLI output.
pub fn format_delay(d: Duration) -> String {
    let total = d.num_seconds().max(0);
    let (days, hours, minutes, seconds) =
        (total / 86_400, (total % 86_400) / 3600, (total % 3600) / 60, total % 60);
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if parts.is_empty() {
        parts.push(format!("{seconds}s"));
    }
    parts.join(" ")
}
