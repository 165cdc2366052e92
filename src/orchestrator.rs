//! Execution orchestrator -- takes one pending execution from claim to notification.
//!
//! The pipeline body runs in its own task. Whatever happens inside it (error
//! or panic) the execution still reaches a terminal status with `ended_at`
//! set, and the notifier is still called. Repository and log-store calls are
//! blocking and go through `spawn_blocking`.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::model::{
    Configuration, Execution, ExecutionId, ExecutionStatus, Project, ResultStatus, Script,
};
use crate::notify::{Notifier, NotifyError};
use crate::runner::ScriptRunner;
use crate::storage::{ConfigurationRepository, ExecutionStore, LogStore};
use crate::tracker::{TicketIssuer, TicketRequest, TrackerError};
use crate::truncate_chars;

/// Stdout excerpt placed at the top of a ticket description.
const TICKET_STDOUT_EXCERPT: usize = 2000;

/// Cumulative report text, shared with the pipeline task so a partial report
/// survives an abort.
#[derive(Clone, Default)]
struct Transcript(Arc<Mutex<String>>);

impl Transcript {
    fn push(&self, line: impl AsRef<str>) {
        let mut text = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(line.as_ref());
    }

    fn snapshot(&self) -> String {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Run a blocking storage call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.context("storage task panicked")?
}

/// What running one script produced.
struct ScriptRun {
    status: ResultStatus,
    exit_code: Option<i32>,
    stdout: String,
}

pub struct Orchestrator {
    configs: Arc<dyn ConfigurationRepository>,
    executions: Arc<dyn ExecutionStore>,
    logs: Arc<dyn LogStore>,
    runner: ScriptRunner,
    tickets: Arc<dyn TicketIssuer>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        configs: Arc<dyn ConfigurationRepository>,
        executions: Arc<dyn ExecutionStore>,
        logs: Arc<dyn LogStore>,
        runner: ScriptRunner,
        tickets: Arc<dyn TicketIssuer>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { configs, executions, logs, runner, tickets, notifier, clock }
    }

    /// Run a pending execution to completion.
    ///
    /// Returns `None` when the execution was not pending (already claimed,
    /// finished, or unknown). Delivering the same id twice is harmless.
    ///
    /// The notifier is called even when the outcome could not be persisted;
    /// that error is returned afterwards.
    pub async fn run(self: &Arc<Self>, execution_id: ExecutionId) -> Result<Option<ExecutionStatus>> {
        let started_at = self.clock.now();
        if !self.on_executions(move |s| s.claim(execution_id, started_at)).await? {
            debug!(execution_id, "execution not pending, nothing to do");
            return Ok(None);
        }
        info!(execution_id, "execution started");

        let transcript = Transcript::default();
        let this = Arc::clone(self);
        let shared = transcript.clone();
        let pipeline = tokio::spawn(async move { this.pipeline(execution_id, &shared).await });

        let status = match pipeline.await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                error!(execution_id, error = %format!("{e:#}"), "execution aborted");
                transcript.push(format!("\nExecution aborted: {e:#}"));
                ExecutionStatus::Error
            }
            Err(e) => {
                error!(execution_id, error = %e, "execution task failed");
                transcript.push(format!("\nExecution aborted: orchestration task failed: {e}"));
                ExecutionStatus::Error
            }
        };

        let report = transcript.snapshot();
        let concluded = self.conclude(execution_id, status, report.clone()).await;
        if let Err(e) = &concluded {
            error!(execution_id, %status, error = %format!("{e:#}"), "failed to record execution outcome");
        }
        if let Err(e) = self.notify(execution_id, status, &report).await {
            warn!(execution_id, error = %format!("{e:#}"), "notification step failed");
        }
        concluded?;
        Ok(Some(status))
    }

    /// Startup sweep. Executions left `running` by a dead process are forced
    /// to `error`; the ids of `pending` ones are returned for re-enqueueing.
    /// Blocks on storage I/O.
    pub fn recover(&self) -> Result<Vec<ExecutionId>> {
        let now = self.clock.now();
        for stale in self.executions.list_by_status(ExecutionStatus::Running)? {
            let mut report = stale.report.clone();
            if !report.is_empty() {
                report.push('\n');
            }
            report.push_str("Execution interrupted: the engine stopped while it was running.");
            match self.executions.finish(stale.id, ExecutionStatus::Error, now, &report, None) {
                Ok(()) => warn!(execution_id = stale.id, "interrupted execution marked as error"),
                Err(e) => error!(execution_id = stale.id, error = %e, "failed to close interrupted execution"),
            }
        }

        let pending: Vec<ExecutionId> = self
            .executions
            .list_by_status(ExecutionStatus::Pending)?
            .into_iter()
            .map(|e| e.id)
            .collect();
        if !pending.is_empty() {
            info!(count = pending.len(), "re-enqueueing pending executions");
        }
        Ok(pending)
    }

    async fn pipeline(&self, execution_id: ExecutionId, transcript: &Transcript) -> Result<ExecutionStatus> {
        let execution = self
            .on_executions(move |s| s.execution(execution_id))
            .await?
            .with_context(|| format!("execution {execution_id} not found"))?;
        let configuration_id = execution.configuration_id;
        let config = self
            .on_configs(move |c| c.configuration(configuration_id))
            .await?
            .with_context(|| format!("configuration {configuration_id} not found"))?;
        let project_id = config.project_id;
        let project = self.on_configs(move |c| c.project(project_id)).await?;

        let project_name = project.as_ref().map_or("unknown", |p| p.name.as_str());
        transcript.push(format!("=== Project: {project_name} ==="));

        let scripts = self.on_configs(move |c| c.scripts(configuration_id)).await?;
        if scripts.is_empty() {
            transcript.push("No scripts attached to this configuration.");
        }

        let script_ids: Vec<_> = scripts.iter().map(|s| s.id).collect();
        let results = self
            .on_executions(move |s| {
                script_ids
                    .into_iter()
                    .map(|script_id| s.create_result(execution_id, script_id, ResultStatus::Pending))
                    .collect::<Result<Vec<_>>>()
            })
            .await?;

        let mut failed = false;
        for (script, result) in scripts.iter().zip(&results) {
            let (run, log_key, comment) = self.run_script(execution_id, script, transcript).await;
            let (result_id, status) = (result.id, run.status);
            self.on_executions(move |s| s.update_result(result_id, status, log_key.as_deref(), &comment))
                .await?;

            if run.status == ResultStatus::Error {
                if !failed {
                    self.escalate(execution_id, &config, project.as_ref(), script, &run, transcript)
                        .await;
                }
                failed = true;
            }
        }

        Ok(if failed { ExecutionStatus::Error } else { ExecutionStatus::Done })
    }

    async fn run_script(
        &self,
        execution_id: ExecutionId,
        script: &Script,
        transcript: &Transcript,
    ) -> (ScriptRun, Option<String>, String) {
        transcript.push(format!("\nRunning script: {}", script.name));
        let path = self.runner.resolve(&script.path);

        let (run, log_text, comment) = match self.runner.run(&path, self.runner.timeout()).await {
            Ok(outcome) => {
                let (status, reason) = self.runner.classify(&outcome);
                if !outcome.stdout.trim().is_empty() {
                    transcript.push(outcome.stdout.trim_end());
                }
                let mut log_text = outcome.stdout.clone();
                if !outcome.stderr.trim().is_empty() {
                    transcript.push(format!("STDERR:\n{}", outcome.stderr.trim_end()));
                    log_text.push_str("\nSTDERR:\n");
                    log_text.push_str(&outcome.stderr);
                }
                let comment = match &reason {
                    Some(r) => {
                        transcript.push(format!("Script '{}' failed: {r}", script.name));
                        r.to_string()
                    }
                    None => "ok".to_string(),
                };
                info!(
                    execution_id,
                    script = %script.name,
                    status = status.as_str(),
                    exit_code = ?outcome.exit_code,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "script finished"
                );
                let run = ScriptRun { status, exit_code: outcome.exit_code, stdout: outcome.stdout };
                (run, log_text, comment)
            }
            Err(e) => {
                warn!(execution_id, script = %script.name, error = %e, "script could not be launched");
                transcript.push(format!("Script '{}' could not be launched: {e}", script.name));
                let run = ScriptRun { status: ResultStatus::Error, exit_code: None, stdout: String::new() };
                (run, e.to_string(), e.to_string())
            }
        };

        let script_id = script.id;
        let log_key = match self
            .on_logs(move |l| l.write_result_log(execution_id, script_id, &log_text))
            .await
        {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(execution_id, script_id = script.id, error = %format!("{e:#}"), "failed to write script log");
                None
            }
        };
        (run, log_key, comment)
    }

    async fn escalate(
        &self,
        execution_id: ExecutionId,
        config: &Configuration,
        project: Option<&Project>,
        script: &Script,
        run: &ScriptRun,
        transcript: &Transcript,
    ) {
        match self.open_ticket(config, project, script, run, &transcript.snapshot()).await {
            Ok(ticket_id) => {
                if let Err(e) = self
                    .on_executions(move |s| s.update_ticket(execution_id, ticket_id))
                    .await
                {
                    warn!(execution_id, ticket_id, error = %e, "failed to record ticket id");
                }
                transcript.push(format!("Tracker ticket created: #{ticket_id}"));
            }
            Err(e) => {
                warn!(execution_id, script = %script.name, error = %e, "ticket creation failed");
                transcript.push(format!("Tracker ticket creation failed: {e}"));
            }
        }
    }

    async fn open_ticket(
        &self,
        config: &Configuration,
        project: Option<&Project>,
        script: &Script,
        run: &ScriptRun,
        report: &str,
    ) -> Result<i64, TrackerError> {
        let project = project
            .ok_or_else(|| TrackerError::MissingProject(format!("#{}", config.project_id)))?;
        let external_id = project
            .tracker_project_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TrackerError::MissingProject(project.name.clone()))?;

        let exit_code = run.exit_code.map_or_else(|| "N/A".to_string(), |c| c.to_string());
        let description = format!(
            "Script '{}' failed with exit code {exit_code}.\n\n{}\n\nFull logs:\n{report}",
            script.name,
            truncate_chars(&run.stdout, TICKET_STDOUT_EXCERPT),
        );
        let request = TicketRequest {
            project_external_id: external_id.to_string(),
            subject: format!("Automated test failure - {}", script.name),
            description,
            priority: script.priority,
            assignee_id: project.tracker_assignee_id,
        };
        self.tickets.create_or_escalate(&request).await
    }

    async fn conclude(&self, execution_id: ExecutionId, status: ExecutionStatus, report: String) -> Result<()> {
        let text = report.clone();
        let log_key = match self.on_logs(move |l| l.write_execution_log(execution_id, &text)).await {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(execution_id, error = %format!("{e:#}"), "failed to write execution log");
                None
            }
        };
        let ended_at = self.clock.now();
        self.on_executions(move |s| s.finish(execution_id, status, ended_at, &report, log_key.as_deref()))
            .await
            .with_context(|| format!("Failed to record outcome of execution {execution_id}"))?;
        info!(execution_id, %status, "execution finished");
        Ok(())
    }

    /// Mail the outcome. If the terminal transition did not make it to the
    /// store, the in-memory `status` and `report` are sent instead.
    async fn notify(&self, execution_id: ExecutionId, status: ExecutionStatus, report: &str) -> Result<()> {
        let stored = self
            .on_executions(move |s| s.execution(execution_id))
            .await?
            .with_context(|| format!("execution {execution_id} not found"))?;
        let execution = if stored.status.is_terminal() {
            stored
        } else {
            Execution {
                status,
                ended_at: Some(self.clock.now()),
                report: report.to_string(),
                ..stored
            }
        };

        let configuration_id = execution.configuration_id;
        let (name, recipients) = self
            .on_configs(move |c| {
                let name = c
                    .configuration(configuration_id)?
                    .map(|c| c.name)
                    .unwrap_or_else(|| format!("configuration #{configuration_id}"));
                Ok((name, c.active_recipients(configuration_id)?))
            })
            .await?;

        match self.notifier.notify(&execution, &name, &recipients).await {
            Ok(()) => {}
            Err(NotifyError::NotConfigured) => {
                info!(execution_id, "SMTP not configured, notification skipped");
            }
            Err(e) => {
                warn!(execution_id, error = %e, "notification failed");
                let line = format!("Notification failed: {e}");
                self.on_executions(move |s| s.annotate(execution_id, &line)).await?;
            }
        }
        Ok(())
    }

    async fn on_executions<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ExecutionStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.executions);
        blocking(move || f(store.as_ref())).await
    }

    async fn on_configs<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ConfigurationRepository) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let repo = Arc::clone(&self.configs);
        blocking(move || f(repo.as_ref())).await
    }

    async fn on_logs<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn LogStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let logs = Arc::clone(&self.logs);
        blocking(move || f(logs.as_ref())).await
    }
}
