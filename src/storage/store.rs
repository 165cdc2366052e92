//! SQLite implementation of the configuration repository and execution store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use super::{from_db_time, to_db_time, ConfigurationRepository, ExecutionStore, Pool};
use crate::model::{
    Configuration, ConfigurationId, Execution, ExecutionId, ExecutionResult, ExecutionStatus,
    Project, ProjectId, Recipient, ResultId, ResultStatus, Script, ScriptId,
};

const EXECUTION_COLUMNS: &str =
    "id, configuration_id, status, started_at, ended_at, report, log_path, ticket_id";
const CONFIGURATION_COLUMNS: &str = "id, tenant_id, project_id, name, periodicity, is_active, \
     activation_at, deactivation_at, last_execution";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

/// Fields of a configuration as written by the administrative layer.
#[derive(Debug, Clone)]
pub struct NewConfiguration {
    pub tenant_id: i64,
    pub project_id: ProjectId,
    pub name: String,
    pub periodicity: String,
    pub is_active: bool,
    pub activation_at: Option<DateTime<Utc>>,
    pub deactivation_at: Option<DateTime<Utc>>,
    pub last_execution: Option<DateTime<Utc>>,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    // Administrative writes. The engine itself never calls these; they back
    // fixtures and imports.

    pub fn insert_project(
        &self,
        name: &str,
        tracker_project_id: Option<&str>,
        tracker_assignee_id: Option<i64>,
    ) -> Result<ProjectId> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO projects (name, tracker_project_id, tracker_assignee_id) VALUES (?1, ?2, ?3)",
            params![name, tracker_project_id, tracker_assignee_id],
        )
        .context("Failed to insert project")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_script(&self, name: &str, path: &str, priority: u8) -> Result<ScriptId> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO scripts (name, path, priority) VALUES (?1, ?2, ?3)",
            params![name, path, priority],
        )
        .context("Failed to insert script")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_configuration(&self, new: &NewConfiguration) -> Result<ConfigurationId> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO configurations
                (tenant_id, project_id, name, periodicity, is_active, activation_at, deactivation_at, last_execution)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.tenant_id,
                new.project_id,
                new.name,
                new.periodicity,
                new.is_active,
                new.activation_at.map(to_db_time),
                new.deactivation_at.map(to_db_time),
                new.last_execution.map(to_db_time),
            ],
        )
        .context("Failed to insert configuration")?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a script to the end of a configuration's run order.
    pub fn attach_script(&self, configuration_id: ConfigurationId, script_id: ScriptId) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO configuration_scripts (configuration_id, script_id, position)
             SELECT ?1, ?2, COALESCE(MAX(position) + 1, 0)
             FROM configuration_scripts WHERE configuration_id = ?1",
            params![configuration_id, script_id],
        )
        .context("Failed to attach script")?;
        Ok(())
    }

    pub fn add_recipient(
        &self,
        configuration_id: ConfigurationId,
        email: &str,
        is_active: bool,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO recipients (configuration_id, email, is_active) VALUES (?1, ?2, ?3)",
            params![configuration_id, email, is_active],
        )
        .context("Failed to insert recipient")?;
        Ok(())
    }

    fn load_configuration(conn: &Connection, row: &Row<'_>) -> rusqlite::Result<Configuration> {
        let id: ConfigurationId = row.get(0)?;

        let mut scripts = conn.prepare_cached(
            "SELECT script_id FROM configuration_scripts WHERE configuration_id = ?1 ORDER BY position, script_id",
        )?;
        let script_ids = scripts
            .query_map([id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<ScriptId>>>()?;

        let mut recipients = conn.prepare_cached(
            "SELECT email, is_active FROM recipients WHERE configuration_id = ?1 ORDER BY id",
        )?;
        let recipients = recipients
            .query_map([id], |r| {
                Ok(Recipient { email: r.get(0)?, is_active: r.get(1)? })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Configuration {
            id,
            tenant_id: row.get(1)?,
            project_id: row.get(2)?,
            name: row.get(3)?,
            periodicity: row.get(4)?,
            is_active: row.get(5)?,
            activation_at: from_db_time(row.get(6)?)?,
            deactivation_at: from_db_time(row.get(7)?)?,
            last_execution: from_db_time(row.get(8)?)?,
            script_ids,
            recipients,
        })
    }
}

fn parse_status<T: std::str::FromStr>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    Ok(Execution {
        id: row.get(0)?,
        configuration_id: row.get(1)?,
        status: parse_status(2, row.get(2)?)?,
        started_at: from_db_time(row.get(3)?)?,
        ended_at: from_db_time(row.get(4)?)?,
        report: row.get(5)?,
        log_path: row.get(6)?,
        ticket_id: row.get(7)?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionResult> {
    Ok(ExecutionResult {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        script_id: row.get(2)?,
        status: parse_status(3, row.get(3)?)?,
        log_path: row.get(4)?,
        comment: row.get(5)?,
    })
}

fn insert_execution(
    conn: &Connection,
    configuration_id: ConfigurationId,
    status: ExecutionStatus,
) -> Result<Execution> {
    conn.execute(
        "INSERT INTO executions (configuration_id, status) VALUES (?1, ?2)",
        params![configuration_id, status.as_str()],
    )
    .context("Failed to insert execution")?;
    Ok(Execution {
        id: conn.last_insert_rowid(),
        configuration_id,
        status,
        started_at: None,
        ended_at: None,
        report: String::new(),
        log_path: None,
        ticket_id: None,
    })
}

impl ConfigurationRepository for SqliteStore {
    fn list_active(&self) -> Result<Vec<Configuration>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFIGURATION_COLUMNS} FROM configurations WHERE is_active = 1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], |row| Self::load_configuration(&conn, row))?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    fn configuration(&self, id: ConfigurationId) -> Result<Option<Configuration>> {
        let conn = self.pool.get()?;
        let config = conn
            .query_row(
                &format!("SELECT {CONFIGURATION_COLUMNS} FROM configurations WHERE id = ?1"),
                [id],
                |row| Self::load_configuration(&conn, row),
            )
            .optional()?;
        Ok(config)
    }

    fn update_last_execution(&self, id: ConfigurationId, at: DateTime<Utc>) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE configurations SET last_execution = ?1 WHERE id = ?2",
            params![to_db_time(at), id],
        )?;
        if changed == 0 {
            anyhow::bail!("Configuration {} not found", id);
        }
        Ok(())
    }

    fn scripts(&self, id: ConfigurationId) -> Result<Vec<Script>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.name, s.path, s.priority
             FROM configuration_scripts cs JOIN scripts s ON s.id = cs.script_id
             WHERE cs.configuration_id = ?1
             ORDER BY cs.position, s.id",
        )?;
        let scripts = stmt
            .query_map([id], |row| {
                Ok(Script {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    path: row.get(2)?,
                    priority: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(scripts)
    }

    fn active_recipients(&self, id: ConfigurationId) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT email FROM recipients WHERE configuration_id = ?1 AND is_active = 1 ORDER BY id",
        )?;
        let emails = stmt
            .query_map([id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(emails)
    }

    fn project(&self, id: ProjectId) -> Result<Option<Project>> {
        let conn = self.pool.get()?;
        let project = conn
            .query_row(
                "SELECT id, name, tracker_project_id, tracker_assignee_id FROM projects WHERE id = ?1",
                [id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        tracker_project_id: row.get(2)?,
                        tracker_assignee_id: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(project)
    }
}

impl ExecutionStore for SqliteStore {
    fn create(&self, configuration_id: ConfigurationId, status: ExecutionStatus) -> Result<Execution> {
        let conn = self.pool.get()?;
        insert_execution(&conn, configuration_id, status)
    }

    fn create_scheduled(
        &self,
        configuration_id: ConfigurationId,
        status: ExecutionStatus,
        at: DateTime<Utc>,
        observed: Option<DateTime<Utc>>,
    ) -> Result<Option<Execution>> {
        let mut conn = self.pool.get()?;
        // IMMEDIATE takes the write lock before the read, so the compare and
        // the update cannot interleave with another scheduler.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(current) = tx
            .query_row(
                "SELECT last_execution FROM configurations WHERE id = ?1",
                [configuration_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
        else {
            anyhow::bail!("Configuration {} not found", configuration_id);
        };
        let current = from_db_time(current)?;
        if current != observed {
            debug!(
                configuration_id,
                ?observed,
                ?current,
                "last_execution moved since it was read, leaving the decision to the other pass"
            );
            return Ok(None);
        }

        tx.execute(
            "UPDATE configurations SET last_execution = ?1 WHERE id = ?2",
            params![to_db_time(at), configuration_id],
        )?;
        let execution = insert_execution(&tx, configuration_id, status)?;
        tx.commit().context("Failed to commit scheduling decision")?;
        Ok(Some(execution))
    }

    fn execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let conn = self.pool.get()?;
        let execution = conn
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
                [id],
                execution_from_row,
            )
            .optional()?;
        Ok(execution)
    }

    fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<Execution>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE status = ?1 ORDER BY id"
        ))?;
        let list = stmt
            .query_map([status.as_str()], execution_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(list)
    }

    fn claim(&self, id: ExecutionId, started_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE executions SET status = 'running', started_at = ?1 WHERE id = ?2 AND status = 'pending'",
            params![to_db_time(started_at), id],
        )?;
        Ok(changed == 1)
    }

    fn finish(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        ended_at: DateTime<Utc>,
        report: &str,
        log_path: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            anyhow::bail!("cannot finish execution {} with non-terminal status {}", id, status);
        }
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE executions SET status = ?1, ended_at = ?2, report = ?3, log_path = COALESCE(?4, log_path)
             WHERE id = ?5 AND status IN ('pending', 'running')",
            params![status.as_str(), to_db_time(ended_at), report, log_path, id],
        )?;
        if changed == 0 {
            anyhow::bail!("Execution {} not found or already finished", id);
        }
        Ok(())
    }

    fn update_ticket(&self, id: ExecutionId, ticket_id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE executions SET ticket_id = ?1 WHERE id = ?2",
            params![ticket_id, id],
        )?;
        if changed == 0 {
            anyhow::bail!("Execution {} not found", id);
        }
        Ok(())
    }

    fn annotate(&self, id: ExecutionId, line: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE executions SET report = CASE WHEN COALESCE(report, '') = '' THEN ?1
                                                 ELSE report || char(10) || ?1 END
             WHERE id = ?2",
            params![line, id],
        )?;
        if changed == 0 {
            anyhow::bail!("Execution {} not found", id);
        }
        Ok(())
    }

    fn create_result(
        &self,
        execution_id: ExecutionId,
        script_id: ScriptId,
        status: ResultStatus,
    ) -> Result<ExecutionResult> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO execution_results (execution_id, script_id, status) VALUES (?1, ?2, ?3)",
            params![execution_id, script_id, status.as_str()],
        )
        .context("Failed to insert execution result")?;
        Ok(ExecutionResult {
            id: conn.last_insert_rowid(),
            execution_id,
            script_id,
            status,
            log_path: None,
            comment: String::new(),
        })
    }

    fn update_result(
        &self,
        id: ResultId,
        status: ResultStatus,
        log_path: Option<&str>,
        comment: &str,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE execution_results SET status = ?1, log_path = COALESCE(?2, log_path), comment = ?3
             WHERE id = ?4 AND status IN ('pending', 'running')",
            params![status.as_str(), log_path, comment, id],
        )?;
        if changed == 0 {
            anyhow::bail!("Execution result {} not found or already final", id);
        }
        Ok(())
    }

    fn results(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionResult>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, execution_id, script_id, status, log_path, comment
             FROM execution_results WHERE execution_id = ?1 ORDER BY id",
        )?;
        let list = stmt
            .query_map([execution_id], result_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(list)
    }
}
