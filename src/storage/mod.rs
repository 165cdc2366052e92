//! SQLite storage layer -- schema, repositories, log blobs.

pub mod logs;
pub mod schema;
mod store;

use anyhow::Result;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::model::{
    Configuration, ConfigurationId, Execution, ExecutionId, ExecutionResult, ExecutionStatus,
    Project, ProjectId, ResultId, ResultStatus, Script, ScriptId,
};

pub use self::logs::{FsLogStore, LogStore};
pub use self::store::{NewConfiguration, SqliteStore};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA temp_store = MEMORY;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let manager = SqliteConnectionManager::file(path).with_init(|c| c.execute_batch(PRAGMAS));
    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// A private in-memory database shared by every pooled connection.
///
/// Each call yields a distinct database.
pub fn open_memory_pool() -> Result<Pool> {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static NEXT: AtomicUsize = AtomicUsize::new(0);

    let name = format!(
        "file:snapflow-mem-{}-{}?mode=memory&cache=shared",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    );
    let manager = SqliteConnectionManager::file(name)
        .with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )
        .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;"));
    // A single long-lived connection: the database disappears with its last
    // connection, and shared-cache table locks do not honour busy_timeout.
    let pool = R2D2Pool::builder()
        .max_size(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .build(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

/// Read side of the configuration records plus the one field the scheduler owns.
pub trait ConfigurationRepository: Send + Sync {
    /// Configurations with the active flag set. Window filtering is the caller's job.
    fn list_active(&self) -> Result<Vec<Configuration>>;
    fn configuration(&self, id: ConfigurationId) -> Result<Option<Configuration>>;
    fn update_last_execution(&self, id: ConfigurationId, at: DateTime<Utc>) -> Result<()>;
    /// Scripts of a configuration in their configured order.
    fn scripts(&self, id: ConfigurationId) -> Result<Vec<Script>>;
    fn active_recipients(&self, id: ConfigurationId) -> Result<Vec<String>>;
    fn project(&self, id: ProjectId) -> Result<Option<Project>>;
}

/// Execution and per-script result records.
pub trait ExecutionStore: Send + Sync {
    fn create(&self, configuration_id: ConfigurationId, status: ExecutionStatus) -> Result<Execution>;

    /// Create an execution and move the configuration's `last_execution` to
    /// `at` in one transaction.
    ///
    /// `observed` is the `last_execution` the decision was made from. If the
    /// stored value no longer matches, another pass got there first: nothing
    /// is written and `None` is returned.
    fn create_scheduled(
        &self,
        configuration_id: ConfigurationId,
        status: ExecutionStatus,
        at: DateTime<Utc>,
        observed: Option<DateTime<Utc>>,
    ) -> Result<Option<Execution>>;

    fn execution(&self, id: ExecutionId) -> Result<Option<Execution>>;
    fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<Execution>>;

    /// `pending -> running`. Returns false if the execution was not pending.
    fn claim(&self, id: ExecutionId, started_at: DateTime<Utc>) -> Result<bool>;

    /// Move a pending or running execution to a terminal status.
    fn finish(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        ended_at: DateTime<Utc>,
        report: &str,
        log_path: Option<&str>,
    ) -> Result<()>;

    fn update_ticket(&self, id: ExecutionId, ticket_id: i64) -> Result<()>;

    /// Append a line to the stored report. Allowed after the terminal
    /// transition; the status is left alone.
    fn annotate(&self, id: ExecutionId, line: &str) -> Result<()>;

    fn create_result(
        &self,
        execution_id: ExecutionId,
        script_id: ScriptId,
        status: ResultStatus,
    ) -> Result<ExecutionResult>;

    fn update_result(
        &self,
        id: ResultId,
        status: ResultStatus,
        log_path: Option<&str>,
        comment: &str,
    ) -> Result<()>;

    fn results(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionResult>>;
}

pub(crate) fn to_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

pub(crate) fn from_db_time(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            })
    })
    .transpose()
}
