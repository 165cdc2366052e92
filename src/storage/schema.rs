//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            tracker_project_id TEXT,
            tracker_assignee_id INTEGER
        );

        CREATE TABLE IF NOT EXISTS scripts (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 2 CHECK (priority BETWEEN 1 AND 5)
        );

        CREATE TABLE IF NOT EXISTS configurations (
            id INTEGER PRIMARY KEY,
            tenant_id INTEGER NOT NULL,
            project_id INTEGER NOT NULL REFERENCES projects(id),
            name TEXT NOT NULL,
            periodicity TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            activation_at TEXT,
            deactivation_at TEXT,
            last_execution TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS configuration_scripts (
            configuration_id INTEGER NOT NULL REFERENCES configurations(id) ON DELETE CASCADE,
            script_id INTEGER NOT NULL REFERENCES scripts(id) ON DELETE CASCADE,
            position INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (configuration_id, script_id)
        );

        CREATE TABLE IF NOT EXISTS recipients (
            id INTEGER PRIMARY KEY,
            configuration_id INTEGER NOT NULL REFERENCES configurations(id) ON DELETE CASCADE,
            email TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS executions (
            id INTEGER PRIMARY KEY,
            configuration_id INTEGER NOT NULL REFERENCES configurations(id),
            status TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT,
            report TEXT NOT NULL DEFAULT '',
            log_path TEXT,
            ticket_id INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS execution_results (
            id INTEGER PRIMARY KEY,
            execution_id INTEGER NOT NULL REFERENCES executions(id),
            script_id INTEGER NOT NULL REFERENCES scripts(id),
            status TEXT NOT NULL,
            log_path TEXT,
            comment TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_configurations_active ON configurations(is_active);
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
        CREATE INDEX IF NOT EXISTS idx_executions_configuration ON executions(configuration_id);
        CREATE INDEX IF NOT EXISTS idx_results_execution ON execution_results(execution_id);",
    )?;

    // Older databases stored the free-text status labels; fold them onto the
    // canonical values once.
    conn.execute_batch(
        "UPDATE executions SET status = 'done' WHERE status IN ('success', 'succès', 'concluant');
         UPDATE executions SET status = 'error' WHERE status IN ('failure', 'échec', 'non_concluant');
         UPDATE execution_results SET status = 'done' WHERE status IN ('success', 'succès', 'concluant');
         UPDATE execution_results SET status = 'error' WHERE status IN ('failure', 'échec', 'non_concluant');",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["configurations", "executions", "execution_results", "scripts"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table}");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }

    #[test]
    fn test_migrate_normalizes_legacy_labels() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO projects (id, name) VALUES (1, 'p');
             INSERT INTO configurations (id, tenant_id, project_id, name, periodicity) VALUES (1, 1, 1, 'c', '2h');
             INSERT INTO executions (configuration_id, status) VALUES (1, 'succès');",
        )
        .unwrap();
        migrate(&conn).unwrap();
        let status: String = conn
            .query_row("SELECT status FROM executions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(status, "done");
    }
}
