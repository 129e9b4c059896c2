//! Version-tracked schema migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS workunits (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            create_time INTEGER NOT NULL,
            name TEXT NOT NULL,
            appid INTEGER NOT NULL,
            error_mask INTEGER NOT NULL DEFAULT 0,
            assimilate_state INTEGER NOT NULL DEFAULT 0,
            file_delete_state INTEGER NOT NULL DEFAULT 0,
            canonical_resultid INTEGER NOT NULL DEFAULT 0,
            need_validate INTEGER NOT NULL DEFAULT 0,
            min_quorum INTEGER NOT NULL,
            target_nresults INTEGER NOT NULL,
            max_error_results INTEGER NOT NULL,
            max_total_results INTEGER NOT NULL,
            max_success_results INTEGER NOT NULL,
            transition_time INTEGER NOT NULL,
            delay_bound INTEGER NOT NULL,
            hr_class INTEGER NOT NULL DEFAULT 0,
            app_version_id INTEGER NOT NULL DEFAULT 0,
            batch INTEGER NOT NULL DEFAULT 0,
            transitioner_flags INTEGER NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 0,
            xml_doc TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_wu_transition ON workunits(transition_time);
        CREATE INDEX IF NOT EXISTS idx_wu_assimilate ON workunits(assimilate_state, appid);
        CREATE INDEX IF NOT EXISTS idx_wu_file_delete ON workunits(file_delete_state);

        CREATE TABLE IF NOT EXISTS results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            create_time INTEGER NOT NULL,
            workunitid INTEGER NOT NULL,
            name TEXT NOT NULL,
            server_state INTEGER NOT NULL,
            outcome INTEGER NOT NULL DEFAULT 0,
            validate_state INTEGER NOT NULL DEFAULT 0,
            file_delete_state INTEGER NOT NULL DEFAULT 0,
            report_deadline INTEGER NOT NULL DEFAULT 0,
            received_time INTEGER NOT NULL DEFAULT 0,
            sent_time INTEGER NOT NULL DEFAULT 0,
            appid INTEGER NOT NULL,
            hostid INTEGER NOT NULL DEFAULT 0,
            userid INTEGER NOT NULL DEFAULT 0,
            app_version_id INTEGER NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 0,
            exit_status INTEGER NOT NULL DEFAULT 0,
            xml_doc_in TEXT NOT NULL DEFAULT '',
            xml_doc_out TEXT NOT NULL DEFAULT '',
            stderr_out TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_results_wu ON results(workunitid);
        CREATE INDEX IF NOT EXISTS idx_results_file_delete ON results(file_delete_state);
        CREATE INDEX IF NOT EXISTS idx_results_unsent ON results(server_state, userid);

        CREATE TABLE IF NOT EXISTS batches (
            id INTEGER PRIMARY KEY,
            state INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS apps (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS host_app_versions (
            host_id INTEGER NOT NULL,
            app_version_id INTEGER NOT NULL,
            max_jobs_per_day INTEGER NOT NULL DEFAULT 100,
            consecutive_valid INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (host_id, app_version_id)
        );
    "#,
}];

/// Run all migrations not yet applied.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;
    let current: i64 = match rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?
    {
        Some(row) => row.get(0).unwrap_or(0),
        None => 0,
    };

    for m in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(m.sql)
            .await
            .map_err(|e| StoreError::Migration(format!("Migration {} failed: {e}", m.name)))?;
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![m.version, m.name],
        )
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to record migration: {e}")))?;
        tracing::info!(version = m.version, name = m.name, "Applied migration");
    }

    Ok(())
}
