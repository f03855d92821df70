//! Task memory tables with versioned migrations

use rusqlite::Connection;
use tracing::{info, warn};

/// Current schema version
pub(crate) const SCHEMA_VERSION: i32 = 2;

/// Get the current schema version from database
pub(crate) fn get_schema_version(conn: &Connection) -> i32 {
    // Create version table if it doesn't exist
    if let Err(e) = conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    ) {
        warn!("Failed to create schema_version table: {}", e);
        return 0;
    }

    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

fn set_schema_version(conn: &Connection, version: i32) -> rusqlite::Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Run migrations incrementally; returns true if anything was applied
pub(crate) fn run_migrations(conn: &Connection) -> rusqlite::Result<bool> {
    let current_version = get_schema_version(conn);
    if current_version >= SCHEMA_VERSION {
        return Ok(false);
    }
    info!(
        "Task memory schema version: {} (target: {})",
        current_version, SCHEMA_VERSION
    );

    // Migration 1: Task records
    if current_version < 1 {
        info!("Running migration 1: task_memory table");
        conn.execute_batch(
            r#"
            -- One row per (task_hash, session_id); re-recording replaces the row
            CREATE TABLE IF NOT EXISTS task_memory (
                id TEXT NOT NULL,
                task_hash TEXT NOT NULL,
                task_type TEXT NOT NULL,
                input TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '',
                output TEXT NOT NULL DEFAULT '',
                success INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                session_id TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (task_hash, session_id)
            );

            -- Cross-session duplicate lookup: newest record for a hash
            CREATE INDEX IF NOT EXISTS idx_task_memory_hash_time
                ON task_memory(task_hash, timestamp DESC);

            -- Retention cleanup
            CREATE INDEX IF NOT EXISTS idx_task_memory_timestamp
                ON task_memory(timestamp);
            "#,
        )?;
        set_schema_version(conn, 1)?;
    }

    // Migration 2: Habits
    if current_version < 2 {
        info!("Running migration 2: user_habits table");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS user_habits (
                id TEXT PRIMARY KEY,
                pattern TEXT NOT NULL,
                frequency INTEGER NOT NULL DEFAULT 1,
                last_used INTEGER NOT NULL,
                success_rate REAL NOT NULL DEFAULT 0,
                suggested_actions TEXT NOT NULL DEFAULT '[]',
                context TEXT NOT NULL DEFAULT ''
            );

            -- Startup load is most-recently-used first
            CREATE INDEX IF NOT EXISTS idx_user_habits_last_used
                ON user_habits(last_used DESC);
            "#,
        )?;
        set_schema_version(conn, 2)?;
    }

    info!("Migrations complete");
    Ok(true)
}
