//! Database migrations for treemirror

use rusqlite::{params, Connection};

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Mapping store (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS mirror_mapping (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mapping_type TEXT NOT NULL,
            source_id INTEGER NOT NULL,
            remote_id TEXT,
            last_update TEXT NOT NULL
        );

        -- The concurrency primitive: one claim per source entity
        CREATE UNIQUE INDEX IF NOT EXISTS idx_mapping_type_source
            ON mirror_mapping(mapping_type, source_id);
        "#,
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?)",
        params![1],
    )?;

    Ok(())
}

/// Task queue and task locks (v2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS task_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_name TEXT NOT NULL,
            args TEXT NOT NULL,
            dedup_key TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retries INTEGER NOT NULL DEFAULT 0,
            not_before_ms INTEGER NOT NULL,
            enqueued_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            worker TEXT,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_task_queue_ready
            ON task_queue(status, not_before_ms, id);
        CREATE INDEX IF NOT EXISTS idx_task_queue_dedup
            ON task_queue(dedup_key, status);

        CREATE TABLE IF NOT EXISTS task_locks (
            lock_key TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );
        "#,
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?)",
        params![2],
    )?;

    Ok(())
}
