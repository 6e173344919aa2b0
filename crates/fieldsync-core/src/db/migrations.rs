//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|value| value != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: entity rows and the outbox
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS entities (
            local_id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            parent_local_id TEXT,
            remote_id TEXT,
            payload TEXT NOT NULL,
            sync_state TEXT NOT NULL,
            local_version INTEGER NOT NULL,
            remote_version INTEGER,
            remote_updated_at INTEGER,
            base_payload TEXT,
            conflict_remote TEXT,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type, updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_entities_state ON entities(sync_state);
        CREATE INDEX IF NOT EXISTS idx_entities_parent ON entities(parent_local_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_remote
            ON entities(entity_type, remote_id) WHERE remote_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS outbox (
            local_id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT,
            local_version INTEGER NOT NULL,
            enqueued_at INTEGER NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            last_backoff_ms INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            status TEXT NOT NULL DEFAULT 'PENDING',
            in_flight INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_outbox_order ON outbox(enqueued_at, local_id);
        CREATE INDEX IF NOT EXISTS idx_outbox_ready ON outbox(status, next_attempt_at);

        INSERT INTO schema_version (version) VALUES (1);",
    )?;

    tx.commit()?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: form drafts and pull cursors
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS drafts (
            key TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_cursors (
            entity_type TEXT PRIMARY KEY,
            since INTEGER NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);",
    )?;

    tx.commit()?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
            [name],
            |row| row.get::<_, i32>(0),
        )
        .unwrap()
            != 0
    }

    #[test]
    fn test_migrations() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_create_sync_tables() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        for table in ["entities", "outbox", "drafts", "sync_cursors"] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }
}
