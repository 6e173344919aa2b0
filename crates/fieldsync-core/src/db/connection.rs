//! Database connection management

use crate::error::Result;
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::time::Duration;

use super::migrations;

/// Database wrapper for the on-device `SQLite` store
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut database = Self { conn };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut database = Self { conn };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Configure `SQLite` for durability under crashes
    fn configure(&self) -> Result<()> {
        // journal_mode reports "memory" for in-memory databases, which is fine
        let _mode: String =
            self.conn
                .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        self.conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        self.conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&mut self) -> Result<()> {
        migrations::run(&mut self.conn)
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Begin a write transaction spanning several repositories
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        let value: i64 = db
            .connection()
            .query_row("SELECT 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_open_file_creates_schema_and_reopens() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("fieldsync.db");

        {
            let db = Database::open(&path).unwrap();
            db.connection()
                .execute(
                    "INSERT INTO drafts (key, payload, updated_at) VALUES ('k', '{}', 1)",
                    [],
                )
                .unwrap();
        }

        let reopened = Database::open(&path).unwrap();
        let count: i64 = reopened
            .connection()
            .query_row("SELECT COUNT(*) FROM drafts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_drop() {
        let mut db = Database::open_in_memory().unwrap();
        {
            let tx = db.transaction().unwrap();
            tx.execute(
                "INSERT INTO drafts (key, payload, updated_at) VALUES ('k', '{}', 1)",
                [],
            )
            .unwrap();
        }
        let count: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM drafts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
