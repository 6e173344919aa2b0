//! Draft repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::Draft;

/// Trait for draft storage operations
pub trait DraftRepository {
    /// Save a draft, overwriting any previous one under the same key
    fn save(&self, draft: &Draft) -> Result<()>;

    /// Load a draft by key
    fn load(&self, key: &str) -> Result<Option<Draft>>;

    /// Remove a draft; returns whether one existed
    fn clear(&self, key: &str) -> Result<bool>;

    /// List drafts whose key starts with `prefix`, most recent first
    fn list(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<Draft>>;
}

/// `SQLite` implementation of `DraftRepository`
pub struct SqliteDraftRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteDraftRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

fn parse_draft(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode((key, payload, updated_at): (String, String, i64)) -> Result<Draft> {
    let payload = serde_json::from_str(&payload).map_err(|error| Error::Corrupt {
        local_id: key.clone(),
        message: format!("draft payload: {error}"),
    })?;
    Ok(Draft {
        key,
        payload,
        updated_at,
    })
}

impl DraftRepository for SqliteDraftRepository<'_> {
    fn save(&self, draft: &Draft) -> Result<()> {
        self.conn.execute(
            "INSERT INTO drafts (key, payload, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload,
                                            updated_at = excluded.updated_at",
            params![
                draft.key,
                serde_json::to_string(&draft.payload)?,
                draft.updated_at
            ],
        )?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Draft>> {
        let raw = self
            .conn
            .query_row(
                "SELECT key, payload, updated_at FROM drafts WHERE key = ?",
                params![key],
                parse_draft,
            )
            .optional()?;
        raw.map(decode).transpose()
    }

    fn clear(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM drafts WHERE key = ?", params![key])?;
        Ok(rows > 0)
    }

    fn list(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<Draft>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, payload, updated_at FROM drafts
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY updated_at DESC, key ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![prefix.unwrap_or(""), limit as i64], parse_draft)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut drafts = Vec::with_capacity(rows.len());
        for raw in rows {
            match decode(raw) {
                Ok(draft) => drafts.push(draft),
                Err(error) => tracing::warn!("Skipping undecodable draft: {}", error),
            }
        }
        Ok(drafts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn draft(key: &str, payload: serde_json::Value, updated_at: i64) -> Draft {
        Draft {
            key: key.to_string(),
            payload,
            updated_at,
        }
    }

    #[test]
    fn test_save_overwrites_and_load_returns_latest() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteDraftRepository::new(db.connection());

        repo.save(&draft("panel-wizard/1", json!({"step": 1}), 10))
            .unwrap();
        repo.save(&draft("panel-wizard/1", json!({"step": 2, "rows": 4}), 20))
            .unwrap();

        let loaded = repo.load("panel-wizard/1").unwrap().unwrap();
        assert_eq!(loaded.payload, json!({"step": 2, "rows": 4}));
        assert_eq!(loaded.updated_at, 20);
        assert!(repo.load("panel-wizard/2").unwrap().is_none());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteDraftRepository::new(db.connection());

        repo.save(&draft("inspection/a", json!({}), 1)).unwrap();
        assert!(repo.clear("inspection/a").unwrap());
        assert!(!repo.clear("inspection/a").unwrap());
    }

    #[test]
    fn test_list_filters_by_literal_prefix() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteDraftRepository::new(db.connection());

        repo.save(&draft("panel-wizard/1", json!({}), 1)).unwrap();
        repo.save(&draft("panel-wizard/2", json!({}), 3)).unwrap();
        repo.save(&draft("panel_wizard/3", json!({}), 2)).unwrap();

        let keys = repo
            .list(Some("panel-wizard/"), 10)
            .unwrap()
            .into_iter()
            .map(|d| d.key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["panel-wizard/2", "panel-wizard/1"]);
        assert_eq!(repo.list(None, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_corrupt_draft_is_reported_on_load() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute(
                "INSERT INTO drafts (key, payload, updated_at) VALUES ('bad', '{not json', 1)",
                [],
            )
            .unwrap();
        let repo = SqliteDraftRepository::new(db.connection());

        assert!(matches!(repo.load("bad"), Err(Error::Corrupt { .. })));
        assert!(repo.list(None, 10).unwrap().is_empty());
    }
}
