//! Entity row repository (the Local Store tables)

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{EntityRecord, LocalId, Payload, RemoteRecord, SyncState};

const ENTITY_COLUMNS: &str = "local_id, entity_type, parent_local_id, remote_id, payload, \
     sync_state, local_version, remote_version, remote_updated_at, base_payload, \
     conflict_remote, last_error, created_at, updated_at";

/// Trait for entity row storage operations
pub trait EntityRepository {
    /// Insert a new row
    fn insert(&self, record: &EntityRecord) -> Result<()>;

    /// Get a row by local ID
    fn get(&self, local_id: &LocalId) -> Result<Option<EntityRecord>>;

    /// Get a row by its remote identity
    fn get_by_remote_id(&self, entity_type: &str, remote_id: &str)
        -> Result<Option<EntityRecord>>;

    /// List rows, most recently written first; undecodable rows are skipped
    fn list(&self, entity_type: Option<&str>, limit: usize, offset: usize)
        -> Result<Vec<EntityRecord>>;

    /// List rows in the given sync state
    fn list_by_state(&self, state: SyncState) -> Result<Vec<EntityRecord>>;

    /// List local IDs starting with the given prefix
    fn list_ids_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;

    /// Overwrite a row if its `local_version` still equals `expected_version`
    fn compare_and_swap(&self, record: &EntityRecord, expected_version: i64) -> Result<bool>;

    /// Remove a row
    fn delete(&self, local_id: &LocalId) -> Result<bool>;

    /// Read only the sync state of a row
    fn sync_state(&self, local_id: &LocalId) -> Result<Option<SyncState>>;

    /// Rows whose state implies a pending mutation but that have no descriptor
    fn find_orphans(&self) -> Result<Vec<EntityRecord>>;

    /// Rows that fail to decode, as `(local_id, error)` pairs
    fn scan_corrupt(&self) -> Result<Vec<(String, String)>>;

    /// Move a row to `CONFLICT`, keeping the diagnostic verbatim and resetting
    /// any column that no longer decodes
    fn quarantine(&self, local_id: &str, error: &str, now: i64) -> Result<bool>;

    /// Count rows in the given state
    fn count_by_state(&self, state: SyncState) -> Result<usize>;

    /// Last `updated_at` seen by the pull phase for an entity type
    fn pull_cursor(&self, entity_type: &str) -> Result<Option<i64>>;

    /// Persist the pull cursor for an entity type
    fn set_pull_cursor(&self, entity_type: &str, since: i64) -> Result<()>;
}

/// `SQLite` implementation of `EntityRepository`
pub struct SqliteEntityRepository<'a> {
    conn: &'a Connection,
}

/// Undecoded row as stored on disk
struct RawEntity {
    local_id: String,
    entity_type: String,
    parent_local_id: Option<String>,
    remote_id: Option<String>,
    payload: String,
    sync_state: String,
    local_version: i64,
    remote_version: Option<i64>,
    remote_updated_at: Option<i64>,
    base_payload: Option<String>,
    conflict_remote: Option<String>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawEntity {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            entity_type: row.get(1)?,
            parent_local_id: row.get(2)?,
            remote_id: row.get(3)?,
            payload: row.get(4)?,
            sync_state: row.get(5)?,
            local_version: row.get(6)?,
            remote_version: row.get(7)?,
            remote_updated_at: row.get(8)?,
            base_payload: row.get(9)?,
            conflict_remote: row.get(10)?,
            last_error: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn corrupt(&self, message: impl Into<String>) -> Error {
        Error::Corrupt {
            local_id: self.local_id.clone(),
            message: message.into(),
        }
    }

    fn decode(self) -> Result<EntityRecord> {
        let local_id = self
            .local_id
            .parse::<LocalId>()
            .map_err(|error| self.corrupt(format!("local_id: {error}")))?;
        let parent_local_id = self
            .parent_local_id
            .as_deref()
            .map(str::parse::<LocalId>)
            .transpose()
            .map_err(|error| self.corrupt(format!("parent_local_id: {error}")))?;
        let payload = serde_json::from_str::<Payload>(&self.payload)
            .map_err(|error| self.corrupt(format!("payload: {error}")))?;
        let sync_state = self
            .sync_state
            .parse::<SyncState>()
            .map_err(|error| self.corrupt(error))?;
        let base_payload = self
            .base_payload
            .as_deref()
            .map(serde_json::from_str::<Payload>)
            .transpose()
            .map_err(|error| self.corrupt(format!("base_payload: {error}")))?;
        let conflict_remote = self
            .conflict_remote
            .as_deref()
            .map(serde_json::from_str::<RemoteRecord>)
            .transpose()
            .map_err(|error| self.corrupt(format!("conflict_remote: {error}")))?;

        Ok(EntityRecord {
            local_id,
            entity_type: self.entity_type,
            parent_local_id,
            remote_id: self.remote_id,
            payload,
            sync_state,
            local_version: self.local_version,
            remote_version: self.remote_version,
            remote_updated_at: self.remote_updated_at,
            base_payload,
            conflict_remote,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl<'a> SqliteEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn query_decoded(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw_rows = stmt
            .query_map(params, RawEntity::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            match raw.decode() {
                Ok(record) => records.push(record),
                Err(error) => tracing::warn!("Skipping undecodable entity row: {}", error),
            }
        }
        Ok(records)
    }

    fn query_one(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<EntityRecord>> {
        let raw = self
            .conn
            .query_row(sql, params, RawEntity::from_row)
            .optional()?;
        raw.map(RawEntity::decode).transpose()
    }
}

fn encode_payload(payload: &Payload) -> Result<String> {
    Ok(serde_json::to_string(payload)?)
}

fn encode_optional<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(Error::from)
}

impl EntityRepository for SqliteEntityRepository<'_> {
    fn insert(&self, record: &EntityRecord) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO entities ({ENTITY_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                record.local_id.as_str(),
                record.entity_type,
                record.parent_local_id.map(|id| id.as_str()),
                record.remote_id,
                encode_payload(&record.payload)?,
                record.sync_state.as_str(),
                record.local_version,
                record.remote_version,
                record.remote_updated_at,
                encode_optional(record.base_payload.as_ref())?,
                encode_optional(record.conflict_remote.as_ref())?,
                record.last_error,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get(&self, local_id: &LocalId) -> Result<Option<EntityRecord>> {
        self.query_one(
            &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE local_id = ?"),
            params![local_id.as_str()],
        )
    }

    fn get_by_remote_id(
        &self,
        entity_type: &str,
        remote_id: &str,
    ) -> Result<Option<EntityRecord>> {
        self.query_one(
            &format!(
                "SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_type = ? AND remote_id = ?"
            ),
            params![entity_type, remote_id],
        )
    }

    fn list(
        &self,
        entity_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EntityRecord>> {
        if let Some(entity_type) = entity_type {
            self.query_decoded(
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities
                     WHERE entity_type = ?
                     ORDER BY updated_at DESC, local_id ASC
                     LIMIT ? OFFSET ?"
                ),
                params![entity_type, limit as i64, offset as i64],
            )
        } else {
            self.query_decoded(
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities
                     ORDER BY updated_at DESC, local_id ASC
                     LIMIT ? OFFSET ?"
                ),
                params![limit as i64, offset as i64],
            )
        }
    }

    fn list_by_state(&self, state: SyncState) -> Result<Vec<EntityRecord>> {
        self.query_decoded(
            &format!(
                "SELECT {ENTITY_COLUMNS} FROM entities
                 WHERE sync_state = ?
                 ORDER BY updated_at DESC, local_id ASC"
            ),
            params![state.as_str()],
        )
    }

    fn list_ids_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let pattern = format!("{}%", prefix.replace(['%', '_'], ""));
        let mut stmt = self.conn.prepare(
            "SELECT local_id FROM entities WHERE local_id LIKE ? ORDER BY local_id LIMIT ?",
        )?;
        let ids = stmt
            .query_map(params![pattern, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn compare_and_swap(&self, record: &EntityRecord, expected_version: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE entities SET
                entity_type = ?, parent_local_id = ?, remote_id = ?, payload = ?,
                sync_state = ?, local_version = ?, remote_version = ?, remote_updated_at = ?,
                base_payload = ?, conflict_remote = ?, last_error = ?, updated_at = ?
             WHERE local_id = ? AND local_version = ?",
            params![
                record.entity_type,
                record.parent_local_id.map(|id| id.as_str()),
                record.remote_id,
                encode_payload(&record.payload)?,
                record.sync_state.as_str(),
                record.local_version,
                record.remote_version,
                record.remote_updated_at,
                encode_optional(record.base_payload.as_ref())?,
                encode_optional(record.conflict_remote.as_ref())?,
                record.last_error,
                record.updated_at,
                record.local_id.as_str(),
                expected_version,
            ],
        )?;
        Ok(rows == 1)
    }

    fn delete(&self, local_id: &LocalId) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM entities WHERE local_id = ?",
            params![local_id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn sync_state(&self, local_id: &LocalId) -> Result<Option<SyncState>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT sync_state FROM entities WHERE local_id = ?",
                params![local_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|value| {
            value.parse::<SyncState>().map_err(|message| Error::Corrupt {
                local_id: local_id.to_string(),
                message,
            })
        })
        .transpose()
    }

    fn find_orphans(&self) -> Result<Vec<EntityRecord>> {
        self.query_decoded(
            &format!(
                "SELECT {ENTITY_COLUMNS} FROM entities e
                 WHERE e.sync_state IN ('PENDING_CREATE', 'PENDING_UPDATE', 'PENDING_DELETE')
                   AND NOT EXISTS (SELECT 1 FROM outbox o WHERE o.local_id = e.local_id)
                 ORDER BY e.created_at ASC, e.local_id ASC"
            ),
            [],
        )
    }

    fn scan_corrupt(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ENTITY_COLUMNS} FROM entities"))?;
        let raw_rows = stmt
            .query_map([], RawEntity::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(raw_rows
            .into_iter()
            .filter_map(|raw| {
                let local_id = raw.local_id.clone();
                raw.decode().err().map(|error| (local_id, error.to_string()))
            })
            .collect())
    }

    fn quarantine(&self, local_id: &str, error: &str, now: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE entities SET
                sync_state = 'CONFLICT',
                last_error = ?,
                payload = CASE
                    WHEN json_valid(payload) = 0 THEN '{}'
                    WHEN json_type(payload) = 'object' THEN payload
                    ELSE '{}' END,
                base_payload = CASE
                    WHEN base_payload IS NULL THEN NULL
                    WHEN json_valid(base_payload) = 0 THEN NULL
                    WHEN json_type(base_payload) = 'object' THEN base_payload
                    ELSE NULL END,
                conflict_remote = CASE
                    WHEN conflict_remote IS NULL THEN NULL
                    WHEN json_valid(conflict_remote) = 0 THEN NULL
                    ELSE conflict_remote END,
                updated_at = ?
             WHERE local_id = ?",
            params![error, now, local_id],
        )?;
        Ok(rows > 0)
    }

    fn count_by_state(&self, state: SyncState) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE sync_state = ?",
            params![state.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn pull_cursor(&self, entity_type: &str) -> Result<Option<i64>> {
        let since = self
            .conn
            .query_row(
                "SELECT since FROM sync_cursors WHERE entity_type = ?",
                params![entity_type],
                |row| row.get(0),
            )
            .optional()?;
        Ok(since)
    }

    fn set_pull_cursor(&self, entity_type: &str, since: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_cursors (entity_type, since) VALUES (?, ?)
             ON CONFLICT(entity_type) DO UPDATE SET since = MAX(since, excluded.since)",
            params![entity_type, since],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let db = setup();
        let repo = SqliteEntityRepository::new(db.connection());

        let record = EntityRecord::new_pending(
            "equipment",
            payload(json!({"name": "Pump 3", "status": "ok"})),
            None,
            100,
        );
        repo.insert(&record).unwrap();

        let fetched = repo.get(&record.local_id).unwrap().unwrap();
        assert_eq!(fetched, record);
    }

    #[test]
    fn test_compare_and_swap_rejects_stale_version() {
        let db = setup();
        let repo = SqliteEntityRepository::new(db.connection());

        let mut record =
            EntityRecord::new_pending("equipment", payload(json!({"name": "A"})), None, 1);
        repo.insert(&record).unwrap();

        record.payload = payload(json!({"name": "B"}));
        record.local_version = 2;
        assert!(repo.compare_and_swap(&record, 1).unwrap());

        record.payload = payload(json!({"name": "C"}));
        record.local_version = 3;
        assert!(!repo.compare_and_swap(&record, 1).unwrap());

        let stored = repo.get(&record.local_id).unwrap().unwrap();
        assert_eq!(stored.payload, payload(json!({"name": "B"})));
        assert_eq!(stored.local_version, 2);
    }

    #[test]
    fn test_list_filters_by_type_and_skips_corrupt_rows() {
        let db = setup();
        let repo = SqliteEntityRepository::new(db.connection());

        repo.insert(&EntityRecord::new_pending("equipment", Payload::new(), None, 1))
            .unwrap();
        repo.insert(&EntityRecord::new_pending("maintenance_session", Payload::new(), None, 2))
            .unwrap();
        let broken = EntityRecord::new_pending("equipment", Payload::new(), None, 3);
        repo.insert(&broken).unwrap();
        db.connection()
            .execute(
                "UPDATE entities SET payload = 'not json' WHERE local_id = ?",
                [broken.local_id.as_str()],
            )
            .unwrap();

        assert_eq!(repo.list(None, 10, 0).unwrap().len(), 2);
        assert_eq!(repo.list(Some("equipment"), 10, 0).unwrap().len(), 1);
        assert!(matches!(
            repo.get(&broken.local_id),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn test_quarantine_resets_undecodable_payload() {
        let db = setup();
        let repo = SqliteEntityRepository::new(db.connection());

        let record = EntityRecord::new_pending("equipment", Payload::new(), None, 1);
        repo.insert(&record).unwrap();
        db.connection()
            .execute(
                "UPDATE entities SET payload = '[1,' WHERE local_id = ?",
                [record.local_id.as_str()],
            )
            .unwrap();

        let corrupt = repo.scan_corrupt().unwrap();
        assert_eq!(corrupt.len(), 1);

        assert!(repo
            .quarantine(&record.local_id.as_str(), &corrupt[0].1, 5)
            .unwrap());
        let stored = repo.get(&record.local_id).unwrap().unwrap();
        assert_eq!(stored.sync_state, SyncState::Conflict);
        assert!(stored.payload.is_empty());
        assert!(stored.last_error.unwrap().contains("payload"));
    }

    #[test]
    fn test_pull_cursor_only_moves_forward() {
        let db = setup();
        let repo = SqliteEntityRepository::new(db.connection());

        assert_eq!(repo.pull_cursor("equipment").unwrap(), None);
        repo.set_pull_cursor("equipment", 50).unwrap();
        repo.set_pull_cursor("equipment", 20).unwrap();
        assert_eq!(repo.pull_cursor("equipment").unwrap(), Some(50));
    }

    #[test]
    fn test_get_by_remote_id() {
        let db = setup();
        let repo = SqliteEntityRepository::new(db.connection());

        let remote = RemoteRecord {
            remote_id: "R1".to_string(),
            version: 3,
            updated_at: 10,
            payload: payload(json!({"name": "Panel"})),
            deleted: false,
        };
        let record = EntityRecord::from_remote("panel_configuration", &remote, 11);
        repo.insert(&record).unwrap();

        let found = repo
            .get_by_remote_id("panel_configuration", "R1")
            .unwrap()
            .unwrap();
        assert_eq!(found.local_id, record.local_id);
        assert!(repo.get_by_remote_id("equipment", "R1").unwrap().is_none());
    }
}
