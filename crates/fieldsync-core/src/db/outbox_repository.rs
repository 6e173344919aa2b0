//! Outbox (sync queue) repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{
    DescriptorStatus, EnqueueOutcome, LocalId, NewDescriptor, Operation, OutboxDescriptor,
    Payload,
};
use crate::sync::BackoffPolicy;

const OUTBOX_COLUMNS: &str = "local_id, entity_type, operation, payload, local_version, \
     enqueued_at, attempt_count, next_attempt_at, last_backoff_ms, last_error, status, in_flight";

/// Result of recording a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackOutcome {
    pub attempt_count: u32,
    pub next_attempt_at: i64,
    pub delay_ms: i64,
    /// Retries exhausted; the descriptor is no longer auto-retried
    pub stalled: bool,
}

/// Trait for outbox storage operations
pub trait OutboxRepository {
    /// Get the open descriptor for an entity
    fn get(&self, local_id: &LocalId) -> Result<Option<OutboxDescriptor>>;

    /// Append a descriptor, coalescing with an existing one for the same entity
    fn enqueue(&self, descriptor: &NewDescriptor, now: i64) -> Result<EnqueueOutcome>;

    /// Overwrite (or insert) a descriptor verbatim, bypassing coalescing rules
    fn replace(&self, descriptor: &OutboxDescriptor) -> Result<()>;

    /// Up to `limit` ready descriptors in queue order, still undecoded
    fn peek_ready(&self, limit: usize, now: i64) -> Result<Vec<DescriptorRow>>;

    /// Flag a descriptor as having a remote call outstanding
    fn mark_in_flight(&self, local_id: &LocalId) -> Result<bool>;

    /// Clear the in-flight flag without touching retry state
    fn release(&self, local_id: &LocalId) -> Result<bool>;

    /// Clear every in-flight flag (used at startup after a crash)
    fn release_all(&self) -> Result<usize>;

    /// Remove a descriptor; a second call is a no-op
    fn ack(&self, local_id: &LocalId) -> Result<bool>;

    /// Remove a descriptor only if it still reflects `local_version`
    fn ack_if_current(&self, local_id: &LocalId, local_version: i64) -> Result<bool>;

    /// Record a failed attempt and schedule the next one
    fn nack(
        &self,
        local_id: &LocalId,
        error: &str,
        now: i64,
        backoff: &BackoffPolicy,
        max_attempts: u32,
    ) -> Result<Option<NackOutcome>>;

    /// Move a descriptor to the terminal `STALLED` state
    fn stall(&self, local_id: &LocalId, error: &str) -> Result<bool>;

    /// Re-arm a stalled descriptor for immediate retry
    fn retry_stalled(&self, local_id: &LocalId, now: i64) -> Result<bool>;

    /// List descriptors in queue order; undecodable rows are skipped
    fn list(&self, limit: usize) -> Result<Vec<OutboxDescriptor>>;

    /// Count stalled descriptors
    fn count_stalled(&self) -> Result<usize>;

    /// Count all descriptors
    fn count(&self) -> Result<usize>;

    /// Remove descriptors whose entity row no longer exists
    fn delete_orphans(&self) -> Result<usize>;
}

/// `SQLite` implementation of `OutboxRepository`
pub struct SqliteOutboxRepository<'a> {
    conn: &'a Connection,
}

/// Undecoded descriptor row as stored on disk
#[derive(Debug, Clone)]
pub struct DescriptorRow {
    pub local_id: String,
    entity_type: String,
    operation: String,
    payload: Option<String>,
    local_version: i64,
    enqueued_at: i64,
    attempt_count: i64,
    next_attempt_at: i64,
    last_backoff_ms: i64,
    last_error: Option<String>,
    status: String,
    in_flight: i64,
}

impl DescriptorRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            entity_type: row.get(1)?,
            operation: row.get(2)?,
            payload: row.get(3)?,
            local_version: row.get(4)?,
            enqueued_at: row.get(5)?,
            attempt_count: row.get(6)?,
            next_attempt_at: row.get(7)?,
            last_backoff_ms: row.get(8)?,
            last_error: row.get(9)?,
            status: row.get(10)?,
            in_flight: row.get(11)?,
        })
    }

    fn corrupt(&self, message: impl Into<String>) -> Error {
        Error::Corrupt {
            local_id: self.local_id.clone(),
            message: message.into(),
        }
    }

    /// Decode into a descriptor, reporting corruption against the row
    pub fn decode(self) -> Result<OutboxDescriptor> {
        let local_id = self
            .local_id
            .parse::<LocalId>()
            .map_err(|error| self.corrupt(format!("local_id: {error}")))?;
        let operation = self
            .operation
            .parse::<Operation>()
            .map_err(|error| self.corrupt(error))?;
        let status = self
            .status
            .parse::<DescriptorStatus>()
            .map_err(|error| self.corrupt(error))?;
        let payload = self
            .payload
            .as_deref()
            .map(serde_json::from_str::<Payload>)
            .transpose()
            .map_err(|error| self.corrupt(format!("outbox payload: {error}")))?;
        if payload.is_none() && operation != Operation::Delete {
            return Err(self.corrupt(format!("{operation} descriptor without payload")));
        }

        Ok(OutboxDescriptor {
            local_id,
            entity_type: self.entity_type,
            operation,
            payload,
            local_version: self.local_version,
            enqueued_at: self.enqueued_at,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or_default(),
            next_attempt_at: self.next_attempt_at,
            last_backoff_ms: self.last_backoff_ms,
            last_error: self.last_error,
            status,
            in_flight: self.in_flight != 0,
        })
    }
}

impl<'a> SqliteOutboxRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn insert_new(&self, descriptor: &NewDescriptor, now: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO outbox (local_id, entity_type, operation, payload, local_version,
                                 enqueued_at, attempt_count, next_attempt_at, last_backoff_ms,
                                 last_error, status, in_flight)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, 0, NULL, 'PENDING', 0)",
            params![
                descriptor.local_id.as_str(),
                descriptor.entity_type,
                descriptor.operation.as_str(),
                encode_payload(descriptor.payload.as_ref())?,
                descriptor.local_version,
                now,
                now,
            ],
        )?;
        Ok(())
    }

    /// Fold a new mutation into the existing descriptor. Queue position is kept;
    /// a stalled descriptor is re-armed since the payload changed.
    fn fold(
        &self,
        existing: &OutboxDescriptor,
        operation: Operation,
        payload: Option<&Payload>,
        local_version: i64,
        now: i64,
    ) -> Result<()> {
        if existing.is_stalled() {
            self.conn.execute(
                "UPDATE outbox SET operation = ?, payload = ?, local_version = ?,
                        status = 'PENDING', attempt_count = 0, last_backoff_ms = 0,
                        next_attempt_at = ?, last_error = NULL
                 WHERE local_id = ?",
                params![
                    operation.as_str(),
                    encode_payload(payload)?,
                    local_version,
                    now,
                    existing.local_id.as_str(),
                ],
            )?;
        } else {
            self.conn.execute(
                "UPDATE outbox SET operation = ?, payload = ?, local_version = ?
                 WHERE local_id = ?",
                params![
                    operation.as_str(),
                    encode_payload(payload)?,
                    local_version,
                    existing.local_id.as_str(),
                ],
            )?;
        }
        Ok(())
    }
}

fn encode_payload(payload: Option<&Payload>) -> Result<Option<String>> {
    payload
        .map(serde_json::to_string)
        .transpose()
        .map_err(Error::from)
}

impl OutboxRepository for SqliteOutboxRepository<'_> {
    fn get(&self, local_id: &LocalId) -> Result<Option<OutboxDescriptor>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE local_id = ?"),
                params![local_id.as_str()],
                DescriptorRow::from_row,
            )
            .optional()?;
        raw.map(DescriptorRow::decode).transpose()
    }

    fn enqueue(&self, descriptor: &NewDescriptor, now: i64) -> Result<EnqueueOutcome> {
        let Some(existing) = self.get(&descriptor.local_id)? else {
            self.insert_new(descriptor, now)?;
            return Ok(EnqueueOutcome::Inserted);
        };

        match (existing.operation, descriptor.operation) {
            (_, Operation::Create) => Err(Error::InvalidTransition(format!(
                "entity {} already has a pending {}",
                descriptor.local_id, existing.operation
            ))),
            (Operation::Delete, Operation::Update) => Err(Error::InvalidTransition(format!(
                "entity {} is pending deletion",
                descriptor.local_id
            ))),
            (Operation::Delete, Operation::Delete) => {
                self.fold(&existing, Operation::Delete, None, descriptor.local_version, now)?;
                Ok(EnqueueOutcome::Coalesced)
            }
            (Operation::Create | Operation::Update, Operation::Update) => {
                self.fold(
                    &existing,
                    existing.operation,
                    descriptor.payload.as_ref(),
                    descriptor.local_version,
                    now,
                )?;
                Ok(EnqueueOutcome::Coalesced)
            }
            (Operation::Create, Operation::Delete)
                if !existing.in_flight && !descriptor.remote_known =>
            {
                self.ack(&existing.local_id)?;
                Ok(EnqueueOutcome::Cancelled)
            }
            (Operation::Create | Operation::Update, Operation::Delete) => {
                self.fold(&existing, Operation::Delete, None, descriptor.local_version, now)?;
                Ok(EnqueueOutcome::Coalesced)
            }
        }
    }

    fn replace(&self, descriptor: &OutboxDescriptor) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO outbox ({OUTBOX_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                descriptor.local_id.as_str(),
                descriptor.entity_type,
                descriptor.operation.as_str(),
                encode_payload(descriptor.payload.as_ref())?,
                descriptor.local_version,
                descriptor.enqueued_at,
                i64::from(descriptor.attempt_count),
                descriptor.next_attempt_at,
                descriptor.last_backoff_ms,
                descriptor.last_error,
                descriptor.status.as_str(),
                i32::from(descriptor.in_flight),
            ],
        )?;
        Ok(())
    }

    fn peek_ready(&self, limit: usize, now: i64) -> Result<Vec<DescriptorRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT o.local_id, o.entity_type, o.operation, o.payload, o.local_version,
                    o.enqueued_at, o.attempt_count, o.next_attempt_at, o.last_backoff_ms,
                    o.last_error, o.status, o.in_flight
             FROM outbox o
             JOIN entities e ON e.local_id = o.local_id
             WHERE o.status = 'PENDING'
               AND o.in_flight = 0
               AND o.next_attempt_at <= ?
               AND e.sync_state != 'CONFLICT'
               AND NOT EXISTS (
                   SELECT 1 FROM entities p
                   WHERE p.local_id = e.parent_local_id AND p.remote_id IS NULL
               )
             ORDER BY o.enqueued_at ASC, o.local_id ASC
             LIMIT ?",
        )?;

        let rows = stmt
            .query_map(params![now, limit as i64], DescriptorRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn mark_in_flight(&self, local_id: &LocalId) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE outbox SET in_flight = 1 WHERE local_id = ? AND in_flight = 0",
            params![local_id.as_str()],
        )?;
        Ok(rows == 1)
    }

    fn release(&self, local_id: &LocalId) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE outbox SET in_flight = 0 WHERE local_id = ?",
            params![local_id.as_str()],
        )?;
        Ok(rows == 1)
    }

    fn release_all(&self) -> Result<usize> {
        Ok(self
            .conn
            .execute("UPDATE outbox SET in_flight = 0 WHERE in_flight != 0", [])?)
    }

    fn ack(&self, local_id: &LocalId) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM outbox WHERE local_id = ?",
            params![local_id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn ack_if_current(&self, local_id: &LocalId, local_version: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM outbox WHERE local_id = ? AND local_version <= ?",
            params![local_id.as_str(), local_version],
        )?;
        Ok(rows > 0)
    }

    fn nack(
        &self,
        local_id: &LocalId,
        error: &str,
        now: i64,
        backoff: &BackoffPolicy,
        max_attempts: u32,
    ) -> Result<Option<NackOutcome>> {
        let Some(existing) = self.get(local_id)? else {
            return Ok(None);
        };

        let attempt_count = existing.attempt_count.saturating_add(1);
        let delay_ms = backoff.next_delay(attempt_count, existing.last_backoff_ms);
        let next_attempt_at = now.saturating_add(delay_ms);
        let stalled = attempt_count >= max_attempts;
        let status = if stalled {
            DescriptorStatus::Stalled
        } else {
            DescriptorStatus::Pending
        };

        self.conn.execute(
            "UPDATE outbox SET attempt_count = ?, next_attempt_at = ?, last_backoff_ms = ?,
                    last_error = ?, status = ?, in_flight = 0
             WHERE local_id = ?",
            params![
                i64::from(attempt_count),
                next_attempt_at,
                delay_ms,
                error,
                status.as_str(),
                local_id.as_str(),
            ],
        )?;

        Ok(Some(NackOutcome {
            attempt_count,
            next_attempt_at,
            delay_ms,
            stalled,
        }))
    }

    fn stall(&self, local_id: &LocalId, error: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE outbox SET status = 'STALLED', last_error = ?, in_flight = 0
             WHERE local_id = ?",
            params![error, local_id.as_str()],
        )?;
        Ok(rows == 1)
    }

    fn retry_stalled(&self, local_id: &LocalId, now: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE outbox SET status = 'PENDING', attempt_count = 0, last_backoff_ms = 0,
                    next_attempt_at = ?
             WHERE local_id = ? AND status = 'STALLED'",
            params![now, local_id.as_str()],
        )?;
        Ok(rows == 1)
    }

    fn list(&self, limit: usize) -> Result<Vec<OutboxDescriptor>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox
             ORDER BY enqueued_at ASC, local_id ASC
             LIMIT ?"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], DescriptorRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut descriptors = Vec::with_capacity(rows.len());
        for raw in rows {
            match raw.decode() {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(error) => tracing::warn!("Skipping undecodable outbox row: {}", error),
            }
        }
        Ok(descriptors)
    }

    fn count_stalled(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE status = 'STALLED'",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn delete_orphans(&self) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM outbox
             WHERE NOT EXISTS (SELECT 1 FROM entities e WHERE e.local_id = outbox.local_id)",
            [],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, EntityRepository, SqliteEntityRepository};
    use crate::models::EntityRecord;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn insert_row(db: &Database, now: i64) -> EntityRecord {
        let record = EntityRecord::new_pending("equipment", Payload::new(), None, now);
        SqliteEntityRepository::new(db.connection())
            .insert(&record)
            .unwrap();
        record
    }

    fn new_descriptor(
        local_id: LocalId,
        operation: Operation,
        payload: Option<Payload>,
        local_version: i64,
    ) -> NewDescriptor {
        NewDescriptor {
            local_id,
            entity_type: "equipment".to_string(),
            operation,
            payload,
            local_version,
            remote_known: false,
        }
    }

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(8), 0.0)
    }

    #[test]
    fn test_update_coalesces_into_pending_create() {
        let db = setup();
        let outbox = SqliteOutboxRepository::new(db.connection());
        let row = insert_row(&db, 10);

        let first = new_descriptor(
            row.local_id,
            Operation::Create,
            Some(payload(json!({"name": "v1"}))),
            1,
        );
        assert_eq!(outbox.enqueue(&first, 10).unwrap(), EnqueueOutcome::Inserted);

        let second = new_descriptor(
            row.local_id,
            Operation::Update,
            Some(payload(json!({"name": "v2"}))),
            2,
        );
        assert_eq!(outbox.enqueue(&second, 20).unwrap(), EnqueueOutcome::Coalesced);

        let stored = outbox.get(&row.local_id).unwrap().unwrap();
        assert_eq!(stored.operation, Operation::Create);
        assert_eq!(stored.payload, Some(payload(json!({"name": "v2"}))));
        assert_eq!(stored.local_version, 2);
        assert_eq!(stored.enqueued_at, 10);
        assert_eq!(outbox.count().unwrap(), 1);
    }

    #[test]
    fn test_delete_cancels_unsent_create() {
        let db = setup();
        let outbox = SqliteOutboxRepository::new(db.connection());
        let row = insert_row(&db, 10);

        outbox
            .enqueue(
                &new_descriptor(row.local_id, Operation::Create, Some(Payload::new()), 1),
                10,
            )
            .unwrap();
        let outcome = outbox
            .enqueue(&new_descriptor(row.local_id, Operation::Delete, None, 2), 11)
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert!(outbox.get(&row.local_id).unwrap().is_none());
    }

    #[test]
    fn test_delete_replaces_in_flight_create() {
        let db = setup();
        let outbox = SqliteOutboxRepository::new(db.connection());
        let row = insert_row(&db, 10);

        outbox
            .enqueue(
                &new_descriptor(row.local_id, Operation::Create, Some(Payload::new()), 1),
                10,
            )
            .unwrap();
        assert!(outbox.mark_in_flight(&row.local_id).unwrap());

        let outcome = outbox
            .enqueue(&new_descriptor(row.local_id, Operation::Delete, None, 2), 11)
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Coalesced);

        let stored = outbox.get(&row.local_id).unwrap().unwrap();
        assert_eq!(stored.operation, Operation::Delete);
        assert_eq!(stored.payload, None);
        assert!(!outbox.ack_if_current(&row.local_id, 1).unwrap());
        assert!(outbox.ack_if_current(&row.local_id, 2).unwrap());
    }

    #[test]
    fn test_update_after_delete_is_rejected() {
        let db = setup();
        let outbox = SqliteOutboxRepository::new(db.connection());
        let row = insert_row(&db, 10);

        let mut delete = new_descriptor(row.local_id, Operation::Delete, None, 2);
        delete.remote_known = true;
        outbox.enqueue(&delete, 10).unwrap();

        let update = new_descriptor(row.local_id, Operation::Update, Some(Payload::new()), 3);
        assert!(matches!(
            outbox.enqueue(&update, 11),
            Err(Error::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_ack_is_idempotent() {
        let db = setup();
        let outbox = SqliteOutboxRepository::new(db.connection());
        let row = insert_row(&db, 10);

        outbox
            .enqueue(
                &new_descriptor(row.local_id, Operation::Create, Some(Payload::new()), 1),
                10,
            )
            .unwrap();

        assert!(outbox.ack(&row.local_id).unwrap());
        assert!(!outbox.ack(&row.local_id).unwrap());
    }

    #[test]
    fn test_peek_orders_by_enqueue_time_and_skips_future_and_conflict() {
        let db = setup();
        let outbox = SqliteOutboxRepository::new(db.connection());
        let entities = SqliteEntityRepository::new(db.connection());

        let late = insert_row(&db, 1);
        let early = insert_row(&db, 2);
        let waiting = insert_row(&db, 3);
        let conflicted = insert_row(&db, 4);

        for (row, at) in [(&late, 30), (&early, 10), (&waiting, 5), (&conflicted, 1)] {
            outbox
                .enqueue(
                    &new_descriptor(row.local_id, Operation::Create, Some(Payload::new()), 1),
                    at,
                )
                .unwrap();
        }
        outbox
            .nack(&waiting.local_id, "timeout", 40, &no_jitter(), 5)
            .unwrap();
        entities
            .quarantine(&conflicted.local_id.as_str(), "broken", 40)
            .unwrap();

        let ready = outbox
            .peek_ready(10, 40)
            .unwrap()
            .into_iter()
            .map(|row| row.decode().unwrap().local_id)
            .collect::<Vec<_>>();
        assert_eq!(ready, vec![early.local_id, late.local_id]);
    }

    #[test]
    fn test_peek_holds_children_until_parent_has_remote_id() {
        let db = setup();
        let outbox = SqliteOutboxRepository::new(db.connection());
        let entities = SqliteEntityRepository::new(db.connection());

        let parent = insert_row(&db, 1);
        let child = EntityRecord::new_pending(
            "panel_configuration",
            Payload::new(),
            Some(parent.local_id),
            2,
        );
        entities.insert(&child).unwrap();

        for row in [&parent, &child] {
            outbox
                .enqueue(
                    &new_descriptor(row.local_id, Operation::Create, Some(Payload::new()), 1),
                    5,
                )
                .unwrap();
        }

        let ready = outbox.peek_ready(10, 5).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].local_id, parent.local_id.as_str());

        let mut confirmed = parent.clone();
        confirmed.remote_id = Some("R1".to_string());
        entities.compare_and_swap(&confirmed, 1).unwrap();
        assert_eq!(outbox.peek_ready(10, 5).unwrap().len(), 2);
    }

    #[test]
    fn test_nack_backs_off_and_stalls_after_max_attempts() {
        let db = setup();
        let outbox = SqliteOutboxRepository::new(db.connection());
        let row = insert_row(&db, 0);
        outbox
            .enqueue(
                &new_descriptor(row.local_id, Operation::Create, Some(Payload::new()), 1),
                0,
            )
            .unwrap();

        let mut deltas = Vec::new();
        let mut last = None;
        for now in [100, 200, 300] {
            last = outbox
                .nack(&row.local_id, "offline", now, &no_jitter(), 3)
                .unwrap();
            deltas.push(last.unwrap().next_attempt_at - now);
        }

        assert_eq!(deltas, vec![1_000, 2_000, 4_000]);
        let last = last.unwrap();
        assert_eq!(last.attempt_count, 3);
        assert!(last.stalled);

        let stored = outbox.get(&row.local_id).unwrap().unwrap();
        assert_eq!(stored.status, DescriptorStatus::Stalled);
        assert_eq!(stored.last_error.as_deref(), Some("offline"));
        assert!(outbox.peek_ready(10, i64::MAX).unwrap().is_empty());

        assert!(outbox.retry_stalled(&row.local_id, 500).unwrap());
        let rearmed = outbox.get(&row.local_id).unwrap().unwrap();
        assert_eq!(rearmed.attempt_count, 0);
        assert_eq!(rearmed.next_attempt_at, 500);
    }

    #[test]
    fn test_update_rearms_stalled_descriptor() {
        let db = setup();
        let outbox = SqliteOutboxRepository::new(db.connection());
        let row = insert_row(&db, 0);
        outbox
            .enqueue(
                &new_descriptor(row.local_id, Operation::Create, Some(Payload::new()), 1),
                0,
            )
            .unwrap();
        outbox.stall(&row.local_id, "422 missing serial").unwrap();

        outbox
            .enqueue(
                &new_descriptor(
                    row.local_id,
                    Operation::Update,
                    Some(payload(json!({"serial": "X"}))),
                    2,
                ),
                50,
            )
            .unwrap();

        let stored = outbox.get(&row.local_id).unwrap().unwrap();
        assert_eq!(stored.status, DescriptorStatus::Pending);
        assert_eq!(stored.next_attempt_at, 50);
        assert_eq!(stored.last_error, None);
        assert_eq!(stored.enqueued_at, 0);
    }

    #[test]
    fn test_delete_orphans_and_release_all() {
        let db = setup();
        let outbox = SqliteOutboxRepository::new(db.connection());
        let row = insert_row(&db, 0);
        outbox
            .enqueue(
                &new_descriptor(row.local_id, Operation::Create, Some(Payload::new()), 1),
                0,
            )
            .unwrap();
        outbox
            .enqueue(
                &new_descriptor(LocalId::new(), Operation::Create, Some(Payload::new()), 1),
                0,
            )
            .unwrap();
        outbox.mark_in_flight(&row.local_id).unwrap();

        assert_eq!(outbox.delete_orphans().unwrap(), 1);
        assert_eq!(outbox.release_all().unwrap(), 1);
        assert!(!outbox.get(&row.local_id).unwrap().unwrap().in_flight);
    }
}
