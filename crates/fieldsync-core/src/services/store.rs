//! Thread-safe handle over the Local Store, Outbox and Draft Store.
//!
//! Every method takes the database lock for a short synchronous unit of work
//! and releases it before returning, so callers never hold it across a remote
//! call. Composite writes (row + descriptor) run in one transaction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::db::{
    Database, DraftRepository, EntityRepository, NackOutcome, OutboxRepository,
    SqliteDraftRepository, SqliteEntityRepository, SqliteOutboxRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    DescriptorStatus, Draft, EnqueueOutcome, EntityRecord, LocalId, LocalWrite, NewDescriptor,
    Operation, OutboxDescriptor, Payload, RemoteRecord, SyncOverview, SyncState, SyncStatus,
};
use crate::sync::BackoffPolicy;
use crate::util::{Clock, SystemClock};

/// How a user settles a conflicted row.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the local copy and push it over the remote one
    UseLocal,
    /// Discard local changes and take the stored remote copy
    UseRemote,
    /// Push a hand-merged payload
    Custom(Payload),
}

/// Outcome of recording a confirmed create/update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushCompletion {
    /// Row is `SYNCED` and the descriptor is gone
    Synced,
    /// The row changed during the call; it stays pending with the new remote identity
    StillPending,
    /// The row no longer exists
    Missing,
    /// The row could not be decoded and was moved to `CONFLICT`
    Quarantined,
}

/// Result of writing a merged payload back after a version conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseOutcome {
    /// Merged payload applied; re-queued unless it already matches the remote
    Rebased,
    /// The row was edited after the push; the next cycle merges again
    Stale,
    /// The row could not be decoded and was moved to `CONFLICT`
    Quarantined,
}

/// Counters from a startup recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Descriptors left in flight by a previous process
    pub released: usize,
    /// Pending rows whose descriptor was re-synthesized
    pub resynthesized: usize,
    /// Undecodable rows moved to `CONFLICT`
    pub quarantined: usize,
    /// Descriptors removed because their row is gone
    pub orphan_descriptors: usize,
}

/// Counters from applying one pull page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Rows left alone because a local mutation or conflict is pending
    pub skipped: usize,
    /// Conflicted rows whose remote copy was replaced by a newer one
    pub refreshed: usize,
    /// Undecodable rows moved to `CONFLICT`
    pub quarantined: usize,
}

/// Thread-safe service for store, outbox and draft operations.
#[derive(Clone)]
pub struct SyncStore {
    db: Arc<Mutex<Database>>,
    clock: Arc<dyn Clock>,
    db_path: Option<PathBuf>,
}

impl std::fmt::Debug for SyncStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SyncStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl SyncStore {
    /// Open a store at the given filesystem path.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&db_path)?;
        tracing::debug!("Opened local store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            clock: Arc::new(SystemClock),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open_in_memory()?)),
            clock: Arc::new(SystemClock),
            db_path: None,
        })
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    // -----------------------------------------------------------------------
    // Local writes
    // -----------------------------------------------------------------------

    /// Write a row optimistically and enqueue its descriptor atomically.
    pub async fn upsert_local(&self, write: LocalWrite) -> Result<EntityRecord> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let record = write_local(&tx, write, now)?;
        tx.commit()?;
        Ok(record)
    }

    pub async fn create(
        &self,
        entity_type: &str,
        payload: Payload,
        parent_local_id: Option<LocalId>,
    ) -> Result<EntityRecord> {
        self.upsert_local(LocalWrite::Create {
            entity_type: entity_type.to_string(),
            payload,
            parent_local_id,
        })
        .await
    }

    pub async fn update(&self, local_id: LocalId, payload: Payload) -> Result<EntityRecord> {
        self.upsert_local(LocalWrite::Update { local_id, payload })
            .await
    }

    pub async fn delete(&self, local_id: LocalId) -> Result<EntityRecord> {
        self.upsert_local(LocalWrite::Delete { local_id }).await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(&self, local_id: &LocalId) -> Result<Option<EntityRecord>> {
        let db = self.db.lock().await;
        SqliteEntityRepository::new(db.connection()).get(local_id)
    }

    /// List rows, most recently written first.
    pub async fn list(
        &self,
        entity_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EntityRecord>> {
        let db = self.db.lock().await;
        SqliteEntityRepository::new(db.connection()).list(entity_type, limit, offset)
    }

    pub async fn list_conflicts(&self) -> Result<Vec<EntityRecord>> {
        let db = self.db.lock().await;
        SqliteEntityRepository::new(db.connection()).list_by_state(SyncState::Conflict)
    }

    /// Local IDs starting with `prefix`, at most `limit`.
    pub async fn find_ids_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        SqliteEntityRepository::new(db.connection()).list_ids_by_prefix(prefix, limit)
    }

    pub async fn list_outbox(&self, limit: usize) -> Result<Vec<OutboxDescriptor>> {
        let db = self.db.lock().await;
        SqliteOutboxRepository::new(db.connection()).list(limit)
    }

    pub async fn descriptor(&self, local_id: &LocalId) -> Result<Option<OutboxDescriptor>> {
        let db = self.db.lock().await;
        SqliteOutboxRepository::new(db.connection()).get(local_id)
    }

    /// Sync status as rendered by the UI; `None` if the row does not exist.
    pub async fn sync_status(&self, local_id: &LocalId) -> Result<Option<SyncStatus>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let Some(state) = SqliteEntityRepository::new(conn).sync_state(local_id)? else {
            return Ok(None);
        };

        let status = match state {
            SyncState::Conflict => SyncStatus::Conflict,
            SyncState::Synced => SyncStatus::Synced,
            SyncState::PendingCreate | SyncState::PendingUpdate | SyncState::PendingDelete => {
                let stalled = SqliteOutboxRepository::new(conn)
                    .get(local_id)?
                    .is_some_and(|descriptor| descriptor.is_stalled());
                if stalled {
                    SyncStatus::Stalled
                } else {
                    SyncStatus::Pending
                }
            }
        };
        Ok(Some(status))
    }

    /// Aggregate counts for a sync badge.
    pub async fn overview(&self) -> Result<SyncOverview> {
        let db = self.db.lock().await;
        let entities = SqliteEntityRepository::new(db.connection());
        let stalled = SqliteOutboxRepository::new(db.connection()).count_stalled()?;
        let pending = entities.count_by_state(SyncState::PendingCreate)?
            + entities.count_by_state(SyncState::PendingUpdate)?
            + entities.count_by_state(SyncState::PendingDelete)?;

        Ok(SyncOverview {
            pending: pending.saturating_sub(stalled),
            conflicts: entities.count_by_state(SyncState::Conflict)?,
            stalled,
        })
    }

    // -----------------------------------------------------------------------
    // Outbox (engine side)
    // -----------------------------------------------------------------------

    /// Up to `limit` ready descriptors in queue order. Descriptors that fail to
    /// decode quarantine their row and are left out.
    pub async fn peek_batch(&self, limit: usize) -> Result<Vec<OutboxDescriptor>> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let rows = SqliteOutboxRepository::new(&tx).peek_ready(limit, now)?;

        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            let local_id = row.local_id.clone();
            match row.decode() {
                Ok(descriptor) => batch.push(descriptor),
                Err(error) => {
                    tracing::warn!(
                        "Quarantining {} after outbox decode failure: {}",
                        local_id,
                        error
                    );
                    quarantine_row(&tx, &local_id, &error.to_string(), now)?;
                }
            }
        }
        tx.commit()?;
        Ok(batch)
    }

    pub async fn mark_in_flight(&self, local_id: &LocalId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteOutboxRepository::new(db.connection()).mark_in_flight(local_id)
    }

    pub async fn release(&self, local_id: &LocalId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteOutboxRepository::new(db.connection()).release(local_id)
    }

    /// Remove a descriptor. Idempotent.
    pub async fn ack(&self, local_id: &LocalId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteOutboxRepository::new(db.connection()).ack(local_id)
    }

    /// Remove a descriptor only if no newer local mutation was folded into it.
    pub async fn ack_if_current(&self, local_id: &LocalId, local_version: i64) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteOutboxRepository::new(db.connection()).ack_if_current(local_id, local_version)
    }

    /// Record a failed attempt and schedule the next one.
    pub async fn nack(
        &self,
        local_id: &LocalId,
        error: &str,
        backoff: &BackoffPolicy,
        max_attempts: u32,
    ) -> Result<Option<NackOutcome>> {
        let now = self.now();
        let db = self.db.lock().await;
        let outcome = SqliteOutboxRepository::new(db.connection()).nack(
            local_id,
            error,
            now,
            backoff,
            max_attempts,
        )?;
        if let Some(outcome) = outcome.filter(|outcome| outcome.stalled) {
            tracing::warn!(
                "Descriptor for {} stalled after {} attempts: {}",
                local_id,
                outcome.attempt_count,
                error
            );
        }
        Ok(outcome)
    }

    /// Stop retrying a descriptor until the user intervenes.
    pub async fn stall(&self, local_id: &LocalId, error: &str) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteOutboxRepository::new(db.connection()).stall(local_id, error)
    }

    /// User-requested retry of a stalled descriptor.
    pub async fn retry_stalled(&self, local_id: &LocalId) -> Result<bool> {
        let now = self.now();
        let db = self.db.lock().await;
        SqliteOutboxRepository::new(db.connection()).retry_stalled(local_id, now)
    }

    // -----------------------------------------------------------------------
    // Write-backs from the engine
    // -----------------------------------------------------------------------

    /// Overwrite a row with a server-confirmed snapshot. Skipped (logged) while
    /// a local mutation is pending or the row is in conflict.
    pub async fn apply_remote_snapshot(
        &self,
        local_id: &LocalId,
        remote: &RemoteRecord,
    ) -> Result<bool> {
        let now = self.now();
        let db = self.db.lock().await;
        let conn = db.connection();
        let Some(mut row) = SqliteEntityRepository::new(conn).get(local_id)? else {
            return Err(Error::NotFound(format!("entity {local_id}")));
        };

        if let Some(descriptor) = SqliteOutboxRepository::new(conn).get(local_id)? {
            tracing::debug!(
                "Ignoring remote snapshot v{} for {}: local v{} pending",
                remote.version,
                local_id,
                descriptor.local_version
            );
            return Ok(false);
        }
        if row.sync_state == SyncState::Conflict {
            tracing::debug!("Ignoring remote snapshot for conflicted {}", local_id);
            return Ok(false);
        }

        let expected = row.local_version;
        apply_snapshot(&mut row, remote, now);
        SqliteEntityRepository::new(conn).compare_and_swap(&row, expected)
    }

    /// Set a row to `CONFLICT`, keeping the remote copy beside the local one.
    pub async fn mark_conflict(
        &self,
        local_id: &LocalId,
        remote: Option<RemoteRecord>,
        reason: &str,
    ) -> Result<bool> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let marked = mark_conflict_row(&tx, local_id, remote, reason, now)?;
        tx.commit()?;
        Ok(marked)
    }

    /// Quarantine a row whose persisted data cannot be decoded.
    pub async fn quarantine(&self, local_id: &str, error: &str) -> Result<bool> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let quarantined = quarantine_row(&tx, local_id, error, now)?;
        tx.commit()?;
        Ok(quarantined)
    }

    /// Record a confirmed create/update pushed at `pushed_version`.
    pub async fn complete_push(
        &self,
        local_id: &LocalId,
        pushed_version: i64,
        remote: &RemoteRecord,
    ) -> Result<PushCompletion> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let entities = SqliteEntityRepository::new(&tx);
        let outbox = SqliteOutboxRepository::new(&tx);

        let found = match entities.get(local_id) {
            Ok(found) => found,
            Err(Error::Corrupt { local_id, message }) => {
                quarantine_with_remote(&tx, &local_id, &message, remote, now)?;
                tx.commit()?;
                return Ok(PushCompletion::Quarantined);
            }
            Err(error) => return Err(error),
        };
        let Some(mut row) = found else {
            outbox.ack(local_id)?;
            tx.commit()?;
            return Ok(PushCompletion::Missing);
        };

        let current = row.local_version;
        let completion = if current == pushed_version {
            apply_snapshot(&mut row, remote, now);
            entities.compare_and_swap(&row, current)?;
            outbox.ack_if_current(local_id, pushed_version)?;
            PushCompletion::Synced
        } else {
            record_remote_identity(&mut row, remote);
            if row.sync_state == SyncState::PendingCreate {
                row.sync_state = SyncState::PendingUpdate;
            }
            entities.compare_and_swap(&row, current)?;
            if let Some(mut descriptor) = outbox.get(local_id)? {
                if descriptor.operation == Operation::Create {
                    descriptor.operation = Operation::Update;
                }
                descriptor.in_flight = false;
                outbox.replace(&descriptor)?;
            }
            tracing::debug!(
                "{} changed during push (v{} -> v{}); keeping it pending",
                local_id,
                pushed_version,
                current
            );
            PushCompletion::StillPending
        };

        tx.commit()?;
        Ok(completion)
    }

    /// Remove a row and its descriptor after a confirmed remote delete.
    pub async fn complete_delete(&self, local_id: &LocalId) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        SqliteOutboxRepository::new(&tx).ack(local_id)?;
        let removed = SqliteEntityRepository::new(&tx).delete(local_id)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Apply the remote snapshot and re-enqueue the merged payload on top of it.
    ///
    /// Only releases the descriptor when the row was edited after
    /// `pushed_version`.
    pub async fn rebase_after_merge(
        &self,
        local_id: &LocalId,
        pushed_version: i64,
        remote: &RemoteRecord,
        merged: Payload,
    ) -> Result<RebaseOutcome> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let entities = SqliteEntityRepository::new(&tx);
        let outbox = SqliteOutboxRepository::new(&tx);

        let row = match entities.get(local_id) {
            Ok(row) => row,
            Err(Error::Corrupt { local_id, message }) => {
                quarantine_with_remote(&tx, &local_id, &message, remote, now)?;
                tx.commit()?;
                return Ok(RebaseOutcome::Quarantined);
            }
            Err(error) => return Err(error),
        };
        let Some(mut row) = row.filter(|row| row.local_version == pushed_version) else {
            outbox.release(local_id)?;
            tx.commit()?;
            return Ok(RebaseOutcome::Stale);
        };

        if merged == remote.payload {
            apply_snapshot(&mut row, remote, now);
            entities.compare_and_swap(&row, pushed_version)?;
            outbox.ack(local_id)?;
        } else {
            record_remote_identity(&mut row, remote);
            row.payload = merged.clone();
            row.sync_state = SyncState::PendingUpdate;
            row.local_version = pushed_version + 1;
            row.updated_at = now;
            entities.compare_and_swap(&row, pushed_version)?;
            requeue(&outbox, &row, Operation::Update, Some(merged), now)?;
        }

        tx.commit()?;
        Ok(RebaseOutcome::Rebased)
    }

    // -----------------------------------------------------------------------
    // Conflict resolution
    // -----------------------------------------------------------------------

    /// Settle a conflicted row with the user's chosen copy.
    pub async fn resolve_conflict(
        &self,
        local_id: &LocalId,
        resolution: Resolution,
    ) -> Result<Option<EntityRecord>> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let entities = SqliteEntityRepository::new(&tx);
        let outbox = SqliteOutboxRepository::new(&tx);

        let mut row = entities
            .get(local_id)?
            .ok_or_else(|| Error::NotFound(format!("entity {local_id}")))?;
        if row.sync_state != SyncState::Conflict {
            return Err(Error::InvalidTransition(format!(
                "entity {local_id} is {}, not in conflict",
                row.sync_state
            )));
        }

        let expected = row.local_version;
        let pending_operation = outbox.get(local_id)?.map(|descriptor| descriptor.operation);
        let remote = row.conflict_remote.take();

        let resolved = match (resolution, remote) {
            (Resolution::UseRemote, Some(remote)) if remote.deleted => {
                outbox.ack(local_id)?;
                entities.delete(local_id)?;
                None
            }
            (Resolution::UseRemote, Some(remote)) => {
                apply_snapshot(&mut row, &remote, now);
                entities.compare_and_swap(&row, expected)?;
                outbox.ack(local_id)?;
                Some(row)
            }
            (Resolution::UseRemote, None) => {
                return Err(Error::InvalidInput(format!(
                    "no remote copy recorded for {local_id}; resolve with the local copy or a custom payload"
                )));
            }
            (choice, remote) => {
                let delete_wins = choice == Resolution::UseLocal
                    && pending_operation == Some(Operation::Delete);
                let payload = match choice {
                    Resolution::Custom(payload) => payload,
                    _ => row.payload.clone(),
                };

                match &remote {
                    Some(remote) if remote.deleted => {
                        row.remote_id = None;
                        row.remote_version = None;
                        row.remote_updated_at = None;
                        row.base_payload = None;
                    }
                    Some(remote) => record_remote_identity(&mut row, remote),
                    None => {}
                }

                row.payload = payload;
                row.local_version = expected + 1;
                row.last_error = None;
                row.updated_at = now;

                let operation = if row.remote_id.is_none() {
                    Operation::Create
                } else if delete_wins {
                    Operation::Delete
                } else {
                    Operation::Update
                };

                let in_sync = operation == Operation::Update
                    && remote
                        .as_ref()
                        .is_some_and(|remote| !remote.deleted && remote.payload == row.payload);
                if in_sync {
                    row.sync_state = SyncState::Synced;
                    entities.compare_and_swap(&row, expected)?;
                    outbox.ack(local_id)?;
                } else {
                    row.sync_state = operation.pending_state();
                    entities.compare_and_swap(&row, expected)?;
                    let payload = (operation != Operation::Delete).then(|| row.payload.clone());
                    requeue(&outbox, &row, operation, payload, now)?;
                }
                Some(row)
            }
        };

        tx.commit()?;
        tracing::info!("Resolved conflict on {}", local_id);
        Ok(resolved)
    }

    // -----------------------------------------------------------------------
    // Pull side
    // -----------------------------------------------------------------------

    /// Merge remotely-originated changes into rows without local work pending,
    /// then advance the pull cursor.
    pub async fn apply_pulled(
        &self,
        entity_type: &str,
        records: &[RemoteRecord],
    ) -> Result<PullReport> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let entities = SqliteEntityRepository::new(&tx);
        let outbox = SqliteOutboxRepository::new(&tx);
        let mut report = PullReport::default();

        for remote in records {
            let found = match entities.get_by_remote_id(entity_type, &remote.remote_id) {
                Ok(found) => found,
                Err(Error::Corrupt { local_id, message }) => {
                    quarantine_with_remote(&tx, &local_id, &message, remote, now)?;
                    report.quarantined += 1;
                    continue;
                }
                Err(error) => return Err(error),
            };
            let Some(mut row) = found else {
                if !remote.deleted {
                    entities.insert(&EntityRecord::from_remote(entity_type, remote, now))?;
                    report.inserted += 1;
                }
                continue;
            };

            // The cursor moves past this record, so the conflict copy must track it
            if row.sync_state == SyncState::Conflict {
                if refresh_conflict_copy(&entities, &mut row, remote)? {
                    report.refreshed += 1;
                } else {
                    report.skipped += 1;
                }
                continue;
            }

            let pending = match outbox.get(&row.local_id) {
                Ok(descriptor) => descriptor.is_some(),
                Err(Error::Corrupt { local_id, message }) => {
                    quarantine_with_remote(&tx, &local_id, &message, remote, now)?;
                    report.quarantined += 1;
                    continue;
                }
                Err(error) => return Err(error),
            };

            // Local wins until pushed
            if row.sync_state != SyncState::Synced || pending {
                report.skipped += 1;
                continue;
            }

            if remote.deleted {
                entities.delete(&row.local_id)?;
                report.deleted += 1;
            } else if remote.version > row.remote_version.unwrap_or(0) {
                let expected = row.local_version;
                apply_snapshot(&mut row, remote, now);
                entities.compare_and_swap(&row, expected)?;
                report.updated += 1;
            }
        }

        if let Some(cursor) = records.iter().map(|record| record.updated_at).max() {
            entities.set_pull_cursor(entity_type, cursor)?;
        }
        tx.commit()?;
        Ok(report)
    }

    pub async fn pull_cursor(&self, entity_type: &str) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        SqliteEntityRepository::new(db.connection()).pull_cursor(entity_type)
    }

    // -----------------------------------------------------------------------
    // Startup recovery
    // -----------------------------------------------------------------------

    /// Repair state left by a crash: release stale in-flight flags, quarantine
    /// undecodable rows, re-synthesize missing descriptors and drop descriptors
    /// whose row is gone.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let entities = SqliteEntityRepository::new(&tx);
        let outbox = SqliteOutboxRepository::new(&tx);
        let mut report = RecoveryReport {
            released: outbox.release_all()?,
            ..RecoveryReport::default()
        };

        for (local_id, error) in entities.scan_corrupt()? {
            if quarantine_row(&tx, &local_id, &error, now)? {
                report.quarantined += 1;
            }
        }

        for row in entities.find_orphans()? {
            let Some(operation) = row.sync_state.pending_operation() else {
                continue;
            };
            let payload = (operation != Operation::Delete).then(|| row.payload.clone());
            outbox.enqueue(
                &NewDescriptor {
                    local_id: row.local_id,
                    entity_type: row.entity_type.clone(),
                    operation,
                    payload,
                    local_version: row.local_version,
                    remote_known: row.remote_id.is_some(),
                },
                row.updated_at,
            )?;
            report.resynthesized += 1;
        }

        report.orphan_descriptors = outbox.delete_orphans()?;
        tx.commit()?;

        if report != RecoveryReport::default() {
            tracing::info!(
                "Recovery: released {}, re-synthesized {}, quarantined {}, dropped {} orphan descriptors",
                report.released,
                report.resynthesized,
                report.quarantined,
                report.orphan_descriptors
            );
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Drafts
    // -----------------------------------------------------------------------

    pub async fn save_draft(&self, key: &str, payload: serde_json::Value) -> Result<Draft> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::InvalidInput("draft key must not be empty".to_string()));
        }
        let draft = Draft {
            key: key.to_string(),
            payload,
            updated_at: self.now(),
        };
        let db = self.db.lock().await;
        SqliteDraftRepository::new(db.connection()).save(&draft)?;
        Ok(draft)
    }

    pub async fn load_draft(&self, key: &str) -> Result<Option<Draft>> {
        let db = self.db.lock().await;
        SqliteDraftRepository::new(db.connection()).load(key)
    }

    pub async fn clear_draft(&self, key: &str) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteDraftRepository::new(db.connection()).clear(key)
    }

    pub async fn list_drafts(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<Draft>> {
        let db = self.db.lock().await;
        SqliteDraftRepository::new(db.connection()).list(prefix, limit)
    }

    /// Turn a draft into a new entity and clear it, in one transaction.
    pub async fn submit_draft(
        &self,
        key: &str,
        entity_type: &str,
        parent_local_id: Option<LocalId>,
    ) -> Result<EntityRecord> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let drafts = SqliteDraftRepository::new(&tx);

        let draft = drafts
            .load(key)?
            .ok_or_else(|| Error::NotFound(format!("draft {key}")))?;
        let serde_json::Value::Object(payload) = draft.payload else {
            return Err(Error::InvalidInput(format!(
                "draft {key} is not a JSON object"
            )));
        };

        let record = write_local(
            &tx,
            LocalWrite::Create {
                entity_type: entity_type.to_string(),
                payload,
                parent_local_id,
            },
            now,
        )?;
        drafts.clear(key)?;
        tx.commit()?;
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// Private
// ---------------------------------------------------------------------------

/// Row write + descriptor enqueue; the caller owns the transaction.
fn write_local(conn: &Connection, write: LocalWrite, now: i64) -> Result<EntityRecord> {
    let entities = SqliteEntityRepository::new(conn);
    let outbox = SqliteOutboxRepository::new(conn);

    match write {
        LocalWrite::Create {
            entity_type,
            payload,
            parent_local_id,
        } => {
            let entity_type = entity_type.trim();
            if entity_type.is_empty() {
                return Err(Error::InvalidInput("entity type must not be empty".to_string()));
            }
            if let Some(parent) = parent_local_id {
                if entities.sync_state(&parent)?.is_none() {
                    return Err(Error::NotFound(format!("parent entity {parent}")));
                }
            }

            let record = EntityRecord::new_pending(entity_type, payload, parent_local_id, now);
            entities.insert(&record)?;
            outbox.enqueue(
                &NewDescriptor {
                    local_id: record.local_id,
                    entity_type: record.entity_type.clone(),
                    operation: Operation::Create,
                    payload: Some(record.payload.clone()),
                    local_version: record.local_version,
                    remote_known: false,
                },
                now,
            )?;
            tracing::debug!("Created {} {}", record.entity_type, record.local_id);
            Ok(record)
        }
        LocalWrite::Update { local_id, payload } => {
            let mut row = editable_row(&entities, &local_id)?;
            if row.sync_state == SyncState::PendingDelete {
                return Err(Error::InvalidTransition(format!(
                    "entity {local_id} is pending deletion"
                )));
            }

            let expected = row.local_version;
            row.payload = payload;
            row.local_version += 1;
            row.updated_at = now;
            if row.sync_state != SyncState::PendingCreate {
                row.sync_state = SyncState::PendingUpdate;
            }
            swap_or_fail(&entities, &row, expected)?;

            let outcome = outbox.enqueue(
                &NewDescriptor {
                    local_id,
                    entity_type: row.entity_type.clone(),
                    operation: Operation::Update,
                    payload: Some(row.payload.clone()),
                    local_version: row.local_version,
                    remote_known: row.remote_id.is_some(),
                },
                now,
            )?;
            if outcome == EnqueueOutcome::Coalesced {
                tracing::debug!("Coalesced update into pending descriptor for {}", local_id);
            }
            Ok(row)
        }
        LocalWrite::Delete { local_id } => {
            let mut row = editable_row(&entities, &local_id)?;
            let expected = row.local_version;
            row.local_version += 1;
            row.updated_at = now;
            row.sync_state = SyncState::PendingDelete;
            swap_or_fail(&entities, &row, expected)?;

            let outcome = outbox.enqueue(
                &NewDescriptor {
                    local_id,
                    entity_type: row.entity_type.clone(),
                    operation: Operation::Delete,
                    payload: None,
                    local_version: row.local_version,
                    remote_known: row.remote_id.is_some(),
                },
                now,
            )?;
            if outcome == EnqueueOutcome::Cancelled {
                entities.delete(&local_id)?;
                tracing::debug!("Delete cancelled unsent create for {}", local_id);
            }
            Ok(row)
        }
    }
}

fn editable_row(entities: &SqliteEntityRepository<'_>, local_id: &LocalId) -> Result<EntityRecord> {
    let row = entities
        .get(local_id)?
        .ok_or_else(|| Error::NotFound(format!("entity {local_id}")))?;
    if row.sync_state == SyncState::Conflict {
        return Err(Error::InvalidTransition(format!(
            "entity {local_id} is in conflict; resolve it first"
        )));
    }
    Ok(row)
}

fn swap_or_fail(
    entities: &SqliteEntityRepository<'_>,
    row: &EntityRecord,
    expected: i64,
) -> Result<()> {
    if entities.compare_and_swap(row, expected)? {
        Ok(())
    } else {
        Err(Error::Database(format!(
            "entity {} changed concurrently",
            row.local_id
        )))
    }
}

/// Take the confirmed snapshot as both data and merge base.
fn apply_snapshot(row: &mut EntityRecord, remote: &RemoteRecord, now: i64) {
    record_remote_identity(row, remote);
    row.payload = remote.payload.clone();
    row.sync_state = SyncState::Synced;
    row.conflict_remote = None;
    row.last_error = None;
    row.updated_at = now;
}

fn record_remote_identity(row: &mut EntityRecord, remote: &RemoteRecord) {
    row.remote_id = Some(remote.remote_id.clone());
    row.remote_version = Some(remote.version);
    row.remote_updated_at = Some(remote.updated_at);
    row.base_payload = Some(remote.payload.clone());
}

/// Overwrite the descriptor for `row` as a fresh, immediately ready attempt,
/// keeping its queue position.
fn requeue(
    outbox: &SqliteOutboxRepository<'_>,
    row: &EntityRecord,
    operation: Operation,
    payload: Option<Payload>,
    now: i64,
) -> Result<()> {
    let enqueued_at = outbox
        .get(&row.local_id)?
        .map_or(now, |descriptor| descriptor.enqueued_at);
    outbox.replace(&OutboxDescriptor {
        local_id: row.local_id,
        entity_type: row.entity_type.clone(),
        operation,
        payload,
        local_version: row.local_version,
        enqueued_at,
        attempt_count: 0,
        next_attempt_at: now,
        last_backoff_ms: 0,
        last_error: None,
        status: DescriptorStatus::Pending,
        in_flight: false,
    })
}

fn mark_conflict_row(
    conn: &Connection,
    local_id: &LocalId,
    remote: Option<RemoteRecord>,
    reason: &str,
    now: i64,
) -> Result<bool> {
    let entities = SqliteEntityRepository::new(conn);
    let Some(mut row) = entities.get(local_id)? else {
        return Ok(false);
    };

    let expected = row.local_version;
    row.sync_state = SyncState::Conflict;
    row.conflict_remote = remote;
    row.last_error = Some(reason.to_string());
    row.updated_at = now;
    let marked = entities.compare_and_swap(&row, expected)?;

    let outbox = SqliteOutboxRepository::new(conn);
    if let Some(mut descriptor) = outbox.get(local_id)? {
        descriptor.in_flight = false;
        descriptor.status = DescriptorStatus::Pending;
        descriptor.attempt_count = 0;
        descriptor.last_error = Some(reason.to_string());
        outbox.replace(&descriptor)?;
    }

    tracing::warn!("Marked {} as conflicted: {}", local_id, reason);
    Ok(marked)
}

fn quarantine_row(conn: &Connection, local_id: &str, error: &str, now: i64) -> Result<bool> {
    let quarantined = SqliteEntityRepository::new(conn).quarantine(local_id, error, now)?;
    conn.execute(
        "UPDATE outbox SET in_flight = 0 WHERE local_id = ?",
        [local_id],
    )?;

    // Resolution re-queues from the row, so an undecodable descriptor has nothing left to offer
    if let Ok(parsed) = local_id.parse::<LocalId>() {
        let outbox = SqliteOutboxRepository::new(conn);
        if let Err(Error::Corrupt { message, .. }) = outbox.get(&parsed) {
            tracing::warn!("Dropping undecodable descriptor for {}: {}", local_id, message);
            outbox.ack(&parsed)?;
        }
    }
    if quarantined {
        tracing::warn!("Quarantined {}: {}", local_id, error);
    }
    Ok(quarantined)
}

/// Quarantine a row hit by a sync write-back and keep the remote copy the
/// call returned, so the user can still pick it.
fn quarantine_with_remote(
    conn: &Connection,
    local_id: &str,
    error: &str,
    remote: &RemoteRecord,
    now: i64,
) -> Result<bool> {
    tracing::warn!("Quarantining {} during sync: {}", local_id, error);
    let quarantined = quarantine_row(conn, local_id, error, now)?;
    let Ok(parsed) = local_id.parse::<LocalId>() else {
        return Ok(quarantined);
    };

    let entities = SqliteEntityRepository::new(conn);
    match entities.get(&parsed) {
        Ok(Some(mut row)) => {
            let expected = row.local_version;
            record_remote_identity(&mut row, remote);
            row.conflict_remote = Some(remote.clone());
            entities.compare_and_swap(&row, expected)?;
        }
        // Damage in a column quarantine cannot reset
        Ok(None) | Err(Error::Corrupt { .. }) => {}
        Err(error) => return Err(error),
    }
    Ok(quarantined)
}

/// Replace the remote copy on a conflicted row when `remote` is newer.
fn refresh_conflict_copy(
    entities: &SqliteEntityRepository<'_>,
    row: &mut EntityRecord,
    remote: &RemoteRecord,
) -> Result<bool> {
    let newer = row.conflict_remote.as_ref().is_none_or(|copy| {
        remote.version > copy.version || (remote.deleted && !copy.deleted)
    });
    if !newer {
        return Ok(false);
    }

    let expected = row.local_version;
    row.conflict_remote = Some(remote.clone());
    let refreshed = entities.compare_and_swap(row, expected)?;
    if refreshed {
        tracing::debug!(
            "Refreshed remote copy of conflicted {} to v{}",
            row.local_id,
            remote.version
        );
    }
    Ok(refreshed)
}

#[cfg(test)]
impl SyncStore {
    /// Run raw SQL bound to one local id, for simulating on-disk damage.
    pub(crate) async fn execute_raw(&self, sql: &str, local_id: &LocalId) -> Result<usize> {
        let db = self.db.lock().await;
        Ok(db.connection().execute(sql, [local_id.as_str()])?)
    }
}
