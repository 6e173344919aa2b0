//! Reconciliation engine: drains the outbox against the remote gateway and
//! pulls remotely-originated changes back into the local store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use super::backoff::BackoffPolicy;
use super::gateway::{GatewayError, RemoteGateway, Session};
use super::merge::{MergeOutcome, MergeTable};
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::models::{EntityRecord, LocalId, Operation, OutboxDescriptor, RemoteRecord};
use crate::services::{PushCompletion, RebaseOutcome, SyncStore};

/// Process-wide state captured at cycle start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleContext {
    pub online: bool,
    pub session: Option<Session>,
}

impl CycleContext {
    pub const fn online(session: Session) -> Self {
        Self {
            online: true,
            session: Some(session),
        }
    }

    pub const fn offline() -> Self {
        Self {
            online: false,
            session: None,
        }
    }
}

/// What one `run_cycle` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Mutations confirmed by the remote
    pub pushed: usize,
    /// Version conflicts resolved by the merge policy
    pub merged: usize,
    /// Rows escalated to `CONFLICT`
    pub conflicts: usize,
    /// Failed attempts scheduled for retry
    pub retried: usize,
    /// Descriptors that reached `STALLED`
    pub stalled: usize,
    /// Descriptors skipped because their parent failed in this cycle
    pub skipped: usize,
    /// Rows quarantined for corruption
    pub quarantined: usize,
    /// Rows inserted, updated or deleted by the pull phase
    pub pulled: usize,
    /// Extra passes run for triggers that arrived mid-cycle
    pub reruns: usize,
    /// Another cycle was running; it will run again on our behalf
    pub coalesced: bool,
    pub cancelled: bool,
    /// Nothing ran: offline or without a session
    pub offline: bool,
    /// Nothing ran, or the cycle stopped, because the engine is paused
    pub paused: bool,
}

impl CycleReport {
    /// Whether anything was pushed, pulled or escalated.
    pub const fn did_work(&self) -> bool {
        self.pushed
            + self.merged
            + self.conflicts
            + self.retried
            + self.stalled
            + self.skipped
            + self.quarantined
            + self.pulled
            > 0
    }
}

/// Whether the engine is allowed to talk to the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineHealth {
    Active,
    /// Repeated auth failures; waits for `resume()`
    Paused(String),
}

/// Per-cycle bookkeeping shared by all passes.
#[derive(Default)]
struct CycleState {
    report: CycleReport,
    /// Merged once already; a second conflict waits for the next cycle
    merged: HashSet<LocalId>,
}

/// Per-pass bookkeeping.
#[derive(Default)]
struct PassState {
    /// Failed in this pass; their dependents are skipped
    blocked: HashSet<LocalId>,
    /// Already handled in this pass and still ready
    attempted: HashSet<LocalId>,
}

/// Drains the outbox and keeps the local store convergent with the remote.
pub struct ReconciliationEngine<G> {
    store: SyncStore,
    gateway: G,
    settings: SyncSettings,
    merge_table: MergeTable,
    backoff: BackoffPolicy,
    cycle_lock: tokio::sync::Mutex<()>,
    rerun: AtomicBool,
    cancelled: AtomicBool,
    auth_failures: AtomicU32,
    health: Mutex<EngineHealth>,
}

impl<G: RemoteGateway> ReconciliationEngine<G> {
    pub fn new(store: SyncStore, gateway: G, settings: SyncSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            merge_table: settings.merge_table(),
            backoff: settings.backoff(),
            store,
            gateway,
            settings,
            cycle_lock: tokio::sync::Mutex::new(()),
            rerun: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            auth_failures: AtomicU32::new(0),
            health: Mutex::new(EngineHealth::Active),
        })
    }

    /// Replace the backoff policy derived from the settings.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub const fn store(&self) -> &SyncStore {
        &self.store
    }

    pub const fn gateway(&self) -> &G {
        &self.gateway
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn health(&self) -> EngineHealth {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.health(), EngineHealth::Paused(_))
    }

    /// Clear a pause, e.g. after the user signed in again.
    pub fn resume(&self) {
        self.auth_failures.store(0, Ordering::SeqCst);
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        if *health != EngineHealth::Active {
            tracing::info!("Sync resumed");
            *health = EngineHealth::Active;
        }
    }

    fn pause(&self, reason: String) {
        tracing::warn!("Sync paused: {}", reason);
        *self.health.lock().unwrap_or_else(PoisonError::into_inner) = EngineHealth::Paused(reason);
    }

    /// Ask the running cycle to stop before its next descriptor. Calls already
    /// in flight complete and are recorded normally.
    pub fn cancel(&self) {
        tracing::debug!("Sync cancellation requested");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run one drain cycle: push ready descriptors, then pull remote changes.
    ///
    /// Only one cycle runs at a time. A call made while a cycle is running
    /// returns at once with `coalesced` set, and the running cycle makes one
    /// more pass before finishing.
    pub async fn run_cycle(&self, context: &CycleContext) -> Result<CycleReport> {
        let session = match (&context.session, context.online) {
            (Some(session), true) => session,
            _ => {
                tracing::debug!("Skipping sync cycle while offline");
                return Ok(CycleReport {
                    offline: true,
                    ..CycleReport::default()
                });
            }
        };
        if self.is_paused() {
            return Ok(CycleReport {
                paused: true,
                ..CycleReport::default()
            });
        }

        let Ok(_guard) = self.cycle_lock.try_lock() else {
            self.rerun.store(true, Ordering::SeqCst);
            tracing::debug!("Sync cycle already running; coalescing trigger");
            return Ok(CycleReport {
                coalesced: true,
                ..CycleReport::default()
            });
        };
        self.cancelled.store(false, Ordering::SeqCst);

        let mut cycle = CycleState::default();
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            self.run_pass(session, &mut cycle).await?;

            if self.is_cancelled() || self.is_paused() {
                break;
            }
            if !self.rerun.swap(false, Ordering::SeqCst) {
                break;
            }
            cycle.report.reruns += 1;
        }

        let mut report = cycle.report;
        report.cancelled = self.is_cancelled();
        report.paused = self.is_paused();
        if report.did_work() {
            tracing::info!(
                "Sync cycle finished: pushed {}, merged {}, conflicts {}, retried {}, stalled {}, pulled {}",
                report.pushed,
                report.merged,
                report.conflicts,
                report.retried,
                report.stalled,
                report.pulled
            );
        } else {
            tracing::debug!("Sync cycle finished with nothing to do");
        }
        Ok(report)
    }

    async fn run_pass(&self, session: &Session, cycle: &mut CycleState) -> Result<()> {
        let mut pass = PassState::default();
        let batch_size = self.settings.batch_size;

        'batches: loop {
            let batch: Vec<OutboxDescriptor> = self
                .store
                .peek_batch(batch_size + pass.attempted.len())
                .await?
                .into_iter()
                .filter(|descriptor| !pass.attempted.contains(&descriptor.local_id))
                .take(batch_size)
                .collect();
            if batch.is_empty() {
                break;
            }

            for descriptor in batch {
                if self.is_cancelled() || self.is_paused() {
                    break 'batches;
                }
                self.process(session, descriptor, cycle, &mut pass).await?;
            }
        }

        if !self.is_cancelled() && !self.is_paused() {
            self.pull(session, cycle).await?;
        }
        Ok(())
    }

    async fn process(
        &self,
        session: &Session,
        descriptor: OutboxDescriptor,
        cycle: &mut CycleState,
        pass: &mut PassState,
    ) -> Result<()> {
        let local_id = descriptor.local_id;
        pass.attempted.insert(local_id);

        let row = match self.store.get(&local_id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                tracing::warn!("Dropping descriptor for missing entity {}", local_id);
                self.store.ack(&local_id).await?;
                return Ok(());
            }
            Err(Error::Corrupt { local_id, message }) => {
                self.store.quarantine(&local_id, &message).await?;
                cycle.report.quarantined += 1;
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        if row
            .parent_local_id
            .is_some_and(|parent| pass.blocked.contains(&parent))
        {
            tracing::debug!("Skipping {}: parent failed in this cycle", local_id);
            pass.blocked.insert(local_id);
            cycle.report.skipped += 1;
            return Ok(());
        }

        if !self.store.mark_in_flight(&local_id).await? {
            return Ok(());
        }

        match descriptor.operation {
            Operation::Create | Operation::Update => {
                self.push_upsert(session, &descriptor, &row, cycle, pass)
                    .await
            }
            Operation::Delete => self.push_delete(session, &descriptor, &row, cycle, pass).await,
        }
    }

    async fn push_upsert(
        &self,
        session: &Session,
        descriptor: &OutboxDescriptor,
        row: &EntityRecord,
        cycle: &mut CycleState,
        pass: &mut PassState,
    ) -> Result<()> {
        let local_id = descriptor.local_id;
        let Some(payload) = descriptor.payload.as_ref() else {
            self.store
                .quarantine(&local_id.as_str(), "descriptor has no payload")
                .await?;
            cycle.report.quarantined += 1;
            return Ok(());
        };

        let result = match &row.remote_id {
            Some(remote_id) => {
                self.gateway
                    .update(
                        session,
                        &descriptor.entity_type,
                        remote_id,
                        payload,
                        row.remote_version.unwrap_or(0),
                    )
                    .await
            }
            None => {
                self.gateway
                    .create(session, &descriptor.entity_type, payload)
                    .await
            }
        };

        match result {
            Ok(remote) => {
                self.auth_failures.store(0, Ordering::SeqCst);
                let completion = self
                    .store
                    .complete_push(&local_id, descriptor.local_version, &remote)
                    .await?;
                cycle.report.pushed += 1;
                match completion {
                    // Newer local edit: push it again in this pass
                    PushCompletion::StillPending => {
                        pass.attempted.remove(&local_id);
                    }
                    PushCompletion::Quarantined => cycle.report.quarantined += 1,
                    PushCompletion::Synced | PushCompletion::Missing => {}
                }
                tracing::debug!(
                    "Pushed {} {} as {} v{}",
                    descriptor.operation,
                    local_id,
                    remote.remote_id,
                    remote.version
                );
                Ok(())
            }
            Err(GatewayError::VersionConflict(current)) => {
                self.auth_failures.store(0, Ordering::SeqCst);
                self.resolve_version_conflict(session, descriptor, row, current, cycle, pass)
                    .await
            }
            Err(GatewayError::NotFound) if row.remote_id.is_some() => {
                let remote_id = row.remote_id.clone().unwrap_or_default();
                let tombstone = RemoteRecord::tombstone(
                    remote_id,
                    row.remote_version.unwrap_or(0),
                    self.store.now(),
                );
                self.store
                    .mark_conflict(&local_id, Some(tombstone), "record was deleted remotely")
                    .await?;
                cycle.report.conflicts += 1;
                Ok(())
            }
            Err(error) => self.record_failure(&local_id, error, cycle, pass).await,
        }
    }

    async fn push_delete(
        &self,
        session: &Session,
        descriptor: &OutboxDescriptor,
        row: &EntityRecord,
        cycle: &mut CycleState,
        pass: &mut PassState,
    ) -> Result<()> {
        let local_id = descriptor.local_id;
        let Some(remote_id) = row.remote_id.as_deref() else {
            // Never reached the remote
            self.store.complete_delete(&local_id).await?;
            cycle.report.pushed += 1;
            return Ok(());
        };

        let result = self
            .gateway
            .delete(
                session,
                &descriptor.entity_type,
                remote_id,
                row.remote_version.unwrap_or(0),
            )
            .await;

        match result {
            Ok(()) | Err(GatewayError::NotFound) => {
                self.auth_failures.store(0, Ordering::SeqCst);
                self.store.complete_delete(&local_id).await?;
                cycle.report.pushed += 1;
                tracing::debug!("Deleted {} ({})", local_id, remote_id);
                Ok(())
            }
            Err(GatewayError::VersionConflict(current)) => {
                self.auth_failures.store(0, Ordering::SeqCst);
                let current = match current {
                    Some(current) => Some(current),
                    None => self
                        .gateway
                        .get(session, &descriptor.entity_type, remote_id)
                        .await
                        .ok(),
                };
                self.store
                    .mark_conflict(&local_id, current, "record changed remotely before delete")
                    .await?;
                cycle.report.conflicts += 1;
                Ok(())
            }
            Err(error) => self.record_failure(&local_id, error, cycle, pass).await,
        }
    }

    async fn resolve_version_conflict(
        &self,
        session: &Session,
        descriptor: &OutboxDescriptor,
        row: &EntityRecord,
        current: Option<RemoteRecord>,
        cycle: &mut CycleState,
        pass: &mut PassState,
    ) -> Result<()> {
        let local_id = descriptor.local_id;
        if cycle.merged.contains(&local_id) {
            tracing::debug!("{} conflicted again after merge; retrying next cycle", local_id);
            self.store.release(&local_id).await?;
            return Ok(());
        }

        let current = match current {
            Some(current) => current,
            None => {
                let remote_id = row.remote_id.as_deref().unwrap_or_default();
                match self
                    .gateway
                    .get(session, &descriptor.entity_type, remote_id)
                    .await
                {
                    Ok(current) => current,
                    Err(GatewayError::NotFound) => RemoteRecord::tombstone(
                        remote_id,
                        row.remote_version.unwrap_or(0),
                        self.store.now(),
                    ),
                    Err(error) => {
                        return self.record_failure(&local_id, error, cycle, pass).await;
                    }
                }
            }
        };

        if current.deleted {
            self.store
                .mark_conflict(&local_id, Some(current), "record was deleted remotely")
                .await?;
            cycle.report.conflicts += 1;
            return Ok(());
        }

        let local = descriptor.payload.as_ref().unwrap_or(&row.payload);
        match self.merge_table.merge(
            &descriptor.entity_type,
            row.base_payload.as_ref(),
            local,
            &current.payload,
        ) {
            MergeOutcome::Merged {
                payload,
                dropped_groups,
            } => {
                if !dropped_groups.is_empty() {
                    tracing::info!(
                        "Remote won groups [{}] for {}; local edits there dropped",
                        dropped_groups.join(", "),
                        local_id
                    );
                }
                match self
                    .store
                    .rebase_after_merge(&local_id, descriptor.local_version, &current, payload)
                    .await?
                {
                    RebaseOutcome::Rebased => {
                        cycle.merged.insert(local_id);
                        cycle.report.merged += 1;
                        // Push the merged payload in this pass
                        pass.attempted.remove(&local_id);
                    }
                    RebaseOutcome::Quarantined => cycle.report.quarantined += 1,
                    RebaseOutcome::Stale => {}
                }
                Ok(())
            }
            MergeOutcome::Conflict { fields } => {
                let reason = format!("conflicting remote changes to {}", fields.join(", "));
                self.store
                    .mark_conflict(&local_id, Some(current), &reason)
                    .await?;
                cycle.report.conflicts += 1;
                Ok(())
            }
        }
    }

    async fn record_failure(
        &self,
        local_id: &LocalId,
        error: GatewayError,
        cycle: &mut CycleState,
        pass: &mut PassState,
    ) -> Result<()> {
        pass.blocked.insert(*local_id);
        let message = error.to_string();

        match error {
            GatewayError::Validation(_) | GatewayError::NotFound => {
                self.store.stall(local_id, &message).await?;
                cycle.report.stalled += 1;
                tracing::warn!("Remote rejected {}: {}", local_id, message);
                return Ok(());
            }
            GatewayError::AuthExpired(_) => {
                let failures = self.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.settings.auth_failure_threshold {
                    self.pause(format!(
                        "{failures} consecutive authentication failures: {message}"
                    ));
                }
            }
            GatewayError::Transient(_) | GatewayError::VersionConflict(_) => {}
        }

        let outcome = self
            .store
            .nack(local_id, &message, &self.backoff, self.settings.max_attempts)
            .await?;
        cycle.report.retried += 1;
        if outcome.is_some_and(|outcome| outcome.stalled) {
            cycle.report.stalled += 1;
        }
        Ok(())
    }

    async fn pull(&self, session: &Session, cycle: &mut CycleState) -> Result<()> {
        for entity_type in &self.settings.pull_entity_types {
            if self.is_cancelled() || self.is_paused() {
                break;
            }
            let since = self.store.pull_cursor(entity_type).await?;
            match self.gateway.list(session, entity_type, since).await {
                Ok(records) if records.is_empty() => {}
                Ok(records) => {
                    self.auth_failures.store(0, Ordering::SeqCst);
                    let pulled = self.store.apply_pulled(entity_type, &records).await?;
                    cycle.report.pulled += pulled.inserted + pulled.updated + pulled.deleted;
                    cycle.report.quarantined += pulled.quarantined;
                }
                Err(GatewayError::AuthExpired(message)) => {
                    let failures = self.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= self.settings.auth_failure_threshold {
                        self.pause(format!(
                            "{failures} consecutive authentication failures: {message}"
                        ));
                    }
                }
                Err(error) => {
                    tracing::warn!("Pull of {} failed: {}", entity_type, error);
                }
            }
        }
        Ok(())
    }
}
