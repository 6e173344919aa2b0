//! In-process remote store with failure injection.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::gateway::{GatewayError, GatewayResult, RemoteGateway, Session};
use crate::models::{Operation, Payload, RemoteRecord};

/// Failure to return instead of performing a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    AuthExpired,
    Validation(String),
}

impl InjectedFailure {
    fn to_error(&self) -> GatewayError {
        match self {
            Self::Transient => GatewayError::Transient("injected network failure".to_string()),
            Self::AuthExpired => GatewayError::AuthExpired("injected auth failure".to_string()),
            Self::Validation(message) => GatewayError::Validation(message.clone()),
        }
    }
}

/// One call observed by the remote, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub operation: Operation,
    pub entity_type: String,
    pub remote_id: Option<String>,
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone)]
enum Matcher {
    Any,
    Field(String, Value),
    Record(String),
}

#[derive(Debug, Clone)]
struct FailureRule {
    matcher: Matcher,
    failure: InjectedFailure,
    remaining: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// (entity type, remote id) -> record; deleted records stay as tombstones
    records: BTreeMap<(String, String), RemoteRecord>,
    next_id: u64,
    clock: i64,
    offline: bool,
    rules: VecDeque<FailureRule>,
    calls: Vec<RemoteCall>,
}

impl MemoryState {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn injected(
        &mut self,
        remote_id: Option<&str>,
        payload: Option<&Payload>,
    ) -> Option<GatewayError> {
        if self.offline {
            return Some(GatewayError::Transient("remote unreachable".to_string()));
        }

        let index = self.rules.iter().position(|rule| match &rule.matcher {
            Matcher::Any => true,
            Matcher::Field(field, value) => {
                payload.is_some_and(|payload| payload.get(field) == Some(value))
            }
            Matcher::Record(id) => remote_id == Some(id.as_str()),
        })?;

        let rule = &mut self.rules[index];
        let error = rule.failure.to_error();
        rule.remaining = rule.remaining.saturating_sub(1);
        if rule.remaining == 0 {
            self.rules.remove(index);
        }
        Some(error)
    }

    fn live(&self, entity_type: &str, remote_id: &str) -> GatewayResult<&RemoteRecord> {
        self.records
            .get(&(entity_type.to_string(), remote_id.to_string()))
            .filter(|record| !record.deleted)
            .ok_or(GatewayError::NotFound)
    }

    fn write(
        &mut self,
        entity_type: &str,
        remote_id: &str,
        payload: Payload,
        deleted: bool,
    ) -> RemoteRecord {
        let updated_at = self.tick();
        let key = (entity_type.to_string(), remote_id.to_string());
        let version = self.records.get(&key).map_or(1, |record| record.version + 1);
        let record = RemoteRecord {
            remote_id: remote_id.to_string(),
            version,
            updated_at,
            payload,
            deleted,
        };
        self.records.insert(key, record.clone());
        record
    }
}

/// Authoritative store kept in process memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call fail as a network error until set back.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Fail the next `times` calls of any kind.
    pub fn fail_next(&self, failure: InjectedFailure, times: usize) {
        self.push_rule(Matcher::Any, failure, times);
    }

    /// Fail the next `times` create/update calls whose payload has `field == value`.
    pub fn fail_payload(&self, field: &str, value: Value, failure: InjectedFailure, times: usize) {
        self.push_rule(Matcher::Field(field.to_string(), value), failure, times);
    }

    /// Fail the next `times` calls addressing `remote_id`.
    pub fn fail_record(&self, remote_id: &str, failure: InjectedFailure, times: usize) {
        self.push_rule(Matcher::Record(remote_id.to_string()), failure, times);
    }

    fn push_rule(&self, matcher: Matcher, failure: InjectedFailure, times: usize) {
        if times > 0 {
            self.state().rules.push_back(FailureRule {
                matcher,
                failure,
                remaining: times,
            });
        }
    }

    /// Create a record out of band, as another device would.
    pub fn insert(&self, entity_type: &str, payload: Payload) -> RemoteRecord {
        let mut state = self.state();
        state.next_id += 1;
        let remote_id = format!("R{}", state.next_id);
        state.write(entity_type, &remote_id, payload, false)
    }

    /// Replace a record out of band, bumping its version.
    pub fn edit(
        &self,
        entity_type: &str,
        remote_id: &str,
        payload: Payload,
    ) -> Option<RemoteRecord> {
        let mut state = self.state();
        state.live(entity_type, remote_id).ok()?;
        Some(state.write(entity_type, remote_id, payload, false))
    }

    /// Delete a record out of band, leaving a tombstone.
    pub fn remove(&self, entity_type: &str, remote_id: &str) -> Option<RemoteRecord> {
        let mut state = self.state();
        state.live(entity_type, remote_id).ok()?;
        Some(state.write(entity_type, remote_id, Payload::new(), true))
    }

    /// Current live copy of a record.
    pub fn record(&self, entity_type: &str, remote_id: &str) -> Option<RemoteRecord> {
        self.state().live(entity_type, remote_id).ok().cloned()
    }

    /// Live records of a type, ordered by remote id.
    pub fn records(&self, entity_type: &str) -> Vec<RemoteRecord> {
        self.state()
            .records
            .iter()
            .filter(|((kind, _), record)| kind == entity_type && !record.deleted)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Mutating calls observed so far, in arrival order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    fn record_call(
        state: &mut MemoryState,
        operation: Operation,
        entity_type: &str,
        remote_id: Option<&str>,
        payload: Option<&Payload>,
    ) {
        state.calls.push(RemoteCall {
            operation,
            entity_type: entity_type.to_string(),
            remote_id: remote_id.map(str::to_string),
            payload: payload.cloned(),
        });
    }
}

impl RemoteGateway for MemoryRemote {
    async fn create(
        &self,
        _session: &Session,
        entity_type: &str,
        payload: &Payload,
    ) -> GatewayResult<RemoteRecord> {
        let mut state = self.state();
        if let Some(error) = state.injected(None, Some(payload)) {
            return Err(error);
        }
        Self::record_call(&mut state, Operation::Create, entity_type, None, Some(payload));
        state.next_id += 1;
        let remote_id = format!("R{}", state.next_id);
        Ok(state.write(entity_type, &remote_id, payload.clone(), false))
    }

    async fn update(
        &self,
        _session: &Session,
        entity_type: &str,
        remote_id: &str,
        payload: &Payload,
        expected_version: i64,
    ) -> GatewayResult<RemoteRecord> {
        let mut state = self.state();
        if let Some(error) = state.injected(Some(remote_id), Some(payload)) {
            return Err(error);
        }
        let current = state.live(entity_type, remote_id)?;
        if current.version != expected_version {
            return Err(GatewayError::VersionConflict(Some(current.clone())));
        }
        Self::record_call(
            &mut state,
            Operation::Update,
            entity_type,
            Some(remote_id),
            Some(payload),
        );
        Ok(state.write(entity_type, remote_id, payload.clone(), false))
    }

    async fn delete(
        &self,
        _session: &Session,
        entity_type: &str,
        remote_id: &str,
        expected_version: i64,
    ) -> GatewayResult<()> {
        let mut state = self.state();
        if let Some(error) = state.injected(Some(remote_id), None) {
            return Err(error);
        }
        let current = state.live(entity_type, remote_id)?;
        if current.version != expected_version {
            return Err(GatewayError::VersionConflict(Some(current.clone())));
        }
        Self::record_call(&mut state, Operation::Delete, entity_type, Some(remote_id), None);
        state.write(entity_type, remote_id, Payload::new(), true);
        Ok(())
    }

    async fn get(
        &self,
        _session: &Session,
        entity_type: &str,
        remote_id: &str,
    ) -> GatewayResult<RemoteRecord> {
        let mut state = self.state();
        if let Some(error) = state.injected(Some(remote_id), None) {
            return Err(error);
        }
        state.live(entity_type, remote_id).cloned()
    }

    async fn list(
        &self,
        _session: &Session,
        entity_type: &str,
        since: Option<i64>,
    ) -> GatewayResult<Vec<RemoteRecord>> {
        let mut state = self.state();
        if let Some(error) = state.injected(None, None) {
            return Err(error);
        }
        let since = since.unwrap_or(i64::MIN);
        let mut records: Vec<RemoteRecord> = state
            .records
            .iter()
            .filter(|((kind, _), record)| kind == entity_type && record.updated_at > since)
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by_key(|record| record.updated_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn session() -> Session {
        Session::new("tech", "token")
    }

    #[tokio::test]
    async fn update_with_stale_version_returns_current_copy() {
        let remote = MemoryRemote::new();
        let created = remote
            .create(&session(), "equipment", &payload(json!({"name": "Pump"})))
            .await
            .unwrap();
        remote
            .edit("equipment", &created.remote_id, payload(json!({"name": "Pump A"})))
            .unwrap();

        let error = remote
            .update(
                &session(),
                "equipment",
                &created.remote_id,
                &payload(json!({"name": "Pump B"})),
                1,
            )
            .await
            .unwrap_err();
        let GatewayError::VersionConflict(Some(current)) = error else {
            panic!("expected version conflict");
        };
        assert_eq!(current.version, 2);
        assert_eq!(current.payload["name"], json!("Pump A"));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let remote = MemoryRemote::new();
        remote.fail_payload("name", json!("bad"), InjectedFailure::Transient, 2);

        let bad = payload(json!({"name": "bad"}));
        for _ in 0..2 {
            assert!(matches!(
                remote.create(&session(), "equipment", &bad).await,
                Err(GatewayError::Transient(_))
            ));
        }
        assert!(remote.create(&session(), "equipment", &bad).await.is_ok());
        assert_eq!(remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn list_reports_tombstones_after_cursor() {
        let remote = MemoryRemote::new();
        let first = remote.insert("equipment", payload(json!({"name": "A"})));
        let second = remote.insert("equipment", payload(json!({"name": "B"})));
        remote.remove("equipment", &first.remote_id).unwrap();

        let changes = remote
            .list(&session(), "equipment", Some(second.updated_at))
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].deleted);
        assert_eq!(changes[0].remote_id, first.remote_id);
        assert!(matches!(
            remote.get(&session(), "equipment", &first.remote_id).await,
            Err(GatewayError::NotFound)
        ));
    }
}
