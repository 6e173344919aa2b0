//! Entity rows and their sync metadata

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::RemoteRecord;

/// Business payload carried through the sync engine. Always a JSON object so
/// that field groups can be diffed and merged.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Device-assigned identifier of an entity, using UUID v7 (time-sortable).
///
/// Immutable for the life of the row and used to correlate outbox
/// descriptors with local rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Create a new unique local ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Per-row convergence marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
    Conflict,
}

impl SyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "SYNCED",
            Self::PendingCreate => "PENDING_CREATE",
            Self::PendingUpdate => "PENDING_UPDATE",
            Self::PendingDelete => "PENDING_DELETE",
            Self::Conflict => "CONFLICT",
        }
    }

    /// Whether this state implies an open outbox descriptor.
    pub const fn is_pending(self) -> bool {
        matches!(
            self,
            Self::PendingCreate | Self::PendingUpdate | Self::PendingDelete
        )
    }

    /// Operation that would re-synthesize a descriptor for this state.
    pub const fn pending_operation(self) -> Option<Operation> {
        match self {
            Self::PendingCreate => Some(Operation::Create),
            Self::PendingUpdate => Some(Operation::Update),
            Self::PendingDelete => Some(Operation::Delete),
            Self::Synced | Self::Conflict => None,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYNCED" => Ok(Self::Synced),
            "PENDING_CREATE" => Ok(Self::PendingCreate),
            "PENDING_UPDATE" => Ok(Self::PendingUpdate),
            "PENDING_DELETE" => Ok(Self::PendingDelete),
            "CONFLICT" => Ok(Self::Conflict),
            other => Err(format!("unknown sync_state '{other}'")),
        }
    }
}

/// Kind of mutation carried by an outbox descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Row state written alongside a descriptor of this operation.
    pub const fn pending_state(self) -> SyncState {
        match self {
            Self::Create => SyncState::PendingCreate,
            Self::Update => SyncState::PendingUpdate,
            Self::Delete => SyncState::PendingDelete,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unknown operation '{other}'")),
        }
    }
}

/// A business record mirrored on-device, with its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Device-assigned identifier
    pub local_id: LocalId,
    /// Entity type name (e.g. `equipment`)
    pub entity_type: String,
    /// Owning entity, if any
    pub parent_local_id: Option<LocalId>,
    /// Identifier assigned by the remote store after the first confirmed push
    pub remote_id: Option<String>,
    /// Optimistic local data
    pub payload: Payload,
    /// Convergence marker
    pub sync_state: SyncState,
    /// Bumped on every local mutation
    pub local_version: i64,
    /// Last known remote revision
    pub remote_version: Option<i64>,
    /// Remote `updated_at` of the last confirmed snapshot (Unix ms)
    pub remote_updated_at: Option<i64>,
    /// Last server-confirmed payload, the common ancestor for merges
    pub base_payload: Option<Payload>,
    /// Remote copy kept alongside the local one while in conflict
    pub conflict_remote: Option<RemoteRecord>,
    /// Last diagnostic error recorded against the row
    pub last_error: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last local write timestamp (Unix ms)
    pub updated_at: i64,
}

impl EntityRecord {
    /// Build a brand-new row awaiting its first push.
    #[must_use]
    pub fn new_pending(
        entity_type: impl Into<String>,
        payload: Payload,
        parent_local_id: Option<LocalId>,
        now: i64,
    ) -> Self {
        Self {
            local_id: LocalId::new(),
            entity_type: entity_type.into(),
            parent_local_id,
            remote_id: None,
            payload,
            sync_state: SyncState::PendingCreate,
            local_version: 1,
            remote_version: None,
            remote_updated_at: None,
            base_payload: None,
            conflict_remote: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a row from a remotely-originated snapshot.
    #[must_use]
    pub fn from_remote(entity_type: impl Into<String>, remote: &RemoteRecord, now: i64) -> Self {
        Self {
            local_id: LocalId::new(),
            entity_type: entity_type.into(),
            parent_local_id: None,
            remote_id: Some(remote.remote_id.clone()),
            payload: remote.payload.clone(),
            sync_state: SyncState::Synced,
            local_version: 1,
            remote_version: Some(remote.version),
            remote_updated_at: Some(remote.updated_at),
            base_payload: Some(remote.payload.clone()),
            conflict_remote: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A UI-originated mutation handed to `upsert_local`.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalWrite {
    Create {
        entity_type: String,
        payload: Payload,
        parent_local_id: Option<LocalId>,
    },
    Update {
        local_id: LocalId,
        payload: Payload,
    },
    Delete {
        local_id: LocalId,
    },
}

impl LocalWrite {
    pub const fn operation(&self) -> Operation {
        match self {
            Self::Create { .. } => Operation::Create,
            Self::Update { .. } => Operation::Update,
            Self::Delete { .. } => Operation::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_id_unique() {
        let id1 = LocalId::new();
        let id2 = LocalId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_local_id_parse() {
        let id = LocalId::new();
        let parsed: LocalId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_sync_state_strings_parse_back() {
        for state in [
            SyncState::Synced,
            SyncState::PendingCreate,
            SyncState::PendingUpdate,
            SyncState::PendingDelete,
            SyncState::Conflict,
        ] {
            assert_eq!(state.as_str().parse::<SyncState>().unwrap(), state);
        }
        assert!("STALLED".parse::<SyncState>().is_err());
    }

    #[test]
    fn test_pending_operation_matches_state() {
        assert_eq!(
            SyncState::PendingDelete.pending_operation(),
            Some(Operation::Delete)
        );
        assert_eq!(SyncState::Synced.pending_operation(), None);
        assert_eq!(Operation::Update.pending_state(), SyncState::PendingUpdate);
    }

    #[test]
    fn test_new_pending_row() {
        let row = EntityRecord::new_pending("equipment", Payload::new(), None, 10);
        assert_eq!(row.sync_state, SyncState::PendingCreate);
        assert_eq!(row.local_version, 1);
        assert!(row.remote_id.is_none());
        assert_eq!(row.created_at, row.updated_at);
    }
}
