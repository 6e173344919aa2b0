//! Remote snapshot model

use serde::{Deserialize, Serialize};

use super::Payload;

/// A record as the remote service knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Identifier assigned by the remote store
    pub remote_id: String,
    /// Monotonic revision marker used for optimistic concurrency
    pub version: i64,
    /// Remote modification timestamp (Unix ms)
    pub updated_at: i64,
    /// Confirmed business data
    #[serde(default)]
    pub payload: Payload,
    /// Tombstone marker (record deleted remotely)
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteRecord {
    /// Tombstone for a record known to be gone from the remote store.
    #[must_use]
    pub fn tombstone(remote_id: impl Into<String>, version: i64, updated_at: i64) -> Self {
        Self {
            remote_id: remote_id.into(),
            version,
            updated_at,
            payload: Payload::new(),
            deleted: true,
        }
    }
}
