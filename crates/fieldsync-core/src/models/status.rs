//! Sync status exposed to the UI

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-entity sync status as rendered by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Synced,
    Pending,
    Conflict,
    /// Retries exhausted or rejected by the remote; needs attention
    Stalled,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "SYNCED",
            Self::Pending => "PENDING",
            Self::Conflict => "CONFLICT",
            Self::Stalled => "STALLED",
        }
    }

    /// Whether the user has to act on this entity.
    pub const fn needs_attention(self) -> bool {
        matches!(self, Self::Conflict | Self::Stalled)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counts for a sync badge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOverview {
    pub pending: usize,
    pub conflicts: usize,
    pub stalled: usize,
}

impl SyncOverview {
    pub const fn is_clean(&self) -> bool {
        self.pending == 0 && self.conflicts == 0 && self.stalled == 0
    }
}
