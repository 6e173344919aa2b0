//! In-progress form draft model

use serde::{Deserialize, Serialize};

/// Partially filled form persisted across restarts. Carries no sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    /// Key, conventionally prefixed by form name (e.g. `panel-wizard/…`)
    pub key: String,
    /// Partial payload collected so far
    pub payload: serde_json::Value,
    /// Last save timestamp (Unix ms)
    pub updated_at: i64,
}
