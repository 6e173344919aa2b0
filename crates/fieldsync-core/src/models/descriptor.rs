//! Outbox descriptor model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{LocalId, Operation, Payload};

/// Retry status of an outbox descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DescriptorStatus {
    /// Eligible for dispatch once `next_attempt_at` has passed
    Pending,
    /// Terminal until the user intervenes; never auto-retried
    Stalled,
}

impl DescriptorStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Stalled => "STALLED",
        }
    }
}

impl fmt::Display for DescriptorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DescriptorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "STALLED" => Ok(Self::Stalled),
            other => Err(format!("unknown descriptor status '{other}'")),
        }
    }
}

/// One intended mutation awaiting confirmation by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxDescriptor {
    pub local_id: LocalId,
    pub entity_type: String,
    pub operation: Operation,
    /// Absent for deletes
    pub payload: Option<Payload>,
    /// Entity `local_version` this descriptor reflects
    pub local_version: i64,
    /// Queue position (Unix ms); preserved across coalescing
    pub enqueued_at: i64,
    pub attempt_count: u32,
    pub next_attempt_at: i64,
    /// Delay applied by the most recent nack
    pub last_backoff_ms: i64,
    pub last_error: Option<String>,
    pub status: DescriptorStatus,
    /// Set while a remote call for this descriptor is outstanding
    pub in_flight: bool,
}

impl OutboxDescriptor {
    pub fn is_stalled(&self) -> bool {
        self.status == DescriptorStatus::Stalled
    }
}

/// Input to `Outbox::enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDescriptor {
    pub local_id: LocalId,
    pub entity_type: String,
    pub operation: Operation,
    pub payload: Option<Payload>,
    pub local_version: i64,
    /// Whether the remote store already knows this entity
    pub remote_known: bool,
}

/// What `enqueue` did with a new descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// No descriptor existed; a new one was appended
    Inserted,
    /// Folded into the existing descriptor for the same entity
    Coalesced,
    /// A delete cancelled a create that never reached the remote store
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_status_roundtrip() {
        assert_eq!(
            "STALLED".parse::<DescriptorStatus>().unwrap(),
            DescriptorStatus::Stalled
        );
        assert_eq!(DescriptorStatus::Pending.to_string(), "PENDING");
        assert!("DONE".parse::<DescriptorStatus>().is_err());
    }
}
