//! Data models for fieldsync

mod descriptor;
mod draft;
mod entity;
mod remote;
mod status;

pub use descriptor::{DescriptorStatus, EnqueueOutcome, NewDescriptor, OutboxDescriptor};
pub use draft::Draft;
pub use entity::{EntityRecord, LocalId, LocalWrite, Operation, Payload, SyncState};
pub use remote::RemoteRecord;
pub use status::{SyncOverview, SyncStatus};
