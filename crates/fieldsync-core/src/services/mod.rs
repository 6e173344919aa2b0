//! Services shared by clients of the sync core.

mod store;

pub use store::{
    PullReport, PushCompletion, RebaseOutcome, RecoveryReport, Resolution, SyncStore,
};
