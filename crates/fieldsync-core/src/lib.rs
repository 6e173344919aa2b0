//! fieldsync-core - Core library for fieldsync
//!
//! This crate contains the device-local store, the pending-mutation outbox and
//! the reconciliation engine that keeps the local store convergent with the
//! remote service while the device drifts in and out of connectivity.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{
    EntityRecord, LocalId, Operation, OutboxDescriptor, Payload, SyncState, SyncStatus,
};
pub use services::SyncStore;
