//! Reconciliation between the local store and the remote service.
//!
//! The engine drains the outbox through a [`RemoteGateway`], resolves
//! version conflicts with the field-group [`MergeTable`], and pulls
//! remotely-originated changes back into the local store.

mod backoff;
mod driver;
mod engine;
mod gateway;
mod http;
mod memory;
mod merge;
mod signals;


pub use backoff::BackoffPolicy;
pub use driver::SyncDriver;
pub use engine::{CycleContext, CycleReport, EngineHealth, ReconciliationEngine};
pub use gateway::{GatewayError, GatewayResult, RemoteGateway, Session};
pub use http::HttpRemoteGateway;
pub use memory::{InjectedFailure, MemoryRemote, RemoteCall};
pub use merge::{FieldGroup, MergeOutcome, MergeTable};
pub use signals::{SignalChange, SignalState, Subscription, SyncSignals};
