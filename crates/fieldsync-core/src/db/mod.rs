//! Database layer for fieldsync

mod connection;
mod draft_repository;
mod entity_repository;
mod migrations;
mod outbox_repository;

pub use connection::Database;
pub use draft_repository::{DraftRepository, SqliteDraftRepository};
pub use entity_repository::{EntityRepository, SqliteEntityRepository};
pub use outbox_repository::{DescriptorRow, NackOutcome, OutboxRepository, SqliteOutboxRepository};
