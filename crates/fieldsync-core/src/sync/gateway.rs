//! Remote Gateway contract consumed by the reconciliation engine.

use std::future::Future;

use thiserror::Error;

use crate::models::{Payload, RemoteRecord};

/// Session credential supplied by the auth collaborator.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Failure taxonomy of a remote call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// Network, timeout or server error; retried with backoff
    #[error("Transient remote error: {0}")]
    Transient(String),

    /// The remote record changed since the expected version. Carries the
    /// current copy when the remote returned one.
    #[error("Remote version conflict")]
    VersionConflict(Option<RemoteRecord>),

    /// The remote rejected the payload; retrying cannot succeed
    #[error("Remote rejected payload: {0}")]
    Validation(String),

    /// The session credential was refused
    #[error("Remote session expired: {0}")]
    AuthExpired(String),

    /// The record does not exist remotely
    #[error("Remote record not found")]
    NotFound,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Thin interface to the remote service.
///
/// Every call takes the session explicitly; implementations never read ambient
/// credentials.
pub trait RemoteGateway: Send + Sync {
    /// Create a record and return its confirmed snapshot (with `remote_id`).
    fn create(
        &self,
        session: &Session,
        entity_type: &str,
        payload: &Payload,
    ) -> impl Future<Output = GatewayResult<RemoteRecord>> + Send;

    /// Replace a record if its version still equals `expected_version`.
    fn update(
        &self,
        session: &Session,
        entity_type: &str,
        remote_id: &str,
        payload: &Payload,
        expected_version: i64,
    ) -> impl Future<Output = GatewayResult<RemoteRecord>> + Send;

    /// Delete a record if its version still equals `expected_version`.
    fn delete(
        &self,
        session: &Session,
        entity_type: &str,
        remote_id: &str,
        expected_version: i64,
    ) -> impl Future<Output = GatewayResult<()>> + Send;

    /// Fetch the current copy of a record.
    fn get(
        &self,
        session: &Session,
        entity_type: &str,
        remote_id: &str,
    ) -> impl Future<Output = GatewayResult<RemoteRecord>> + Send;

    /// Records of a type modified after `since` (Unix ms), tombstones included.
    fn list(
        &self,
        session: &Session,
        entity_type: &str,
        since: Option<i64>,
    ) -> impl Future<Output = GatewayResult<Vec<RemoteRecord>>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_debug_redacts_token() {
        let session = Session::new("tech-7", "secret");
        let debug = format!("{session:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("tech-7"));
    }
}
