use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::entity::EntityType;

pub mod http;
pub mod memory;

/// Failures surfaced by the remote service seam. `NotFound` is load-bearing
/// for idempotent convergence; everything else is either retried or mapped
/// onto a terminal queue state by the outbound engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote entity not found")]
    NotFound,
    #[error("remote rejected the credentials")]
    Unauthorized,
    #[error("remote returned status {code}: {message}")]
    Status { code: u16, message: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unusable remote payload: {0}")]
    Payload(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound)
    }
}

/// Narrow interface to the remote service: one operation group per entity
/// type plus identity resolution. Implementations must be safe to call
/// concurrently.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// The authoritative identity for the current credentials, or `None`
    /// when nobody is signed in.
    async fn resolve_current_identity(&self) -> Result<Option<String>, RemoteError>;

    /// Authoritative set of records for one entity type, scoped to `owner`.
    async fn fetch_all(&self, entity: EntityType, owner: &str) -> Result<Vec<Value>, RemoteError>;

    /// Create a record; the response is the canonical record including the
    /// remote-assigned `_id`.
    async fn create(&self, entity: EntityType, payload: &Value) -> Result<Value, RemoteError>;

    async fn update(
        &self,
        entity: EntityType,
        id: &str,
        payload: &Value,
    ) -> Result<Value, RemoteError>;

    async fn delete(&self, entity: EntityType, id: &str) -> Result<(), RemoteError>;

    /// Entity-specific state transition (invoice dispatch, withdrawal
    /// submission). Returns the canonical record after the transition.
    async fn send(&self, entity: EntityType, id: &str) -> Result<Value, RemoteError>;
}
