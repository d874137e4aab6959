use async_trait::async_trait;
use thiserror::Error;

use crate::session::{CallRole, CallSession, CallStatus, SdpKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("call {0} already exists")]
    Conflict(String),
    #[error("call {0} not found")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The session-record collaborator both participants coordinate through.
///
/// Implementations enforce the record invariants: one session per id, each
/// description slot written at most once (answer only after offer),
/// candidate sequences append-only, status monotonic along the transition
/// graph. `append_candidate` never fails on duplicate blobs; re-appending
/// is an idempotent concern left to readers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a fresh session record, `Conflict` if the id is taken
    async fn create(&self, session: CallSession) -> Result<(), StoreError>;

    /// Fetch one record; `None` once it has aged out
    async fn get(&self, id: &str) -> Result<Option<CallSession>, StoreError>;

    /// Write a description slot. `InvalidTransition` when the slot is
    /// already set, or for an answer while no offer exists.
    async fn set_description(
        &self,
        id: &str,
        kind: SdpKind,
        blob: String,
    ) -> Result<(), StoreError>;

    /// Append one connectivity candidate under `role`
    async fn append_candidate(
        &self,
        id: &str,
        role: CallRole,
        blob: String,
    ) -> Result<(), StoreError>;

    /// Advance the status. `InvalidTransition` when `status` is not
    /// reachable from the current one.
    async fn set_status(&self, id: &str, status: CallStatus) -> Result<(), StoreError>;

    /// Sessions where `user_id` participates, excluding those whose
    /// terminal state has outlived the grace period.
    async fn list_active_for(&self, user_id: &str) -> Result<Vec<CallSession>, StoreError>;
}
