use call_store::StoreError;
use thiserror::Error;

/// Engine-level error taxonomy.
///
/// Media and state-machine failures are terminal for the call they
/// belong to and surface from the public API. Per-candidate failures
/// are logged and skipped. Poll failures are counted by the
/// reconciliation loop and never end a call on their own.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("call id conflict: {0}")]
    Conflict(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("remote data rejected: {0}")]
    RemoteDataRejected(String),
    #[error("poll failure: {0}")]
    PollFailure(String),
    #[error("unknown call: {0}")]
    CallNotFound(String),
    #[error("negotiation failure: {0}")]
    Negotiation(String),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(id) => EngineError::Conflict(id),
            StoreError::InvalidTransition(detail) => EngineError::InvalidTransition(detail),
            StoreError::NotFound(id) => EngineError::CallNotFound(id),
            other => EngineError::Store(other),
        }
    }
}
