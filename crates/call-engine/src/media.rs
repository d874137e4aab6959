use async_trait::async_trait;
use call_store::MediaKind;

use crate::error::EngineError;

/// Handle to a live local capture resource. The engine only moves it
/// between acquisition, the peer connection, and release; the actual
/// device stream lives inside the [`MediaSource`] implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: String,
    pub kind: MediaKind,
}

/// Local capture collaborator (camera/microphone).
///
/// `acquire` fails with [`EngineError::MediaUnavailable`] when permission
/// is denied or no device exists; the engine surfaces that to the user
/// and aborts call setup before any session record is written.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaHandle, EngineError>;

    /// Release is synchronous and infallible so teardown can never block
    /// on it; implementations log their own cleanup problems.
    fn release(&self, handle: &MediaHandle);
}
