use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::media::MediaHandle;

/// One local negotiation context over the platform media stack.
///
/// Description and candidate blobs are opaque engine artifacts; the
/// trait never interprets them. Any of the apply operations may fail if
/// the runtime rejects a blob as malformed.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, EngineError>;

    async fn create_answer(&self) -> Result<String, EngineError>;

    async fn set_remote_description(&self, blob: &str) -> Result<(), EngineError>;

    async fn add_remote_candidate(&self, blob: &str) -> Result<(), EngineError>;

    /// Close the context. Idempotent; after close the candidate stream
    /// ends and further operations may fail.
    async fn close(&self);
}

/// A freshly connected peer context plus its outbound event streams.
pub struct PeerHandle {
    pub connection: Arc<dyn PeerConnection>,
    /// Locally gathered connectivity candidates, in gathering order.
    pub local_candidates: mpsc::UnboundedReceiver<String>,
    /// Fires when the first remote media arrives over the connection.
    pub remote_media: mpsc::UnboundedReceiver<MediaHandle>,
}

/// Factory seam over the platform's peer-connection constructor.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        media: &MediaHandle,
        ice_servers: &[String],
    ) -> Result<PeerHandle, EngineError>;
}
