//! Mock media and peer-connection implementations for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use call_store::MediaKind;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::media::{MediaHandle, MediaSource};
use crate::peer::{PeerConnection, PeerConnector, PeerHandle};

/// Remote blobs carrying this prefix are rejected by the mock runtime,
/// standing in for data the platform cannot parse.
pub const MALFORMED_PREFIX: &str = "malformed";

/// Mock capture device with acquire/release counters.
pub struct MockMedia {
    deny: bool,
    next_id: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl MockMedia {
    pub fn new() -> Self {
        Self {
            deny: false,
            next_id: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// A device that always refuses acquisition, as if permission were
    /// denied.
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::new()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl Default for MockMedia {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaHandle, EngineError> {
        if self.deny {
            return Err(EngineError::MediaUnavailable(
                "permission denied".to_string(),
            ));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MediaHandle {
            id: format!("media-{n}"),
            kind,
        })
    }

    fn release(&self, _handle: &MediaHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Mock negotiation context. Offers and answers are derived from the
/// local media id; remote data is recorded for assertions. Blobs
/// prefixed with [`MALFORMED_PREFIX`] are rejected.
pub struct MockPeer {
    media_id: String,
    remote_description: Mutex<Option<String>>,
    remote_candidates: Mutex<Vec<String>>,
    candidate_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    remote_media_tx: Mutex<Option<mpsc::UnboundedSender<MediaHandle>>>,
    closed: AtomicBool,
}

impl MockPeer {
    /// Simulate the platform gathering one local candidate.
    pub fn emit_local_candidate(&self, blob: impl Into<String>) {
        let tx = self.candidate_tx.lock();
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(blob.into());
        }
    }

    /// Simulate remote media starting to flow.
    pub fn emit_remote_media(&self, media: MediaHandle) {
        let tx = self.remote_media_tx.lock();
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(media);
        }
    }

    pub fn remote_description(&self) -> Option<String> {
        self.remote_description.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<String> {
        self.remote_candidates.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn reject_malformed(blob: &str) -> Result<(), EngineError> {
    if blob.starts_with(MALFORMED_PREFIX) {
        return Err(EngineError::RemoteDataRejected(format!(
            "runtime rejected blob: {blob}"
        )));
    }
    Ok(())
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<String, EngineError> {
        Ok(format!("offer:{}", self.media_id))
    }

    async fn create_answer(&self) -> Result<String, EngineError> {
        Ok(format!("answer:{}", self.media_id))
    }

    async fn set_remote_description(&self, blob: &str) -> Result<(), EngineError> {
        reject_malformed(blob)?;
        *self.remote_description.lock() = Some(blob.to_string());
        Ok(())
    }

    async fn add_remote_candidate(&self, blob: &str) -> Result<(), EngineError> {
        reject_malformed(blob)?;
        self.remote_candidates.lock().push(blob.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders ends the engine's pump tasks.
        self.candidate_tx.lock().take();
        self.remote_media_tx.lock().take();
    }
}

/// Factory that records every peer it builds so tests can drive them.
#[derive(Default)]
pub struct MockConnector {
    peers: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_peer(&self) -> Option<Arc<MockPeer>> {
        self.peers.lock().last().cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        media: &MediaHandle,
        _ice_servers: &[String],
    ) -> Result<PeerHandle, EngineError> {
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let (remote_media_tx, remote_media_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(MockPeer {
            media_id: media.id.clone(),
            remote_description: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            candidate_tx: Mutex::new(Some(candidate_tx)),
            remote_media_tx: Mutex::new(Some(remote_media_tx)),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().push(peer.clone());
        Ok(PeerHandle {
            connection: peer,
            local_candidates: candidate_rx,
            remote_media: remote_media_rx,
        })
    }
}
