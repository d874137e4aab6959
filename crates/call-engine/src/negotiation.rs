use std::sync::Arc;

use call_store::{CallRole, SessionStore};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::events::CallEvent;
use crate::media::{MediaHandle, MediaSource};
use crate::peer::{PeerConnection, PeerConnector, PeerHandle};

/// One call's local negotiation context: the media handle, the peer
/// connection, and the pump tasks tying them to the session record and
/// the event stream. Exclusively owned by this participant's engine.
pub(crate) struct Negotiation {
    call_id: String,
    media: MediaHandle,
    media_source: Arc<dyn MediaSource>,
    connection: Arc<dyn PeerConnection>,
    forwarder: JoinHandle<()>,
    media_watcher: JoinHandle<()>,
    answer_applied: bool,
    closed: bool,
}

impl Negotiation {
    /// Connect a peer context over already-acquired media. Spawns the
    /// candidate forwarder (local candidates are appended to the record
    /// the moment they are gathered, unbatched) and the remote-media
    /// watcher.
    pub(crate) async fn connect(
        call_id: &str,
        role: CallRole,
        media: MediaHandle,
        media_source: Arc<dyn MediaSource>,
        connector: &dyn PeerConnector,
        ice_servers: &[String],
        store: Arc<dyn SessionStore>,
        events: broadcast::Sender<CallEvent>,
    ) -> Result<Self, EngineError> {
        let PeerHandle {
            connection,
            local_candidates,
            remote_media,
        } = match connector.connect(&media, ice_servers).await {
            Ok(handle) => handle,
            Err(err) => {
                media_source.release(&media);
                return Err(err);
            }
        };

        let forwarder = tokio::spawn(forward_local_candidates(
            store,
            call_id.to_string(),
            role,
            local_candidates,
        ));
        let media_watcher = tokio::spawn(watch_remote_media(
            events,
            call_id.to_string(),
            remote_media,
        ));

        Ok(Self {
            call_id: call_id.to_string(),
            media,
            media_source,
            connection,
            forwarder,
            media_watcher,
            answer_applied: false,
            closed: false,
        })
    }

    pub(crate) async fn create_offer(&self) -> Result<String, EngineError> {
        self.connection.create_offer().await
    }

    pub(crate) async fn create_answer(&self) -> Result<String, EngineError> {
        self.connection.create_answer().await
    }

    /// Apply the remote offer on the receiver side. Rejection is logged
    /// and not fatal; the answer step decides whether the call can
    /// proceed.
    pub(crate) async fn apply_offer(&self, blob: &str) {
        if let Err(err) = self.connection.set_remote_description(blob).await {
            tracing::warn!(
                target: "call_engine",
                call_id = %self.call_id,
                %err,
                "remote offer rejected by runtime"
            );
        }
    }

    /// Apply the remote answer on the caller side, at most once. A blob
    /// the runtime rejects is still marked applied: re-applying the same
    /// rejected data on every poll can never succeed.
    pub(crate) async fn apply_answer(&mut self, blob: &str) {
        if self.answer_applied {
            return;
        }
        self.answer_applied = true;
        if let Err(err) = self.connection.set_remote_description(blob).await {
            tracing::warn!(
                target: "call_engine",
                call_id = %self.call_id,
                %err,
                "remote answer rejected by runtime"
            );
        }
    }

    pub(crate) fn answer_applied(&self) -> bool {
        self.answer_applied
    }

    /// Apply freshly observed remote candidates in record order. A
    /// rejected candidate is skipped; connectivity may still come from
    /// the rest.
    pub(crate) async fn apply_candidates(&self, blobs: &[String]) {
        for blob in blobs {
            if let Err(err) = self.connection.add_remote_candidate(blob).await {
                tracing::warn!(
                    target: "call_engine",
                    call_id = %self.call_id,
                    %err,
                    "remote candidate rejected by runtime"
                );
            }
        }
    }

    /// Tear down the context: stop the pumps, close the peer, release
    /// media. Idempotent, and never waits on a session-record write.
    pub(crate) async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.forwarder.abort();
        self.media_watcher.abort();
        self.connection.close().await;
        self.media_source.release(&self.media);
        tracing::debug!(target: "call_engine", call_id = %self.call_id, "negotiation closed");
    }
}

impl Drop for Negotiation {
    fn drop(&mut self) {
        // Backstop so a dropped-but-unclosed context never leaks the
        // capture device.
        if !self.closed {
            self.forwarder.abort();
            self.media_watcher.abort();
            self.media_source.release(&self.media);
        }
    }
}

async fn forward_local_candidates(
    store: Arc<dyn SessionStore>,
    call_id: String,
    role: CallRole,
    mut candidates: mpsc::UnboundedReceiver<String>,
) {
    while let Some(blob) = candidates.recv().await {
        if let Err(err) = store.append_candidate(&call_id, role, blob).await {
            tracing::warn!(
                target: "call_engine",
                call_id = %call_id,
                %err,
                "failed to publish local candidate"
            );
        }
    }
}

async fn watch_remote_media(
    events: broadcast::Sender<CallEvent>,
    call_id: String,
    mut remote_media: mpsc::UnboundedReceiver<MediaHandle>,
) {
    while let Some(media) = remote_media.recv().await {
        let _ = events.send(CallEvent::RemoteMediaAvailable {
            call_id: call_id.clone(),
            media,
        });
    }
}
