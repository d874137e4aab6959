use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use call_store::{
    generate_call_id, CallRole, CallSession, CallStatus, MediaKind, SdpKind, SessionStore,
};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::dedup::CandidateTracker;
use crate::error::EngineError;
use crate::events::CallEvent;
use crate::media::MediaSource;
use crate::negotiation::Negotiation;
use crate::peer::PeerConnector;
use crate::reconcile;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Registry entry for one call this participant is involved in. A
/// surfaced-but-unaccepted incoming ring has no negotiation yet (no
/// media is held before the user answers).
pub(crate) struct ActiveCall {
    pub(crate) role: CallRole,
    pub(crate) last_status: CallStatus,
    pub(crate) registered_at: Instant,
    pub(crate) negotiation: Option<Negotiation>,
}

pub(crate) struct Inner {
    pub(crate) user_id: String,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) media: Arc<dyn MediaSource>,
    pub(crate) connector: Arc<dyn PeerConnector>,
    pub(crate) config: EngineConfig,
    pub(crate) events: broadcast::Sender<CallEvent>,
    pub(crate) tracker: CandidateTracker,
    pub(crate) calls: Mutex<HashMap<String, ActiveCall>>,
    shutdown_tx: watch::Sender<bool>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

/// One participant's signaling engine.
///
/// Cheaply cloneable handle; all state lives behind the shared inner.
/// The two participants of a call each run their own engine against the
/// same [`SessionStore`] and coordinate through it alone.
#[derive(Clone)]
pub struct CallEngine {
    inner: Arc<Inner>,
}

impl CallEngine {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn SessionStore>,
        media: Arc<dyn MediaSource>,
        connector: Arc<dyn PeerConnector>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                user_id: user_id.into(),
                store,
                media,
                connector,
                config,
                events,
                tracker: CandidateTracker::new(),
                calls: Mutex::new(HashMap::new()),
                shutdown_tx,
                shutdown_rx,
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// A fresh event receiver, starting at the current stream position.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn the reconciliation loop. Runs until [`CallEngine::shutdown`].
    pub fn run(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(reconcile::run_loop(inner))
    }

    /// Place an outgoing call. Media is acquired before any record is
    /// written, so a denied device aborts with no session created. The
    /// returned id identifies the call to `end_call` and in events.
    pub async fn start_call(
        &self,
        receiver_id: &str,
        kind: MediaKind,
    ) -> Result<String, EngineError> {
        let inner = &self.inner;
        let media = inner.media.acquire(kind).await?;

        let call_id = generate_call_id();
        let session = CallSession::new(call_id.as_str(), inner.user_id.as_str(), receiver_id, kind);
        if let Err(err) = inner.store.create(session).await {
            inner.media.release(&media);
            // A colliding id is fatal to this attempt; retrying mints a
            // fresh one.
            return Err(err.into());
        }

        let mut negotiation = match Negotiation::connect(
            &call_id,
            CallRole::Caller,
            media,
            inner.media.clone(),
            inner.connector.as_ref(),
            &inner.config.ice_servers,
            inner.store.clone(),
            inner.events.clone(),
        )
        .await
        {
            Ok(negotiation) => negotiation,
            Err(err) => {
                self.abandon_record(&call_id).await;
                return Err(err);
            }
        };

        let offer = match negotiation.create_offer().await {
            Ok(blob) => blob,
            Err(err) => {
                negotiation.close().await;
                self.abandon_record(&call_id).await;
                return Err(err);
            }
        };
        if let Err(err) = inner
            .store
            .set_description(&call_id, SdpKind::Offer, offer)
            .await
        {
            negotiation.close().await;
            self.abandon_record(&call_id).await;
            return Err(err.into());
        }

        tracing::info!(
            target: "call_engine",
            call_id = %call_id,
            receiver = %receiver_id,
            ?kind,
            "outgoing call placed"
        );
        let mut calls = inner.calls.lock().await;
        calls.insert(
            call_id.clone(),
            ActiveCall {
                role: CallRole::Caller,
                last_status: CallStatus::Ringing,
                registered_at: Instant::now(),
                negotiation: Some(negotiation),
            },
        );
        Ok(call_id)
    }

    /// Accept a ringing call targeting this user: acquire media, apply
    /// the published offer, publish the answer, mark the session
    /// connected.
    pub async fn accept_call(&self, call_id: &str) -> Result<(), EngineError> {
        let inner = &self.inner;
        let session = inner
            .store
            .get(call_id)
            .await?
            .ok_or_else(|| EngineError::CallNotFound(call_id.to_string()))?;
        if session.receiver_id != inner.user_id {
            return Err(EngineError::InvalidTransition(format!(
                "call {call_id} does not target this user"
            )));
        }
        if session.status != CallStatus::Ringing {
            return Err(EngineError::InvalidTransition(format!(
                "call {call_id} is {}, not ringing",
                session.status
            )));
        }
        let offer = session.offer.clone().ok_or_else(|| {
            // The caller creates the record before the offer lands; an
            // accept racing that window just retries.
            EngineError::InvalidTransition(format!("offer not yet published for call {call_id}"))
        })?;

        let media = inner.media.acquire(session.media_kind).await?;
        let mut negotiation = Negotiation::connect(
            call_id,
            CallRole::Receiver,
            media,
            inner.media.clone(),
            inner.connector.as_ref(),
            &inner.config.ice_servers,
            inner.store.clone(),
            inner.events.clone(),
        )
        .await?;

        negotiation.apply_offer(&offer).await;
        let answer = match negotiation.create_answer().await {
            Ok(blob) => blob,
            Err(err) => {
                negotiation.close().await;
                return Err(err);
            }
        };
        if let Err(err) = inner
            .store
            .set_description(call_id, SdpKind::Answer, answer)
            .await
        {
            negotiation.close().await;
            return Err(err.into());
        }
        if let Err(err) = inner.store.set_status(call_id, CallStatus::Connected).await {
            // The caller hung up (or the ring aged out) between our read
            // and this write.
            negotiation.close().await;
            return Err(err.into());
        }

        tracing::info!(target: "call_engine", call_id = %call_id, "call accepted");
        let mut calls = inner.calls.lock().await;
        let entry = calls.entry(call_id.to_string()).or_insert_with(|| ActiveCall {
            role: CallRole::Receiver,
            last_status: CallStatus::Ringing,
            registered_at: Instant::now(),
            negotiation: None,
        });
        entry.last_status = CallStatus::Connected;
        entry.negotiation = Some(negotiation);
        drop(calls);
        let _ = inner.events.send(CallEvent::StatusChanged {
            call_id: call_id.to_string(),
            status: CallStatus::Connected,
        });
        Ok(())
    }

    /// End (or, for an unanswered incoming ring, decline) a call.
    ///
    /// Local resources are torn down first; the terminal status write is
    /// best effort and never holds the device open on a store failure.
    pub async fn end_call(&self, call_id: &str) -> Result<(), EngineError> {
        let inner = &self.inner;
        let mut calls = inner.calls.lock().await;
        let mut active = calls
            .remove(call_id)
            .ok_or_else(|| EngineError::CallNotFound(call_id.to_string()))?;
        drop(calls);

        let terminal = if active.role == CallRole::Receiver
            && active.last_status == CallStatus::Ringing
        {
            CallStatus::Rejected
        } else {
            CallStatus::Ended
        };

        if let Some(mut negotiation) = active.negotiation.take() {
            negotiation.close().await;
        }
        inner.tracker.forget(call_id);

        if let Err(err) = inner.store.set_status(call_id, terminal).await {
            tracing::warn!(
                target: "call_engine",
                call_id = %call_id,
                %err,
                "terminal status write failed"
            );
        }
        tracing::info!(target: "call_engine", call_id = %call_id, status = %terminal, "call ended locally");
        let _ = inner.events.send(CallEvent::StatusChanged {
            call_id: call_id.to_string(),
            status: terminal,
        });
        Ok(())
    }

    /// Stop the reconciliation loop and tear down every active call,
    /// publishing `ended` best-effort so remote peers observe an
    /// explicit terminal state instead of waiting out the backstop.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let _ = inner.shutdown_tx.send(true);

        let drained: Vec<(String, ActiveCall)> = {
            let mut calls = inner.calls.lock().await;
            calls.drain().collect()
        };
        for (call_id, mut active) in drained {
            if let Some(mut negotiation) = active.negotiation.take() {
                negotiation.close().await;
            }
            inner.tracker.forget(&call_id);
            if !active.last_status.is_terminal() {
                if let Err(err) = inner.store.set_status(&call_id, CallStatus::Ended).await {
                    tracing::debug!(
                        target: "call_engine",
                        call_id = %call_id,
                        %err,
                        "terminal write on shutdown failed"
                    );
                }
            }
        }
        tracing::debug!(target: "call_engine", user = %inner.user_id, "engine shut down");
    }

    /// Best-effort terminal write for a record whose local setup failed
    /// partway, so the remote side does not see a ghost ring.
    async fn abandon_record(&self, call_id: &str) {
        if let Err(err) = self
            .inner
            .store
            .set_status(call_id, CallStatus::Ended)
            .await
        {
            tracing::debug!(
                target: "call_engine",
                call_id = %call_id,
                %err,
                "abandon write failed"
            );
        }
    }
}
