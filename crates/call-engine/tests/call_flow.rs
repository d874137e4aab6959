//! End-to-end call flows: two engines (caller and receiver) sharing one
//! in-memory session store, with mock media and peer connections.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use call_engine::mock::{MockConnector, MockMedia};
use call_engine::{CallEngine, CallEvent, EngineConfig, EngineError};
use call_store::{
    CallRole, CallSession, CallStatus, MediaKind, MemoryStore, SdpKind, SessionStore, StoreError,
};

const POLL: Duration = Duration::from_millis(25);
const EVENT_WAIT: Duration = Duration::from_secs(2);

fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval: POLL,
        ring_timeout: Duration::from_secs(45),
        poll_failure_threshold: 3,
        ice_servers: Vec::new(),
    }
}

struct Peer {
    engine: CallEngine,
    media: Arc<MockMedia>,
    connector: Arc<MockConnector>,
    events: broadcast::Receiver<CallEvent>,
    loop_handle: JoinHandle<()>,
}

fn spawn_peer(user_id: &str, store: Arc<dyn SessionStore>, config: EngineConfig) -> Peer {
    let media = Arc::new(MockMedia::new());
    let connector = Arc::new(MockConnector::new());
    let engine = CallEngine::new(
        user_id,
        store,
        media.clone(),
        connector.clone(),
        config,
    );
    let events = engine.subscribe();
    let loop_handle = engine.run();
    Peer {
        engine,
        media,
        connector,
        events,
        loop_handle,
    }
}

async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<CallEvent>,
    what: &str,
    mut pred: F,
) -> CallEvent
where
    F: FnMut(&CallEvent) -> bool,
{
    timeout(EVENT_WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("event stream closed waiting for {what}: {err}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

fn is_status(event: &CallEvent, call_id: &str, status: CallStatus) -> bool {
    matches!(
        event,
        CallEvent::StatusChanged { call_id: id, status: s }
            if id == call_id && *s == status
    )
}

/// Store wrapper that fails a scripted number of polls before recovering.
struct FlakyStore {
    inner: Arc<dyn SessionStore>,
    failing_polls: AtomicU32,
}

impl FlakyStore {
    fn wrap(inner: Arc<dyn SessionStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing_polls: AtomicU32::new(0),
        })
    }

    fn fail_polls(&self, count: u32) {
        self.failing_polls.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn create(&self, session: CallSession) -> Result<(), StoreError> {
        self.inner.create(session).await
    }

    async fn get(&self, id: &str) -> Result<Option<CallSession>, StoreError> {
        self.inner.get(id).await
    }

    async fn set_description(
        &self,
        id: &str,
        kind: SdpKind,
        blob: String,
    ) -> Result<(), StoreError> {
        self.inner.set_description(id, kind, blob).await
    }

    async fn append_candidate(
        &self,
        id: &str,
        role: CallRole,
        blob: String,
    ) -> Result<(), StoreError> {
        self.inner.append_candidate(id, role, blob).await
    }

    async fn set_status(&self, id: &str, status: CallStatus) -> Result<(), StoreError> {
        self.inner.set_status(id, status).await
    }

    async fn list_active_for(&self, user_id: &str) -> Result<Vec<CallSession>, StoreError> {
        if self.failing_polls.load(Ordering::SeqCst) > 0 {
            self.failing_polls.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Backend("injected poll failure".into()));
        }
        self.inner.list_active_for(user_id).await
    }
}

// Scenario A: placing a video call writes a ringing record with the
// offer, and early local candidates land within one poll interval.
#[tokio::test]
async fn start_call_publishes_ringing_record_with_offer_and_candidates() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let caller = spawn_peer("alice", store.clone(), test_config());

    let call_id = caller
        .engine
        .start_call("bob", MediaKind::Video)
        .await
        .expect("start_call");

    let peer = caller.connector.last_peer().expect("peer connected");
    peer.emit_local_candidate("caller-cand-0");
    sleep(POLL * 2).await;

    let session = store.get(&call_id).await.unwrap().expect("record exists");
    assert_eq!(session.status, CallStatus::Ringing);
    assert_eq!(session.caller_id, "alice");
    assert_eq!(session.receiver_id, "bob");
    assert_eq!(session.media_kind, MediaKind::Video);
    assert!(session.offer.is_some());
    assert!(session.answer.is_none());
    assert_eq!(session.caller_candidates, ["caller-cand-0"]);

    caller.engine.shutdown().await;
    caller.loop_handle.abort();
}

// Scenario B: the receiver is rung, accepts, and the caller observes
// `connected` and applies the answer within a poll interval.
#[tokio::test]
async fn accept_connects_both_sides_and_applies_answer() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let mut caller = spawn_peer("alice", store.clone(), test_config());
    let mut receiver = spawn_peer("bob", store.clone(), test_config());

    let call_id = caller
        .engine
        .start_call("bob", MediaKind::Audio)
        .await
        .expect("start_call");

    let incoming = wait_for_event(&mut receiver.events, "incoming call", |event| {
        matches!(event, CallEvent::IncomingCall(session) if session.id == call_id)
    })
    .await;
    if let CallEvent::IncomingCall(session) = incoming {
        assert_eq!(session.caller_id, "alice");
        assert_eq!(session.status, CallStatus::Ringing);
    }
    // The ring is surfaced without touching the receiver's devices.
    assert_eq!(receiver.media.acquired(), 0);

    receiver.engine.accept_call(&call_id).await.expect("accept");

    wait_for_event(&mut caller.events, "caller connected", |event| {
        is_status(event, &call_id, CallStatus::Connected)
    })
    .await;

    // The caller's context received the published answer.
    let answer = store
        .get(&call_id)
        .await
        .unwrap()
        .unwrap()
        .answer
        .expect("answer set");
    sleep(POLL * 2).await;
    let caller_peer = caller.connector.last_peer().unwrap();
    assert_eq!(caller_peer.remote_description(), Some(answer));

    caller.engine.shutdown().await;
    receiver.engine.shutdown().await;
}

// Scenario C: the receiver's polls fail twice, then the terminal status
// is observed; local media is released exactly once.
#[tokio::test]
async fn missed_polls_then_observed_end_releases_media_once() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let flaky = FlakyStore::wrap(store.clone());
    let mut caller = spawn_peer("alice", store.clone(), test_config());
    let mut receiver = spawn_peer("bob", flaky.clone(), test_config());

    let call_id = caller
        .engine
        .start_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    wait_for_event(&mut receiver.events, "incoming call", |event| {
        matches!(event, CallEvent::IncomingCall(_))
    })
    .await;
    receiver.engine.accept_call(&call_id).await.unwrap();

    flaky.fail_polls(2);
    caller.engine.end_call(&call_id).await.unwrap();

    wait_for_event(&mut receiver.events, "receiver observes end", |event| {
        is_status(event, &call_id, CallStatus::Ended)
    })
    .await;
    sleep(POLL * 3).await;

    assert_eq!(receiver.media.acquired(), 1);
    assert_eq!(receiver.media.released(), 1);
    assert!(receiver.connector.last_peer().unwrap().is_closed());

    caller.engine.shutdown().await;
    receiver.engine.shutdown().await;
}

// Scenario D: five caller candidates appended before the receiver's
// first look are applied in order on the next tick, and never twice.
#[tokio::test]
async fn early_candidates_apply_in_order_exactly_once() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let caller = spawn_peer("alice", store.clone(), test_config());

    let call_id = caller
        .engine
        .start_call("bob", MediaKind::Video)
        .await
        .unwrap();
    let caller_peer = caller.connector.last_peer().unwrap();
    for n in 0..5 {
        caller_peer.emit_local_candidate(format!("caller-cand-{n}"));
    }
    sleep(POLL * 2).await;

    let mut receiver = spawn_peer("bob", store.clone(), test_config());
    wait_for_event(&mut receiver.events, "incoming call", |event| {
        matches!(event, CallEvent::IncomingCall(_))
    })
    .await;
    receiver.engine.accept_call(&call_id).await.unwrap();

    let expected: Vec<String> = (0..5).map(|n| format!("caller-cand-{n}")).collect();
    let receiver_peer = receiver.connector.last_peer().unwrap();
    timeout(EVENT_WAIT, async {
        while receiver_peer.remote_candidates().len() < 5 {
            sleep(POLL).await;
        }
    })
    .await
    .expect("candidates applied");
    assert_eq!(receiver_peer.remote_candidates(), expected);

    // Further ticks re-read the same sequence without re-applying.
    sleep(POLL * 4).await;
    assert_eq!(receiver_peer.remote_candidates(), expected);

    caller.engine.shutdown().await;
    receiver.engine.shutdown().await;
}

// Scenario E: declining a ring never sets an answer and terminates in
// `rejected` on both sides.
#[tokio::test]
async fn reject_before_exchange_sets_no_answer() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let mut caller = spawn_peer("alice", store.clone(), test_config());
    let mut receiver = spawn_peer("bob", store.clone(), test_config());

    let call_id = caller
        .engine
        .start_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    wait_for_event(&mut receiver.events, "incoming call", |event| {
        matches!(event, CallEvent::IncomingCall(_))
    })
    .await;

    // Declining a ringing call as receiver rejects it.
    receiver.engine.end_call(&call_id).await.unwrap();

    wait_for_event(&mut caller.events, "caller observes rejection", |event| {
        is_status(event, &call_id, CallStatus::Rejected)
    })
    .await;

    let session = store.get(&call_id).await.unwrap().expect("within grace");
    assert_eq!(session.status, CallStatus::Rejected);
    assert!(session.answer.is_none());
    // No media was ever held on the receiver side.
    assert_eq!(receiver.media.acquired(), 0);

    caller.engine.shutdown().await;
    receiver.engine.shutdown().await;
}

#[tokio::test]
async fn media_denial_aborts_before_any_record() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let media = Arc::new(MockMedia::denying());
    let connector = Arc::new(MockConnector::new());
    let engine = CallEngine::new(
        "alice",
        store.clone() as Arc<dyn SessionStore>,
        media,
        connector.clone(),
        test_config(),
    );

    let err = engine
        .start_call("bob", MediaKind::Video)
        .await
        .expect_err("denied media");
    assert!(matches!(err, EngineError::MediaUnavailable(_)));
    assert!(store.list_active_for("alice").await.unwrap().is_empty());
    assert_eq!(connector.peer_count(), 0);
}

#[tokio::test]
async fn three_consecutive_poll_failures_signal_instability_once() {
    let flaky = FlakyStore::wrap(Arc::new(MemoryStore::new()));
    flaky.fail_polls(4);
    let mut peer = spawn_peer("alice", flaky.clone(), test_config());

    let event = wait_for_event(&mut peer.events, "signaling unstable", |event| {
        matches!(event, CallEvent::SignalingUnstable { .. })
    })
    .await;
    if let CallEvent::SignalingUnstable {
        consecutive_failures,
    } = event
    {
        assert_eq!(consecutive_failures, 3);
    }

    // The fourth failure stays quiet; the threshold is reported once
    // per outage.
    sleep(POLL * 4).await;
    loop {
        match peer.events.try_recv() {
            Ok(CallEvent::SignalingUnstable { .. }) => {
                panic!("instability signaled more than once")
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    peer.engine.shutdown().await;
}

#[tokio::test]
async fn vanished_session_force_terminates_locally() {
    // Grace period of zero: terminal records disappear from listings
    // before the peer can observe the status itself.
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::with_limits(0, 64));
    let mut caller = spawn_peer("alice", store.clone(), test_config());
    let mut receiver = spawn_peer("bob", store.clone(), test_config());

    let call_id = caller
        .engine
        .start_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    wait_for_event(&mut receiver.events, "incoming call", |event| {
        matches!(event, CallEvent::IncomingCall(_))
    })
    .await;
    receiver.engine.accept_call(&call_id).await.unwrap();
    wait_for_event(&mut caller.events, "caller connected", |event| {
        is_status(event, &call_id, CallStatus::Connected)
    })
    .await;

    // Give the vanish exemption window time to lapse on the receiver.
    sleep(POLL * 3).await;
    caller.engine.end_call(&call_id).await.unwrap();

    wait_for_event(&mut receiver.events, "forced local end", |event| {
        is_status(event, &call_id, CallStatus::Ended)
    })
    .await;
    sleep(POLL * 2).await;
    assert_eq!(receiver.media.released(), 1);
    assert!(receiver.connector.last_peer().unwrap().is_closed());

    caller.engine.shutdown().await;
    receiver.engine.shutdown().await;
}

#[tokio::test]
async fn unanswered_ring_times_out_and_ends() {
    let mut config = test_config();
    config.ring_timeout = Duration::from_millis(100);
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let mut caller = spawn_peer("alice", store.clone(), config);

    let call_id = caller
        .engine
        .start_call("bob", MediaKind::Audio)
        .await
        .unwrap();

    wait_for_event(&mut caller.events, "ring timeout", |event| {
        is_status(event, &call_id, CallStatus::Ended)
    })
    .await;

    let session = store.get(&call_id).await.unwrap().expect("within grace");
    assert_eq!(session.status, CallStatus::Ended);
    assert_eq!(caller.media.released(), 1);

    caller.engine.shutdown().await;
}

#[tokio::test]
async fn remote_media_arrival_is_surfaced() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let mut caller = spawn_peer("alice", store.clone(), test_config());

    let call_id = caller
        .engine
        .start_call("bob", MediaKind::Video)
        .await
        .unwrap();
    let peer = caller.connector.last_peer().unwrap();
    peer.emit_remote_media(call_engine::MediaHandle {
        id: "remote-media".into(),
        kind: MediaKind::Video,
    });

    let event = wait_for_event(&mut caller.events, "remote media", |event| {
        matches!(event, CallEvent::RemoteMediaAvailable { .. })
    })
    .await;
    if let CallEvent::RemoteMediaAvailable { call_id: id, media } = event {
        assert_eq!(id, call_id);
        assert_eq!(media.id, "remote-media");
    }

    caller.engine.shutdown().await;
}

#[tokio::test]
async fn accepting_a_connected_call_is_rejected() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let mut caller = spawn_peer("alice", store.clone(), test_config());
    let mut receiver = spawn_peer("bob", store.clone(), test_config());

    let call_id = caller
        .engine
        .start_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    wait_for_event(&mut receiver.events, "incoming call", |event| {
        matches!(event, CallEvent::IncomingCall(_))
    })
    .await;
    receiver.engine.accept_call(&call_id).await.unwrap();

    let err = receiver
        .engine
        .accept_call(&call_id)
        .await
        .expect_err("double accept");
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    caller.engine.shutdown().await;
    receiver.engine.shutdown().await;
}
