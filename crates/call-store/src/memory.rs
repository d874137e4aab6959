use dashmap::DashMap;

use async_trait::async_trait;

use crate::session::{unix_millis, CallRole, CallSession, CallStatus, SdpKind};
use crate::store::{SessionStore, StoreError};

/// Default time a terminal session stays visible to `list_active_for`,
/// long enough for the slower peer's poll loop to observe the terminal
/// status before the record ages out.
pub const DEFAULT_GRACE_MILLIS: u64 = 30_000;

/// Default cap on each role's candidate sequence.
pub const DEFAULT_CANDIDATE_CAP: usize = 64;

/// In-memory reference implementation of [`SessionStore`].
///
/// Semantics mirror what a TTL'd remote store provides: records for
/// terminal calls remain readable for a grace period and are purged
/// lazily on later accesses. Both participants' engines share one
/// instance in tests; a networked implementation slots behind the same
/// trait.
pub struct MemoryStore {
    sessions: DashMap<String, CallSession>,
    grace_millis: u64,
    candidate_cap: usize,
    /// Terminal timestamps, keyed by call id, set on the transition into
    /// `ended`/`rejected`.
    terminal_at: DashMap<String, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_GRACE_MILLIS, DEFAULT_CANDIDATE_CAP)
    }

    pub fn with_limits(grace_millis: u64, candidate_cap: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            grace_millis,
            candidate_cap,
            terminal_at: DashMap::new(),
        }
    }

    /// Whether the session's terminal state has outlived the grace period.
    fn aged_out(&self, id: &str, now_ms: u64) -> bool {
        self.terminal_at
            .get(id)
            .map(|at| now_ms.saturating_sub(*at) >= self.grace_millis)
            .unwrap_or(false)
    }

    /// Drop every session whose grace period has elapsed.
    fn purge_expired(&self, now_ms: u64) {
        let expired: Vec<String> = self
            .terminal_at
            .iter()
            .filter(|entry| now_ms.saturating_sub(*entry.value()) >= self.grace_millis)
            .map(|entry| entry.key().clone())
            .collect();
        for id in expired {
            self.sessions.remove(&id);
            self.terminal_at.remove(&id);
            tracing::debug!(target: "call_store", call_id = %id, "purged aged-out session");
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: CallSession) -> Result<(), StoreError> {
        self.purge_expired(unix_millis());
        match self.sessions.entry(session.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::Conflict(session.id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::debug!(
                    target: "call_store",
                    call_id = %session.id,
                    caller = %session.caller_id,
                    receiver = %session.receiver_id,
                    "session created"
                );
                slot.insert(session);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<CallSession>, StoreError> {
        let now = unix_millis();
        if self.aged_out(id, now) {
            self.sessions.remove(id);
            self.terminal_at.remove(id);
            return Ok(None);
        }
        Ok(self.sessions.get(id).map(|s| s.value().clone()))
    }

    async fn set_description(
        &self,
        id: &str,
        kind: SdpKind,
        blob: String,
    ) -> Result<(), StoreError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        match kind {
            SdpKind::Offer => {
                if session.offer.is_some() {
                    return Err(StoreError::InvalidTransition(format!(
                        "offer already set for call {id}"
                    )));
                }
                session.offer = Some(blob);
            }
            SdpKind::Answer => {
                if session.offer.is_none() {
                    return Err(StoreError::InvalidTransition(format!(
                        "answer before offer for call {id}"
                    )));
                }
                if session.answer.is_some() {
                    return Err(StoreError::InvalidTransition(format!(
                        "answer already set for call {id}"
                    )));
                }
                session.answer = Some(blob);
            }
        }
        Ok(())
    }

    async fn append_candidate(
        &self,
        id: &str,
        role: CallRole,
        blob: String,
    ) -> Result<(), StoreError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let seq = match role {
            CallRole::Caller => &mut session.caller_candidates,
            CallRole::Receiver => &mut session.receiver_candidates,
        };
        if seq.len() >= self.candidate_cap {
            // Append stays non-failing; excess paths are dropped.
            tracing::warn!(
                target: "call_store",
                call_id = %id,
                ?role,
                cap = self.candidate_cap,
                "candidate cap reached, dropping append"
            );
            return Ok(());
        }
        seq.push(blob);
        Ok(())
    }

    async fn set_status(&self, id: &str, status: CallStatus) -> Result<(), StoreError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !session.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition(format!(
                "{} -> {} for call {id}",
                session.status, status
            )));
        }
        tracing::debug!(
            target: "call_store",
            call_id = %id,
            from = %session.status,
            to = %status,
            "status transition"
        );
        session.status = status;
        if status.is_terminal() {
            self.terminal_at.insert(id.to_string(), unix_millis());
        }
        Ok(())
    }

    async fn list_active_for(&self, user_id: &str) -> Result<Vec<CallSession>, StoreError> {
        let now = unix_millis();
        self.purge_expired(now);
        let mut sessions: Vec<CallSession> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_participant(user_id))
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }
}
