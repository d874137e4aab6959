use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new call ID
pub fn generate_call_id() -> String {
    Uuid::new_v4().to_string()
}

/// Milliseconds since the unix epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Media requested for a call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Which participant a candidate sequence (or a write) belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Receiver,
}

impl CallRole {
    /// The other side of the call. Candidates under one role are consumed
    /// by the opposite participant.
    pub fn opposite(self) -> CallRole {
        match self {
            CallRole::Caller => CallRole::Receiver,
            CallRole::Receiver => CallRole::Caller,
        }
    }
}

/// Which description slot a negotiation blob targets
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Call lifecycle status. Terminal states absorb: no transition leaves
/// `Ended` or `Rejected`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Connected,
    Ended,
    Rejected,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Rejected)
    }

    /// Whether `next` is reachable from `self` in one step
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        match (self, next) {
            (CallStatus::Ringing, CallStatus::Connected)
            | (CallStatus::Ringing, CallStatus::Rejected)
            | (CallStatus::Ringing, CallStatus::Ended)
            | (CallStatus::Connected, CallStatus::Ended) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
            CallStatus::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

/// The shared session record both participants poll. Descriptions and
/// candidates are opaque blobs produced by the media stack; only presence
/// and sequence order matter here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    #[serde(default)]
    pub offer: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub caller_candidates: Vec<String>,
    #[serde(default)]
    pub receiver_candidates: Vec<String>,
    /// Creation time, milliseconds since the unix epoch
    pub created_at: u64,
}

impl CallSession {
    /// Mint a fresh ringing session. Only the caller creates records.
    pub fn new(
        id: impl Into<String>,
        caller_id: impl Into<String>,
        receiver_id: impl Into<String>,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            id: id.into(),
            caller_id: caller_id.into(),
            receiver_id: receiver_id.into(),
            media_kind,
            status: CallStatus::Ringing,
            offer: None,
            answer: None,
            caller_candidates: Vec::new(),
            receiver_candidates: Vec::new(),
            created_at: unix_millis(),
        }
    }

    /// The role `user_id` plays in this call, if any
    pub fn role_of(&self, user_id: &str) -> Option<CallRole> {
        if self.caller_id == user_id {
            Some(CallRole::Caller)
        } else if self.receiver_id == user_id {
            Some(CallRole::Receiver)
        } else {
            None
        }
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.role_of(user_id).is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Candidate sequence appended by `role`
    pub fn candidates(&self, role: CallRole) -> &[String] {
        match role {
            CallRole::Caller => &self.caller_candidates,
            CallRole::Receiver => &self.receiver_candidates,
        }
    }

    /// Description blob in the given slot
    pub fn description(&self, kind: SdpKind) -> Option<&str> {
        match kind {
            SdpKind::Offer => self.offer.as_deref(),
            SdpKind::Answer => self.answer.as_deref(),
        }
    }

    /// Milliseconds elapsed since creation, as seen from `now_ms`
    pub fn age_millis(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at)
    }
}
