use call_store::{CallSession, CallStatus};

use crate::media::MediaHandle;

/// Application-facing call events, delivered over a broadcast channel.
/// A fresh subscription starts at the current stream position.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A ringing session targeting the local user appeared in the store.
    IncomingCall(CallSession),
    /// A known call's status changed (observed remotely or driven locally).
    StatusChanged { call_id: String, status: CallStatus },
    /// The remote side's media started flowing for this call.
    RemoteMediaAvailable { call_id: String, media: MediaHandle },
    /// The poll-failure threshold was crossed. Informational; active
    /// calls continue and the loop keeps retrying.
    SignalingUnstable { consecutive_failures: u32 },
}
