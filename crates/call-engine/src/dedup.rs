use std::collections::HashMap;

use call_store::CallRole;
use parking_lot::Mutex;

/// Tracks how many of a remote role's candidates have already been
/// applied locally, per call.
///
/// Candidate sequences in the session record are append-only, so a
/// monotonic count is enough to split each poll's view into
/// already-applied prefix and fresh suffix. Re-reading the same prefix
/// under at-least-once delivery yields an empty suffix.
#[derive(Default)]
pub struct CandidateTracker {
    applied: Mutex<HashMap<(String, CallRole), usize>>,
}

impl CandidateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the not-yet-applied suffix of `all` and mark it applied.
    pub fn fresh<'a>(&self, call_id: &str, role: CallRole, all: &'a [String]) -> &'a [String] {
        let mut applied = self.applied.lock();
        let count = applied
            .entry((call_id.to_string(), role))
            .or_insert(0);
        if *count >= all.len() {
            return &[];
        }
        let suffix = &all[*count..];
        *count = all.len();
        suffix
    }

    /// Drop all bookkeeping for a torn-down call.
    pub fn forget(&self, call_id: &str) {
        let mut applied = self.applied.lock();
        applied.retain(|(id, _), _| id != call_id);
    }
}
