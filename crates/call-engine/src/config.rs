use std::env;
use std::time::Duration;

/// Engine tuning knobs, all overridable from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the reconciliation loop polls the session store.
    pub poll_interval: Duration,
    /// How long an outgoing call may ring unanswered before the caller
    /// ends it.
    pub ring_timeout: Duration,
    /// Consecutive poll failures before the engine signals that
    /// signaling is unstable.
    pub poll_failure_threshold: u32,
    /// STUN/TURN endpoints handed to real peer-connector implementations.
    pub ice_servers: Vec<String>,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let poll_interval_ms = env::var("CALL_POLL_INTERVAL_MS")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(1_000);
        let ring_timeout_secs = env::var("CALL_RING_TIMEOUT_SECS")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(45);
        let poll_failure_threshold = env::var("CALL_POLL_FAILURE_THRESHOLD")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(3);
        let ice_servers = env::var("CALL_ICE_SERVERS")
            .ok()
            .map(|val| {
                val.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(default_ice_servers);

        Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            ring_timeout: Duration::from_secs(ring_timeout_secs),
            poll_failure_threshold,
            ice_servers,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            ring_timeout: Duration::from_secs(45),
            poll_failure_threshold: 3,
            ice_servers: default_ice_servers(),
        }
    }
}

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
