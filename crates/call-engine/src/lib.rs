pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod mock;
pub mod negotiation;
pub mod peer;
mod reconcile;

pub use config::EngineConfig;
pub use engine::CallEngine;
pub use error::EngineError;
pub use events::CallEvent;
pub use media::{MediaHandle, MediaSource};
pub use peer::{PeerConnection, PeerConnector, PeerHandle};
