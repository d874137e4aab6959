pub mod memory;
pub mod session;
pub mod store;

pub use memory::MemoryStore;
pub use session::{
    generate_call_id, unix_millis, CallRole, CallSession, CallStatus, MediaKind, SdpKind,
};
pub use store::{SessionStore, StoreError};
