//! Per-account sessions: persistence, device fingerprints and the manager
//! that serializes all work for an account.

pub mod fingerprint;
pub mod manager;
pub mod store;

pub use fingerprint::DeviceFingerprint;
pub use manager::{AccountSessionManager, ActiveSession};
pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore};
