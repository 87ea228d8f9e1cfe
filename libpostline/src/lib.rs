//! Postline - scheduled multi-account publishing
//!
//! This library holds the publishing engine: durable post and account
//! storage, per-account authenticated sessions, the publish adapter and the
//! dispatcher that moves posts from `pending` to `published` (or `failed`)
//! with retries, rate limits and crash recovery.

pub mod config;
pub mod credentials;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod instance;
pub mod logging;
pub mod platforms;
pub mod publisher;
pub mod rate_limiter;
pub mod scheduling;
pub mod service;
pub mod sessions;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{Credentials, FileCredentials, StaticCredentials};
pub use db::{Database, PostFilter, QueueStats};
pub use dispatcher::{CycleReport, Dispatcher};
pub use error::{PlatformError, PostlineError, Result};
pub use instance::InstanceLock;
pub use publisher::{PublishOutcome, Publisher};
pub use service::PostlineService;
pub use types::{Account, Post, PostStatus, PostType, Session, SessionStatus};
