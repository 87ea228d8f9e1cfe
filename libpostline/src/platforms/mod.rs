//! Seams to the external platform.
//!
//! The engine never speaks the platform's wire protocol itself. It talks to
//! four collaborators:
//!
//! - [`Authenticator`] turns credentials and a device fingerprint into an
//!   [`AuthState`]
//! - [`MediaStore`] resolves media references to bytes
//! - [`PublishPlatform`] performs the publish call
//! - [`CredentialProvider`] supplies an account's credentials on demand
//!
//! Implementations only classify failures into [`PlatformError`]; whether a
//! failure is retried is decided by the dispatcher.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use libpostline::platforms::mock::{MockMediaStore, MockPlatform};
//! use libpostline::platforms::{Authenticator, MediaStore, PublishPlatform};
//!
//! let platform = Arc::new(MockPlatform::new());
//! let authenticator: Arc<dyn Authenticator> = platform.clone();
//! let publisher: Arc<dyn PublishPlatform> = platform;
//! let media: Arc<dyn MediaStore> = Arc::new(MockMediaStore::permissive());
//! ```

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::PlatformError;
use crate::sessions::fingerprint::DeviceFingerprint;
use crate::types::{Account, AuthState, Post, PostType};

pub mod http;
pub mod media;

// Available outside tests so integration tests and embedders can script it
pub mod mock;

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Media bytes resolved for one reference
#[derive(Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub reference: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for MediaItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaItem")
            .field("reference", &self.reference)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Everything the platform needs for one publish call
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub account_id: String,
    /// Sent as the client reference so the platform can find the publish later
    pub post_id: String,
    pub post_type: PostType,
    pub auth_state: AuthState,
    pub fingerprint: Option<DeviceFingerprint>,
    pub media: Vec<MediaItem>,
    pub caption: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Log in and return a fresh auth state.
    ///
    /// # Errors
    ///
    /// - `PlatformError::Authentication` for bad credentials, a locked
    ///   account or a challenge the engine cannot answer
    /// - `PlatformError::AccountSuspended` when the platform banned the account
    /// - `PlatformError::Network` / `RateLimit` for transient trouble
    async fn login(
        &self,
        credentials: &Credentials,
        fingerprint: &DeviceFingerprint,
    ) -> PlatformResult<AuthState>;
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Resolve a media reference.
    ///
    /// Returns `PlatformError::MediaUnavailable` when the reference does not
    /// resolve; this is not retried.
    async fn fetch_media_bytes(&self, media_ref: &str) -> PlatformResult<Vec<u8>>;
}

#[async_trait]
pub trait PublishPlatform: Send + Sync {
    /// Lowercase identifier used in logs
    fn name(&self) -> &str;

    /// Publish and return the platform's media id.
    ///
    /// A `PlatformError::SessionExpired` makes the session manager drop the
    /// auth state so the next attempt logs in again.
    async fn publish(&self, request: &PublishRequest) -> PlatformResult<String>;

    /// Look for an earlier publish of `post` that the engine never recorded.
    ///
    /// Called before re-publishing a post that may already have reached the
    /// platform. Platforms without a lookup report nothing.
    async fn find_recent_publish(
        &self,
        _auth_state: &AuthState,
        _post: &Post,
    ) -> PlatformResult<Option<String>> {
        Ok(None)
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credentials for `account`.
    ///
    /// Missing credentials are reported as `PlatformError::Authentication`,
    /// which degrades the account like a rejected login.
    async fn credentials(&self, account: &Account) -> PlatformResult<Credentials>;
}
