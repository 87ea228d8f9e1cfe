//! Core types for Postline

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::PostlineError;
use crate::sessions::fingerprint::DeviceFingerprint;

/// Kind of content a post publishes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PostType {
    Static,
    Carousel,
    Video,
    Reel,
    Story,
}

impl PostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostType::Static => "static",
            PostType::Carousel => "carousel",
            PostType::Video => "video",
            PostType::Reel => "reel",
            PostType::Story => "story",
        }
    }
}

impl FromStr for PostType {
    type Err = PostlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "static" | "image" | "photo" => Ok(PostType::Static),
            "carousel" | "album" => Ok(PostType::Carousel),
            "video" => Ok(PostType::Video),
            "reel" => Ok(PostType::Reel),
            "story" => Ok(PostType::Story),
            _ => Err(PostlineError::InvalidInput(format!(
                "Invalid post type '{}'. Valid options: static, carousel, video, reel, story",
                s
            ))),
        }
    }
}

impl std::fmt::Display for PostType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Pending,
    Processing,
    Published,
    Failed,
    Cancelled,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Processing => "processing",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
            PostStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PostStatus::Published | PostStatus::Failed | PostStatus::Cancelled
        )
    }
}

impl FromStr for PostStatus {
    type Err = PostlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(PostStatus::Pending),
            "processing" => Ok(PostStatus::Processing),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            "cancelled" | "canceled" => Ok(PostStatus::Cancelled),
            _ => Err(PostlineError::InvalidInput(format!(
                "Invalid post status '{}'. Valid options: pending, processing, published, failed, cancelled",
                s
            ))),
        }
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of content to publish to one account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub id: String,
    pub account_id: String,
    pub post_type: PostType,
    /// Media references, resolved by the media store at publish time
    pub media: Vec<String>,
    pub caption: Option<String>,
    /// `None` means publish as soon as possible
    pub scheduled_for: Option<i64>,
    pub status: PostStatus,
    pub attempt_count: u32,
    /// Only set when `status` is `Failed`
    pub last_error: Option<String>,
    /// Only set when `status` is `Published`
    pub published_media_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Set while the post is claimed by a worker
    pub claimed_at: Option<i64>,
    /// A cancel arrived while the post was processing
    pub cancel_requested: bool,
    /// Requeued by the recovery sweep after a stale claim
    pub recovered: bool,
}

impl Post {
    pub fn new(
        account_id: String,
        post_type: PostType,
        media: Vec<String>,
        caption: Option<String>,
        scheduled_for: Option<i64>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            account_id,
            post_type,
            media,
            caption,
            scheduled_for,
            status: PostStatus::Pending,
            attempt_count: 0,
            last_error: None,
            published_media_id: None,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            cancel_requested: false,
            recovered: false,
        }
    }

    /// Whether an earlier attempt may already have reached the platform
    pub fn may_have_published(&self) -> bool {
        self.attempt_count > 0 || self.recovered
    }
}

/// A social-media account under automation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub business_profile_id: Option<String>,
    pub device_fingerprint: Option<DeviceFingerprint>,
    /// Why the account cannot log in, if its credentials were rejected
    pub degraded_reason: Option<String>,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

impl Account {
    pub fn new(id: String, username: String, business_profile_id: Option<String>) -> Self {
        Self {
            id,
            username,
            business_profile_id,
            device_fingerprint: None,
            degraded_reason: None,
            created_at: chrono::Utc::now().timestamp(),
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_reason.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Unauthenticated,
    Authenticating,
    Active,
    Expired,
    /// Login was rejected for bad credentials or a locked account.
    /// Terminal until an operator resets the login.
    CredentialsRejected,
    /// The platform suspended the account
    Banned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Unauthenticated => "unauthenticated",
            SessionStatus::Authenticating => "authenticating",
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::CredentialsRejected => "credentials_rejected",
            SessionStatus::Banned => "banned",
        }
    }

    /// A login attempt is needed before the session can be used
    pub fn needs_login(&self) -> bool {
        matches!(
            self,
            SessionStatus::Unauthenticated | SessionStatus::Authenticating | SessionStatus::Expired
        )
    }
}

impl FromStr for SessionStatus {
    type Err = PostlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unauthenticated" => Ok(SessionStatus::Unauthenticated),
            "authenticating" => Ok(SessionStatus::Authenticating),
            "active" => Ok(SessionStatus::Active),
            "expired" => Ok(SessionStatus::Expired),
            "credentials_rejected" => Ok(SessionStatus::CredentialsRejected),
            "banned" => Ok(SessionStatus::Banned),
            _ => Err(PostlineError::InvalidInput(format!(
                "Invalid session status '{}'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Token and cookie bundle returned by a successful login.
///
/// Opaque to the engine apart from the expiry instant.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthState {
    pub token: String,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    pub issued_at: i64,
    pub expires_at: Option<i64>,
}

impl AuthState {
    pub fn new(token: String, issued_at: i64, expires_at: Option<i64>) -> Self {
        Self {
            token,
            cookies: BTreeMap::new(),
            issued_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("token", &"[REDACTED]")
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The live authenticated handle for one account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub account_id: String,
    pub auth_state: Option<AuthState>,
    pub status: SessionStatus,
    pub last_used_at: Option<i64>,
    pub updated_at: i64,
}

impl Session {
    pub fn unauthenticated(account_id: &str, now: i64) -> Self {
        Self {
            account_id: account_id.to_string(),
            auth_state: None,
            status: SessionStatus::Unauthenticated,
            last_used_at: None,
            updated_at: now,
        }
    }
}
