//! Publish adapter
//!
//! Turns a [`Post`] into one platform publish call made under the account's
//! session. The publisher reports what happened as a [`PublishOutcome`] and
//! never touches post status; the dispatcher owns every transition.

use std::sync::Arc;

use crate::config::PublishConfig;
use crate::error::{PlatformError, PostlineError, Result};
use crate::platforms::{MediaItem, MediaStore, PublishPlatform, PublishRequest};
use crate::service::validation::check_shape;
use crate::sessions::AccountSessionManager;
use crate::types::Post;

/// Result of one publish attempt
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Published { media_id: String },
    /// Transient; the dispatcher may try again later
    Retryable(PlatformError),
    /// Terminal for this post
    Rejected(PlatformError),
    /// The account's login was rejected; the post itself is fine
    AuthenticationFailed(String),
}

impl PublishOutcome {
    /// Classify a platform failure
    pub fn from_platform_error(error: PlatformError) -> Self {
        if error.is_retryable() {
            PublishOutcome::Retryable(error)
        } else {
            PublishOutcome::Rejected(error)
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

pub struct Publisher {
    sessions: Arc<AccountSessionManager>,
    platform: Arc<dyn PublishPlatform>,
    media: Arc<dyn MediaStore>,
    rules: PublishConfig,
}

impl Publisher {
    pub fn new(
        sessions: Arc<AccountSessionManager>,
        platform: Arc<dyn PublishPlatform>,
        media: Arc<dyn MediaStore>,
        rules: PublishConfig,
    ) -> Self {
        Self {
            sessions,
            platform,
            media,
            rules,
        }
    }

    pub fn sessions(&self) -> &Arc<AccountSessionManager> {
        &self.sessions
    }

    /// Publish `post` once.
    ///
    /// # Errors
    ///
    /// - `InvalidPostShape` when the media count does not fit the post type
    /// - `NotFound` when the account disappeared
    /// - `Database` for storage trouble while handling the session
    pub async fn publish(&self, post: &Post) -> Result<PublishOutcome> {
        check_shape(&self.rules, post.post_type, &post.media)?;

        // Media is resolved before the account lock so slow storage never
        // holds up the account
        let media = match self.fetch_media(post).await {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(post_id = %post.id, error = %e, "Media could not be resolved");
                return Ok(PublishOutcome::from_platform_error(e));
            }
        };

        let platform = &self.platform;
        let check_duplicate = post.may_have_published();

        let result = self
            .sessions
            .with_session(&post.account_id, move |session| async move {
                if check_duplicate {
                    match platform.find_recent_publish(&session.auth_state, post).await {
                        Ok(Some(media_id)) => {
                            tracing::info!(
                                post_id = %post.id,
                                media_id = %media_id,
                                "Found an earlier publish, not publishing again"
                            );
                            return Ok(media_id);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(
                                post_id = %post.id,
                                error = %e,
                                "Duplicate lookup failed, publishing anyway"
                            );
                        }
                    }
                }

                let request = PublishRequest {
                    account_id: session.account_id,
                    post_id: post.id.clone(),
                    post_type: post.post_type,
                    auth_state: session.auth_state,
                    fingerprint: Some(session.fingerprint),
                    media,
                    caption: post.caption.clone(),
                };

                tracing::debug!(
                    post_id = %post.id,
                    platform = platform.name(),
                    media_count = request.media.len(),
                    "Publishing"
                );
                platform.publish(&request).await
            })
            .await;

        match result {
            Ok(media_id) => Ok(PublishOutcome::Published { media_id }),
            Err(PostlineError::AuthenticationFailed { reason, .. }) => {
                Ok(PublishOutcome::AuthenticationFailed(reason))
            }
            Err(PostlineError::Platform(e)) => Ok(PublishOutcome::from_platform_error(e)),
            Err(e) => Err(e),
        }
    }

    async fn fetch_media(&self, post: &Post) -> std::result::Result<Vec<MediaItem>, PlatformError> {
        let mut items = Vec::with_capacity(post.media.len());
        for reference in &post.media {
            let bytes = self.media.fetch_media_bytes(reference).await?;
            items.push(MediaItem {
                reference: reference.clone(),
                bytes,
            });
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::db::Database;
    use crate::platforms::mock::{MockMediaStore, MockPlatform};
    use crate::scheduling::ManualClock;
    use crate::sessions::MemorySessionStore;
    use crate::types::{Account, PostType};

    struct Harness {
        db: Database,
        platform: Arc<MockPlatform>,
        media: Arc<MockMediaStore>,
        publisher: Publisher,
    }

    async fn harness(platform: MockPlatform) -> Harness {
        let db = Database::in_memory().await.unwrap();
        db.create_account(&Account::new("shop".to_string(), "shop_ig".to_string(), None))
            .await
            .unwrap();

        let platform = Arc::new(platform);
        let media = Arc::new(MockMediaStore::permissive());
        let sessions = Arc::new(AccountSessionManager::new(
            db.clone(),
            Arc::new(MemorySessionStore::new()),
            platform.clone(),
            Arc::new(StaticCredentials::new().with("shop", "shop_ig", "hunter2")),
            Arc::new(ManualClock::new(chrono::Utc::now().timestamp())),
            "test-salt",
        ));
        let publisher = Publisher::new(
            sessions,
            platform.clone(),
            media.clone(),
            PublishConfig::default(),
        );

        Harness {
            db,
            platform,
            media,
            publisher,
        }
    }

    fn post(post_type: PostType, media: &[&str]) -> Post {
        Post::new(
            "shop".to_string(),
            post_type,
            media.iter().map(|m| m.to_string()).collect(),
            Some("caption".to_string()),
            None,
        )
    }

    #[tokio::test]
    async fn test_publish_carousel() {
        let h = harness(MockPlatform::new()).await;
        let post = post(PostType::Carousel, &["a.jpg", "b.jpg", "c.jpg"]);

        let outcome = h.publisher.publish(&post).await.unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Published {
                media_id: "mock-media-1".to_string()
            }
        );

        let calls = h.platform.publishes();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].media_refs, vec!["a.jpg", "b.jpg", "c.jpg"]);
        assert_eq!(calls[0].token, "mock-token-1");
        assert_eq!(h.media.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_invalid_shape_never_reaches_platform() {
        let h = harness(MockPlatform::new()).await;
        let post = post(PostType::Static, &[]);

        let err = h.publisher.publish(&post).await.unwrap_err();
        assert!(matches!(err, PostlineError::InvalidPostShape(_)));
        assert_eq!(h.platform.login_count(), 0);
        assert_eq!(h.media.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_media_is_rejected_without_login() {
        let h = harness(MockPlatform::new()).await;
        h.media.mark_missing("gone.jpg");

        let outcome = h
            .publisher
            .publish(&post(PostType::Static, &["gone.jpg"]))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            PublishOutcome::Rejected(PlatformError::MediaUnavailable(_))
        ));
        assert_eq!(h.platform.login_count(), 0);
    }

    #[tokio::test]
    async fn test_classifies_platform_failures() {
        let h = harness(MockPlatform::new()).await;
        h.platform.script_publishes([
            Err(PlatformError::Network("timeout".to_string())),
            Err(PlatformError::ContentRejected("nudity".to_string())),
        ]);

        let first = h
            .publisher
            .publish(&post(PostType::Static, &["a.jpg"]))
            .await
            .unwrap();
        assert!(matches!(first, PublishOutcome::Retryable(PlatformError::Network(_))));

        let second = h
            .publisher
            .publish(&post(PostType::Static, &["a.jpg"]))
            .await
            .unwrap();
        assert!(matches!(
            second,
            PublishOutcome::Rejected(PlatformError::ContentRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_login_rejection_reported() {
        let h = harness(
            MockPlatform::new().rejecting_logins(PlatformError::Authentication(
                "bad password".to_string(),
            )),
        )
        .await;

        let outcome = h
            .publisher
            .publish(&post(PostType::Static, &["a.jpg"]))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::AuthenticationFailed("bad password".to_string())
        );
        assert_eq!(h.platform.publish_count(), 0);

        let account = h.db.get_account("shop").await.unwrap().unwrap();
        assert!(account.is_degraded());
    }

    #[tokio::test]
    async fn test_duplicate_guard_short_circuits() {
        let h = harness(MockPlatform::new()).await;
        let mut post = post(PostType::Static, &["a.jpg"]);
        post.recovered = true;
        h.platform.record_remote_publish(&post.id, "already-there");

        let outcome = h.publisher.publish(&post).await.unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Published {
                media_id: "already-there".to_string()
            }
        );
        assert_eq!(h.platform.lookup_count(), 1);
        assert_eq!(h.platform.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_guard_skipped_for_first_attempt() {
        let h = harness(MockPlatform::new()).await;
        h.publisher
            .publish(&post(PostType::Static, &["a.jpg"]))
            .await
            .unwrap();
        assert_eq!(h.platform.lookup_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_lookup_failure_is_ignored() {
        let h = harness(MockPlatform::new()).await;
        h.platform.fail_lookups(true);
        let mut post = post(PostType::Static, &["a.jpg"]);
        post.attempt_count = 1;

        let outcome = h.publisher.publish(&post).await.unwrap();
        assert!(outcome.is_published());
        assert_eq!(h.platform.lookup_count(), 1);
        assert_eq!(h.platform.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_account_is_an_error() {
        let h = harness(MockPlatform::new()).await;
        let mut post = post(PostType::Static, &["a.jpg"]);
        post.account_id = "nobody".to_string();

        let err = h.publisher.publish(&post).await.unwrap_err();
        assert!(matches!(err, PostlineError::NotFound(_)));
    }
}
