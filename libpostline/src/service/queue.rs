//! Post queue service
//!
//! Enqueue, inspect and cancel posts. Enqueue is the only way posts enter the
//! system and it validates everything up front: a rejected request leaves no
//! record behind.

use serde::Serialize;
use std::sync::Arc;

use crate::db::{Database, PostFilter, QueueStats};
use crate::error::{PostlineError, Result};
use crate::scheduling::Clock;
use crate::types::{Post, PostStatus, PostType};

use super::events::{Event, EventBus};
use super::validation::{ValidationRequest, ValidationService};

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub account_id: String,
    pub post_type: PostType,
    pub media: Vec<String>,
    pub caption: Option<String>,
    /// `None` publishes as soon as possible
    pub scheduled_for: Option<i64>,
}

/// A post as reported to users
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostStatusView {
    #[serde(flatten)]
    pub post: Post,
    /// Set when the account's credentials were rejected; the post waits
    /// until the login is reset
    pub account_degraded: Option<String>,
}

#[derive(Clone)]
pub struct QueueService {
    db: Database,
    validation: ValidationService,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl QueueService {
    pub fn new(
        db: Database,
        validation: ValidationService,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            validation,
            events,
            clock,
        }
    }

    /// Validate and store a new pending post, returning its id.
    ///
    /// # Errors
    ///
    /// - `InvalidPostShape` when the media count does not fit the post type
    /// - `InvalidInput` for an over-long caption
    /// - `NotFound` when the account does not exist or was removed
    pub async fn enqueue_post(&self, request: EnqueueRequest) -> Result<String> {
        self.validation.check(&ValidationRequest {
            post_type: request.post_type,
            media: request.media.clone(),
            caption: request.caption.clone(),
        })?;

        match self.db.get_account(&request.account_id).await? {
            Some(account) if !account.is_deleted() => {
                if let Some(reason) = &account.degraded_reason {
                    tracing::warn!(
                        account_id = %account.id,
                        reason = %reason,
                        "Enqueueing for an account whose login was rejected"
                    );
                }
            }
            _ => {
                return Err(PostlineError::NotFound(format!(
                    "account '{}'",
                    request.account_id
                )))
            }
        }

        let now = self.clock.now();
        let mut post = Post::new(
            request.account_id,
            request.post_type,
            request.media,
            request.caption,
            request.scheduled_for,
        );
        post.created_at = now;
        post.updated_at = now;

        self.db.create_post(&post).await?;

        tracing::info!(
            post_id = %post.id,
            account_id = %post.account_id,
            post_type = %post.post_type,
            scheduled_for = ?post.scheduled_for,
            "Post enqueued"
        );
        self.events.emit(Event::PostEnqueued {
            post_id: post.id.clone(),
            account_id: post.account_id.clone(),
            scheduled_for: post.scheduled_for,
        });

        Ok(post.id)
    }

    pub async fn get_post_status(&self, post_id: &str) -> Result<PostStatusView> {
        let post = self
            .db
            .get_post(post_id)
            .await?
            .ok_or_else(|| PostlineError::NotFound(format!("post '{}'", post_id)))?;

        let account_degraded = self
            .db
            .get_account(&post.account_id)
            .await?
            .and_then(|account| account.degraded_reason);

        Ok(PostStatusView {
            post,
            account_degraded,
        })
    }

    pub async fn list_posts(&self, filter: &PostFilter) -> Result<Vec<Post>> {
        self.db.list_posts(filter).await
    }

    /// Cancel a post.
    ///
    /// A pending post is cancelled at once. A processing post is only marked;
    /// it lands in `cancelled` when its attempt returns, whatever the
    /// outcome. Returns `false` for unknown or already finished posts.
    pub async fn cancel_post(&self, post_id: &str) -> Result<bool> {
        match self.db.cancel_post(post_id, self.clock.now()).await? {
            Some(PostStatus::Cancelled) => {
                tracing::info!(post_id, "Post cancelled");
                self.events.emit(Event::PostCancelled {
                    post_id: post_id.to_string(),
                });
                Ok(true)
            }
            Some(_) => {
                tracing::info!(post_id, "Cancel requested for a post being published");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.db.queue_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublishConfig;
    use crate::scheduling::ManualClock;
    use crate::types::Account;

    const T0: i64 = 1_700_000_000;

    async fn service() -> (QueueService, Database, EventBus) {
        let db = Database::in_memory().await.unwrap();
        db.create_account(&Account::new("shop".to_string(), "shop_ig".to_string(), None))
            .await
            .unwrap();
        let events = EventBus::new(16);
        let service = QueueService::new(
            db.clone(),
            ValidationService::new(PublishConfig::default()),
            events.clone(),
            Arc::new(ManualClock::new(T0)),
        );
        (service, db, events)
    }

    fn request(post_type: PostType, media: &[&str]) -> EnqueueRequest {
        EnqueueRequest {
            account_id: "shop".to_string(),
            post_type,
            media: media.iter().map(|m| m.to_string()).collect(),
            caption: Some("hello".to_string()),
            scheduled_for: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_carousel() {
        let (service, _db, events) = service().await;
        let mut receiver = events.subscribe();

        let id = service
            .enqueue_post(request(PostType::Carousel, &["a.jpg", "b.jpg", "c.jpg"]))
            .await
            .unwrap();

        let view = service.get_post_status(&id).await.unwrap();
        assert_eq!(view.post.status, PostStatus::Pending);
        assert_eq!(view.post.scheduled_for, None);
        assert_eq!(view.post.media.len(), 3);
        assert_eq!(view.post.created_at, T0);
        assert_eq!(view.account_degraded, None);

        assert!(matches!(
            receiver.recv().await.unwrap(),
            Event::PostEnqueued { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_shape_creates_nothing() {
        let (service, db, _) = service().await;

        let err = service
            .enqueue_post(request(PostType::Static, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, PostlineError::InvalidPostShape(_)));
        assert_eq!(db.queue_stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_unknown_or_removed_account() {
        let (service, db, _) = service().await;

        let mut req = request(PostType::Static, &["a.jpg"]);
        req.account_id = "ghost".to_string();
        assert!(matches!(
            service.enqueue_post(req).await,
            Err(PostlineError::NotFound(_))
        ));

        db.soft_delete_account("shop", T0).await.unwrap();
        assert!(matches!(
            service.enqueue_post(request(PostType::Static, &["a.jpg"])).await,
            Err(PostlineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_reports_degraded_account() {
        let (service, db, _) = service().await;
        let id = service
            .enqueue_post(request(PostType::Reel, &["v.mp4"]))
            .await
            .unwrap();

        db.set_account_degraded("shop", "bad password").await.unwrap();

        let view = service.get_post_status(&id).await.unwrap();
        assert_eq!(view.post.status, PostStatus::Pending);
        assert_eq!(view.account_degraded.as_deref(), Some("bad password"));
    }

    #[tokio::test]
    async fn test_cancel() {
        let (service, db, _) = service().await;
        let pending = service
            .enqueue_post(request(PostType::Story, &["s.jpg"]))
            .await
            .unwrap();
        let processing = service
            .enqueue_post(request(PostType::Story, &["s.jpg"]))
            .await
            .unwrap();
        db.mark_processing(&processing, T0).await.unwrap();

        assert!(service.cancel_post(&pending).await.unwrap());
        assert_eq!(
            service.get_post_status(&pending).await.unwrap().post.status,
            PostStatus::Cancelled
        );

        assert!(service.cancel_post(&processing).await.unwrap());
        let view = service.get_post_status(&processing).await.unwrap();
        assert_eq!(view.post.status, PostStatus::Processing);
        assert!(view.post.cancel_requested);

        assert!(!service.cancel_post(&pending).await.unwrap());
        assert!(!service.cancel_post("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_status_of_unknown_post() {
        let (service, _, _) = service().await;
        assert!(matches!(
            service.get_post_status("nope").await,
            Err(PostlineError::NotFound(_))
        ));
    }
}
