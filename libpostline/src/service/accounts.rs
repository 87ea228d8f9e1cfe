//! Account management
//!
//! Registering, listing and removing accounts, plus the operator controls
//! around a rejected login.

use serde::Serialize;
use std::sync::Arc;

use crate::db::{Database, PostFilter};
use crate::error::{PostlineError, Result};
use crate::scheduling::Clock;
use crate::sessions::AccountSessionManager;
use crate::types::{Account, PostStatus, SessionStatus};

use super::events::{Event, EventBus};

const MAX_ACCOUNT_ID_LEN: usize = 64;
const RESERVED_ACCOUNT_IDS: [&str; 3] = ["all", "none", "list"];

/// Summary of one account for operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountHealth {
    pub account_id: String,
    pub username: String,
    /// `None` until the first publish attempt creates a session
    pub session_status: Option<SessionStatus>,
    pub degraded_reason: Option<String>,
    pub pending_posts: usize,
    pub deleted: bool,
}

impl AccountHealth {
    pub fn is_healthy(&self) -> bool {
        !self.deleted
            && self.degraded_reason.is_none()
            && !matches!(
                self.session_status,
                Some(SessionStatus::Banned | SessionStatus::CredentialsRejected)
            )
    }
}

/// Check an account id: alphanumeric plus `-` and `_`, at most 64
/// characters, not a reserved word
pub fn validate_account_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(PostlineError::InvalidInput(
            "account id cannot be empty".to_string(),
        ));
    }

    if id.chars().count() > MAX_ACCOUNT_ID_LEN {
        return Err(PostlineError::InvalidInput(format!(
            "account id too long: {} characters (max {})",
            id.chars().count(),
            MAX_ACCOUNT_ID_LEN
        )));
    }

    if !id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return Err(PostlineError::InvalidInput(format!(
            "invalid account id '{}': use letters, digits, '-' and '_' only",
            id
        )));
    }

    if RESERVED_ACCOUNT_IDS.contains(&id.to_lowercase().as_str()) {
        return Err(PostlineError::InvalidInput(format!(
            "'{}' is a reserved name",
            id
        )));
    }

    Ok(())
}

#[derive(Clone)]
pub struct AccountService {
    db: Database,
    sessions: Arc<AccountSessionManager>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl AccountService {
    pub fn new(
        db: Database,
        sessions: Arc<AccountSessionManager>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            sessions,
            events,
            clock,
        }
    }

    /// Register an account. Ids are never reused, not even after removal.
    pub async fn add_account(
        &self,
        id: &str,
        username: &str,
        business_profile_id: Option<&str>,
    ) -> Result<Account> {
        validate_account_id(id)?;
        if username.trim().is_empty() {
            return Err(PostlineError::InvalidInput(
                "username cannot be empty".to_string(),
            ));
        }
        if self.db.get_account(id).await?.is_some() {
            return Err(PostlineError::InvalidInput(format!(
                "account '{}' already exists",
                id
            )));
        }

        let mut account = Account::new(
            id.to_string(),
            username.trim().to_string(),
            business_profile_id.map(str::to_string),
        );
        account.created_at = self.clock.now();
        self.db.create_account(&account).await?;

        tracing::info!(account_id = id, username = %account.username, "Account added");
        Ok(account)
    }

    pub async fn list_accounts(
        &self,
        business_profile_id: Option<&str>,
        include_deleted: bool,
    ) -> Result<Vec<Account>> {
        self.db.list_accounts(business_profile_id, include_deleted).await
    }

    /// Soft-delete an account.
    ///
    /// Pending posts are cancelled, processing posts get a cancel request and
    /// the stored session is dropped once any in-flight publish returns.
    /// Returns the number of posts affected.
    pub async fn remove_account(&self, id: &str) -> Result<u64> {
        let now = self.clock.now();
        if !self.db.soft_delete_account(id, now).await? {
            return Err(PostlineError::NotFound(format!("account '{}'", id)));
        }

        let pending = self
            .db
            .list_posts(&PostFilter {
                account_id: Some(id.to_string()),
                status: Some(PostStatus::Pending),
                ..Default::default()
            })
            .await?;
        let affected = self.db.cancel_posts_for_account(id, now).await?;
        for post in pending {
            self.events.emit(Event::PostCancelled { post_id: post.id });
        }

        self.sessions.terminate(id).await?;

        tracing::info!(account_id = id, posts_cancelled = affected, "Account removed");
        Ok(affected)
    }

    /// Clear a credentials rejection so the next publish logs in again
    pub async fn reset_login(&self, id: &str) -> Result<()> {
        self.sessions.reset_login(id).await
    }

    pub async fn account_health(&self, id: &str) -> Result<AccountHealth> {
        let account = self
            .db
            .get_account(id)
            .await?
            .ok_or_else(|| PostlineError::NotFound(format!("account '{}'", id)))?;

        let pending_posts = self
            .db
            .list_posts(&PostFilter {
                account_id: Some(id.to_string()),
                status: Some(PostStatus::Pending),
                ..Default::default()
            })
            .await?
            .len();

        Ok(AccountHealth {
            session_status: self.sessions.session_status(id).await?,
            deleted: account.is_deleted(),
            account_id: account.id,
            username: account.username,
            degraded_reason: account.degraded_reason,
            pending_posts,
        })
    }
}
