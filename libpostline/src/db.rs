//! Database operations for Postline
//!
//! The `posts` table is the durable status machine. Every transition out of
//! `processing` is a conditional UPDATE on `status = 'processing'`, so a
//! worker that lost its claim (recovery sweep, restart) cannot overwrite
//! a newer outcome. A cancel that arrives while a post is processing sets
//! `cancel_requested`, and whichever transition ends the attempt lands the
//! post in `cancelled` instead.

use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DbError, PostlineError, Result};
use crate::sessions::fingerprint::DeviceFingerprint;
use crate::types::{Account, Post, PostStatus, PostType};

const POST_COLUMNS: &str = "id, account_id, post_type, media, caption, scheduled_for, status, \
     attempt_count, last_error, published_media_id, created_at, updated_at, claimed_at, \
     cancel_requested, recovered";

const ACCOUNT_COLUMNS: &str =
    "id, username, business_profile_id, device_fingerprint, degraded_reason, created_at, deleted_at";

/// Filter for [`Database::list_posts`]
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub account_id: Option<String>,
    pub status: Option<PostStatus>,
    pub business_profile_id: Option<String>,
    pub limit: Option<u32>,
}

/// Post counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub published: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Earliest publish time among pending posts; unscheduled posts count as
    /// due at their creation time
    pub next_due_at: Option<i64>,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.published + self.failed + self.cancelled
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    /// Private in-memory database, for tests and embedding.
    ///
    /// Pinned to a single connection that never expires; every
    /// connection to `:memory:` would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(DbError::SqlxError)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ----- posts -----

    pub async fn create_post(&self, post: &Post) -> Result<()> {
        let media = serde_json::to_string(&post.media).map_err(|e| DbError::CorruptRow {
            table: "posts",
            reason: format!("media not serializable: {}", e),
        })?;

        sqlx::query(
            r#"
            INSERT INTO posts (id, account_id, post_type, media, caption, scheduled_for, status,
                               attempt_count, last_error, published_media_id, created_at,
                               updated_at, claimed_at, cancel_requested, recovered)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.account_id)
        .bind(post.post_type.as_str())
        .bind(media)
        .bind(&post.caption)
        .bind(post.scheduled_for)
        .bind(post.status.as_str())
        .bind(post.attempt_count as i64)
        .bind(&post.last_error)
        .bind(&post.published_media_id)
        .bind(post.created_at)
        .bind(post.updated_at)
        .bind(post.claimed_at)
        .bind(post.cancel_requested)
        .bind(post.recovered)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let query = format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS);
        let row = sqlx::query(&query)
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(post_from_row).transpose()
    }

    /// Newest first
    pub async fn list_posts(&self, filter: &PostFilter) -> Result<Vec<Post>> {
        let mut query = format!("SELECT {} FROM posts WHERE 1 = 1", POST_COLUMNS);

        if filter.account_id.is_some() {
            query.push_str(" AND account_id = ?");
        }
        if filter.status.is_some() {
            query.push_str(" AND status = ?");
        }
        if filter.business_profile_id.is_some() {
            query.push_str(
                " AND account_id IN (SELECT id FROM accounts WHERE business_profile_id = ?)",
            );
        }
        query.push_str(" ORDER BY created_at DESC, id");
        if filter.limit.is_some() {
            query.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&query);
        if let Some(account_id) = &filter.account_id {
            q = q.bind(account_id);
        }
        if let Some(status) = filter.status {
            q = q.bind(status.as_str());
        }
        if let Some(profile) = &filter.business_profile_id {
            q = q.bind(profile);
        }
        if let Some(limit) = filter.limit {
            q = q.bind(limit as i64);
        }

        let rows = q.fetch_all(&self.pool).await.map_err(DbError::SqlxError)?;
        rows.iter().map(post_from_row).collect()
    }

    /// Pending posts whose time has come, unscheduled ones first, then by
    /// scheduled time and creation time
    pub async fn list_due(&self, now: i64) -> Result<Vec<Post>> {
        let query = format!(
            r#"
            SELECT {} FROM posts
            WHERE status = 'pending'
              AND cancel_requested = 0
              AND (scheduled_for IS NULL OR scheduled_for <= ?)
            ORDER BY scheduled_for IS NOT NULL, scheduled_for ASC, created_at ASC, id ASC
            "#,
            POST_COLUMNS
        );

        let rows = sqlx::query(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(post_from_row).collect()
    }

    /// Claim a pending post. Exactly one of any number of concurrent callers
    /// gets `true`.
    pub async fn mark_processing(&self, post_id: &str, now: i64) -> Result<bool> {
        Ok(self.claim_post(post_id, now).await?.is_some())
    }

    /// Claim a pending post that is due at `now` and return the claimed row.
    ///
    /// The row is re-read by the UPDATE itself, so a caller holding an older
    /// copy (from `list_due`) sees the current attempt count and recovery
    /// flag, and a post rescheduled into the future since is not claimed.
    pub async fn claim_post(&self, post_id: &str, now: i64) -> Result<Option<Post>> {
        let query = format!(
            r#"
            UPDATE posts
            SET status = 'processing', claimed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'pending' AND cancel_requested = 0
              AND (scheduled_for IS NULL OR scheduled_for <= ?)
            RETURNING {}
            "#,
            POST_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(now)
            .bind(now)
            .bind(post_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(post_from_row).transpose()
    }

    pub async fn mark_published(
        &self,
        post_id: &str,
        media_id: &str,
        now: i64,
    ) -> Result<Option<PostStatus>> {
        let status = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE posts
            SET status = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'published' END,
                published_media_id = CASE WHEN cancel_requested = 1 THEN NULL ELSE ? END,
                last_error = NULL,
                claimed_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(media_id)
        .bind(now)
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        parse_returned_status(status)
    }

    pub async fn mark_failed(
        &self,
        post_id: &str,
        error: &str,
        attempt_count: u32,
        now: i64,
    ) -> Result<Option<PostStatus>> {
        let status = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE posts
            SET status = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'failed' END,
                last_error = CASE WHEN cancel_requested = 1 THEN NULL ELSE ? END,
                attempt_count = MAX(attempt_count, ?),
                claimed_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(error)
        .bind(attempt_count as i64)
        .bind(now)
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        parse_returned_status(status)
    }

    /// Put a post back to pending for another attempt at `scheduled_for`
    pub async fn schedule_retry(
        &self,
        post_id: &str,
        attempt_count: u32,
        scheduled_for: i64,
        now: i64,
    ) -> Result<Option<PostStatus>> {
        let status = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE posts
            SET status = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'pending' END,
                attempt_count = MAX(attempt_count, ?),
                scheduled_for = ?,
                claimed_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(attempt_count as i64)
        .bind(scheduled_for)
        .bind(now)
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        parse_returned_status(status)
    }

    /// Release a claim without counting an attempt
    pub async fn requeue(&self, post_id: &str, now: i64) -> Result<Option<PostStatus>> {
        let status = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE posts
            SET status = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'pending' END,
                claimed_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(now)
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        parse_returned_status(status)
    }

    /// Release an abandoned claim and flag the post for the duplicate guard.
    ///
    /// Only applies while the claim is still older than `cutoff`, so a post
    /// re-claimed in the meantime is left alone.
    pub async fn requeue_stale(
        &self,
        post_id: &str,
        cutoff: i64,
        now: i64,
    ) -> Result<Option<PostStatus>> {
        let status = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE posts
            SET status = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'pending' END,
                recovered = 1,
                claimed_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'processing'
              AND (claimed_at IS NULL OR claimed_at < ?)
            RETURNING status
            "#,
        )
        .bind(now)
        .bind(post_id)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        parse_returned_status(status)
    }

    /// Processing posts claimed before `cutoff`
    pub async fn find_stale_processing(&self, cutoff: i64) -> Result<Vec<Post>> {
        let query = format!(
            r#"
            SELECT {} FROM posts
            WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at < ?)
            ORDER BY claimed_at ASC
            "#,
            POST_COLUMNS
        );

        let rows = sqlx::query(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(post_from_row).collect()
    }

    /// Cancel a post.
    ///
    /// Returns `Some(Cancelled)` for a pending post, `Some(Processing)` when
    /// the cancel was recorded against an in-flight attempt, and `None` for
    /// unknown or already finished posts.
    pub async fn cancel_post(&self, post_id: &str, now: i64) -> Result<Option<PostStatus>> {
        let status = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE posts
            SET status = CASE WHEN status = 'pending' THEN 'cancelled' ELSE status END,
                cancel_requested = CASE WHEN status = 'processing' THEN 1 ELSE cancel_requested END,
                updated_at = ?
            WHERE id = ? AND status IN ('pending', 'processing')
            RETURNING status
            "#,
        )
        .bind(now)
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        parse_returned_status(status)
    }

    /// Cancel every unfinished post of an account; returns how many were hit
    pub async fn cancel_posts_for_account(&self, account_id: &str, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = CASE WHEN status = 'pending' THEN 'cancelled' ELSE status END,
                cancel_requested = CASE WHEN status = 'processing' THEN 1 ELSE cancel_requested END,
                updated_at = ?
            WHERE account_id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(now)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM posts GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match PostStatus::from_str(&status) {
                Ok(PostStatus::Pending) => stats.pending = count,
                Ok(PostStatus::Processing) => stats.processing = count,
                Ok(PostStatus::Published) => stats.published = count,
                Ok(PostStatus::Failed) => stats.failed = count,
                Ok(PostStatus::Cancelled) => stats.cancelled = count,
                Err(_) => {
                    return Err(DbError::CorruptRow {
                        table: "posts",
                        reason: format!("unknown status '{}'", status),
                    }
                    .into())
                }
            }
        }

        stats.next_due_at = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MIN(COALESCE(scheduled_for, created_at)) FROM posts WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(stats)
    }

    // ----- accounts -----

    pub async fn create_account(&self, account: &Account) -> Result<()> {
        let fingerprint = account
            .device_fingerprint
            .as_ref()
            .map(fingerprint_to_json)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO accounts (id, username, business_profile_id, device_fingerprint,
                                  degraded_reason, created_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.username)
        .bind(&account.business_profile_id)
        .bind(fingerprint)
        .bind(&account.degraded_reason)
        .bind(account.created_at)
        .bind(account.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Includes soft-deleted accounts; callers check [`Account::is_deleted`]
    pub async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let query = format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn list_accounts(
        &self,
        business_profile_id: Option<&str>,
        include_deleted: bool,
    ) -> Result<Vec<Account>> {
        let mut query = format!("SELECT {} FROM accounts WHERE 1 = 1", ACCOUNT_COLUMNS);
        if !include_deleted {
            query.push_str(" AND deleted_at IS NULL");
        }
        if business_profile_id.is_some() {
            query.push_str(" AND business_profile_id = ?");
        }
        query.push_str(" ORDER BY id");

        let mut q = sqlx::query(&query);
        if let Some(profile) = business_profile_id {
            q = q.bind(profile);
        }

        let rows = q.fetch_all(&self.pool).await.map_err(DbError::SqlxError)?;
        rows.iter().map(account_from_row).collect()
    }

    pub async fn set_device_fingerprint(
        &self,
        account_id: &str,
        fingerprint: &DeviceFingerprint,
    ) -> Result<()> {
        sqlx::query("UPDATE accounts SET device_fingerprint = ? WHERE id = ?")
            .bind(fingerprint_to_json(fingerprint)?)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn set_account_degraded(&self, account_id: &str, reason: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET degraded_reason = ? WHERE id = ?")
            .bind(reason)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn clear_account_degraded(&self, account_id: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET degraded_reason = NULL WHERE id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Ids of live accounts whose credentials were rejected
    pub async fn degraded_account_ids(&self) -> Result<HashSet<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM accounts WHERE degraded_reason IS NOT NULL AND deleted_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(ids.into_iter().collect())
    }

    /// Returns false if the account is unknown or already deleted
    pub async fn soft_delete_account(&self, account_id: &str, now: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE accounts SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
                .bind(now)
                .bind(account_id)
                .execute(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }
}

fn parse_returned_status(status: Option<String>) -> Result<Option<PostStatus>> {
    status
        .map(|s| {
            PostStatus::from_str(&s).map_err(|_| {
                PostlineError::from(DbError::CorruptRow {
                    table: "posts",
                    reason: format!("unknown status '{}'", s),
                })
            })
        })
        .transpose()
}

fn fingerprint_to_json(fingerprint: &DeviceFingerprint) -> Result<String> {
    serde_json::to_string(fingerprint).map_err(|e| {
        PostlineError::from(DbError::CorruptRow {
            table: "accounts",
            reason: format!("fingerprint not serializable: {}", e),
        })
    })
}

fn post_from_row(row: &SqliteRow) -> Result<Post> {
    let corrupt = |reason: String| DbError::CorruptRow {
        table: "posts",
        reason,
    };

    let post_type: String = row.try_get("post_type").map_err(DbError::SqlxError)?;
    let status: String = row.try_get("status").map_err(DbError::SqlxError)?;
    let media: String = row.try_get("media").map_err(DbError::SqlxError)?;
    let attempt_count: i64 = row.try_get("attempt_count").map_err(DbError::SqlxError)?;

    Ok(Post {
        id: row.try_get("id").map_err(DbError::SqlxError)?,
        account_id: row.try_get("account_id").map_err(DbError::SqlxError)?,
        post_type: PostType::from_str(&post_type)
            .map_err(|_| corrupt(format!("unknown post type '{}'", post_type)))?,
        media: serde_json::from_str(&media)
            .map_err(|e| corrupt(format!("media is not a JSON list: {}", e)))?,
        caption: row.try_get("caption").map_err(DbError::SqlxError)?,
        scheduled_for: row.try_get("scheduled_for").map_err(DbError::SqlxError)?,
        status: PostStatus::from_str(&status)
            .map_err(|_| corrupt(format!("unknown status '{}'", status)))?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| corrupt(format!("attempt_count out of range: {}", attempt_count)))?,
        last_error: row.try_get("last_error").map_err(DbError::SqlxError)?,
        published_media_id: row.try_get("published_media_id").map_err(DbError::SqlxError)?,
        created_at: row.try_get("created_at").map_err(DbError::SqlxError)?,
        updated_at: row.try_get("updated_at").map_err(DbError::SqlxError)?,
        claimed_at: row.try_get("claimed_at").map_err(DbError::SqlxError)?,
        cancel_requested: row.try_get("cancel_requested").map_err(DbError::SqlxError)?,
        recovered: row.try_get("recovered").map_err(DbError::SqlxError)?,
    })
}

fn account_from_row(row: &SqliteRow) -> Result<Account> {
    let fingerprint: Option<String> =
        row.try_get("device_fingerprint").map_err(DbError::SqlxError)?;
    let device_fingerprint = fingerprint
        .map(|json| {
            serde_json::from_str::<DeviceFingerprint>(&json).map_err(|e| DbError::CorruptRow {
                table: "accounts",
                reason: format!("bad device fingerprint: {}", e),
            })
        })
        .transpose()?;

    Ok(Account {
        id: row.try_get("id").map_err(DbError::SqlxError)?,
        username: row.try_get("username").map_err(DbError::SqlxError)?,
        business_profile_id: row.try_get("business_profile_id").map_err(DbError::SqlxError)?,
        device_fingerprint,
        degraded_reason: row.try_get("degraded_reason").map_err(DbError::SqlxError)?,
        created_at: row.try_get("created_at").map_err(DbError::SqlxError)?,
        deleted_at: row.try_get("deleted_at").map_err(DbError::SqlxError)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> Database {
        let db = Database::in_memory().await.unwrap();
        db.create_account(&Account::new("shop".to_string(), "shop_ig".to_string(), None))
            .await
            .unwrap();
        db
    }

    fn pending_post(scheduled_for: Option<i64>, created_at: i64) -> Post {
        let mut post = Post::new(
            "shop".to_string(),
            PostType::Static,
            vec!["img/1.jpg".to_string()],
            Some("caption".to_string()),
            scheduled_for,
        );
        post.created_at = created_at;
        post.updated_at = created_at;
        post
    }

    async fn claimed_post(db: &Database, now: i64) -> Post {
        let post = pending_post(None, now - 10);
        db.create_post(&post).await.unwrap();
        assert!(db.mark_processing(&post.id, now).await.unwrap());
        post
    }

    #[tokio::test]
    async fn test_database_initialization_with_invalid_path() {
        let result = Database::new("/dev/null/impossible/postline.db").await;
        assert!(result.is_err(), "Should fail to create database under /dev/null");
    }

    #[tokio::test]
    async fn test_file_database_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("postline.db");

        let db = Database::new(&path.to_string_lossy()).await.unwrap();
        db.create_account(&Account::new("a".to_string(), "a".to_string(), None))
            .await
            .unwrap();

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_create_and_get_post() {
        let db = setup().await;
        let mut post = pending_post(Some(5_000), 1_000);
        post.post_type = PostType::Carousel;
        post.media = vec!["a.jpg".to_string(), "b.jpg".to_string(), "c.jpg".to_string()];
        db.create_post(&post).await.unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded, post);
    }

    #[tokio::test]
    async fn test_get_missing_post_is_none() {
        let db = setup().await;
        assert!(db.get_post("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_post_requires_existing_account() {
        let db = setup().await;
        let mut post = pending_post(None, 1);
        post.account_id = "ghost".to_string();

        let result = db.create_post(&post).await;
        assert!(result.is_err(), "Foreign key should reject unknown account");
    }

    #[tokio::test]
    async fn test_list_due_respects_schedule_and_order() {
        let db = setup().await;
        let now = 10_000;

        let future = pending_post(Some(now + 600), 1);
        let later = pending_post(Some(now - 10), 2);
        let earlier = pending_post(Some(now - 100), 3);
        let asap_old = pending_post(None, 4);
        let asap_new = pending_post(None, 5);
        for p in [&future, &later, &earlier, &asap_new, &asap_old] {
            db.create_post(p).await.unwrap();
        }

        let due: Vec<String> = db
            .list_due(now)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(
            due,
            vec![
                asap_old.id.clone(),
                asap_new.id.clone(),
                earlier.id.clone(),
                later.id.clone()
            ]
        );

        let due_later = db.list_due(now + 600).await.unwrap();
        assert!(due_later.iter().any(|p| p.id == future.id));
    }

    #[tokio::test]
    async fn test_mark_processing_only_once() {
        let db = setup().await;
        let post = pending_post(None, 1);
        db.create_post(&post).await.unwrap();

        assert!(db.mark_processing(&post.id, 100).await.unwrap());
        assert!(!db.mark_processing(&post.id, 101).await.unwrap());

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Processing);
        assert_eq!(loaded.claimed_at, Some(100));
        assert!(db.list_due(1_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_requires_post_to_be_due() {
        let db = setup().await;
        let post = pending_post(Some(500), 1);
        db.create_post(&post).await.unwrap();

        assert!(db.claim_post(&post.id, 499).await.unwrap().is_none());
        let claimed = db.claim_post(&post.id, 500).await.unwrap().unwrap();
        assert_eq!(claimed.status, PostStatus::Processing);
        assert_eq!(claimed.claimed_at, Some(500));
    }

    #[tokio::test]
    async fn test_claim_returns_current_row() {
        let db = setup().await;
        let post = claimed_post(&db, 100).await;
        db.schedule_retry(&post.id, 1, 150, 101).await.unwrap();

        let claimed = db.claim_post(&post.id, 150).await.unwrap().unwrap();
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.scheduled_for, Some(150));
        assert!(claimed.may_have_published());
    }

    #[tokio::test]
    async fn test_stale_sweep_requeues_claim_without_timestamp() {
        let db = setup().await;
        let post = claimed_post(&db, 100).await;
        sqlx::query("UPDATE posts SET claimed_at = NULL WHERE id = ?")
            .bind(&post.id)
            .execute(db.pool())
            .await
            .unwrap();

        let stale = db.find_stale_processing(50).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(
            db.requeue_stale(&post.id, 50, 200).await.unwrap(),
            Some(PostStatus::Pending)
        );
        assert!(db.find_stale_processing(50).await.unwrap().is_empty());
        assert!(db.get_post(&post.id).await.unwrap().unwrap().recovered);
    }

    #[tokio::test]
    async fn test_mark_published_records_media_id() {
        let db = setup().await;
        let post = claimed_post(&db, 100).await;

        let status = db.mark_published(&post.id, "media-1", 110).await.unwrap();
        assert_eq!(status, Some(PostStatus::Published));

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.published_media_id.as_deref(), Some("media-1"));
        assert!(loaded.claimed_at.is_none());
        assert!(loaded.last_error.is_none());
    }

    #[tokio::test]
    async fn test_transitions_require_processing() {
        let db = setup().await;
        let post = pending_post(None, 1);
        db.create_post(&post).await.unwrap();

        assert_eq!(db.mark_published(&post.id, "m", 5).await.unwrap(), None);
        assert_eq!(db.mark_failed(&post.id, "x", 1, 5).await.unwrap(), None);
        assert_eq!(db.schedule_retry(&post.id, 1, 50, 5).await.unwrap(), None);
        assert_eq!(db.requeue(&post.id, 5).await.unwrap(), None);

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Pending);
    }

    #[tokio::test]
    async fn test_attempt_count_never_decreases() {
        let db = setup().await;
        let post = claimed_post(&db, 100).await;

        db.schedule_retry(&post.id, 2, 200, 101).await.unwrap();
        assert!(db.mark_processing(&post.id, 200).await.unwrap());
        db.mark_failed(&post.id, "boom", 1, 201).await.unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempt_count, 2);
        assert_eq!(loaded.status, PostStatus::Failed);
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_schedule_retry_sets_next_time() {
        let db = setup().await;
        let post = claimed_post(&db, 100).await;

        let status = db.schedule_retry(&post.id, 1, 160, 100).await.unwrap();
        assert_eq!(status, Some(PostStatus::Pending));

        assert!(db.list_due(159).await.unwrap().is_empty());
        assert_eq!(db.list_due(160).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_post() {
        let db = setup().await;
        let post = pending_post(None, 1);
        db.create_post(&post).await.unwrap();

        assert_eq!(
            db.cancel_post(&post.id, 5).await.unwrap(),
            Some(PostStatus::Cancelled)
        );
        assert!(!db.mark_processing(&post.id, 6).await.unwrap());
        assert_eq!(db.cancel_post(&post.id, 7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_processing_discards_result() {
        let db = setup().await;
        let post = claimed_post(&db, 100).await;

        assert_eq!(
            db.cancel_post(&post.id, 101).await.unwrap(),
            Some(PostStatus::Processing)
        );

        let status = db.mark_published(&post.id, "media-9", 102).await.unwrap();
        assert_eq!(status, Some(PostStatus::Cancelled));

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert!(loaded.published_media_id.is_none());
        assert!(loaded.cancel_requested);
    }

    #[tokio::test]
    async fn test_cancel_processing_then_retry_lands_cancelled() {
        let db = setup().await;
        let post = claimed_post(&db, 100).await;
        db.cancel_post(&post.id, 101).await.unwrap();

        let status = db.schedule_retry(&post.id, 1, 500, 102).await.unwrap();
        assert_eq!(status, Some(PostStatus::Cancelled));
        assert!(db.list_due(1_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_and_requeue_stale() {
        let db = setup().await;
        let post = claimed_post(&db, 100).await;

        assert!(db.find_stale_processing(100).await.unwrap().is_empty());
        let stale = db.find_stale_processing(1_000).await.unwrap();
        assert_eq!(stale.len(), 1);

        let status = db.requeue_stale(&post.id, 1_000, 1_001).await.unwrap();
        assert_eq!(status, Some(PostStatus::Pending));

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert!(loaded.recovered);
        assert_eq!(loaded.attempt_count, 0);
        assert!(loaded.claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_requeue_stale_skips_fresh_claim() {
        let db = setup().await;
        let post = claimed_post(&db, 900).await;

        assert_eq!(db.requeue_stale(&post.id, 500, 1_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let db = setup().await;
        let a = pending_post(Some(700), 10);
        let b = pending_post(None, 20);
        db.create_post(&a).await.unwrap();
        db.create_post(&b).await.unwrap();
        let c = claimed_post(&db, 100).await;
        db.mark_published(&c.id, "m", 101).await.unwrap();

        let stats = db.queue_stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.published, 1);
        assert_eq!(stats.total(), 3);
        assert_eq!(stats.next_due_at, Some(20));
    }

    #[tokio::test]
    async fn test_list_posts_filters() {
        let db = setup().await;
        db.create_account(&Account::new(
            "cafe".to_string(),
            "cafe_ig".to_string(),
            Some("biz-1".to_string()),
        ))
        .await
        .unwrap();

        let shop_post = pending_post(None, 1);
        let mut cafe_post = pending_post(None, 2);
        cafe_post.account_id = "cafe".to_string();
        db.create_post(&shop_post).await.unwrap();
        db.create_post(&cafe_post).await.unwrap();

        let all = db.list_posts(&PostFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, cafe_post.id, "Newest first");

        let by_profile = db
            .list_posts(&PostFilter {
                business_profile_id: Some("biz-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_profile.len(), 1);
        assert_eq!(by_profile[0].id, cafe_post.id);

        let limited = db
            .list_posts(&PostFilter {
                account_id: Some("shop".to_string()),
                status: Some(PostStatus::Pending),
                limit: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, shop_post.id);
    }

    #[tokio::test]
    async fn test_cancel_posts_for_account() {
        let db = setup().await;
        let pending = pending_post(None, 1);
        db.create_post(&pending).await.unwrap();
        let processing = claimed_post(&db, 100).await;

        assert_eq!(db.cancel_posts_for_account("shop", 200).await.unwrap(), 2);

        let pending = db.get_post(&pending.id).await.unwrap().unwrap();
        assert_eq!(pending.status, PostStatus::Cancelled);
        let processing = db.get_post(&processing.id).await.unwrap().unwrap();
        assert_eq!(processing.status, PostStatus::Processing);
        assert!(processing.cancel_requested);
    }

    #[tokio::test]
    async fn test_account_lifecycle() {
        let db = setup().await;

        let fp = DeviceFingerprint::derive("salt", "shop");
        db.set_device_fingerprint("shop", &fp).await.unwrap();
        db.set_account_degraded("shop", "bad password").await.unwrap();

        let account = db.get_account("shop").await.unwrap().unwrap();
        assert_eq!(account.device_fingerprint, Some(fp));
        assert!(account.is_degraded());
        assert!(db.degraded_account_ids().await.unwrap().contains("shop"));

        db.clear_account_degraded("shop").await.unwrap();
        assert!(db.degraded_account_ids().await.unwrap().is_empty());

        assert!(db.soft_delete_account("shop", 50).await.unwrap());
        assert!(!db.soft_delete_account("shop", 51).await.unwrap());
        assert!(db.list_accounts(None, false).await.unwrap().is_empty());
        assert_eq!(db.list_accounts(None, true).await.unwrap().len(), 1);

        let account = db.get_account("shop").await.unwrap().unwrap();
        assert_eq!(account.deleted_at, Some(50));
    }

    #[tokio::test]
    async fn test_concurrent_claims_on_file_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("claims.db");
        let db = Database::new(&path.to_string_lossy()).await.unwrap();
        db.create_account(&Account::new("shop".to_string(), "s".to_string(), None))
            .await
            .unwrap();
        let post = pending_post(None, 1);
        db.create_post(&post).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let db = db.clone();
            let id = post.id.clone();
            handles.push(tokio::spawn(async move {
                db.mark_processing(&id, 100 + i).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
