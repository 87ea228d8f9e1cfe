//! Per-account publish rate limiting
//!
//! Counts publishes per account in fixed clock-hour windows stored in the
//! `rate_limits` table, so the budget survives daemon restarts.

use crate::error::{DbError, Result};
use crate::Database;

const WINDOW_SECS: i64 = 3600;

/// Hourly publish budget shared by every account
#[derive(Debug, Clone)]
pub struct RateLimiter {
    posts_per_hour: u32,
}

impl RateLimiter {
    /// `posts_per_hour == 0` disables limiting
    pub fn new(posts_per_hour: u32) -> Self {
        Self { posts_per_hour }
    }

    pub fn posts_per_hour(&self) -> u32 {
        self.posts_per_hour
    }

    /// Returns `Ok(true)` and counts the publish if the account has budget left
    pub async fn check_and_record(&self, db: &Database, account_id: &str, now: i64) -> Result<bool> {
        if !self.check(db, account_id, now).await? {
            return Ok(false);
        }
        self.record(db, account_id, now).await?;
        Ok(true)
    }

    /// Whether another publish fits in the current window, without counting it
    pub async fn check(&self, db: &Database, account_id: &str, now: i64) -> Result<bool> {
        if self.posts_per_hour == 0 {
            return Ok(true);
        }
        let count = window_count(db, account_id, window_start(now)).await?;
        Ok(count < self.posts_per_hour)
    }

    pub async fn record(&self, db: &Database, account_id: &str, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limits (account_id, window_start, post_count)
            VALUES (?, ?, 1)
            ON CONFLICT(account_id, window_start)
            DO UPDATE SET post_count = post_count + 1
            "#,
        )
        .bind(account_id)
        .bind(window_start(now))
        .execute(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Start of the next window, when a full account may publish again
    pub fn next_window(&self, now: i64) -> i64 {
        window_start(now) + WINDOW_SECS
    }

    /// Drop windows that ended before `cutoff`
    pub async fn cleanup_old_windows(&self, db: &Database, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE window_start < ?")
            .bind(window_start(cutoff))
            .execute(db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}

fn window_start(timestamp: i64) -> i64 {
    timestamp.div_euclid(WINDOW_SECS) * WINDOW_SECS
}

async fn window_count(db: &Database, account_id: &str, window_start: i64) -> Result<u32> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT post_count FROM rate_limits WHERE account_id = ? AND window_start = ?",
    )
    .bind(account_id)
    .bind(window_start)
    .fetch_optional(db.pool())
    .await
    .map_err(DbError::SqlxError)?;

    Ok(count.unwrap_or(0).clamp(0, u32::MAX as i64) as u32)
}
