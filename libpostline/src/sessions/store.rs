//! Session persistence
//!
//! Pure storage keyed by account id. No network, no locking: the
//! [`AccountSessionManager`](super::AccountSessionManager) is the only caller
//! and already holds the account's lock.

use async_trait::async_trait;
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use crate::db::Database;
use crate::error::{DbError, PostlineError, Result};
use crate::types::{AuthState, Session, SessionStatus};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, account_id: &str) -> Result<Option<Session>>;
    async fn put(&self, session: &Session) -> Result<()>;
    async fn delete(&self, account_id: &str) -> Result<()>;
}

/// Sessions in the `sessions` table, surviving restarts
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, account_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, status, auth_state, last_used_at, updated_at
            FROM sessions WHERE account_id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let corrupt = |reason: String| {
            PostlineError::from(DbError::CorruptRow {
                table: "sessions",
                reason,
            })
        };

        let status: String = row.try_get("status").map_err(DbError::SqlxError)?;
        let auth_state: Option<String> = row.try_get("auth_state").map_err(DbError::SqlxError)?;

        Ok(Some(Session {
            account_id: row.try_get("account_id").map_err(DbError::SqlxError)?,
            status: SessionStatus::from_str(&status)
                .map_err(|_| corrupt(format!("unknown session status '{}'", status)))?,
            auth_state: auth_state
                .map(|json| serde_json::from_str::<AuthState>(&json))
                .transpose()
                .map_err(|e| corrupt(format!("bad auth state: {}", e)))?,
            last_used_at: row.try_get("last_used_at").map_err(DbError::SqlxError)?,
            updated_at: row.try_get("updated_at").map_err(DbError::SqlxError)?,
        }))
    }

    async fn put(&self, session: &Session) -> Result<()> {
        let auth_state = session
            .auth_state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DbError::CorruptRow {
                table: "sessions",
                reason: format!("auth state not serializable: {}", e),
            })?;

        sqlx::query(
            r#"
            INSERT INTO sessions (account_id, status, auth_state, last_used_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                status = excluded.status,
                auth_state = excluded.auth_state,
                last_used_at = excluded.last_used_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.account_id)
        .bind(session.status.as_str())
        .bind(auth_state)
        .bind(session.last_used_at)
        .bind(session.updated_at)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn delete(&self, account_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE account_id = ?")
            .bind(account_id)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

/// Process-local sessions
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, account_id: &str) -> Result<Option<Session>> {
        Ok(self.map().get(account_id).cloned())
    }

    async fn put(&self, session: &Session) -> Result<()> {
        self.map()
            .insert(session.account_id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, account_id: &str) -> Result<()> {
        self.map().remove(account_id);
        Ok(())
    }
}
