//! Account Session Manager
//!
//! Owns every [`Session`]. All work for one account goes through
//! [`AccountSessionManager::with_session`], which holds that account's lock
//! for the whole operation: login if needed, the caller's function, and the
//! write-back. Different accounts never contend; there is no global lock.
//!
//! Session state machine:
//!
//! ```text
//! unauthenticated ──login ok──▶ active ──token expired / SessionExpired──▶ expired
//!        ▲                        │                                          │
//!        │                        └──────────────◀── login ok ◀──────────────┘
//!        │ reset_login
//! credentials_rejected ◀── login rejected (bad credentials, locked, challenge)
//! banned               ◀── platform reports suspension
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use crate::db::Database;
use crate::error::{PlatformError, PostlineError, Result};
use crate::platforms::{Authenticator, CredentialProvider, PlatformResult};
use crate::scheduling::Clock;
use crate::sessions::fingerprint::DeviceFingerprint;
use crate::sessions::store::SessionStore;
use crate::types::{Account, AuthState, Session, SessionStatus};

/// What `with_session` hands to the caller: a logged-in session
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub account_id: String,
    pub auth_state: AuthState,
    pub fingerprint: DeviceFingerprint,
}

/// Registry of per-key async locks.
///
/// Entries exist only while someone holds or waits for the lock.
#[derive(Default)]
struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct KeyedGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let mutex = self.map().entry(key.to_string()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.map().len()
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut map = self.locks.map();
        if let Some(mutex) = map.get(&self.key) {
            // Only the registry itself still references it
            if Arc::strong_count(mutex) == 1 {
                map.remove(&self.key);
            }
        }
    }
}

pub struct AccountSessionManager {
    db: Database,
    store: Arc<dyn SessionStore>,
    authenticator: Arc<dyn Authenticator>,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    fingerprint_salt: String,
    locks: KeyedLocks,
}

impl AccountSessionManager {
    pub fn new(
        db: Database,
        store: Arc<dyn SessionStore>,
        authenticator: Arc<dyn Authenticator>,
        credentials: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
        fingerprint_salt: impl Into<String>,
    ) -> Self {
        Self {
            db,
            store,
            authenticator,
            credentials,
            clock,
            fingerprint_salt: fingerprint_salt.into(),
            locks: KeyedLocks::default(),
        }
    }

    /// Run `f` with a logged-in session for `account_id`.
    ///
    /// At most one `f` runs per account at any time within this process.
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown or deleted accounts
    /// - `AuthenticationFailed` when the credentials are (or were previously)
    ///   rejected; the account is degraded and nothing is retried
    /// - `Platform(_)` for login trouble and whatever `f` returns
    pub async fn with_session<T, F, Fut>(&self, account_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(ActiveSession) -> Fut + Send,
        Fut: Future<Output = PlatformResult<T>> + Send,
        T: Send,
    {
        let _guard = self.locks.lock(account_id).await;

        let account = self.live_account(account_id).await?;
        let mut session = self.load_session(account_id).await?;
        let mut fingerprint = account.device_fingerprint.clone();

        match session.status {
            SessionStatus::CredentialsRejected => {
                return Err(PostlineError::AuthenticationFailed {
                    account_id: account_id.to_string(),
                    reason: account
                        .degraded_reason
                        .clone()
                        .unwrap_or_else(|| "credentials were rejected".to_string()),
                });
            }
            SessionStatus::Banned => {
                return Err(PlatformError::AccountSuspended(format!(
                    "account '{}' is suspended by the platform",
                    account_id
                ))
                .into());
            }
            SessionStatus::Active => {}
            SessionStatus::Unauthenticated
            | SessionStatus::Authenticating
            | SessionStatus::Expired => {
                let fp = self.ensure_fingerprint(&account).await?;
                self.login(&account, &fp, &mut session).await?;
                fingerprint = Some(fp);
            }
        }

        let fingerprint = match fingerprint {
            Some(fp) => fp,
            None => self.ensure_fingerprint(&account).await?,
        };
        let auth_state = session.auth_state.clone().ok_or_else(|| {
            PostlineError::Dispatch(format!(
                "session for '{}' is active without auth state",
                account_id
            ))
        })?;

        let result = f(ActiveSession {
            account_id: account_id.to_string(),
            auth_state,
            fingerprint,
        })
        .await;

        let now = self.clock.now();
        session.last_used_at = Some(now);
        session.updated_at = now;
        match &result {
            Err(PlatformError::SessionExpired(reason)) => {
                tracing::info!(account_id, reason = %reason, "Session expired, will log in again");
                session.status = SessionStatus::Expired;
                session.auth_state = None;
            }
            Err(PlatformError::AccountSuspended(reason)) => {
                tracing::warn!(account_id, reason = %reason, "Platform reports account suspended");
                session.status = SessionStatus::Banned;
                session.auth_state = None;
            }
            _ => {}
        }

        // A failed write here never masks the result of `f`
        if let Err(e) = self.store.put(&session).await {
            tracing::warn!(account_id, error = %e, "Failed to persist session after use");
        }

        result.map_err(PostlineError::Platform)
    }

    /// Operator fixed the credentials: forget the rejection and log in again
    /// on next use.
    pub async fn reset_login(&self, account_id: &str) -> Result<()> {
        let _guard = self.locks.lock(account_id).await;
        self.live_account(account_id).await?;

        let now = self.clock.now();
        let mut session = self
            .store
            .get(account_id)
            .await?
            .unwrap_or_else(|| Session::unauthenticated(account_id, now));
        session.status = SessionStatus::Unauthenticated;
        session.auth_state = None;
        session.updated_at = now;
        self.store.put(&session).await?;
        self.db.clear_account_degraded(account_id).await?;

        tracing::info!(account_id, "Login reset");
        Ok(())
    }

    /// Drop the stored session; waits for any in-flight operation first
    pub async fn terminate(&self, account_id: &str) -> Result<()> {
        let _guard = self.locks.lock(account_id).await;
        self.store.delete(account_id).await?;
        tracing::debug!(account_id, "Session terminated");
        Ok(())
    }

    pub async fn session_status(&self, account_id: &str) -> Result<Option<SessionStatus>> {
        Ok(self.store.get(account_id).await?.map(|s| s.status))
    }

    async fn live_account(&self, account_id: &str) -> Result<Account> {
        match self.db.get_account(account_id).await? {
            Some(account) if !account.is_deleted() => Ok(account),
            _ => Err(PostlineError::NotFound(format!("account '{}'", account_id))),
        }
    }

    /// Stored session with stale states normalized
    async fn load_session(&self, account_id: &str) -> Result<Session> {
        let now = self.clock.now();
        let mut session = self
            .store
            .get(account_id)
            .await?
            .unwrap_or_else(|| Session::unauthenticated(account_id, now));

        match session.status {
            // A crash mid-login leaves this behind
            SessionStatus::Authenticating => {
                session.status = SessionStatus::Unauthenticated;
            }
            SessionStatus::Active => {
                let usable = session
                    .auth_state
                    .as_ref()
                    .is_some_and(|state| !state.is_expired(now));
                if !usable {
                    tracing::debug!(account_id, "Auth state expired");
                    session.status = SessionStatus::Expired;
                    session.auth_state = None;
                }
            }
            _ => {}
        }

        Ok(session)
    }

    async fn ensure_fingerprint(&self, account: &Account) -> Result<DeviceFingerprint> {
        if let Some(fp) = &account.device_fingerprint {
            return Ok(fp.clone());
        }
        let fp = DeviceFingerprint::derive(&self.fingerprint_salt, &account.id);
        self.db.set_device_fingerprint(&account.id, &fp).await?;
        tracing::debug!(account_id = %account.id, device_id = %fp.device_id, "Device fingerprint created");
        Ok(fp)
    }

    async fn login(
        &self,
        account: &Account,
        fingerprint: &DeviceFingerprint,
        session: &mut Session,
    ) -> Result<()> {
        let account_id = account.id.as_str();

        session.status = SessionStatus::Authenticating;
        session.auth_state = None;
        session.updated_at = self.clock.now();
        self.store.put(session).await?;

        tracing::debug!(account_id, "Logging in");
        let outcome = match self.credentials.credentials(account).await {
            Ok(credentials) => self.authenticator.login(&credentials, fingerprint).await,
            Err(e) => Err(e),
        };

        session.updated_at = self.clock.now();
        match outcome {
            Ok(state) => {
                session.status = SessionStatus::Active;
                session.auth_state = Some(state);
                self.store.put(session).await?;
                if account.is_degraded() {
                    self.db.clear_account_degraded(account_id).await?;
                }
                tracing::info!(account_id, "Logged in");
                Ok(())
            }
            Err(PlatformError::Authentication(reason)) => {
                session.status = SessionStatus::CredentialsRejected;
                self.store.put(session).await?;
                self.db.set_account_degraded(account_id, &reason).await?;
                tracing::warn!(account_id, reason = %reason, "Login rejected, account degraded");
                Err(PostlineError::AuthenticationFailed {
                    account_id: account_id.to_string(),
                    reason,
                })
            }
            Err(PlatformError::AccountSuspended(reason)) => {
                session.status = SessionStatus::Banned;
                self.store.put(session).await?;
                tracing::warn!(account_id, reason = %reason, "Account suspended");
                Err(PlatformError::AccountSuspended(reason).into())
            }
            Err(e) => {
                session.status = SessionStatus::Unauthenticated;
                self.store.put(session).await?;
                tracing::warn!(account_id, error = %e, "Login failed");
                Err(e.into())
            }
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.len()
    }
}
