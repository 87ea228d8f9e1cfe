//! Scriptable platform for tests
//!
//! `MockPlatform` plays both the [`Authenticator`] and the
//! [`PublishPlatform`]. Outcomes are taken from per-call scripts first and
//! fall back to the default behavior once a script runs dry. Every call is
//! counted, and concurrent publishes for the same account are detected so
//! tests can assert per-account exclusivity.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::credentials::Credentials;
use crate::error::PlatformError;
use crate::platforms::{Authenticator, MediaStore, PlatformResult, PublishPlatform, PublishRequest};
use crate::sessions::fingerprint::DeviceFingerprint;
use crate::types::{AuthState, Post, PostType};

/// One recorded publish call
#[derive(Debug, Clone, PartialEq)]
pub struct PublishCall {
    pub account_id: String,
    pub post_id: String,
    pub post_type: PostType,
    pub media_refs: Vec<String>,
    pub caption: Option<String>,
    pub token: String,
    pub outcome: Result<String, PlatformError>,
}

pub struct MockPlatform {
    name: String,
    delay: Duration,
    /// Lifetime of issued tokens; `None` never expires
    token_ttl: Option<i64>,
    login_script: Mutex<VecDeque<PlatformResult<()>>>,
    login_default: Mutex<PlatformResult<()>>,
    publish_script: Mutex<VecDeque<PlatformResult<()>>>,
    lookup_fails: AtomicBool,
    remote_publishes: Mutex<HashMap<String, String>>,
    login_calls: AtomicUsize,
    publish_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
    media_counter: AtomicUsize,
    logins: Mutex<Vec<(String, DeviceFingerprint)>>,
    publishes: Mutex<Vec<PublishCall>>,
    in_flight: Mutex<HashSet<String>>,
    overlap_detected: AtomicBool,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// A platform where every login and publish succeeds
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            delay: Duration::ZERO,
            token_ttl: None,
            login_script: Mutex::new(VecDeque::new()),
            login_default: Mutex::new(Ok(())),
            publish_script: Mutex::new(VecDeque::new()),
            lookup_fails: AtomicBool::new(false),
            remote_publishes: Mutex::new(HashMap::new()),
            login_calls: AtomicUsize::new(0),
            publish_calls: AtomicUsize::new(0),
            lookup_calls: AtomicUsize::new(0),
            media_counter: AtomicUsize::new(0),
            logins: Mutex::new(Vec::new()),
            publishes: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            overlap_detected: AtomicBool::new(false),
        }
    }

    /// Simulated network latency for every publish
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_token_ttl(mut self, secs: i64) -> Self {
        self.token_ttl = Some(secs);
        self
    }

    /// Every login fails with `error` until changed
    pub fn rejecting_logins(self, error: PlatformError) -> Self {
        self.set_login_default(Err(error));
        self
    }

    pub fn set_login_default(&self, outcome: PlatformResult<()>) {
        *lock(&self.login_default) = outcome;
    }

    /// Queue outcomes for the next login calls
    pub fn script_logins(&self, outcomes: impl IntoIterator<Item = PlatformResult<()>>) {
        lock(&self.login_script).extend(outcomes);
    }

    /// Queue outcomes for the next publish calls; `Ok` means success with a
    /// generated media id
    pub fn script_publishes(&self, outcomes: impl IntoIterator<Item = PlatformResult<()>>) {
        lock(&self.publish_script).extend(outcomes);
    }

    /// Pretend `post_id` already went out as `media_id` without the engine
    /// hearing about it
    pub fn record_remote_publish(&self, post_id: &str, media_id: &str) {
        lock(&self.remote_publishes).insert(post_id.to_string(), media_id.to_string());
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.lookup_fails.store(fail, Ordering::SeqCst);
    }

    pub fn login_count(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn publish_count(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_count(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    /// Usernames and fingerprints presented at login, in call order
    pub fn logins(&self) -> Vec<(String, DeviceFingerprint)> {
        lock(&self.logins).clone()
    }

    pub fn publishes(&self) -> Vec<PublishCall> {
        lock(&self.publishes).clone()
    }

    /// Whether two publishes for one account ever ran at the same time
    pub fn overlap_detected(&self) -> bool {
        self.overlap_detected.load(Ordering::SeqCst)
    }

    fn next_media_id(&self) -> String {
        let n = self.media_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("mock-media-{}", n)
    }
}

/// Poisoning only happens if a test already panicked
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Authenticator for MockPlatform {
    async fn login(
        &self,
        credentials: &Credentials,
        fingerprint: &DeviceFingerprint,
    ) -> PlatformResult<AuthState> {
        let n = self.login_calls.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.logins).push((credentials.username.clone(), fingerprint.clone()));

        let scripted = lock(&self.login_script).pop_front();
        let outcome = scripted.unwrap_or_else(|| lock(&self.login_default).clone());
        outcome?;

        let issued_at = chrono::Utc::now().timestamp();
        Ok(AuthState::new(
            format!("mock-token-{}", n),
            issued_at,
            self.token_ttl.map(|ttl| issued_at + ttl),
        ))
    }
}

#[async_trait]
impl PublishPlatform for MockPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, request: &PublishRequest) -> PlatformResult<String> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);

        let entered = lock(&self.in_flight).insert(request.account_id.clone());
        if !entered {
            tracing::error!(account_id = %request.account_id, "Overlapping publish detected");
            self.overlap_detected.store(true, Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        let scripted = lock(&self.publish_script).pop_front();
        let outcome = match scripted.unwrap_or(Ok(())) {
            Ok(()) => {
                let media_id = self.next_media_id();
                lock(&self.remote_publishes).insert(request.post_id.clone(), media_id.clone());
                Ok(media_id)
            }
            Err(e) => Err(e),
        };

        if entered {
            lock(&self.in_flight).remove(&request.account_id);
        }

        lock(&self.publishes).push(PublishCall {
            account_id: request.account_id.clone(),
            post_id: request.post_id.clone(),
            post_type: request.post_type,
            media_refs: request.media.iter().map(|m| m.reference.clone()).collect(),
            caption: request.caption.clone(),
            token: request.auth_state.token.clone(),
            outcome: outcome.clone(),
        });

        outcome
    }

    async fn find_recent_publish(
        &self,
        _auth_state: &AuthState,
        post: &Post,
    ) -> PlatformResult<Option<String>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        if self.lookup_fails.load(Ordering::SeqCst) {
            return Err(PlatformError::Network("lookup unavailable".to_string()));
        }
        Ok(lock(&self.remote_publishes).get(&post.id).cloned())
    }
}

/// Media store that serves any reference unless told it is missing
#[derive(Debug, Default)]
pub struct MockMediaStore {
    missing: Mutex<HashSet<String>>,
    fetches: AtomicUsize,
}

impl MockMediaStore {
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn mark_missing(&self, media_ref: &str) {
        lock(&self.missing).insert(media_ref.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaStore for MockMediaStore {
    async fn fetch_media_bytes(&self, media_ref: &str) -> PlatformResult<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if lock(&self.missing).contains(media_ref) {
            return Err(PlatformError::MediaUnavailable(media_ref.to_string()));
        }
        Ok(media_ref.as_bytes().to_vec())
    }
}
