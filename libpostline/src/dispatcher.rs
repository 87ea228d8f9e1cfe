//! Scheduler/dispatcher
//!
//! Every cycle takes the due posts, groups them per account and hands each
//! account's batch to one worker task. Workers are bounded by a global
//! semaphore, and an account already being worked is skipped until its
//! worker finishes. Inside a batch posts are published one at a time in due
//! order, so per-account ordering never depends on the session lock alone.
//!
//! Post state machine, owned entirely by this module:
//!
//! ```text
//! pending ──claim──▶ processing ──published──────────────────────▶ published
//!    ▲                   │ ──retryable, attempts < max──▶ pending (backoff)
//!    │                   │ ──retryable at max / rejected──▶ failed
//!    └── auth failure ───┘ ──cancel requested──▶ cancelled
//! ```

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinSet;

use crate::config::SchedulerConfig;
use crate::db::Database;
use crate::error::{PostlineError, Result};
use crate::publisher::{PublishOutcome, Publisher};
use crate::rate_limiter::RateLimiter;
use crate::scheduling::{retry_backoff, Clock};
use crate::service::events::{Event, EventBus};
use crate::types::{Post, PostStatus};

/// Rate-limit windows older than this are deleted by the sweep
const RATE_WINDOW_RETENTION_SECS: i64 = 24 * 3600;

/// What happened to one post in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Published,
    Retried,
    Failed,
    Cancelled,
    /// Another worker or a cancel got there first
    ClaimLost,
    RateLimited,
    AuthenticationFailed,
}

impl Step {
    fn stops_batch(self) -> bool {
        matches!(self, Step::RateLimited | Step::AuthenticationFailed)
    }
}

/// Result of one account batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub account_id: String,
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub claims_lost: usize,
    /// The hourly budget ran out before the batch did
    pub rate_limited: bool,
    pub authentication_failed: bool,
    /// Internal error that ended the batch early
    pub error: Option<String>,
}

impl BatchReport {
    fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            ..Default::default()
        }
    }

    fn record(&mut self, step: Step) {
        match step {
            Step::Published => self.published += 1,
            Step::Retried => self.retried += 1,
            Step::Failed => self.failed += 1,
            Step::Cancelled => self.cancelled += 1,
            Step::ClaimLost => self.claims_lost += 1,
            Step::RateLimited => self.rate_limited = true,
            Step::AuthenticationFailed => self.authentication_failed = true,
        }
    }
}

/// Result of one dispatch cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub due: usize,
    pub accounts_dispatched: usize,
    pub skipped_degraded: usize,
    pub skipped_busy: usize,
    /// Posts of accounts left for the next poll because every worker slot
    /// was taken
    pub deferred: usize,
    /// Filled in by [`Dispatcher::run_cycle`]; empty after `spawn_cycle`
    pub batches: Vec<BatchReport>,
}

impl CycleReport {
    pub fn published(&self) -> usize {
        self.batches.iter().map(|b| b.published).sum()
    }

    pub fn retried(&self) -> usize {
        self.batches.iter().map(|b| b.retried).sum()
    }

    pub fn failed(&self) -> usize {
        self.batches.iter().map(|b| b.failed).sum()
    }
}

/// Held by a worker for the lifetime of its batch
struct WorkerSlot {
    account_id: String,
    busy: Arc<Mutex<HashSet<String>>>,
    in_flight: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        lock_busy(&self.busy).remove(&self.account_id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock_busy(busy: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct Dispatcher {
    db: Database,
    publisher: Arc<Publisher>,
    rate_limiter: Option<RateLimiter>,
    config: SchedulerConfig,
    events: EventBus,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    busy: Arc<Mutex<HashSet<String>>>,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        publisher: Arc<Publisher>,
        config: SchedulerConfig,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            db,
            publisher,
            rate_limiter: None,
            config,
            events,
            clock,
            permits,
            in_flight: Arc::new(AtomicUsize::new(0)),
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Workers currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self, account_id: &str) -> bool {
        lock_busy(&self.busy).contains(account_id)
    }

    /// Run one cycle and wait for every worker it started
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut workers = JoinSet::new();
        let mut report = self.dispatch_due(&mut workers, true).await?;

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(batch) => report.batches.push(batch),
                Err(e) => tracing::error!(error = %e, "Dispatch worker panicked"),
            }
        }

        Ok(report)
    }

    /// Start workers for due account batches without waiting for them.
    ///
    /// Never waits for a worker slot: accounts that do not get one are
    /// counted as `deferred` and picked up by a later call.
    pub async fn spawn_cycle(&self, workers: &mut JoinSet<BatchReport>) -> Result<CycleReport> {
        self.dispatch_due(workers, false).await
    }

    async fn dispatch_due(
        &self,
        workers: &mut JoinSet<BatchReport>,
        wait_for_slot: bool,
    ) -> Result<CycleReport> {
        let now = self.clock.now();
        let due = self.db.list_due(now).await?;

        let mut report = CycleReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let degraded = self.db.degraded_account_ids().await?;

        for (account_id, posts) in group_by_account(due) {
            if degraded.contains(&account_id) {
                tracing::debug!(
                    account_id = %account_id,
                    posts = posts.len(),
                    "Skipping degraded account"
                );
                report.skipped_degraded += posts.len();
                continue;
            }
            if self.is_busy(&account_id) {
                report.skipped_busy += posts.len();
                continue;
            }

            let permit = if wait_for_slot {
                self.permits.clone().acquire_owned().await.map_err(|_| pool_closed())?
            } else {
                match self.permits.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(TryAcquireError::NoPermits) => {
                        report.deferred += posts.len();
                        continue;
                    }
                    Err(TryAcquireError::Closed) => return Err(pool_closed()),
                }
            };

            let Some(slot) = self.claim_account(&account_id, permit) else {
                report.skipped_busy += posts.len();
                continue;
            };

            report.accounts_dispatched += 1;
            let dispatcher = self.clone();
            workers.spawn(async move { dispatcher.process_batch(slot, posts).await });
        }

        tracing::debug!(
            due = report.due,
            accounts = report.accounts_dispatched,
            skipped_degraded = report.skipped_degraded,
            skipped_busy = report.skipped_busy,
            deferred = report.deferred,
            "Dispatch cycle started"
        );
        Ok(report)
    }

    fn claim_account(&self, account_id: &str, permit: OwnedSemaphorePermit) -> Option<WorkerSlot> {
        if !lock_busy(&self.busy).insert(account_id.to_string()) {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(WorkerSlot {
            account_id: account_id.to_string(),
            busy: self.busy.clone(),
            in_flight: self.in_flight.clone(),
            _permit: permit,
        })
    }

    async fn process_batch(&self, slot: WorkerSlot, posts: Vec<Post>) -> BatchReport {
        let mut report = BatchReport::new(&slot.account_id);

        for post in &posts {
            match self.process_post(post).await {
                Ok(step) => {
                    report.record(step);
                    if step.stops_batch() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        post_id = %post.id,
                        account_id = %post.account_id,
                        error = %e,
                        "Dispatch failed, stopping batch"
                    );
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }

        report
    }

    /// Claim, publish and record one post.
    ///
    /// `queued` comes from the cycle's `list_due` snapshot; everything after
    /// the claim works on the row the claim returned.
    async fn process_post(&self, queued: &Post) -> Result<Step> {
        let now = self.clock.now();

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.check(&self.db, &queued.account_id, now).await? {
                tracing::info!(
                    account_id = %queued.account_id,
                    resumes_at = limiter.next_window(now),
                    "Hourly publish budget used up"
                );
                return Ok(Step::RateLimited);
            }
        }

        let Some(claimed) = self.db.claim_post(&queued.id, now).await? else {
            tracing::debug!(post_id = %queued.id, "Claim lost");
            return Ok(Step::ClaimLost);
        };
        let post = &claimed;

        if let Some(limiter) = &self.rate_limiter {
            limiter.record(&self.db, &post.account_id, now).await?;
        }

        let attempt = post.attempt_count + 1;
        tracing::info!(
            post_id = %post.id,
            account_id = %post.account_id,
            post_type = %post.post_type,
            attempt,
            "Publishing post"
        );
        self.events.emit(Event::PublishStarted {
            post_id: post.id.clone(),
            account_id: post.account_id.clone(),
            attempt,
        });

        let outcome = match self.publisher.publish(post).await {
            Ok(outcome) => outcome,
            Err(PostlineError::InvalidPostShape(reason)) => {
                return self
                    .fail(post, post.attempt_count, format!("invalid post shape: {}", reason))
                    .await;
            }
            Err(PostlineError::NotFound(what)) => {
                return self
                    .fail(post, post.attempt_count, format!("{} not found", what))
                    .await;
            }
            Err(e) => {
                if let Err(requeue_err) = self.db.requeue(&post.id, self.clock.now()).await {
                    tracing::warn!(
                        post_id = %post.id,
                        error = %requeue_err,
                        "Could not release claim, the recovery sweep will"
                    );
                }
                return Err(e);
            }
        };

        let now = self.clock.now();
        match outcome {
            PublishOutcome::Published { media_id } => {
                match self.db.mark_published(&post.id, &media_id, now).await? {
                    Some(PostStatus::Published) => {
                        tracing::info!(
                            post_id = %post.id,
                            account_id = %post.account_id,
                            media_id = %media_id,
                            "Post published"
                        );
                        self.events.emit(Event::PostPublished {
                            post_id: post.id.clone(),
                            account_id: post.account_id.clone(),
                            media_id,
                        });
                        Ok(Step::Published)
                    }
                    other => Ok(self.settled_elsewhere(post, other)),
                }
            }
            PublishOutcome::Retryable(error) if attempt < self.config.max_attempts => {
                let delay = retry_backoff(
                    attempt,
                    self.config.backoff_base_secs,
                    self.config.backoff_max_secs,
                );
                let scheduled_for = now.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));

                match self
                    .db
                    .schedule_retry(&post.id, attempt, scheduled_for, now)
                    .await?
                {
                    Some(PostStatus::Pending) => {
                        tracing::warn!(
                            post_id = %post.id,
                            attempt,
                            retry_in_secs = delay,
                            error = %error,
                            "Publish failed, retry scheduled"
                        );
                        self.events.emit(Event::RetryScheduled {
                            post_id: post.id.clone(),
                            attempt,
                            scheduled_for,
                            error: error.to_string(),
                        });
                        Ok(Step::Retried)
                    }
                    other => Ok(self.settled_elsewhere(post, other)),
                }
            }
            PublishOutcome::Retryable(error) | PublishOutcome::Rejected(error) => {
                self.fail(post, attempt, error.to_string()).await
            }
            PublishOutcome::AuthenticationFailed(reason) => {
                let status = self.db.requeue(&post.id, now).await?;
                tracing::warn!(
                    post_id = %post.id,
                    account_id = %post.account_id,
                    reason = %reason,
                    "Login rejected, post left pending"
                );
                self.events.emit(Event::AccountDegraded {
                    account_id: post.account_id.clone(),
                    reason,
                });
                if status == Some(PostStatus::Cancelled) {
                    self.settled_elsewhere(post, status);
                }
                Ok(Step::AuthenticationFailed)
            }
        }
    }

    async fn fail(&self, post: &Post, attempts: u32, error: String) -> Result<Step> {
        let now = self.clock.now();
        match self.db.mark_failed(&post.id, &error, attempts, now).await? {
            Some(PostStatus::Failed) => {
                tracing::warn!(
                    post_id = %post.id,
                    account_id = %post.account_id,
                    attempt = attempts,
                    error = %error,
                    "Post failed"
                );
                self.events.emit(Event::PostFailed {
                    post_id: post.id.clone(),
                    attempt: attempts,
                    error,
                });
                Ok(Step::Failed)
            }
            other => Ok(self.settled_elsewhere(post, other)),
        }
    }

    /// A recording write found the post cancelled or no longer ours
    fn settled_elsewhere(&self, post: &Post, status: Option<PostStatus>) -> Step {
        match status {
            Some(PostStatus::Cancelled) => {
                tracing::info!(post_id = %post.id, "Cancelled while publishing, result discarded");
                self.events.emit(Event::PostCancelled {
                    post_id: post.id.clone(),
                });
                Step::Cancelled
            }
            _ => {
                tracing::warn!(post_id = %post.id, "Post claim was lost while publishing");
                Step::ClaimLost
            }
        }
    }

    /// Requeue posts whose processing claim was abandoned, e.g. by a crash.
    ///
    /// Posts of accounts this dispatcher is working right now are left alone.
    /// Returns the number of posts put back to pending.
    pub async fn recover_stale(&self) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = now.saturating_sub(i64::try_from(self.config.stale_after_secs).unwrap_or(i64::MAX));

        let mut recovered = 0;
        for post in self.db.find_stale_processing(cutoff).await? {
            if self.is_busy(&post.account_id) {
                continue;
            }

            match self.db.requeue_stale(&post.id, cutoff, now).await? {
                Some(PostStatus::Pending) => {
                    tracing::warn!(
                        post_id = %post.id,
                        account_id = %post.account_id,
                        attempt = post.attempt_count,
                        "Recovered abandoned post"
                    );
                    self.events.emit(Event::PostRecovered {
                        post_id: post.id.clone(),
                        account_id: post.account_id.clone(),
                    });
                    recovered += 1;
                }
                Some(PostStatus::Cancelled) => {
                    self.events.emit(Event::PostCancelled {
                        post_id: post.id.clone(),
                    });
                }
                _ => {}
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            let removed = limiter
                .cleanup_old_windows(&self.db, now - RATE_WINDOW_RETENTION_SECS)
                .await?;
            if removed > 0 {
                tracing::debug!(removed, "Old rate-limit windows removed");
            }
        }

        Ok(recovered)
    }

    /// Dispatch until `shutdown` turns true, then wait for running workers.
    ///
    /// The recovery sweep runs once at startup and then every
    /// `recovery_interval_secs`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval_secs,
            max_concurrent = self.config.max_concurrent,
            "Dispatcher started"
        );

        let mut workers: JoinSet<BatchReport> = JoinSet::new();
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut recovery = tokio::time::interval(self.config.recovery_interval());
        recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = recovery.tick() => {
                    if let Err(e) = self.recover_stale().await {
                        tracing::error!(error = %e, "Recovery sweep failed");
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.spawn_cycle(&mut workers).await {
                        tracing::error!(error = %e, "Dispatch cycle failed");
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    log_batch(joined);
                }
            }
        }

        tracing::info!(in_flight = self.in_flight(), "Shutting down, waiting for workers");
        while let Some(joined) = workers.join_next().await {
            log_batch(joined);
        }
        tracing::info!("Dispatcher stopped");
        Ok(())
    }
}

fn pool_closed() -> PostlineError {
    PostlineError::Dispatch("worker pool closed".to_string())
}

fn log_batch(joined: std::result::Result<BatchReport, tokio::task::JoinError>) {
    match joined {
        Ok(batch) => tracing::debug!(
            account_id = %batch.account_id,
            published = batch.published,
            retried = batch.retried,
            failed = batch.failed,
            cancelled = batch.cancelled,
            "Batch finished"
        ),
        Err(e) => tracing::error!(error = %e, "Dispatch worker panicked"),
    }
}

/// Split due posts per account, keeping the due order within each account
/// and the order in which accounts first appear
fn group_by_account(posts: Vec<Post>) -> Vec<(String, Vec<Post>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<Post>)> = Vec::new();

    for post in posts {
        match index.get(&post.account_id) {
            Some(&i) => groups[i].1.push(post),
            None => {
                index.insert(post.account_id.clone(), groups.len());
                groups.push((post.account_id.clone(), vec![post]));
            }
        }
    }

    groups
}
