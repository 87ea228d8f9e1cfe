//! Time handling for the dispatcher: clocks, retry backoff and parsing of
//! human-readable publish times.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::{PostlineError, Result};

/// Source of "now" as Unix seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Delay before the next attempt once `attempts` attempts have failed:
/// `min(base * 2^attempts, max)`.
pub fn retry_backoff(attempts: u32, base_secs: u64, max_secs: u64) -> u64 {
    let factor = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
    base_secs.saturating_mul(factor).min(max_secs)
}

/// Parse a schedule string relative to `now`.
///
/// Accepts:
/// - durations: `30m`, `2h`, `1d 6h`, optionally prefixed with `in `
/// - RFC 3339 instants: `2025-11-20T15:00:00Z`
/// - natural language: `tomorrow 9am`, `next monday 10:00`
pub fn parse_schedule(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(PostlineError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if let Ok(instant) = DateTime::parse_from_rfc3339(input) {
        return Ok(instant.with_timezone(&Utc));
    }

    let relative = input.strip_prefix("in ").unwrap_or(input);
    if let Some(duration) = parse_duration(relative) {
        return Ok(now + duration);
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).map_err(|e| {
        PostlineError::InvalidInput(format!("Could not parse schedule '{}': {}", input, e))
    })
}

fn parse_duration(input: &str) -> Option<Duration> {
    let std_duration = humantime::parse_duration(input).ok()?;
    let secs = i64::try_from(std_duration.as_secs()).ok()?;
    Duration::try_seconds(secs)
}
