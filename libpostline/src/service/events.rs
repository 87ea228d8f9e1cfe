//! Engine events
//!
//! An in-process event bus over `tokio::sync::broadcast`. The dispatcher and
//! the services emit an [`Event`] at every post transition; any number of
//! subscribers (the daemon's logger, a CLI watching a post, tests) can listen.
//!
//! Emitting never blocks and never fails. With no subscribers the event is
//! dropped; a lagging subscriber loses the oldest events.
//!
//! # Example
//!
//! ```no_run
//! use libpostline::service::events::{Event, EventBus};
//!
//! # async fn example() {
//! let bus = EventBus::new(100);
//! let mut receiver = bus.subscribe();
//!
//! bus.emit(Event::PostEnqueued {
//!     post_id: "abc123".to_string(),
//!     account_id: "shop".to_string(),
//!     scheduled_for: None,
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Something that happened to a post or an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PostEnqueued {
        post_id: String,
        account_id: String,
        scheduled_for: Option<i64>,
    },

    /// A worker claimed the post and is about to publish it
    PublishStarted {
        post_id: String,
        account_id: String,
        attempt: u32,
    },

    PostPublished {
        post_id: String,
        account_id: String,
        media_id: String,
    },

    RetryScheduled {
        post_id: String,
        attempt: u32,
        scheduled_for: i64,
        error: String,
    },

    PostFailed {
        post_id: String,
        attempt: u32,
        error: String,
    },

    PostCancelled { post_id: String },

    /// Login was rejected; the account's posts wait until it is reset
    AccountDegraded { account_id: String, reason: String },

    /// Requeued by the recovery sweep after an abandoned claim
    PostRecovered { post_id: String, account_id: String },
}

impl Event {
    pub fn post_id(&self) -> Option<&str> {
        match self {
            Event::PostEnqueued { post_id, .. }
            | Event::PublishStarted { post_id, .. }
            | Event::PostPublished { post_id, .. }
            | Event::RetryScheduled { post_id, .. }
            | Event::PostFailed { post_id, .. }
            | Event::PostCancelled { post_id }
            | Event::PostRecovered { post_id, .. } => Some(post_id),
            Event::AccountDegraded { .. } => None,
        }
    }
}
