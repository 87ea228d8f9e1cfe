//! Service layer for Postline
//!
//! The API the binaries (and any embedder) program against. `PostlineService`
//! wires the stores, the session manager, the publisher and the dispatcher
//! together and hands out the specialized sub-services:
//!
//! - `QueueService`: enqueue, inspect, list and cancel posts
//! - `AccountService`: register and remove accounts, login resets, health
//! - `ValidationService`: post shape and caption checks
//! - `Dispatcher`: the publishing engine itself
//! - `EventBus`: engine events for subscribers
//!
//! # Example
//!
//! ```no_run
//! use libpostline::service::PostlineService;
//! use libpostline::service::queue::EnqueueRequest;
//! use libpostline::PostType;
//!
//! # async fn example() -> libpostline::Result<()> {
//! let service = PostlineService::new().await?;
//!
//! service.accounts().add_account("shop", "shop_official", None).await?;
//! let post_id = service
//!     .queue()
//!     .enqueue_post(EnqueueRequest {
//!         account_id: "shop".to_string(),
//!         post_type: PostType::Carousel,
//!         media: vec!["spring/1.jpg".to_string(), "spring/2.jpg".to_string()],
//!         caption: Some("Spring collection".to_string()),
//!         scheduled_for: None,
//!     })
//!     .await?;
//!
//! service.dispatcher().run_cycle().await?;
//! println!("{:?}", service.queue().get_post_status(&post_id).await?.post.status);
//! # Ok(())
//! # }
//! ```

pub mod accounts;
pub mod events;
pub mod queue;
pub mod validation;

use std::sync::Arc;

use self::accounts::AccountService;
use self::events::{EventBus, EventReceiver};
use self::queue::QueueService;
use self::validation::ValidationService;
use crate::config::expand_path;
use crate::credentials::FileCredentials;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, PostlineError};
use crate::platforms::http::HttpPlatform;
use crate::platforms::media::FsMediaStore;
use crate::platforms::{Authenticator, CredentialProvider, MediaStore, PublishPlatform};
use crate::publisher::Publisher;
use crate::rate_limiter::RateLimiter;
use crate::scheduling::{Clock, SystemClock};
use crate::sessions::{AccountSessionManager, SqliteSessionStore};
use crate::{Config, Database, Result};

/// The external collaborators the engine runs against
#[derive(Clone)]
pub struct Collaborators {
    pub authenticator: Arc<dyn Authenticator>,
    pub platform: Arc<dyn PublishPlatform>,
    pub media: Arc<dyn MediaStore>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// HTTP gateway, media under `media_root` and the credentials file, all
    /// taken from `config.platform`
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = Arc::new(HttpPlatform::new(&config.platform)?);
        Ok(Self {
            authenticator: http.clone(),
            platform: http,
            media: Arc::new(FsMediaStore::new(expand_path(&config.platform.media_root))),
            credentials: Arc::new(FileCredentials::new(&config.platform.credentials_file)),
            clock: Arc::new(SystemClock),
        })
    }
}

/// Main service facade
///
/// All sub-services share one `Database` (a cloneable pool handle), one
/// session manager and one event bus.
pub struct PostlineService {
    config: Config,
    db: Database,
    queue: QueueService,
    accounts: AccountService,
    validation: ValidationService,
    dispatcher: Dispatcher,
    event_bus: EventBus,
}

impl PostlineService {
    /// Load the configuration from the default location and connect to the
    /// real platform gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the database
    /// cannot be opened or migrated.
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    pub async fn from_config(config: Config) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::with_collaborators(config, collaborators).await
    }

    /// Open the configured database and run against `collaborators`
    pub async fn with_collaborators(config: Config, collaborators: Collaborators) -> Result<Self> {
        let db_path = config.database_path();
        let db_path = db_path.to_str().ok_or_else(|| {
            PostlineError::Config(ConfigError::InvalidValue {
                field: "database.path".to_string(),
                reason: "path is not valid UTF-8".to_string(),
            })
        })?;
        let db = Database::new(db_path).await?;
        Ok(Self::assemble(config, db, collaborators))
    }

    /// Build on an already opened database
    pub fn assemble(config: Config, db: Database, collaborators: Collaborators) -> Self {
        let event_bus = EventBus::default();
        let clock = collaborators.clock;

        let sessions = Arc::new(AccountSessionManager::new(
            db.clone(),
            Arc::new(SqliteSessionStore::new(db.clone())),
            collaborators.authenticator,
            collaborators.credentials,
            clock.clone(),
            config.sessions.fingerprint_salt.clone(),
        ));
        let publisher = Arc::new(Publisher::new(
            sessions.clone(),
            collaborators.platform,
            collaborators.media,
            config.publish.clone(),
        ));

        let mut dispatcher = Dispatcher::new(
            db.clone(),
            publisher,
            config.scheduler.clone(),
            event_bus.clone(),
            clock.clone(),
        );
        if config.rate_limits.posts_per_hour > 0 {
            dispatcher =
                dispatcher.with_rate_limiter(RateLimiter::new(config.rate_limits.posts_per_hour));
        }

        let validation = ValidationService::new(config.publish.clone());
        let queue = QueueService::new(db.clone(), validation.clone(), event_bus.clone(), clock.clone());
        let accounts = AccountService::new(db.clone(), sessions, event_bus.clone(), clock);

        Self {
            config,
            db,
            queue,
            accounts,
            validation,
            dispatcher,
            event_bus,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn queue(&self) -> &QueueService {
        &self.queue
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    pub fn validation(&self) -> &ValidationService {
        &self.validation
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Receive engine events emitted from now on
    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }
}
