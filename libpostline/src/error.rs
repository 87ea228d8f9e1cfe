//! Error types for Postline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PostlineError>;

#[derive(Error, Debug)]
pub enum PostlineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid post shape: {0}")]
    InvalidPostShape(String),

    #[error("Authentication failed for account '{account_id}': {reason}")]
    AuthenticationFailed { account_id: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Another publisher is already running: {0}")]
    AlreadyRunning(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PostlineError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PostlineError::InvalidInput(_) | PostlineError::InvalidPostShape(_) => 3,
            PostlineError::AuthenticationFailed { .. } => 2,
            PostlineError::Platform(PlatformError::Authentication(_)) => 2,
            PostlineError::Platform(_) => 1,
            PostlineError::Config(_) => 1,
            PostlineError::Database(_) => 1,
            PostlineError::NotFound(_) => 1,
            PostlineError::Dispatch(_) => 1,
            PostlineError::AlreadyRunning(_) => 1,
            PostlineError::Serialization(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

/// Failures reported by the external platform collaborators.
///
/// Lower layers only classify; whether a failure ends a post is decided by
/// the dispatcher via [`PlatformError::is_retryable`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Content rejected: {0}")]
    ContentRejected(String),

    #[error("Account suspended: {0}")]
    AccountSuspended(String),

    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Platform returned {code}: {message}")]
    Remote {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl PlatformError {
    /// Whether another attempt later could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PlatformError::RateLimit(_)
            | PlatformError::Network(_)
            | PlatformError::SessionExpired(_) => true,
            PlatformError::Remote { retryable, .. } => *retryable,
            PlatformError::Authentication(_)
            | PlatformError::ContentRejected(_)
            | PlatformError::AccountSuspended(_)
            | PlatformError::MediaUnavailable(_) => false,
        }
    }

    /// Stable machine-readable code for logs and events
    pub fn code(&self) -> &str {
        match self {
            PlatformError::Authentication(_) => "authentication",
            PlatformError::SessionExpired(_) => "session_expired",
            PlatformError::RateLimit(_) => "rate_limited",
            PlatformError::Network(_) => "network",
            PlatformError::ContentRejected(_) => "content_rejected",
            PlatformError::AccountSuspended(_) => "account_suspended",
            PlatformError::MediaUnavailable(_) => "media_unavailable",
            PlatformError::Remote { code, .. } => code,
        }
    }
}
