//! Logging setup shared by the Postline binaries.
//!
//! Everything goes to stderr so that `postline-queue --format json` output on
//! stdout stays machine-readable. The format and level come from, in order:
//! explicit flags, `POSTLINE_LOG_FORMAT` / `POSTLINE_LOG_LEVEL`, then
//! `text` at `info`.
//!
//! ```no_run
//! use libpostline::logging::{LogFormat, LoggingConfig};
//!
//! LoggingConfig::from_env()
//!     .with_format(Some(LogFormat::Json))
//!     .init();
//! ```

use std::str::FromStr;

pub const LOG_FORMAT_ENV: &str = "POSTLINE_LOG_FORMAT";
pub const LOG_LEVEL_ENV: &str = "POSTLINE_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain single-line output
    #[default]
    Text,
    /// One JSON object per line, for log shippers
    Json,
    /// Multi-line colored output for development
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    /// Forces `debug` unless `RUST_LOG` says otherwise
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
            verbose: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: impl Into<String>, verbose: bool) -> Self {
        Self {
            format,
            level: level.into(),
            verbose,
        }
    }

    /// Build from `POSTLINE_LOG_FORMAT` and `POSTLINE_LOG_LEVEL`.
    ///
    /// An unparseable format falls back to text rather than failing startup.
    pub fn from_env() -> Self {
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());

        Self {
            format,
            level,
            verbose: false,
        }
    }

    /// Override the format when a command-line flag was given
    pub fn with_format(mut self, format: Option<LogFormat>) -> Self {
        if let Some(format) = format {
            self.format = format;
        }
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// The directive handed to `EnvFilter` when `RUST_LOG` is unset
    pub fn effective_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.level
        }
    }

    /// Install the global subscriber.
    ///
    /// A second call is a no-op; tests and embedders may have installed one
    /// already.
    pub fn init(&self) {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.effective_level()));

        let result = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .flatten_event(true)
                .with_target(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .with_file(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true)
                .try_init(),
        };

        if result.is_err() {
            tracing::debug!("Global tracing subscriber already installed");
        }
    }
}

/// Initialize logging from the environment alone
pub fn init_default() {
    LoggingConfig::from_env().init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" PRETTY ".parse::<LogFormat>().unwrap(), LogFormat::Pretty);

        let err = "yaml".parse::<LogFormat>().unwrap_err();
        assert!(err.contains("Invalid log format: 'yaml'"));
    }

    #[test]
    fn test_log_format_display_round_trips() {
        for format in [LogFormat::Text, LogFormat::Json, LogFormat::Pretty] {
            assert_eq!(format.to_string().parse::<LogFormat>().unwrap(), format);
        }
    }

    #[test]
    fn test_verbose_forces_debug() {
        let config = LoggingConfig::new(LogFormat::Text, "warn", false);
        assert_eq!(config.effective_level(), "warn");
        assert_eq!(config.with_verbose(true).effective_level(), "debug");
    }

    #[test]
    fn test_flag_overrides_env_format() {
        let config = LoggingConfig::default().with_format(Some(LogFormat::Pretty));
        assert_eq!(config.format, LogFormat::Pretty);

        let unchanged = LoggingConfig::new(LogFormat::Json, "info", false).with_format(None);
        assert_eq!(unchanged.format, LogFormat::Json);
    }

    #[test]
    #[serial]
    fn test_from_env_reads_variables() {
        std::env::set_var(LOG_FORMAT_ENV, "json");
        std::env::set_var(LOG_LEVEL_ENV, "trace");

        let config = LoggingConfig::from_env();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "trace");

        std::env::remove_var(LOG_FORMAT_ENV);
        std::env::remove_var(LOG_LEVEL_ENV);
    }

    #[test]
    #[serial]
    fn test_from_env_falls_back_on_garbage() {
        std::env::set_var(LOG_FORMAT_ENV, "xml");
        std::env::remove_var(LOG_LEVEL_ENV);

        let config = LoggingConfig::from_env();
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.level, "info");

        std::env::remove_var(LOG_FORMAT_ENV);
    }
}
