//! postline-send - Publishing daemon
//!
//! Polls the post queue and publishes due posts through each account's
//! session, retrying transient failures and recovering abandoned claims.

use clap::Parser;
use libpostline::logging::{LogFormat, LoggingConfig};
use libpostline::{Config, InstanceLock, PostlineService, Result};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "postline-send")]
#[command(version)]
#[command(about = "Publishing daemon for scheduled posts")]
#[command(long_about = "\
postline-send - Publishing daemon for scheduled posts

DESCRIPTION:
    postline-send is a long-running daemon that publishes queued posts when
    they become due. Each account's posts are published one at a time
    through that account's logged-in session; different accounts publish
    in parallel up to scheduler.max_concurrent.

    Only one postline-send may run against a database at a time; a second
    one exits with an error while the first holds <database>.lock.

    Transient failures (network, rate limits, expired sessions) are retried
    with exponential backoff up to scheduler.max_attempts. Posts left in
    'processing' by a crash are requeued by a recovery sweep.

USAGE:
    # Run in foreground (logs to stderr)
    postline-send

    # Poll every 10 seconds with debug logging
    postline-send --poll-interval 10 --verbose

    # Recover, publish whatever is due once, and exit
    postline-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (running publishes finish first)

CONFIGURATION:
    Configuration file: ~/.config/postline/config.toml
    Database location: ~/.local/share/postline/postline.db

    [scheduler]
    poll_interval_secs = 30
    recovery_interval_secs = 300
    max_attempts = 3
    max_concurrent = 4

    [rate_limits]
    posts_per_hour = 25

    Override with environment variables:
        POSTLINE_CONFIG      - Path to config file
        POSTLINE_DB_PATH     - Path to database file
        POSTLINE_LOG_FORMAT  - text, json or pretty
        POSTLINE_LOG_LEVEL   - Log level (default: info)

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log output format: text, json or pretty
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Run one recovery sweep and one dispatch cycle, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env()
        .with_format(cli.log_format)
        .with_verbose(cli.verbose)
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "postline-send failed");
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(secs) = cli.poll_interval {
        config.scheduler.poll_interval_secs = secs;
        config.validate()?;
    }

    // Held until exit so a second daemon on this database refuses to start
    let lock = InstanceLock::acquire(&config.database_path())?;
    info!(lock = %lock.path().display(), "Instance lock held");

    let service = PostlineService::from_config(config).await?;
    let dispatcher = service.dispatcher();

    if cli.once {
        let recovered = dispatcher.recover_stale().await?;
        let report = dispatcher.run_cycle().await?;
        info!(
            recovered,
            due = report.due,
            published = report.published(),
            retried = report.retried(),
            failed = report.failed(),
            skipped_degraded = report.skipped_degraded,
            "Processed due posts once"
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(wait_for_shutdown(shutdown_tx));

    info!("postline-send daemon starting");
    dispatcher.run(shutdown_rx).await?;
    info!("postline-send daemon stopped");
    Ok(())
}

/// Flip `shutdown` on SIGINT or SIGTERM
#[cfg(unix)]
async fn wait_for_shutdown(shutdown: watch::Sender<bool>) {
    use futures::stream::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "Signal setup failed, falling back to Ctrl-C only");
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown.send(true);
            }
            return;
        }
    };

    if let Some(signal) = signals.next().await {
        info!(signal, "Received shutdown signal, stopping gracefully");
        let _ = shutdown.send(true);
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(shutdown: watch::Sender<bool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl-C, stopping gracefully");
        let _ = shutdown.send(true);
    }
}
