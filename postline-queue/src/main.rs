//! postline-queue - Manage accounts and the post queue
//!
//! Operator tool for registering accounts, enqueueing posts and inspecting
//! or cancelling what the daemon will publish.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use libpostline::logging::{LogFormat, LoggingConfig};
use libpostline::scheduling::parse_schedule;
use libpostline::service::queue::{EnqueueRequest, PostStatusView};
use libpostline::service::PostlineService;
use libpostline::{
    Account, Config, Post, PostFilter, PostStatus, PostType, PostlineError, QueueStats, Result,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "postline-queue")]
#[command(version)]
#[command(about = "Manage accounts and scheduled posts")]
#[command(long_about = "\
postline-queue - Manage accounts and scheduled posts

DESCRIPTION:
    postline-queue manages the Postline queue. Register the accounts posts
    are published to, enqueue posts for them, and inspect or cancel posts
    before the postline-send daemon publishes them.

COMMANDS:
    accounts    Add, list, remove or reset accounts
    enqueue     Queue a post for an account
    status      Show one post
    list        List posts
    cancel      Cancel a post
    stats       Show queue statistics

USAGE EXAMPLES:
    # Register an account
    postline-queue accounts add brand-main brand_official --profile acme

    # Queue a carousel for tomorrow morning
    postline-queue enqueue brand-main --type carousel \\
        -m spring/1.jpg -m spring/2.jpg -m spring/3.jpg \\
        --caption \"Spring drop\" --at \"tomorrow 9am\"

    # Queue a static post for as soon as possible
    postline-queue enqueue brand-main -m hero.jpg

    # Pending posts as JSON
    postline-queue list --status pending --format json

    # Clear a rejected login after fixing the password
    postline-queue accounts reset brand-main

SCHEDULES:
    Durations       30m, 2h, \"in 1d 6h\"
    RFC 3339        2025-11-20T15:00:00Z
    Natural         \"tomorrow 9am\", \"next monday 10:00\"

CONFIGURATION:
    Configuration file: ~/.config/postline/config.toml
    Database location: ~/.local/share/postline/postline.db

    Override with environment variables:
        POSTLINE_CONFIG    - Path to config file
        POSTLINE_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed (not found, database or configuration error)
    2 - Authentication error
    3 - Invalid input (bad post shape, account id, schedule, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format: text, json or pretty
    #[arg(long, global = true, value_name = "FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage accounts
    Accounts {
        #[command(subcommand)]
        action: AccountsCommand,
    },

    /// Queue a post for an account
    Enqueue {
        /// Account to publish to
        account_id: String,

        /// Post type: static, carousel, video, reel or story
        #[arg(short = 't', long = "type", default_value = "static")]
        post_type: PostType,

        /// Media reference, relative to the media root (repeat for carousels)
        #[arg(short, long = "media", value_name = "REF")]
        media: Vec<String>,

        /// Caption text
        #[arg(short, long)]
        caption: Option<String>,

        /// When to publish (e.g. "2h", "tomorrow 9am"); as soon as possible if omitted
        #[arg(long, value_name = "WHEN")]
        at: Option<String>,

        /// Output format: text or json
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show one post
    Status {
        /// Post ID
        post_id: String,

        /// Output format: text or json
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List posts, due order first
    List {
        /// Output format: text or json
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Only posts for this account
        #[arg(short, long)]
        account: Option<String>,

        /// Only posts in this status
        #[arg(short, long)]
        status: Option<PostStatus>,

        /// Only posts for accounts of this business profile
        #[arg(short, long)]
        profile: Option<String>,

        /// Maximum number of posts
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Cancel a post
    Cancel {
        /// Post ID to cancel
        post_id: String,
    },

    /// Show queue statistics
    Stats {
        /// Output format: text or json
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
enum AccountsCommand {
    /// Register an account
    Add {
        /// Account ID (letters, digits, '-' and '_')
        account_id: String,

        /// Platform username
        username: String,

        /// Business profile the account belongs to
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// List accounts
    List {
        /// Only accounts of this business profile
        #[arg(short, long)]
        profile: Option<String>,

        /// Include removed accounts
        #[arg(long)]
        all: bool,

        /// Output format: text or json
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Remove an account and cancel its queued posts
    Remove {
        /// Account ID
        account_id: String,
    },

    /// Clear a rejected login so the next publish logs in again
    Reset {
        /// Account ID
        account_id: String,
    },

    /// Show session state and pending work for an account
    Health {
        /// Account ID
        account_id: String,

        /// Output format: text or json
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env()
        .with_format(cli.log_format)
        .with_verbose(cli.verbose)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let service = PostlineService::from_config(config).await?;

    match cli.command {
        Commands::Accounts { action } => cmd_accounts(&service, action).await,
        Commands::Enqueue {
            account_id,
            post_type,
            media,
            caption,
            at,
            format,
        } => {
            let request = EnqueueRequest {
                account_id,
                post_type,
                media,
                caption,
                scheduled_for: at
                    .map(|when| parse_schedule(&when, Utc::now()).map(|t| t.timestamp()))
                    .transpose()?,
            };
            cmd_enqueue(&service, request, format).await
        }
        Commands::Status { post_id, format } => cmd_status(&service, &post_id, format).await,
        Commands::List {
            format,
            account,
            status,
            profile,
            limit,
        } => {
            let filter = PostFilter {
                account_id: account,
                status,
                business_profile_id: profile,
                limit,
            };
            cmd_list(&service, &filter, format).await
        }
        Commands::Cancel { post_id } => cmd_cancel(&service, &post_id).await,
        Commands::Stats { format } => cmd_stats(&service, format).await,
    }
}

async fn cmd_accounts(service: &PostlineService, action: AccountsCommand) -> Result<()> {
    let accounts = service.accounts();
    match action {
        AccountsCommand::Add {
            account_id,
            username,
            profile,
        } => {
            let account = accounts
                .add_account(&account_id, &username, profile.as_deref())
                .await?;
            println!("Added account {} ({})", account.id, account.username);
        }
        AccountsCommand::List {
            profile,
            all,
            format,
        } => {
            let list = accounts.list_accounts(profile.as_deref(), all).await?;
            match format {
                OutputFormat::Json => print_json(&list)?,
                OutputFormat::Text => output_accounts_text(&list),
            }
        }
        AccountsCommand::Remove { account_id } => {
            let cancelled = accounts.remove_account(&account_id).await?;
            println!(
                "Removed account {} ({} post{} cancelled)",
                account_id,
                cancelled,
                if cancelled == 1 { "" } else { "s" }
            );
        }
        AccountsCommand::Reset { account_id } => {
            accounts.reset_login(&account_id).await?;
            println!("Login reset for account {}", account_id);
        }
        AccountsCommand::Health { account_id, format } => {
            let health = accounts.account_health(&account_id).await?;
            match format {
                OutputFormat::Json => print_json(&health)?,
                OutputFormat::Text => {
                    println!("Account:  {} ({})", health.account_id, health.username);
                    println!(
                        "Session:  {}",
                        health
                            .session_status
                            .map(|s| s.as_str())
                            .unwrap_or("none")
                    );
                    println!("Pending:  {}", health.pending_posts);
                    if let Some(reason) = &health.degraded_reason {
                        println!("Degraded: {}", reason);
                    }
                    if health.deleted {
                        println!("Removed:  yes");
                    }
                    println!("Healthy:  {}", if health.is_healthy() { "yes" } else { "no" });
                }
            }
        }
    }
    Ok(())
}

async fn cmd_enqueue(
    service: &PostlineService,
    request: EnqueueRequest,
    format: OutputFormat,
) -> Result<()> {
    let scheduled_for = request.scheduled_for;
    let post_id = service.queue().enqueue_post(request).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "id": post_id,
            "scheduled_for": scheduled_for,
        }))?,
        OutputFormat::Text => println!("{}", post_id),
    }
    Ok(())
}

async fn cmd_status(service: &PostlineService, post_id: &str, format: OutputFormat) -> Result<()> {
    let view = service.queue().get_post_status(post_id).await?;
    match format {
        OutputFormat::Json => print_json(&view)?,
        OutputFormat::Text => output_status_text(&view),
    }
    Ok(())
}

async fn cmd_list(service: &PostlineService, filter: &PostFilter, format: OutputFormat) -> Result<()> {
    let posts = service.queue().list_posts(filter).await?;
    match format {
        OutputFormat::Json => print_json(&posts)?,
        OutputFormat::Text => output_list_text(&posts),
    }
    Ok(())
}

/// Cancel a post; finished posts are reported as invalid input
async fn cmd_cancel(service: &PostlineService, post_id: &str) -> Result<()> {
    let queue = service.queue();
    if queue.cancel_post(post_id).await? {
        println!("Cancelled post {}", post_id);
        return Ok(());
    }

    let view = queue.get_post_status(post_id).await?;
    Err(PostlineError::InvalidInput(format!(
        "post '{}' is already {}",
        post_id, view.post.status
    )))
}

async fn cmd_stats(service: &PostlineService, format: OutputFormat) -> Result<()> {
    let stats = service.queue().stats().await?;
    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Text => output_stats_text(&stats),
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn output_accounts_text(accounts: &[Account]) {
    for account in accounts {
        let mut line = format!(
            "{} | {} | {}",
            account.id,
            account.username,
            account.business_profile_id.as_deref().unwrap_or("-")
        );
        if account.is_deleted() {
            line.push_str(" | removed");
        } else if let Some(reason) = &account.degraded_reason {
            line.push_str(&format!(" | degraded: {}", reason));
        }
        println!("{}", line);
    }
}

fn output_status_text(view: &PostStatusView) {
    let post = &view.post;
    let now = Utc::now().timestamp();

    println!("Post:      {}", post.id);
    println!("Account:   {}", post.account_id);
    println!("Type:      {}", post.post_type);
    println!("Status:    {}", post.status);
    println!("Media:     {}", post.media.join(", "));
    if let Some(caption) = &post.caption {
        println!("Caption:   {}", truncate_content(caption, 60));
    }
    match post.scheduled_for {
        Some(ts) => println!("Scheduled: {} ({})", format_timestamp(ts), format_time_until(now, ts)),
        None => println!("Scheduled: as soon as possible"),
    }
    println!("Attempts:  {}", post.attempt_count);
    if let Some(media_id) = &post.published_media_id {
        println!("Media ID:  {}", media_id);
    }
    if let Some(error) = &post.last_error {
        println!("Error:     {}", error);
    }
    if let Some(reason) = &view.account_degraded {
        println!(
            "Warning:   account login was rejected ({}); run 'postline-queue accounts reset {}' after fixing it",
            reason, post.account_id
        );
    }
}

fn output_list_text(posts: &[Post]) {
    let now = Utc::now().timestamp();

    for post in posts {
        let caption_preview = post
            .caption
            .as_deref()
            .map(|c| truncate_content(c, 40))
            .unwrap_or_default();
        let when = match (post.status, post.scheduled_for) {
            (PostStatus::Pending, Some(ts)) => format_time_until(now, ts),
            (PostStatus::Pending, None) => "asap".to_string(),
            (_, Some(ts)) => format_timestamp(ts),
            (_, None) => "-".to_string(),
        };

        println!(
            "{} | {} | {} | {} | {} | {}",
            post.id, post.account_id, post.post_type, post.status, when, caption_preview
        );
    }
}

fn output_stats_text(stats: &QueueStats) {
    println!("Pending:    {}", stats.pending);
    println!("Processing: {}", stats.processing);
    println!("Published:  {}", stats.published);
    println!("Failed:     {}", stats.failed);
    println!("Cancelled:  {}", stats.cancelled);
    println!("Total:      {}", stats.total());
    if let Some(next) = stats.next_due_at {
        println!(
            "Next due:   {} ({})",
            format_timestamp(next),
            format_time_until(Utc::now().timestamp(), next)
        );
    }
}

/// Truncate to `max_chars` characters with an ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    let single_line = content.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let truncated: String = single_line.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Human-readable distance until `scheduled_at`
fn format_time_until(now: i64, scheduled_at: i64) -> String {
    let diff = scheduled_at - now;

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate_content("short", 10), "short");
        assert_eq!(truncate_content("ééééé", 3), "ééé...");
        assert_eq!(truncate_content("two\nlines", 20), "two lines");
    }

    #[test]
    fn test_format_time_until() {
        assert_eq!(format_time_until(1000, 900), "overdue");
        assert_eq!(format_time_until(0, 30), "in <1 minute");
        assert_eq!(format_time_until(0, 120), "in 2 minutes");
        assert_eq!(format_time_until(0, 3600), "in 1 hour");
        assert_eq!(format_time_until(0, 3 * 86400), "in 3 days");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(1_700_000_000), "2023-11-14 22:13 UTC");
    }

    #[test]
    fn test_cli_parses_repeated_media() {
        let cli = Cli::try_parse_from([
            "postline-queue",
            "enqueue",
            "shop",
            "--type",
            "carousel",
            "-m",
            "a.jpg",
            "-m",
            "b.jpg",
        ])
        .unwrap();
        match cli.command {
            Commands::Enqueue {
                post_type, media, ..
            } => {
                assert_eq!(post_type, PostType::Carousel);
                assert_eq!(media, vec!["a.jpg", "b.jpg"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_status() {
        assert!(Cli::try_parse_from(["postline-queue", "list", "--status", "lost"]).is_err());
    }
}
