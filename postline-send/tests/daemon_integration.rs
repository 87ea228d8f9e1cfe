//! Integration tests for the postline-send daemon

use assert_cmd::Command;
use libpostline::{Account, Database, InstanceLock, Post, PostStatus, PostType};
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

struct TestEnv {
    _temp_dir: TempDir,
    config_path: String,
    db_path: String,
}

impl TestEnv {
    fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("postline-send").unwrap();
        cmd.env("POSTLINE_CONFIG", &self.config_path)
            .env("POSTLINE_DB_PATH", &self.db_path)
            .env_remove("POSTLINE_LOG_FORMAT");
        cmd
    }

    async fn database(&self) -> Database {
        Database::new(&self.db_path).await.unwrap()
    }
}

/// Config pointing at a platform address nothing listens on
async fn setup_test_env() -> TestEnv {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("postline.db");
    let media_root = temp_dir.path().join("media");
    let credentials_path = temp_dir.path().join("credentials.toml");

    fs::create_dir_all(&media_root).unwrap();
    fs::write(media_root.join("hero.jpg"), b"jpeg-bytes").unwrap();
    fs::write(
        &credentials_path,
        "[accounts.shop]\npassword = \"pw\"\n",
    )
    .unwrap();

    let config_content = format!(
        r#"
[scheduler]
poll_interval_secs = 1
max_attempts = 3
backoff_base_secs = 1

[platform]
base_url = "http://127.0.0.1:9"
timeout_secs = 2
media_root = "{}"
credentials_file = "{}"
"#,
        media_root.display().to_string().replace('\\', "/"),
        credentials_path.display().to_string().replace('\\', "/"),
    );
    fs::write(&config_path, config_content).unwrap();

    let env = TestEnv {
        config_path: config_path.to_str().unwrap().to_string(),
        db_path: db_path.to_str().unwrap().to_string(),
        _temp_dir: temp_dir,
    };

    let db = env.database().await;
    db.create_account(&Account::new("shop".to_string(), "shop_ig".to_string(), None))
        .await
        .unwrap();
    env
}

async fn create_due_post(env: &TestEnv, media: &str) -> String {
    let db = env.database().await;
    let now = chrono::Utc::now().timestamp();
    let post = Post::new(
        "shop".to_string(),
        PostType::Static,
        vec![media.to_string()],
        Some("spring drop".to_string()),
        Some(now - 10),
    );
    db.create_post(&post).await.unwrap();
    post.id
}

#[test]
fn test_help_describes_daemon() {
    Command::cargo_bin("postline-send")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--once"))
        .stdout(predicate::str::contains("SIGTERM"));
}

#[tokio::test]
async fn test_once_on_empty_queue_succeeds() {
    let env = setup_test_env().await;

    env.command().arg("--once").assert().success();

    let stats = env.database().await.queue_stats().await.unwrap();
    assert_eq!(stats.total(), 0);
}

#[tokio::test]
async fn test_invalid_config_fails() {
    let env = setup_test_env().await;
    fs::write(&env.config_path, "invalid toml content [[[").unwrap();

    env.command()
        .arg("--once")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Failed to parse config"));
}

#[tokio::test]
async fn test_zero_poll_interval_is_rejected() {
    let env = setup_test_env().await;

    env.command()
        .args(["--once", "--poll-interval", "0"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("poll_interval_secs"));
}

#[tokio::test]
async fn test_once_fails_post_with_missing_media() {
    let env = setup_test_env().await;
    let post_id = create_due_post(&env, "gone.jpg").await;

    env.command().arg("--once").assert().success();

    let post = env.database().await.get_post(&post_id).await.unwrap().unwrap();
    assert_eq!(post.status, PostStatus::Failed);
    assert_eq!(post.attempt_count, 1);
    assert!(post.last_error.unwrap().contains("Media unavailable"));
}

#[tokio::test]
async fn test_second_daemon_refuses_to_start() {
    let env = setup_test_env().await;
    let post_id = create_due_post(&env, "gone.jpg").await;

    // Stands in for a daemon already running against this database
    let running = InstanceLock::acquire(std::path::Path::new(&env.db_path)).unwrap();

    env.command()
        .arg("--once")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("already running"));

    let post = env.database().await.get_post(&post_id).await.unwrap().unwrap();
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(post.attempt_count, 0);

    drop(running);
    env.command().arg("--once").assert().success();
}

#[tokio::test]
async fn test_once_retries_when_platform_unreachable() {
    let env = setup_test_env().await;
    let post_id = create_due_post(&env, "hero.jpg").await;

    env.command().arg("--once").assert().success();

    let post = env.database().await.get_post(&post_id).await.unwrap().unwrap();
    assert_eq!(post.status, PostStatus::Pending);
    assert_eq!(post.attempt_count, 1);
    assert!(post.scheduled_for.unwrap() > chrono::Utc::now().timestamp() - 10);
}

#[tokio::test]
async fn test_once_leaves_future_posts_alone() {
    let env = setup_test_env().await;
    let db = env.database().await;
    let post = Post::new(
        "shop".to_string(),
        PostType::Static,
        vec!["hero.jpg".to_string()],
        None,
        Some(chrono::Utc::now().timestamp() + 3600),
    );
    db.create_post(&post).await.unwrap();

    env.command().arg("--once").assert().success();

    let stored = db.get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Pending);
    assert_eq!(stored.attempt_count, 0);
}
