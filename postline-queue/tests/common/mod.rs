//! Shared setup for postline-queue integration tests

#![allow(dead_code)]

use assert_cmd::Command;
use libpostline::Database;
use std::fs;
use tempfile::TempDir;

pub struct TestEnv {
    _temp_dir: TempDir,
    pub config_path: String,
    pub db_path: String,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let db_path = temp_dir.path().join("data").join("postline.db");

        fs::write(
            &config_path,
            "[publish]\nmax_caption_chars = 50\n\n[platform]\nbase_url = \"http://127.0.0.1:9\"\n",
        )
        .unwrap();

        Self {
            config_path: config_path.to_string_lossy().to_string(),
            db_path: db_path.to_string_lossy().to_string(),
            _temp_dir: temp_dir,
        }
    }

    pub fn queue(&self) -> Command {
        let mut cmd = Command::cargo_bin("postline-queue").unwrap();
        cmd.env("POSTLINE_CONFIG", &self.config_path)
            .env("POSTLINE_DB_PATH", &self.db_path)
            .env_remove("POSTLINE_LOG_FORMAT");
        cmd
    }

    /// Run a command that must succeed and return its trimmed stdout
    pub fn run(&self, args: &[&str]) -> String {
        let output = self.queue().args(args).assert().success().get_output().clone();
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    pub fn add_account(&self, id: &str) {
        self.run(&["accounts", "add", id, &format!("{}_ig", id)]);
    }

    pub fn enqueue_static(&self, account: &str, extra: &[&str]) -> String {
        let mut args = vec!["enqueue", account, "-m", "hero.jpg"];
        args.extend_from_slice(extra);
        self.run(&args)
    }

    pub async fn database(&self) -> Database {
        Database::new(&self.db_path).await.unwrap()
    }
}
