//! Account credentials.
//!
//! The engine never stores passwords. They come from a [`CredentialProvider`]
//! at login time and are held in [`SecretString`] so they are zeroed on drop
//! and never show up in `Debug` output.
//!
//! Two providers ship:
//! - [`FileCredentials`]: a TOML file, re-read on every login so operators can
//!   fix a password and then reset the account's login
//! - [`StaticCredentials`]: an in-memory map for tests and embedding
//!
//! The file format:
//!
//! ```toml
//! [accounts.brand-main]
//! username = "brand_official"   # optional, defaults to the account's username
//! password = "hunter2"
//! ```

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use zeroize::Zeroize;

use crate::error::PlatformError;
use crate::platforms::{CredentialProvider, PlatformResult};
use crate::types::Account;

#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    /// Copy of the credentials; the password copy is also zeroed on drop
    pub fn duplicate(&self) -> Self {
        Self::new(self.username.clone(), self.password.expose_secret().to_string())
    }
}

#[derive(Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    accounts: HashMap<String, FileEntry>,
}

#[derive(Deserialize)]
struct FileEntry {
    username: Option<String>,
    password: String,
}

/// Reads credentials from a TOML file on each request
#[derive(Debug, Clone)]
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let expanded = shellexpand::tilde(&path.as_ref().to_string_lossy()).to_string();
        Self {
            path: PathBuf::from(expanded),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self, account: &Account) -> PlatformResult<Credentials> {
        let metadata = std::fs::symlink_metadata(&self.path).map_err(|e| {
            PlatformError::Authentication(format!(
                "cannot read credentials file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        if metadata.file_type().is_symlink() {
            return Err(PlatformError::Authentication(format!(
                "credentials file {} is a symlink; refusing to follow it",
                self.path.display()
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o077 != 0 {
                tracing::warn!(
                    path = %self.path.display(),
                    "Credentials file is readable by other users; chmod 600 recommended"
                );
            }
        }

        let mut content = std::fs::read_to_string(&self.path).map_err(|e| {
            PlatformError::Authentication(format!(
                "cannot read credentials file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let parsed: std::result::Result<CredentialsFile, _> = toml::from_str(&content);
        content.zeroize();

        let mut parsed = parsed.map_err(|e| {
            PlatformError::Authentication(format!("credentials file is not valid TOML: {}", e))
        })?;

        let found = parsed.accounts.remove(&account.id);
        for entry in parsed.accounts.values_mut() {
            entry.password.zeroize();
        }

        let entry = found.ok_or_else(|| {
            PlatformError::Authentication(format!(
                "no credentials configured for account '{}'",
                account.id
            ))
        })?;

        let username = entry.username.unwrap_or_else(|| account.username.clone());
        Ok(Credentials {
            username,
            password: SecretString::from(entry.password),
        })
    }
}

#[async_trait]
impl CredentialProvider for FileCredentials {
    async fn credentials(&self, account: &Account) -> PlatformResult<Credentials> {
        let provider = self.clone();
        let account = account.clone();
        tokio::task::spawn_blocking(move || provider.load(&account))
            .await
            .map_err(|e| PlatformError::Network(format!("credential lookup aborted: {}", e)))?
    }
}

/// In-memory credentials keyed by account id
#[derive(Debug, Default)]
pub struct StaticCredentials {
    entries: RwLock<HashMap<String, Credentials>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, account_id: &str, username: &str, password: &str) -> Self {
        self.insert(account_id, username, password);
        self
    }

    pub fn insert(&self, account_id: &str, username: &str, password: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(account_id.to_string(), Credentials::new(username, password));
        }
    }

    pub fn remove(&self, account_id: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(account_id);
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(&self, account: &Account) -> PlatformResult<Credentials> {
        let entries = self
            .entries
            .read()
            .map_err(|_| PlatformError::Authentication("credential map poisoned".to_string()))?;

        entries
            .get(&account.id)
            .map(Credentials::duplicate)
            .ok_or_else(|| {
                PlatformError::Authentication(format!(
                    "no credentials configured for account '{}'",
                    account.id
                ))
            })
    }
}
