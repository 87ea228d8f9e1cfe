//! Filesystem media store
//!
//! Media references are relative paths under a configured root. Absolute
//! paths and `..` components are rejected so a post cannot read arbitrary
//! files.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::error::PlatformError;
use crate::platforms::{MediaStore, PlatformResult};

#[derive(Debug, Clone)]
pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let expanded = shellexpand::tilde(&root.as_ref().to_string_lossy()).to_string();
        Self {
            root: PathBuf::from(expanded),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a reference to a path under the root
    pub fn resolve(&self, media_ref: &str) -> PlatformResult<PathBuf> {
        let relative = Path::new(media_ref);
        if media_ref.trim().is_empty() {
            return Err(PlatformError::MediaUnavailable("empty media reference".to_string()));
        }

        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(PlatformError::MediaUnavailable(format!(
                        "media reference '{}' escapes the media root",
                        media_ref
                    )))
                }
            }
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn fetch_media_bytes(&self, media_ref: &str) -> PlatformResult<Vec<u8>> {
        let path = self.resolve(media_ref)?;
        tokio::fs::read(&path).await.map_err(|e| {
            tracing::debug!(path = %path.display(), error = %e, "Media read failed");
            PlatformError::MediaUnavailable(format!("{}: {}", media_ref, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_file_under_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("campaign")).unwrap();
        std::fs::write(dir.path().join("campaign/hero.jpg"), b"jpeg-bytes").unwrap();

        let store = FsMediaStore::new(dir.path());
        let bytes = store.fetch_media_bytes("campaign/hero.jpg").await.unwrap();
        assert_eq!(bytes, b"jpeg-bytes".to_vec());
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let store = FsMediaStore::new(dir.path());

        let err = store.fetch_media_bytes("nope.jpg").await.unwrap_err();
        assert!(matches!(err, PlatformError::MediaUnavailable(_)));
    }

    #[test]
    fn test_rejects_traversal() {
        let store = FsMediaStore::new("/srv/media");

        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("a/../../b").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("").is_err());
        assert_eq!(
            store.resolve("./a/b.jpg").unwrap(),
            PathBuf::from("/srv/media/a/b.jpg")
        );
    }
}
