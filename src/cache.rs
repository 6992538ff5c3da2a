//! Certificate material cache
//!
//! External issuance writes `private key PEM ++ chain PEM` under the FQDN;
//! the certificate poller reads it back. The directory cache keeps one file
//! per key in a directory only the enclave user can access.

use crate::error::CacheError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Storage for certificate material keyed by name (the FQDN)
#[async_trait]
pub trait CertCache: Send + Sync {
    /// Returns [`CacheError::Miss`] when nothing is stored under `key` yet
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError>;

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError>;
}

/// Filesystem cache rooted at a single owner-only directory
#[derive(Debug, Clone)]
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    /// Creates the cache directory (mode 0700) if needed
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder
            .create(&dir)
            .await
            .map_err(|e| CacheError::Unavailable(format!("failed to create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.starts_with('.') {
            return Err(CacheError::Unavailable(format!("invalid cache key: {key:?}")));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl CertCache for DirCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key = %key, "Cache miss");
                Err(CacheError::Miss)
            }
            Err(e) => Err(CacheError::Unavailable(format!("failed to read {}: {e}", path.display()))),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        let tmp = self.dir.join(format!(".{key}.tmp"));

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let write = async {
            use tokio::io::AsyncWriteExt;
            let mut file = options.open(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await
        };
        write
            .await
            .map_err(|e| CacheError::Unavailable(format!("failed to write {}: {e}", path.display())))?;

        debug!(key = %key, len = data.len(), "Stored certificate material");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_miss_then_hit() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DirCache::create(tmp.path().join("cert-cache")).await.unwrap();

        assert!(matches!(cache.get("example.test").await, Err(CacheError::Miss)));

        cache.put("example.test", b"material").await.unwrap();
        assert_eq!(cache.get("example.test").await.unwrap(), b"material");
    }

    #[tokio::test]
    async fn test_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DirCache::create(tmp.path()).await.unwrap();

        cache.put("example.test", b"old").await.unwrap();
        cache.put("example.test", b"new").await.unwrap();
        assert_eq!(cache.get("example.test").await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DirCache::create(tmp.path()).await.unwrap();

        assert!(matches!(
            cache.get("../etc/passwd").await,
            Err(CacheError::Unavailable(_))
        ));
        assert!(cache.put("a/b", b"x").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("cert-cache");
        let cache = DirCache::create(&dir).await.unwrap();
        cache.put("example.test", b"material").await.unwrap();

        let dir_mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode & 0o077, 0);
        let file_mode = std::fs::metadata(dir.join("example.test"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
    }
}
