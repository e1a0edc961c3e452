//! CAS Store
//!
//! Content-addressed blob store keyed by the lowercase hex SHA-256 digest of
//! its bytes. Write-once: a `put` of content already on disk does not touch
//! the file again. Writes are atomic from a reader's perspective via
//! write-temp-then-rename, matching the original system's `runs.py::cas_put`.

use sha2::{Digest, Sha256};
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CasError {
    #[error("io error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A content-addressed store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct CasStore {
    root: PathBuf,
}

/// Computes the lowercase hex SHA-256 digest of `bytes`.
pub fn digest_of(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

impl CasStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, digest: &str) -> PathBuf {
        self.root.join(digest)
    }

    /// Stores `content`, returning its digest. A no-op if the digest's file
    /// already exists.
    pub async fn put(&self, content: &[u8]) -> Result<String, CasError> {
        let digest = digest_of(content);
        let dest = self.path_for(&digest);

        if fs::try_exists(&dest).await.unwrap_or(false) {
            debug!(digest = %digest, "cas entry already present, skipping write");
            return Ok(digest);
        }

        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| CasError::Io { path: self.root.clone(), source })?;

        let tmp = self.root.join(format!(".{digest}.tmp-{}", std::process::id()));
        fs::write(&tmp, content)
            .await
            .map_err(|source| CasError::Io { path: tmp.clone(), source })?;
        fs::rename(&tmp, &dest)
            .await
            .map_err(|source| CasError::Io { path: dest.clone(), source })?;

        Ok(digest)
    }

    /// Fetches content by digest, or `None` if absent.
    pub async fn get(&self, digest: &str) -> Result<Option<Vec<u8>>, CasError> {
        let path = self.path_for(digest);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CasError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn roundtrips_content() {
        let dir = tempdir().unwrap();
        let store = CasStore::new(dir.path());

        let digest = store.put(b"hello world").await.unwrap();
        let got = store.get(&digest).await.unwrap().unwrap();
        assert_eq!(got, b"hello world");
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = CasStore::new(dir.path());

        let d1 = store.put(b"same bytes").await.unwrap();
        let d2 = store.put(b"same bytes").await.unwrap();
        assert_eq!(d1, d2);

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert_eq!(entries.clone().count(), 1);
        assert!(entries.next().is_some());
    }

    #[tokio::test]
    async fn missing_digest_returns_none() {
        let dir = tempdir().unwrap();
        let store = CasStore::new(dir.path());
        assert!(store.get("deadbeef").await.unwrap().is_none());
    }

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        let d = digest_of(b"");
        assert_eq!(d, "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }
}
