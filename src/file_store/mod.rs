//! Content-addressed asset storage (`spec.md` §2 FileStore, §6 storage layout).
//!
//! Files live at `<updates_dir>/.expo-internal/<assetHash>`. A file is
//! trusted only when its name matches the SHA-256 of its contents —
//! the same download-to-temp-then-verify-then-rename pattern the host
//! daemon's self-updater uses for its own binary (`update/mod.rs`).

use crate::errors::UpdatesError;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create asset store dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn path_for(&self, asset_key: &str) -> PathBuf {
        self.root.join(asset_key)
    }

    pub async fn contains(&self, asset_key: &str) -> bool {
        tokio::fs::metadata(self.path_for(asset_key)).await.is_ok()
    }

    /// Verify that the file at `asset_key`'s path matches its own name
    /// (i.e. hasn't been corrupted or truncated on disk). Invariant 1 of
    /// `spec.md` §3.
    pub async fn verify_on_disk(&self, asset_key: &str) -> Result<bool> {
        let path = self.path_for(asset_key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(_) => return Ok(false),
        };
        let actual = format!("{:x}", Sha256::digest(&bytes));
        Ok(actual == asset_key)
    }

    /// Download `url` to a temp file, verify its SHA-256 equals
    /// `expected_hash`, then atomically rename into the content-addressed
    /// path. On hash mismatch the temp file is removed and `Err` is
    /// returned — the caller (Loader) treats this as terminal for the
    /// current invocation (`spec.md` §4.2 step 5, §7 `DigestMismatch`).
    pub async fn download_and_store(
        &self,
        client: &reqwest::Client,
        url: &str,
        expected_hash: &str,
    ) -> Result<PathBuf> {
        let final_path = self.path_for(expected_hash);
        if self.verify_on_disk(expected_hash).await.unwrap_or(false) {
            debug!(expected_hash, "asset already present — skipping download");
            return Ok(final_path);
        }

        let temp_path = self.root.join(format!("{expected_hash}.tmp-{}", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .with_context(|| format!("failed to create temp file {}", temp_path.display()))?;

        let mut response = client.get(url).send().await.context("asset GET failed")?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = response.chunk().await.context("asset download stream error")? {
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .context("failed to write asset chunk")?;
        }
        file.flush().await?;
        drop(file);

        let actual_hash = format!("{:x}", hasher.finalize());
        if actual_hash != expected_hash {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(UpdatesError::DigestMismatch {
                asset_key: expected_hash.to_string(),
                expected: expected_hash.to_string(),
                actual: actual_hash,
            }
            .into());
        }

        tokio::fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("failed to rename asset into place at {}", final_path.display()))?;

        info!(expected_hash, "asset downloaded and verified");
        Ok(final_path)
    }

    /// Delete an asset file. Called by the Reaper only once the Catalog
    /// confirms no remaining reference (`spec.md` §3 Lifecycle).
    pub async fn remove(&self, asset_key: &str) -> Result<()> {
        let path = self.path_for(asset_key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(asset_key, err = %e, "failed to remove asset file");
                Err(e.into())
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn path_for_and_contains() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).await.unwrap();
        assert!(!store.contains("abc").await);

        let path = store.path_for("abc");
        tokio::fs::write(&path, b"hello").await.unwrap();
        assert!(store.contains("abc").await);
    }

    #[tokio::test]
    async fn verify_on_disk_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).await.unwrap();

        let real_hash = format!("{:x}", Sha256::digest(b"payload"));
        tokio::fs::write(store.path_for(&real_hash), b"payload")
            .await
            .unwrap();
        assert!(store.verify_on_disk(&real_hash).await.unwrap());

        // Corrupt it in place.
        tokio::fs::write(store.path_for(&real_hash), b"tampered")
            .await
            .unwrap();
        assert!(!store.verify_on_disk(&real_hash).await.unwrap());
    }

    #[tokio::test]
    async fn remove_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).await.unwrap();
        store.remove("does-not-exist").await.unwrap();
    }
}
