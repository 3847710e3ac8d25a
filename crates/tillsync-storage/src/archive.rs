use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tillsync_core::SyncWindow;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedBatch {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes were already archived for this window.
    pub deduplicated: bool,
}

/// Content-addressed archive of raw ledger batches, one directory per
/// window and source.
#[derive(Debug, Clone)]
pub struct FetchArchive {
    root: PathBuf,
}

impl FetchArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(window: &SyncWindow, source_id: &str, content_hash: &str) -> PathBuf {
        let span = format!(
            "{}-{}",
            window.min.format("%Y%m%dT%H%M%S"),
            window.max.format("%Y%m%dT%H%M%S")
        );
        PathBuf::from(window.min.format("%Y-%m-%d").to_string())
            .join(span)
            .join(source_id)
            .join(window.scope.as_deref().unwrap_or("all"))
            .join(format!("{content_hash}.json"))
    }

    pub async fn store_batch(
        &self,
        window: &SyncWindow,
        source_id: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedBatch> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path_for(window, source_id, &content_hash);
        let target = self.root.join(&relative_path);
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let already_there = fs::try_exists(&target)
            .await
            .with_context(|| format!("checking archive path {}", target.display()))?;
        let deduplicated = already_there || !write_atomically(&dir, &target, bytes).await?;

        Ok(ArchivedBatch {
            content_hash,
            relative_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Write through a temp file in `dir` and rename onto `target`. Returns
/// `false` when another writer got there first.
async fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let temp_path = dir.join(format!(".{}.partial", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| format!("renaming into {}", target.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn window() -> SyncWindow {
        SyncWindow::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).single().unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 7, 0).single().unwrap(),
        )
        .with_scope(Some("store-7".into()))
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            FetchArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn path_groups_by_day_window_source_and_scope() {
        let path = FetchArchive::relative_path_for(&window(), "ledger-http", "abc");
        assert_eq!(
            path,
            PathBuf::from("2026-03-02/20260302T100000-20260302T100700/ledger-http/store-7/abc.json")
        );
    }

    #[tokio::test]
    async fn identical_batches_are_stored_once() {
        let dir = tempdir().expect("tempdir");
        let archive = FetchArchive::new(dir.path());

        let first = archive
            .store_batch(&window(), "ledger-http", br#"[{"id":"r-1"}]"#)
            .await
            .expect("first store");
        let second = archive
            .store_batch(&window(), "ledger-http", br#"[{"id":"r-1"}]"#)
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(dir.path().join(&first.relative_path).exists());
    }
}
