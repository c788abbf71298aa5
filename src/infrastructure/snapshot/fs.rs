use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::task;
use walkdir::WalkDir;

use crate::application::ports::snapshot_store::SnapshotStore;
use crate::domain::{BucketId, DocumentKey, SyncError};

const TOMBSTONE_MARKER: &str = "tombstone";

/// Local-disk backend for development and single-host deployments.
/// Layout: `<root>/<bucket>/files/<path>`, with a `tombstone` marker beside
/// the `files` directory. Writes go through write-temp-then-rename so an
/// observer never sees a partial object.
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &BucketId) -> PathBuf {
        self.root.join(bucket.to_string())
    }

    fn files_dir(&self, bucket: &BucketId) -> PathBuf {
        self.bucket_dir(bucket).join("files")
    }

    fn object_path(&self, key: &DocumentKey) -> PathBuf {
        // Key paths are normalized at construction; no traversal components
        // can reach here.
        self.files_dir(key.bucket()).join(key.path())
    }

    fn marker_path(&self, bucket: &BucketId) -> PathBuf {
        self.bucket_dir(bucket).join(TOMBSTONE_MARKER)
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn load_text(&self, key: &DocumentKey) -> anyhow::Result<String> {
        let path = self.object_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8(bytes)
                .with_context(|| format!("snapshot for {key} is not valid UTF-8")),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read snapshot {}", path.display()))
            }
        }
    }

    async fn save_text(&self, key: &DocumentKey, text: &str) -> anyhow::Result<()> {
        if self.is_tombstoned(key.bucket()).await? {
            return Err(anyhow::Error::new(SyncError::BucketClosed(*key.bucket())));
        }
        let target = self.object_path(key);
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.files_dir(key.bucket()));
        let bytes = text.as_bytes().to_vec();
        task::spawn_blocking(move || -> anyhow::Result<()> {
            std::fs::create_dir_all(&parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)
                .context("failed to create temp snapshot file")?;
            tmp.write_all(&bytes)
                .context("failed to write temp snapshot file")?;
            tmp.persist(&target)
                .with_context(|| format!("failed to persist snapshot {}", target.display()))?;
            Ok(())
        })
        .await
        .context("snapshot write task join")?
    }

    async fn list_paths(&self, bucket: &BucketId) -> anyhow::Result<Vec<String>> {
        let files_dir = self.files_dir(bucket);
        task::spawn_blocking(move || {
            let mut paths = Vec::new();
            if !files_dir.exists() {
                return Ok(paths);
            }
            for entry in WalkDir::new(&files_dir).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&files_dir) {
                    paths.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
            paths.sort();
            Ok(paths)
        })
        .await
        .context("snapshot list task join")?
    }

    async fn clone_bucket(&self, src: &BucketId) -> anyhow::Result<BucketId> {
        let dst = BucketId::new();
        let src_dir = self.files_dir(src);
        let dst_dir = self.files_dir(&dst);
        task::spawn_blocking(move || -> anyhow::Result<()> {
            std::fs::create_dir_all(&dst_dir)
                .with_context(|| format!("failed to create {}", dst_dir.display()))?;
            if !src_dir.exists() {
                return Ok(());
            }
            for entry in WalkDir::new(&src_dir).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&src_dir)
                    .context("walked path escaped source dir")?;
                let target = dst_dir.join(rel);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                std::fs::copy(entry.path(), &target).with_context(|| {
                    format!("failed to copy {} to {}", entry.path().display(), target.display())
                })?;
            }
            Ok(())
        })
        .await
        .context("snapshot clone task join")??;
        Ok(dst)
    }

    async fn tombstone(&self, bucket: &BucketId) -> anyhow::Result<()> {
        let dir = self.bucket_dir(bucket);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        tokio::fs::write(self.marker_path(bucket), b"")
            .await
            .context("failed to write tombstone marker")
    }

    async fn is_tombstoned(&self, bucket: &BucketId) -> anyhow::Result<bool> {
        Ok(tokio::fs::try_exists(self.marker_path(bucket))
            .await
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(bucket: BucketId, path: &str) -> DocumentKey {
        DocumentKey::new(bucket, path).unwrap()
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsSnapshotStore::new(tmp.path());
        let k = key(BucketId::new(), "src/main.py");

        store.save_text(&k, "print('hi')\n").await.unwrap();
        assert_eq!(store.load_text(&k).await.unwrap(), "print('hi')\n");
    }

    #[tokio::test]
    async fn missing_object_is_empty_text() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsSnapshotStore::new(tmp.path());
        let text = store
            .load_text(&key(BucketId::new(), "nope.py"))
            .await
            .unwrap();
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn list_paths_walks_nested_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsSnapshotStore::new(tmp.path());
        let bucket = BucketId::new();
        store.save_text(&key(bucket, "a.py"), "a").await.unwrap();
        store
            .save_text(&key(bucket, "pkg/mod/b.py"), "b")
            .await
            .unwrap();

        assert_eq!(
            store.list_paths(&bucket).await.unwrap(),
            vec!["a.py".to_string(), "pkg/mod/b.py".to_string()]
        );
    }

    #[tokio::test]
    async fn tombstoned_bucket_rejects_saves() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsSnapshotStore::new(tmp.path());
        let bucket = BucketId::new();
        let k = key(bucket, "main.py");
        store.save_text(&k, "before").await.unwrap();

        store.tombstone(&bucket).await.unwrap();
        let err = store.save_text(&k, "after").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::BucketClosed(_))
        ));
        assert_eq!(store.load_text(&k).await.unwrap(), "before");
    }

    #[tokio::test]
    async fn clone_bucket_copies_the_tree() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsSnapshotStore::new(tmp.path());
        let src = BucketId::new();
        store
            .save_text(&key(src, "dir/file.txt"), "copied")
            .await
            .unwrap();

        let dst = store.clone_bucket(&src).await.unwrap();
        assert_eq!(
            store.load_text(&key(dst, "dir/file.txt")).await.unwrap(),
            "copied"
        );
    }
}
