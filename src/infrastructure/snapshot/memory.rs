use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::bail;
use async_trait::async_trait;

use crate::application::ports::snapshot_store::SnapshotStore;
use crate::domain::{BucketId, DocumentKey, SyncError};

/// In-process adapter used by the test suite and embeddable deployments.
#[derive(Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<HashMap<BucketId, BucketState>>,
    fail_saves: AtomicBool,
    loads: AtomicUsize,
}

#[derive(Default)]
struct BucketState {
    files: HashMap<String, String>,
    tombstoned: bool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `save_text` fail until reset. Lets tests
    /// exercise the retry/stay-dirty path.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of `load_text` calls observed so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn stored_text(&self, key: &DocumentKey) -> Option<String> {
        let inner = self.inner.lock().expect("snapshot map poisoned");
        inner
            .get(key.bucket())
            .and_then(|b| b.files.get(key.path()).cloned())
    }

    pub fn put_text(&self, key: &DocumentKey, text: &str) {
        let mut inner = self.inner.lock().expect("snapshot map poisoned");
        inner
            .entry(*key.bucket())
            .or_default()
            .files
            .insert(key.path().to_string(), text.to_string());
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load_text(&self, key: &DocumentKey) -> anyhow::Result<String> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().expect("snapshot map poisoned");
        Ok(inner
            .get(key.bucket())
            .and_then(|b| b.files.get(key.path()).cloned())
            .unwrap_or_default())
    }

    async fn save_text(&self, key: &DocumentKey, text: &str) -> anyhow::Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            bail!("injected save failure");
        }
        let mut inner = self.inner.lock().expect("snapshot map poisoned");
        let bucket = inner.entry(*key.bucket()).or_default();
        if bucket.tombstoned {
            return Err(anyhow::Error::new(SyncError::BucketClosed(*key.bucket())));
        }
        bucket.files.insert(key.path().to_string(), text.to_string());
        Ok(())
    }

    async fn list_paths(&self, bucket: &BucketId) -> anyhow::Result<Vec<String>> {
        let inner = self.inner.lock().expect("snapshot map poisoned");
        let mut paths: Vec<String> = inner
            .get(bucket)
            .map(|b| b.files.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        Ok(paths)
    }

    async fn clone_bucket(&self, src: &BucketId) -> anyhow::Result<BucketId> {
        let mut inner = self.inner.lock().expect("snapshot map poisoned");
        let files = inner
            .get(src)
            .map(|b| b.files.clone())
            .unwrap_or_default();
        let dst = BucketId::new();
        inner.insert(
            dst,
            BucketState {
                files,
                tombstoned: false,
            },
        );
        Ok(dst)
    }

    async fn tombstone(&self, bucket: &BucketId) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("snapshot map poisoned");
        inner.entry(*bucket).or_default().tombstoned = true;
        Ok(())
    }

    async fn is_tombstoned(&self, bucket: &BucketId) -> anyhow::Result<bool> {
        let inner = self.inner.lock().expect("snapshot map poisoned");
        Ok(inner.get(bucket).map(|b| b.tombstoned).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(bucket: BucketId, path: &str) -> DocumentKey {
        DocumentKey::new(bucket, path).unwrap()
    }

    #[tokio::test]
    async fn missing_object_reads_as_empty_text() {
        let store = MemorySnapshotStore::new();
        let text = store
            .load_text(&key(BucketId::new(), "main.py"))
            .await
            .unwrap();
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn tombstone_rejects_writes_but_keeps_reads() {
        let store = MemorySnapshotStore::new();
        let bucket = BucketId::new();
        let k = key(bucket, "main.py");

        store.save_text(&k, "print('a')").await.unwrap();
        store.tombstone(&bucket).await.unwrap();

        assert!(store.is_tombstoned(&bucket).await.unwrap());
        assert_eq!(store.load_text(&k).await.unwrap(), "print('a')");

        let err = store.save_text(&k, "print('b')").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::BucketClosed(_))
        ));
    }

    #[tokio::test]
    async fn clone_copies_files_into_a_fresh_bucket() {
        let store = MemorySnapshotStore::new();
        let src = BucketId::new();
        store
            .save_text(&key(src, "a.py"), "a")
            .await
            .unwrap();
        store
            .save_text(&key(src, "lib/b.py"), "b")
            .await
            .unwrap();

        let dst = store.clone_bucket(&src).await.unwrap();
        assert_ne!(src, dst);
        assert_eq!(
            store.list_paths(&dst).await.unwrap(),
            vec!["a.py".to_string(), "lib/b.py".to_string()]
        );
        assert!(!store.is_tombstoned(&dst).await.unwrap());
    }
}
