use async_trait::async_trait;

use crate::domain::{BucketId, DocumentKey};

/// The only seam that talks to the object store. One object per
/// `(bucket, path)`; the body is the UTF-8 materialized text.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Current materialized text. A missing object is empty text, not an
    /// error.
    async fn load_text(&self, key: &DocumentKey) -> anyhow::Result<String>;

    /// Durable write, atomic from the observer's viewpoint. Rejected when
    /// the bucket is tombstoned.
    async fn save_text(&self, key: &DocumentKey, text: &str) -> anyhow::Result<()>;

    /// All file paths currently present in the bucket's snapshot.
    async fn list_paths(&self, bucket: &BucketId) -> anyhow::Result<Vec<String>>;

    /// Server-side deep copy of an entire bucket; returns the new handle.
    async fn clone_bucket(&self, src: &BucketId) -> anyhow::Result<BucketId>;

    /// Soft delete. Reads keep working for archival consumers; writes are
    /// rejected from here on.
    async fn tombstone(&self, bucket: &BucketId) -> anyhow::Result<()>;

    async fn is_tombstoned(&self, bucket: &BucketId) -> anyhow::Result<bool>;
}
