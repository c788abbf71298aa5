use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::application::ports::bucket_access::BucketAccess;
use crate::application::ports::snapshot_store::SnapshotStore;
use crate::bootstrap::config::Config;
use crate::domain::{BucketId, SyncError};
use crate::infrastructure::crdt::YrsFactory;
use crate::infrastructure::realtime::{DocumentStore, RoomRouter, StoreConfig};
use crate::presentation::ws::protocol::WireMessage;

/// The one live engine per process. Constructed at startup and threaded
/// explicitly through every handler; documents are owned by the store,
/// rooms and sessions reach them by key.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    cfg: Config,
    store: Arc<DocumentStore>,
    router: Arc<RoomRouter>,
    snapshots: Arc<dyn SnapshotStore>,
    access: Arc<dyn BucketAccess>,
}

impl Engine {
    pub fn new(
        cfg: Config,
        snapshots: Arc<dyn SnapshotStore>,
        access: Arc<dyn BucketAccess>,
    ) -> Self {
        let store = Arc::new(DocumentStore::new(
            snapshots.clone(),
            Arc::new(YrsFactory),
            StoreConfig {
                idle_grace: Duration::from_secs(cfg.idle_evict_secs),
                flush_debounce: Duration::from_millis(cfg.flush_debounce_ms),
                flush_parallelism: cfg.flush_parallelism,
            },
        ));
        Self {
            inner: Arc::new(EngineInner {
                cfg,
                store,
                router: Arc::new(RoomRouter::new()),
                snapshots,
                access,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.inner.store
    }

    pub fn router(&self) -> &RoomRouter {
        &self.inner.router
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.inner.snapshots
    }

    pub fn access(&self) -> &dyn BucketAccess {
        self.inner.access.as_ref()
    }

    pub async fn list_bucket_paths(&self, bucket: &BucketId) -> anyhow::Result<Vec<String>> {
        self.inner.snapshots.list_paths(bucket).await
    }

    /// Server-side deep copy. Live documents of the source are flushed
    /// first so the copy reflects the latest accepted writes.
    pub async fn clone_bucket(&self, src: &BucketId) -> anyhow::Result<BucketId> {
        for key in self.inner.store.keys_in_bucket(src) {
            if let Err(e) = self.inner.store.flush(&key).await {
                tracing::warn!(key = %key, error = ?e, "pre_clone_flush_failed");
            }
        }
        self.inner.snapshots.clone_bucket(src).await
    }

    /// Soft delete. Order matters: one archival flush while writes are
    /// still accepted, then the durable marker, then live subscriptions
    /// are terminated with `BucketClosed` and the documents dropped.
    pub async fn tombstone_bucket(&self, bucket: &BucketId) -> anyhow::Result<()> {
        for key in self.inner.store.keys_in_bucket(bucket) {
            if let Err(e) = self.inner.store.flush(&key).await {
                tracing::warn!(key = %key, error = ?e, "pre_tombstone_flush_failed");
            }
        }
        self.inner.snapshots.tombstone(bucket).await?;
        self.inner.store.mark_bucket_closed(bucket);

        let frame = WireMessage::error_frame(&SyncError::BucketClosed(*bucket), Some(*bucket), None);
        self.inner.router.broadcast_bucket(bucket, &frame.encode(), None);
        let closed = self.inner.router.close_bucket(bucket);
        self.inner.store.remove_bucket_docs(bucket);
        tracing::info!(bucket = %bucket, rooms = closed.len(), "bucket_tombstoned");
        Ok(())
    }

    /// Shutdown path: flush every dirty document under a hard deadline,
    /// then let the process exit regardless.
    pub async fn shutdown_flush(&self) {
        let deadline = Duration::from_secs(self.inner.cfg.shutdown_deadline_secs);
        if timeout(deadline, self.inner.store.flush_all()).await.is_err() {
            tracing::error!(
                deadline_secs = self.inner.cfg.shutdown_deadline_secs,
                "shutdown_flush_deadline_exceeded"
            );
        }
    }
}
