use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::stream;
use tokio::time::sleep;

use crate::application::ports::crdt::{CrdtDoc, CrdtFactory};
use crate::application::ports::snapshot_store::SnapshotStore;
use crate::domain::{BucketId, DocumentKey, Origin, SyncError};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a clean, unsubscribed document stays resident before the
    /// sweeper evicts it.
    pub idle_grace: Duration,
    /// Write-behind delay between an apply and the snapshot flush it
    /// schedules.
    pub flush_debounce: Duration,
    /// Bound on concurrent snapshot writes during `flush_all`.
    pub flush_parallelism: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(300),
            flush_debounce: Duration::from_millis(600),
            flush_parallelism: 8,
        }
    }
}

pub struct UpdateRecord {
    pub seq: u64,
    pub origin: Origin,
    pub bytes: Vec<u8>,
}

struct DocState {
    doc: Box<dyn CrdtDoc>,
    seq: u64,
    log: Vec<UpdateRecord>,
    dirty: bool,
    last_activity: Instant,
    subscribers: usize,
}

struct LiveDocument {
    state: Mutex<DocState>,
}

/// Authoritative registry of live documents. In-memory operations run under
/// one short-hold lock per document and never suspend; everything that
/// touches the object store happens outside the lock against a
/// point-in-time copy.
pub struct DocumentStore {
    docs: RwLock<HashMap<DocumentKey, Arc<LiveDocument>>>,
    load_gates: tokio::sync::Mutex<HashMap<DocumentKey, Arc<tokio::sync::Mutex<()>>>>,
    closed_buckets: RwLock<HashSet<BucketId>>,
    flush_flags: Mutex<HashSet<DocumentKey>>,
    snapshots: Arc<dyn SnapshotStore>,
    crdt: Arc<dyn CrdtFactory>,
    cfg: StoreConfig,
}

impl DocumentStore {
    pub fn new(
        snapshots: Arc<dyn SnapshotStore>,
        crdt: Arc<dyn CrdtFactory>,
        cfg: StoreConfig,
    ) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            load_gates: tokio::sync::Mutex::new(HashMap::new()),
            closed_buckets: RwLock::new(HashSet::new()),
            flush_flags: Mutex::new(HashSet::new()),
            snapshots,
            crdt,
            cfg,
        }
    }

    fn lookup(&self, key: &DocumentKey) -> Option<Arc<LiveDocument>> {
        self.docs.read().expect("store lock poisoned").get(key).cloned()
    }

    fn bucket_closed(&self, bucket: &BucketId) -> bool {
        self.closed_buckets
            .read()
            .expect("store lock poisoned")
            .contains(bucket)
    }

    pub fn bucket_is_closed(&self, bucket: &BucketId) -> bool {
        self.bucket_closed(bucket)
    }

    /// Marks a bucket closed for the non-suspending apply fast path. The
    /// adapter-side tombstone marker is the durable record; this cache is
    /// seeded from it on attach.
    pub fn mark_bucket_closed(&self, bucket: &BucketId) {
        self.closed_buckets
            .write()
            .expect("store lock poisoned")
            .insert(*bucket);
    }

    /// Loads or returns the live document. Concurrent callers for the same
    /// key share a single snapshot load through a per-key gate.
    async fn get_or_load(
        &self,
        key: &DocumentKey,
        bump_subscriber: bool,
        dirty_when_new: bool,
    ) -> Result<Arc<LiveDocument>, SyncError> {
        if self.bucket_closed(key.bucket()) {
            return Err(SyncError::BucketClosed(*key.bucket()));
        }
        if let Some(live) = self.lookup(key) {
            if bump_subscriber {
                let mut state = live.state.lock().expect("doc lock poisoned");
                state.subscribers += 1;
                state.last_activity = Instant::now();
            }
            return Ok(live);
        }

        let gate = {
            let mut gates = self.load_gates.lock().await;
            gates.entry(key.clone()).or_default().clone()
        };
        let _guard = gate.lock().await;

        // Another caller may have finished the load while we waited.
        if let Some(live) = self.lookup(key) {
            if bump_subscriber {
                let mut state = live.state.lock().expect("doc lock poisoned");
                state.subscribers += 1;
                state.last_activity = Instant::now();
            }
            self.load_gates.lock().await.remove(key);
            return Ok(live);
        }

        let tombstoned = self
            .snapshots
            .is_tombstoned(key.bucket())
            .await
            .map_err(|source| SyncError::SnapshotUnavailable {
                key: key.clone(),
                source,
            })?;
        if tombstoned {
            self.mark_bucket_closed(key.bucket());
            self.load_gates.lock().await.remove(key);
            return Err(SyncError::BucketClosed(*key.bucket()));
        }

        let text = match self.snapshots.load_text(key).await {
            Ok(text) => text,
            Err(source) => {
                self.load_gates.lock().await.remove(key);
                return Err(SyncError::SnapshotUnavailable {
                    key: key.clone(),
                    source,
                });
            }
        };

        let mut doc = self.crdt.create();
        let loaded_empty = text.is_empty();
        if !loaded_empty {
            let _ = doc.replace_text(&text);
        }
        let live = Arc::new(LiveDocument {
            state: Mutex::new(DocState {
                doc,
                seq: 0,
                log: Vec::new(),
                dirty: dirty_when_new && loaded_empty,
                last_activity: Instant::now(),
                subscribers: usize::from(bump_subscriber),
            }),
        });
        self.docs
            .write()
            .expect("store lock poisoned")
            .insert(key.clone(), live.clone());
        self.load_gates.lock().await.remove(key);
        Ok(live)
    }

    /// Subscribes a caller to the document, creating it from its snapshot
    /// when needed. Returns the full encoded CRDT state.
    pub async fn attach(&self, key: &DocumentKey) -> Result<Vec<u8>, SyncError> {
        let live = self.get_or_load(key, true, false).await?;
        let state = live.state.lock().expect("doc lock poisoned");
        Ok(state.doc.encode_state())
    }

    /// Ensures a document exists without taking a subscription; a brand-new
    /// document is marked dirty so its (possibly empty) snapshot object
    /// gets written. Returns the encoded state.
    pub async fn create(&self, key: &DocumentKey) -> Result<Vec<u8>, SyncError> {
        let live = self.get_or_load(key, false, true).await?;
        let state = live.state.lock().expect("doc lock poisoned");
        Ok(state.doc.encode_state())
    }

    /// Encoded state of an already-live document; no load, no subscription
    /// bookkeeping.
    pub fn encode_state(&self, key: &DocumentKey) -> Option<Vec<u8>> {
        let live = self.lookup(key)?;
        let state = live.state.lock().expect("doc lock poisoned");
        Some(state.doc.encode_state())
    }

    /// Applies one update. Atomic on the CRDT; a rejected payload leaves
    /// state, sequence and log untouched. Never suspends.
    pub fn apply(
        &self,
        key: &DocumentKey,
        update: &[u8],
        origin: Origin,
    ) -> Result<u64, SyncError> {
        if self.bucket_closed(key.bucket()) {
            return Err(SyncError::BucketClosed(*key.bucket()));
        }
        let live = self
            .lookup(key)
            .ok_or_else(|| SyncError::NotSubscribed(key.clone()))?;
        let mut state = live.state.lock().expect("doc lock poisoned");
        state.doc.apply_update(update)?;
        state.seq += 1;
        let seq = state.seq;
        state.log.push(UpdateRecord {
            seq,
            origin,
            bytes: update.to_vec(),
        });
        state.dirty = true;
        state.last_activity = Instant::now();
        Ok(seq)
    }

    /// Materialized text at the current state.
    pub fn snapshot_text(&self, key: &DocumentKey) -> Option<String> {
        let live = self.lookup(key)?;
        let state = live.state.lock().expect("doc lock poisoned");
        Some(state.doc.text())
    }

    /// Writes the materialized text through the snapshot adapter. The write
    /// observes a point-in-time copy; the document lock is never held
    /// across the I/O. On success the dirty flag clears and the log
    /// compacts, unless a concurrent apply raced the write.
    pub async fn flush(&self, key: &DocumentKey) -> anyhow::Result<bool> {
        let Some(live) = self.lookup(key) else {
            return Ok(false);
        };
        let (text, seq_at) = {
            let state = live.state.lock().expect("doc lock poisoned");
            if !state.dirty {
                return Ok(false);
            }
            (state.doc.text(), state.seq)
        };
        if let Err(e) = self.snapshots.save_text(key, &text).await {
            // A closed bucket is a terminal refusal; everything else is a
            // retriable save failure for the periodic flush loop.
            let closed = matches!(
                e.downcast_ref::<SyncError>(),
                Some(SyncError::BucketClosed(_))
            );
            return if closed {
                Err(e)
            } else {
                Err(anyhow::Error::new(SyncError::Transient(e)))
            };
        }
        let mut state = live.state.lock().expect("doc lock poisoned");
        if state.seq == seq_at {
            state.dirty = false;
            state.log.clear();
        }
        Ok(true)
    }

    /// Write-behind: collapses a burst of applies into one flush after the
    /// debounce window. A failed flush leaves the document dirty for the
    /// periodic retry loop.
    pub fn schedule_flush(self: &Arc<Self>, key: &DocumentKey) {
        {
            let mut flags = self.flush_flags.lock().expect("store lock poisoned");
            if !flags.insert(key.clone()) {
                return;
            }
        }
        let store = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            sleep(store.cfg.flush_debounce).await;
            let should_run = {
                let mut flags = store.flush_flags.lock().expect("store lock poisoned");
                flags.remove(&key)
            };
            if should_run {
                if let Err(e) = store.flush(&key).await {
                    tracing::warn!(key = %key, error = ?e, "debounced_flush_failed");
                }
            }
        });
    }

    /// Flushes every dirty document with bounded parallelism. Failures are
    /// logged and do not block other flushes; the failing documents stay
    /// dirty and resident.
    pub async fn flush_all(&self) {
        let keys: Vec<DocumentKey> = {
            let docs = self.docs.read().expect("store lock poisoned");
            docs.iter()
                .filter(|(_, live)| live.state.lock().expect("doc lock poisoned").dirty)
                .map(|(key, _)| key.clone())
                .collect()
        };
        stream::iter(keys)
            .for_each_concurrent(self.cfg.flush_parallelism, |key| async move {
                if let Err(e) = self.flush(&key).await {
                    tracing::error!(key = %key, error = ?e, "flush_failed");
                }
            })
            .await;
    }

    /// Drops one subscription; the document becomes eligible for eviction
    /// once the count is zero and the state is clean.
    pub fn release(&self, key: &DocumentKey) {
        if let Some(live) = self.lookup(key) {
            let mut state = live.state.lock().expect("doc lock poisoned");
            state.subscribers = state.subscribers.saturating_sub(1);
            state.last_activity = Instant::now();
        }
    }

    /// Removes the document outright (file deleted). Snapshot objects are
    /// left to the object store's own lifecycle.
    pub fn remove(&self, key: &DocumentKey) -> bool {
        self.docs
            .write()
            .expect("store lock poisoned")
            .remove(key)
            .is_some()
    }

    /// Eviction pass: drops documents with no subscribers, no unsaved
    /// changes, and no activity inside the idle grace. Purely memory
    /// management; the next attach rehydrates from the snapshot.
    pub fn sweep(&self) {
        let grace = self.cfg.idle_grace;
        let mut docs = self.docs.write().expect("store lock poisoned");
        docs.retain(|key, live| {
            let state = live.state.lock().expect("doc lock poisoned");
            let keep =
                state.subscribers > 0 || state.dirty || state.last_activity.elapsed() < grace;
            if !keep {
                tracing::debug!(key = %key, "document_evicted");
            }
            keep
        });
    }

    pub fn keys_in_bucket(&self, bucket: &BucketId) -> Vec<DocumentKey> {
        let docs = self.docs.read().expect("store lock poisoned");
        docs.keys()
            .filter(|key| key.bucket() == bucket)
            .cloned()
            .collect()
    }

    pub fn remove_bucket_docs(&self, bucket: &BucketId) {
        let mut docs = self.docs.write().expect("store lock poisoned");
        docs.retain(|key, _| key.bucket() != bucket);
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.docs.read().expect("store lock poisoned").contains_key(key)
    }

    pub fn subscriber_count(&self, key: &DocumentKey) -> usize {
        self.lookup(key)
            .map(|live| live.state.lock().expect("doc lock poisoned").subscribers)
            .unwrap_or(0)
    }

    pub fn log_len(&self, key: &DocumentKey) -> usize {
        self.lookup(key)
            .map(|live| live.state.lock().expect("doc lock poisoned").log.len())
            .unwrap_or(0)
    }

    pub fn is_dirty(&self, key: &DocumentKey) -> bool {
        self.lookup(key)
            .map(|live| live.state.lock().expect("doc lock poisoned").dirty)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::crdt::YrsFactory;
    use crate::infrastructure::snapshot::MemorySnapshotStore;

    fn store_with(
        snapshots: Arc<MemorySnapshotStore>,
        cfg: StoreConfig,
    ) -> Arc<DocumentStore> {
        Arc::new(DocumentStore::new(
            snapshots,
            Arc::new(YrsFactory),
            cfg,
        ))
    }

    fn replace_update(text: &str) -> Vec<u8> {
        use crate::application::ports::crdt::CrdtFactory;
        let mut doc = YrsFactory.create();
        doc.replace_text(text)
    }

    fn key(bucket: BucketId, path: &str) -> DocumentKey {
        DocumentKey::new(bucket, path).unwrap()
    }

    #[tokio::test]
    async fn attach_hydrates_from_snapshot() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let k = key(BucketId::new(), "main.py");
        snapshots.put_text(&k, "print('seed')\n");

        let store = store_with(snapshots, StoreConfig::default());
        store.attach(&k).await.unwrap();
        assert_eq!(store.snapshot_text(&k).unwrap(), "print('seed')\n");
        assert_eq!(store.subscriber_count(&k), 1);
        assert!(!store.is_dirty(&k));
    }

    #[tokio::test]
    async fn concurrent_attaches_share_one_snapshot_load() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let k = key(BucketId::new(), "main.py");
        snapshots.put_text(&k, "seed");

        let store = store_with(snapshots.clone(), StoreConfig::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move { store.attach(&k).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(snapshots.load_count(), 1);
        assert_eq!(store.subscriber_count(&k), 8);
    }

    #[tokio::test]
    async fn apply_bumps_sequence_and_appends_the_log() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let store = store_with(snapshots, StoreConfig::default());
        let k = key(BucketId::new(), "main.py");
        store.attach(&k).await.unwrap();

        let seq1 = store
            .apply(&k, &replace_update("a"), Origin::Server)
            .unwrap();
        let seq2 = store
            .apply(&k, &replace_update("b"), Origin::Server)
            .unwrap();
        assert_eq!((seq1, seq2), (1, 2));
        assert_eq!(store.log_len(&k), 2);
        assert!(store.is_dirty(&k));
    }

    #[tokio::test]
    async fn malformed_update_is_rejected_without_side_effects() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let store = store_with(snapshots, StoreConfig::default());
        let k = key(BucketId::new(), "main.py");
        store.attach(&k).await.unwrap();
        store
            .apply(&k, &replace_update("keep"), Origin::Server)
            .unwrap();

        let err = store
            .apply(&k, &[0xde, 0xad, 0xbe, 0xef], Origin::Server)
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedUpdate));
        assert_eq!(store.log_len(&k), 1);
        assert_eq!(store.snapshot_text(&k).unwrap(), "keep");
    }

    #[tokio::test]
    async fn flush_persists_text_and_compacts_the_log() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let store = store_with(snapshots.clone(), StoreConfig::default());
        let k = key(BucketId::new(), "main.py");
        store.attach(&k).await.unwrap();
        store
            .apply(&k, &replace_update("print('hi')\n"), Origin::Server)
            .unwrap();

        assert!(store.flush(&k).await.unwrap());
        assert_eq!(
            snapshots.stored_text(&k).unwrap(),
            "print('hi')\n"
        );
        assert!(!store.is_dirty(&k));
        assert_eq!(store.log_len(&k), 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_the_document_dirty() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let store = store_with(snapshots.clone(), StoreConfig::default());
        let k = key(BucketId::new(), "main.py");
        store.attach(&k).await.unwrap();
        store
            .apply(&k, &replace_update("unsaved"), Origin::Server)
            .unwrap();

        snapshots.set_fail_saves(true);
        assert!(store.flush(&k).await.is_err());
        assert!(store.is_dirty(&k));
        assert_eq!(store.log_len(&k), 1);

        snapshots.set_fail_saves(false);
        assert!(store.flush(&k).await.unwrap());
        assert_eq!(snapshots.stored_text(&k).unwrap(), "unsaved");
    }

    #[tokio::test]
    async fn eviction_only_touches_idle_clean_documents() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let cfg = StoreConfig {
            idle_grace: Duration::ZERO,
            ..Default::default()
        };
        let store = store_with(snapshots, cfg);
        let bucket = BucketId::new();

        let subscribed = key(bucket, "subscribed.py");
        store.attach(&subscribed).await.unwrap();

        let dirty = key(bucket, "dirty.py");
        store.attach(&dirty).await.unwrap();
        store
            .apply(&dirty, &replace_update("x"), Origin::Server)
            .unwrap();
        store.release(&dirty);

        let idle = key(bucket, "idle.py");
        store.attach(&idle).await.unwrap();
        store.release(&idle);

        store.sweep();
        assert!(store.contains(&subscribed));
        assert!(store.contains(&dirty));
        assert!(!store.contains(&idle));
    }

    #[tokio::test]
    async fn accepted_writes_survive_eviction() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let cfg = StoreConfig {
            idle_grace: Duration::ZERO,
            ..Default::default()
        };
        let store = store_with(snapshots, cfg);
        let k = key(BucketId::new(), "main.py");

        store.attach(&k).await.unwrap();
        store
            .apply(&k, &replace_update("durable\n"), Origin::Server)
            .unwrap();
        store.flush(&k).await.unwrap();
        store.release(&k);
        store.sweep();
        assert!(!store.contains(&k));

        store.attach(&k).await.unwrap();
        assert_eq!(store.snapshot_text(&k).unwrap(), "durable\n");
    }

    #[tokio::test]
    async fn closed_bucket_rejects_applies_and_attaches() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let store = store_with(snapshots, StoreConfig::default());
        let bucket = BucketId::new();
        let k = key(bucket, "main.py");
        store.attach(&k).await.unwrap();

        store.mark_bucket_closed(&bucket);
        assert!(matches!(
            store.apply(&k, &replace_update("x"), Origin::Server),
            Err(SyncError::BucketClosed(_))
        ));
        assert!(matches!(
            store.attach(&k).await,
            Err(SyncError::BucketClosed(_))
        ));
    }

    #[tokio::test]
    async fn tombstone_marker_is_discovered_on_attach() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let bucket = BucketId::new();
        snapshots.tombstone(&bucket).await.unwrap();

        let store = store_with(snapshots, StoreConfig::default());
        let k = key(bucket, "main.py");
        assert!(matches!(
            store.attach(&k).await,
            Err(SyncError::BucketClosed(_))
        ));
        // Cached for the synchronous path from here on.
        assert!(matches!(
            store.apply(&k, b"irrelevant", Origin::Server),
            Err(SyncError::BucketClosed(_))
        ));
    }

    #[tokio::test]
    async fn apply_on_unknown_document_is_not_subscribed() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let store = store_with(snapshots, StoreConfig::default());
        let k = key(BucketId::new(), "ghost.py");
        assert!(matches!(
            store.apply(&k, &replace_update("x"), Origin::Server),
            Err(SyncError::NotSubscribed(_))
        ));
    }
}
