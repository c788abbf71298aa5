use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use crate::domain::{BucketId, DocumentKey};

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Reader,
    Writer,
}

/// Sender half of one connection's outbound queue. The queue is bounded;
/// a full queue signals overflow instead of blocking peers, and the session
/// tears the connection down with `SlowConsumer`.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<String>,
    overflow: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                id,
                outbound: tx,
                overflow: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn overflow_signal(&self) -> Arc<Notify> {
        self.overflow.clone()
    }

    /// Enqueues one frame. Returns false when the frame was dropped because
    /// the queue is full (overflow signalled) or the session is gone.
    pub fn send(&self, frame: String) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflow.notify_one();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

struct Subscriber {
    handle: ConnectionHandle,
    role: Role,
    #[allow(dead_code)]
    joined_at: DateTime<Utc>,
}

/// Membership and fan-out. Rooms hold connection handles keyed by document;
/// documents themselves are owned solely by the store and reached by key.
#[derive(Default)]
pub struct RoomRouter {
    rooms: RwLock<HashMap<DocumentKey, HashMap<ConnectionId, Subscriber>>>,
    bucket_rooms: RwLock<HashMap<BucketId, HashMap<ConnectionId, ConnectionHandle>>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, key: &DocumentKey, handle: ConnectionHandle, role: Role) {
        let mut rooms = self.rooms.write().expect("router lock poisoned");
        rooms.entry(key.clone()).or_default().insert(
            handle.id(),
            Subscriber {
                handle,
                role,
                joined_at: Utc::now(),
            },
        );
    }

    /// Returns false when the connection was not a member.
    pub fn leave(&self, key: &DocumentKey, conn: ConnectionId) -> bool {
        let mut rooms = self.rooms.write().expect("router lock poisoned");
        let Some(members) = rooms.get_mut(key) else {
            return false;
        };
        let removed = members.remove(&conn).is_some();
        if members.is_empty() {
            rooms.remove(key);
        }
        removed
    }

    pub fn role_of(&self, key: &DocumentKey, conn: ConnectionId) -> Option<Role> {
        let rooms = self.rooms.read().expect("router lock poisoned");
        rooms.get(key).and_then(|m| m.get(&conn)).map(|s| s.role)
    }

    pub fn subscriber_count(&self, key: &DocumentKey) -> usize {
        let rooms = self.rooms.read().expect("router lock poisoned");
        rooms.get(key).map(|m| m.len()).unwrap_or(0)
    }

    /// Best-effort fan-out, never echoing the originating connection. A
    /// subscriber whose queue is full gets its overflow signal raised and
    /// loses this frame; peers are unaffected.
    pub fn broadcast(&self, key: &DocumentKey, frame: &str, except: Option<ConnectionId>) {
        let rooms = self.rooms.read().expect("router lock poisoned");
        let Some(members) = rooms.get(key) else {
            return;
        };
        for (conn, subscriber) in members {
            if Some(*conn) == except {
                continue;
            }
            if !subscriber.handle.send(frame.to_string()) {
                tracing::debug!(key = %key, conn = %conn, "broadcast_frame_dropped");
            }
        }
    }

    pub fn join_bucket(&self, bucket: &BucketId, handle: ConnectionHandle) {
        let mut rooms = self.bucket_rooms.write().expect("router lock poisoned");
        rooms.entry(*bucket).or_default().insert(handle.id(), handle);
    }

    pub fn leave_bucket(&self, bucket: &BucketId, conn: ConnectionId) {
        let mut rooms = self.bucket_rooms.write().expect("router lock poisoned");
        if let Some(members) = rooms.get_mut(bucket) {
            members.remove(&conn);
            if members.is_empty() {
                rooms.remove(bucket);
            }
        }
    }

    /// Fan-out for bucket-level events (file tree changes, bucket closure):
    /// reaches every connection interested in the bucket, subscribed to the
    /// affected document or not.
    pub fn broadcast_bucket(&self, bucket: &BucketId, frame: &str, except: Option<ConnectionId>) {
        let rooms = self.bucket_rooms.read().expect("router lock poisoned");
        let Some(members) = rooms.get(bucket) else {
            return;
        };
        for (conn, handle) in members {
            if Some(*conn) == except {
                continue;
            }
            if !handle.send(frame.to_string()) {
                tracing::debug!(bucket = %bucket, conn = %conn, "bucket_frame_dropped");
            }
        }
    }

    /// Removes a room wholesale (document deleted); returns the evicted
    /// member connections.
    pub fn close_room(&self, key: &DocumentKey) -> Vec<ConnectionId> {
        let mut rooms = self.rooms.write().expect("router lock poisoned");
        rooms
            .remove(key)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Removes every room under a bucket plus the bucket room itself;
    /// returns the closed document keys.
    pub fn close_bucket(&self, bucket: &BucketId) -> Vec<DocumentKey> {
        let mut closed = Vec::new();
        {
            let mut rooms = self.rooms.write().expect("router lock poisoned");
            rooms.retain(|key, _| {
                if key.bucket() == bucket {
                    closed.push(key.clone());
                    false
                } else {
                    true
                }
            });
        }
        let mut bucket_rooms = self.bucket_rooms.write().expect("router lock poisoned");
        bucket_rooms.remove(bucket);
        closed
    }

    /// Disconnect cleanup: removes the connection everywhere and returns
    /// the document keys it was subscribed to so the caller can release
    /// store references.
    pub fn leave_all(&self, conn: ConnectionId) -> Vec<DocumentKey> {
        let mut left = Vec::new();
        {
            let mut rooms = self.rooms.write().expect("router lock poisoned");
            rooms.retain(|key, members| {
                if members.remove(&conn).is_some() {
                    left.push(key.clone());
                }
                !members.is_empty()
            });
        }
        let mut bucket_rooms = self.bucket_rooms.write().expect("router lock poisoned");
        bucket_rooms.retain(|_, members| {
            members.remove(&conn);
            !members.is_empty()
        });
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(bucket: BucketId, path: &str) -> DocumentKey {
        DocumentKey::new(bucket, path).unwrap()
    }

    fn handle(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<String>) {
        ConnectionHandle::new(Uuid::new_v4(), capacity)
    }

    #[tokio::test]
    async fn broadcast_suppresses_the_originating_connection() {
        let router = RoomRouter::new();
        let k = key(BucketId::new(), "main.py");

        let (origin, mut origin_rx) = handle(8);
        let (peer, mut peer_rx) = handle(8);
        router.join(&k, origin.clone(), Role::Writer);
        router.join(&k, peer.clone(), Role::Writer);

        router.broadcast(&k, "frame-1", Some(origin.id()));

        assert_eq!(peer_rx.recv().await.unwrap(), "frame-1");
        assert!(origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_recipient_order_is_preserved() {
        let router = RoomRouter::new();
        let k = key(BucketId::new(), "main.py");
        let (peer, mut rx) = handle(16);
        router.join(&k, peer, Role::Reader);

        for i in 0..5 {
            router.broadcast(&k, &format!("frame-{i}"), None);
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), format!("frame-{i}"));
        }
    }

    #[tokio::test]
    async fn full_queue_raises_overflow_and_spares_peers() {
        let router = RoomRouter::new();
        let k = key(BucketId::new(), "main.py");

        let (slow, _slow_rx) = handle(1);
        let (fast, mut fast_rx) = handle(8);
        let overflowed = slow.overflow_signal();
        router.join(&k, slow, Role::Reader);
        router.join(&k, fast, Role::Reader);

        router.broadcast(&k, "a", None);
        router.broadcast(&k, "b", None);

        // The slow consumer's signal fired; the fast one saw every frame.
        tokio::time::timeout(std::time::Duration::from_millis(100), overflowed.notified())
            .await
            .expect("overflow signal expected");
        assert_eq!(fast_rx.recv().await.unwrap(), "a");
        assert_eq!(fast_rx.recv().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn close_room_evicts_all_members() {
        let router = RoomRouter::new();
        let k = key(BucketId::new(), "old.py");
        let (a, _) = handle(4);
        let (b, _) = handle(4);
        router.join(&k, a.clone(), Role::Writer);
        router.join(&k, b.clone(), Role::Writer);

        let evicted = router.close_room(&k);
        assert_eq!(evicted.len(), 2);
        assert_eq!(router.role_of(&k, a.id()), None);
        assert_eq!(router.subscriber_count(&k), 0);
    }

    #[tokio::test]
    async fn leave_all_reports_previous_memberships() {
        let router = RoomRouter::new();
        let bucket = BucketId::new();
        let k1 = key(bucket, "a.py");
        let k2 = key(bucket, "b.py");
        let (conn, _) = handle(4);
        router.join(&k1, conn.clone(), Role::Writer);
        router.join(&k2, conn.clone(), Role::Writer);
        router.join_bucket(&bucket, conn.clone());

        let mut left = router.leave_all(conn.id());
        left.sort_by(|a, b| a.path().cmp(b.path()));
        assert_eq!(left, vec![k1.clone(), k2.clone()]);
        assert_eq!(router.subscriber_count(&k1), 0);
    }

    #[tokio::test]
    async fn bucket_broadcast_reaches_bucket_members_only() {
        let router = RoomRouter::new();
        let bucket = BucketId::new();
        let other = BucketId::new();
        let (member, mut member_rx) = handle(4);
        let (outsider, mut outsider_rx) = handle(4);
        router.join_bucket(&bucket, member);
        router.join_bucket(&other, outsider);

        router.broadcast_bucket(&bucket, "tree-change", None);
        assert_eq!(member_rx.recv().await.unwrap(), "tree-change");
        assert!(outsider_rx.try_recv().is_err());
    }
}
