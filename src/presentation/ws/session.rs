use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::timeout;
use uuid::Uuid;

use crate::application::access::{Capability, Peer};
use crate::bootstrap::engine::Engine;
use crate::domain::{BucketId, DocumentKey, Origin, SyncError};
use crate::infrastructure::realtime::{ConnectionHandle, Role};
use crate::presentation::auth;
use crate::presentation::ws::protocol::{self, TreeAction, WireMessage};

#[derive(Debug, Deserialize, Clone)]
pub struct AuthQuery {
    pub token: Option<String>,
    pub access_token: Option<String>,
}

pub async fn ws_entry(
    ws: WebSocketUpgrade,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    State(engine): State<Engine>,
) -> Result<impl IntoResponse, StatusCode> {
    let token = query.token.or(query.access_token).or_else(|| {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok().map(|s| s.to_owned()))
            .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.to_string()))
    });

    let peer = token
        .as_deref()
        .and_then(|t| auth::resolve_peer(&engine.config().auth_secret, t))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    Ok(ws.on_upgrade(move |socket| run_session(socket, engine, peer)))
}

/// Simple token bucket for per-connection inbound throttling.
struct TokenBucket {
    tokens: f64,
    rate: f64,
    burst: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            tokens: burst,
            rate,
            burst,
            last: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        self.tokens =
            (self.tokens + now.duration_since(self.last).as_secs_f64() * self.rate).min(self.burst);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-connection protocol state. Membership authority stays with the
/// router; the local set only drives cleanup and idempotent re-subscribes.
pub struct SessionState {
    engine: Engine,
    peer: Peer,
    conn_id: Uuid,
    handle: ConnectionHandle,
    subscriptions: HashSet<DocumentKey>,
    joined_buckets: HashSet<BucketId>,
    malformed_strikes: u32,
}

impl SessionState {
    pub fn new(engine: Engine, peer: Peer, handle: ConnectionHandle) -> Self {
        let conn_id = handle.id();
        let mut state = Self {
            engine,
            peer,
            conn_id,
            handle,
            subscriptions: HashSet::new(),
            joined_buckets: HashSet::new(),
            malformed_strikes: 0,
        };
        // Container agents receive bucket-level events (file tree changes,
        // bucket closure) from the moment they connect.
        if let Peer::ContainerAgent { bucket, .. } = state.peer.clone() {
            state
                .engine
                .router()
                .join_bucket(&bucket, state.handle.clone());
            state.joined_buckets.insert(bucket);
        }
        state
    }

    pub fn connection_id(&self) -> Uuid {
        self.conn_id
    }

    fn origin(&self) -> Origin {
        match &self.peer {
            Peer::ContainerAgent { .. } => Origin::FilesystemSync { conn: self.conn_id },
            _ => Origin::Peer { conn: self.conn_id },
        }
    }

    /// Reports one error to this connection. Returns `Err` when the session
    /// must close (fatal kinds, or a run of malformed frames past the
    /// strike limit).
    fn report(
        &mut self,
        err: SyncError,
        bucket_id: Option<BucketId>,
        file_path: Option<String>,
    ) -> Result<(), SyncError> {
        let frame = WireMessage::error_frame(&err, bucket_id, file_path);
        self.handle.send(frame.encode());
        if err.closes_connection() {
            return Err(err);
        }
        if matches!(err, SyncError::MalformedUpdate) {
            self.malformed_strikes += 1;
            if self.malformed_strikes > self.engine.config().malformed_strike_limit {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn capability(&self, bucket: &BucketId) -> Result<Capability, SyncError> {
        self.peer.capability(self.engine.access(), bucket).await
    }

    pub async fn handle_message(&mut self, msg: WireMessage) -> Result<(), SyncError> {
        match msg {
            WireMessage::SubscribeDocument {
                bucket_id,
                file_path,
            } => self.handle_subscribe(bucket_id, file_path).await,
            WireMessage::UnsubscribeDocument {
                bucket_id,
                file_path,
            } => self.handle_unsubscribe(bucket_id, file_path),
            WireMessage::YjsUpdate {
                bucket_id,
                file_path,
                update,
            } => self.handle_update(bucket_id, file_path, update).await,
            WireMessage::FileTreeChange {
                bucket_id,
                file_path,
                action,
            } => self.handle_tree_change(bucket_id, file_path, action).await,
            // Server-originated kinds are not accepted inbound.
            WireMessage::DocumentState { bucket_id, file_path, .. } => self.report(
                SyncError::MalformedUpdate,
                Some(bucket_id),
                Some(file_path),
            ),
            WireMessage::Error { code, .. } => {
                tracing::debug!(conn = %self.conn_id, code = %code, "peer_error_frame_ignored");
                Ok(())
            }
        }
    }

    async fn handle_subscribe(
        &mut self,
        bucket_id: BucketId,
        file_path: String,
    ) -> Result<(), SyncError> {
        let Some(key) = DocumentKey::new(bucket_id, &file_path) else {
            return self.report(SyncError::MalformedUpdate, Some(bucket_id), Some(file_path));
        };
        let cap = match self.capability(&bucket_id).await {
            Ok(cap) => cap,
            Err(err) => return self.report(err, Some(bucket_id), Some(file_path)),
        };

        // Re-subscribes are idempotent: refresh the state without another
        // attach so subscriber counts stay honest.
        if self.subscriptions.contains(&key) {
            if let Some(state) = self.engine.store().encode_state(&key) {
                self.handle.send(
                    WireMessage::DocumentState {
                        bucket_id,
                        file_path,
                        state: protocol::encode_payload(&state),
                    }
                    .encode(),
                );
                return Ok(());
            }
            // The document vanished under us (tree delete); fall through to
            // a fresh attach.
            self.subscriptions.remove(&key);
        }

        let state = match self.engine.store().attach(&key).await {
            Ok(state) => state,
            Err(err) => return self.report(err, Some(bucket_id), Some(file_path)),
        };
        let role = if cap == Capability::Write {
            Role::Writer
        } else {
            Role::Reader
        };
        self.engine.router().join(&key, self.handle.clone(), role);
        if self.joined_buckets.insert(bucket_id) {
            self.engine
                .router()
                .join_bucket(&bucket_id, self.handle.clone());
        }
        self.subscriptions.insert(key);
        self.handle.send(
            WireMessage::DocumentState {
                bucket_id,
                file_path,
                state: protocol::encode_payload(&state),
            }
            .encode(),
        );
        Ok(())
    }

    fn handle_unsubscribe(
        &mut self,
        bucket_id: BucketId,
        file_path: String,
    ) -> Result<(), SyncError> {
        let Some(key) = DocumentKey::new(bucket_id, &file_path) else {
            return self.report(SyncError::MalformedUpdate, Some(bucket_id), Some(file_path));
        };
        if !self.engine.router().leave(&key, self.conn_id) {
            self.subscriptions.remove(&key);
            return self.report(
                SyncError::NotSubscribed(key),
                Some(bucket_id),
                Some(file_path),
            );
        }
        self.engine.store().release(&key);
        self.subscriptions.remove(&key);
        Ok(())
    }

    async fn handle_update(
        &mut self,
        bucket_id: BucketId,
        file_path: String,
        update: String,
    ) -> Result<(), SyncError> {
        let Some(key) = DocumentKey::new(bucket_id, &file_path) else {
            return self.report(SyncError::MalformedUpdate, Some(bucket_id), Some(file_path));
        };
        // Scope is re-checked on every document touch; a compromised
        // connection cannot cross buckets.
        if let Err(err) = self.capability(&bucket_id).await {
            return self.report(err, Some(bucket_id), Some(file_path));
        }
        if self.engine.store().bucket_is_closed(&bucket_id) {
            return self.report(
                SyncError::BucketClosed(bucket_id),
                Some(bucket_id),
                Some(file_path),
            );
        }
        match self.engine.router().role_of(&key, self.conn_id) {
            None => {
                return self.report(
                    SyncError::NotSubscribed(key),
                    Some(bucket_id),
                    Some(file_path),
                );
            }
            Some(Role::Reader) => {
                return self.report(SyncError::Unauthorized, Some(bucket_id), Some(file_path));
            }
            Some(Role::Writer) => {}
        }
        let Some(bytes) = protocol::decode_payload(&update) else {
            return self.report(SyncError::MalformedUpdate, Some(bucket_id), Some(file_path));
        };
        match self.engine.store().apply(&key, &bytes, self.origin()) {
            Ok(_seq) => {
                self.engine.store().schedule_flush(&key);
                let frame = WireMessage::YjsUpdate {
                    bucket_id,
                    file_path,
                    update,
                };
                self.engine
                    .router()
                    .broadcast(&key, &frame.encode(), Some(self.conn_id));
                Ok(())
            }
            Err(err) => self.report(err, Some(bucket_id), Some(file_path)),
        }
    }

    async fn handle_tree_change(
        &mut self,
        bucket_id: BucketId,
        file_path: String,
        action: TreeAction,
    ) -> Result<(), SyncError> {
        let Some(key) = DocumentKey::new(bucket_id, &file_path) else {
            return self.report(SyncError::MalformedUpdate, Some(bucket_id), Some(file_path));
        };
        match self.capability(&bucket_id).await {
            Ok(Capability::Write) => {}
            Ok(_) => {
                return self.report(SyncError::Unauthorized, Some(bucket_id), Some(file_path));
            }
            Err(err) => return self.report(err, Some(bucket_id), Some(file_path)),
        }
        if self.engine.store().bucket_is_closed(&bucket_id) {
            return self.report(
                SyncError::BucketClosed(bucket_id),
                Some(bucket_id),
                Some(file_path),
            );
        }
        let frame = WireMessage::FileTreeChange {
            bucket_id,
            file_path: file_path.clone(),
            action,
        };
        match action {
            TreeAction::Create => {
                if let Err(err) = self.engine.store().create(&key).await {
                    return self.report(err, Some(bucket_id), Some(file_path));
                }
                // Persist the (possibly empty) object so startup listings
                // see the new file.
                self.engine.store().schedule_flush(&key);
                self.engine
                    .router()
                    .broadcast_bucket(&bucket_id, &frame.encode(), Some(self.conn_id));
                Ok(())
            }
            TreeAction::Delete => {
                self.engine
                    .router()
                    .broadcast_bucket(&bucket_id, &frame.encode(), Some(self.conn_id));
                let evicted = self.engine.router().close_room(&key);
                self.engine.store().remove(&key);
                self.subscriptions.remove(&key);
                tracing::debug!(key = %key, evicted = evicted.len(), "document_deleted");
                Ok(())
            }
        }
    }

    /// Disconnect cleanup: membership out of the router, references out of
    /// the store.
    pub fn teardown(&mut self) {
        for key in self.engine.router().leave_all(self.conn_id) {
            self.engine.store().release(&key);
        }
        self.subscriptions.clear();
    }
}

async fn run_session(socket: WebSocket, engine: Engine, peer: Peer) {
    let cfg = engine.config().clone();
    let conn_id = Uuid::new_v4();
    let (handle, mut outbound_rx) = ConnectionHandle::new(conn_id, cfg.outbound_queue);
    let overflow = handle.overflow_signal();
    let handler_budget = Duration::from_millis(cfg.handler_budget_ms);
    let heartbeat = Duration::from_secs(cfg.heartbeat_secs);

    tracing::debug!(conn = %conn_id, peer = ?peer, "session_open");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let last_beat = Arc::new(Mutex::new(Instant::now()));

    // Writer: drains the bounded outbound queue, pings on the heartbeat
    // interval, and gives up when a liveness beat is overdue.
    let writer_beat = last_beat.clone();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if ws_tx.send(WsMessage::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping.tick() => {
                    let stale = writer_beat
                        .lock()
                        .expect("liveness lock poisoned")
                        .elapsed()
                        > heartbeat * 2;
                    if stale || ws_tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut session = SessionState::new(engine, peer, handle.clone());
    let mut limiter = TokenBucket::new(cfg.rate_limit_per_sec, cfg.rate_limit_burst);

    loop {
        tokio::select! {
            _ = overflow.notified() => {
                tracing::warn!(conn = %conn_id, "session_slow_consumer");
                handle.send(
                    WireMessage::error_frame(&SyncError::SlowConsumer, None, None).encode(),
                );
                break;
            }
            inbound = ws_rx.next() => {
                let Some(Ok(message)) = inbound else { break };
                *last_beat.lock().expect("liveness lock poisoned") = Instant::now();
                let text = match message {
                    WsMessage::Text(text) => text,
                    WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                    WsMessage::Close(_) => break,
                    WsMessage::Binary(_) => {
                        if session
                            .report(SyncError::MalformedUpdate, None, None)
                            .is_err()
                        {
                            break;
                        }
                        continue;
                    }
                };
                if !limiter.allow() {
                    // Typed reject; the excess message itself is dropped.
                    handle.send(
                        WireMessage::Error {
                            code: "throttled".into(),
                            message: "message rate limit exceeded".into(),
                            bucket_id: None,
                            file_path: None,
                        }
                        .encode(),
                    );
                    continue;
                }
                let Some(msg) = WireMessage::decode(&text) else {
                    if session
                        .report(SyncError::MalformedUpdate, None, None)
                        .is_err()
                    {
                        break;
                    }
                    continue;
                };
                match timeout(handler_budget, session.handle_message(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::debug!(conn = %conn_id, error = %err, "session_closing");
                        break;
                    }
                    Err(_) => {
                        handle.send(
                            WireMessage::error_frame(&SyncError::HandlerTimeout, None, None)
                                .encode(),
                        );
                        tracing::warn!(conn = %conn_id, "session_handler_timeout");
                        break;
                    }
                }
            }
        }
    }

    session.teardown();
    drop(handle);
    drop(session);
    let _ = writer.await;
    tracing::debug!(conn = %conn_id, "session_closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_allows_bursts_then_throttles() {
        let mut bucket = TokenBucket::new(0.0, 3.0);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1000.0, 1.0);
        assert!(bucket.allow());
        assert!(!bucket.allow());
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.allow());
    }
}
