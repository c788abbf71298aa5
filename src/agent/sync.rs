use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::agent::config::AgentConfig;
use crate::agent::connection::{self, ConnectError, WsStream};
use crate::agent::debounce::{PendingWrites, QuietWindows};
use crate::agent::hash::sha256_hex;
use crate::agent::ignore::{self, SYNC_MARKER};
use crate::agent::watcher::{self, FsEvent, FsEventKind};
use crate::application::ports::crdt::{CrdtDoc, CrdtFactory};
use crate::domain::DocumentKey;
use crate::infrastructure::crdt::YrsFactory;
use crate::presentation::ws::protocol::{self, TreeAction, WireMessage};

type WsSink = SplitSink<WsStream, Message>;

/// Winner of a `document-state` reconciliation for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateDecision {
    /// Server wins; materialize its text on disk.
    WriteDisk,
    /// Local wins; push the file's bytes as a replacement update.
    PushLocal,
    /// Nothing to do.
    Nothing,
}

/// Server text never beats a non-empty local file when the server side is
/// empty: a freshly cloned bucket must not wipe what a terminal just
/// wrote. In every other divergence the object store is the durable
/// source of truth.
fn resolve_document_state(local: Option<&str>, server_text: &str) -> StateDecision {
    let local_text = local.unwrap_or("");
    if !local_text.is_empty() && server_text.is_empty() {
        return StateDecision::PushLocal;
    }
    if local_text == server_text || server_text.is_empty() {
        return StateDecision::Nothing;
    }
    StateDecision::WriteDisk
}

/// A burst of keystrokes batches under the long window; a change that
/// stands alone or carries substantial content flushes quickly.
fn is_significant(
    since_last_remote: Option<Duration>,
    update_len: usize,
    gap: Duration,
    len_threshold: usize,
) -> bool {
    since_last_remote.map_or(true, |since| since > gap) || update_len > len_threshold
}

/// Per-workspace agent state. Mirrors hold one CRDT replica per path so
/// remote updates can be materialized and local edits diffed into
/// replacement transactions.
pub struct Agent {
    cfg: AgentConfig,
    crdt: YrsFactory,
    http: reqwest::Client,
    mirrors: HashMap<String, Box<dyn CrdtDoc>>,
    pending: PendingWrites,
    quiet: QuietWindows,
    last_remote: HashMap<String, Instant>,
    subscribed: HashSet<String>,
    awaiting_state: HashSet<String>,
    initial_sync_done: bool,
    started: Instant,
}

impl Agent {
    pub fn new(cfg: AgentConfig) -> Self {
        Self {
            cfg,
            crdt: YrsFactory,
            http: reqwest::Client::new(),
            mirrors: HashMap::new(),
            pending: PendingWrites::new(),
            quiet: QuietWindows::new(),
            last_remote: HashMap::new(),
            subscribed: HashSet::new(),
            awaiting_state: HashSet::new(),
            initial_sync_done: false,
            started: Instant::now(),
        }
    }

    fn abs_path(&self, rel: &str) -> PathBuf {
        self.cfg.workspace.join(rel)
    }

    /// Workspace-relative path for a watcher event, already filtered
    /// through the ignore policy. None means the event is not ours.
    fn relative_path(&self, path: &std::path::Path) -> Option<String> {
        let rel = path.strip_prefix(&self.cfg.workspace).ok()?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        if rel.is_empty() || ignore::is_ignored(&rel) {
            return None;
        }
        // Normalization also guards against odd watcher paths.
        DocumentKey::new(self.cfg.bucket, &rel).map(|key| key.path().to_string())
    }

    fn subscribe_frame(&self, rel: &str) -> WireMessage {
        WireMessage::SubscribeDocument {
            bucket_id: self.cfg.bucket,
            file_path: rel.to_string(),
        }
    }

    fn update_frame(&self, rel: &str, update: &[u8]) -> WireMessage {
        WireMessage::YjsUpdate {
            bucket_id: self.cfg.bucket,
            file_path: rel.to_string(),
            update: protocol::encode_payload(update),
        }
    }

    /// Files currently on disk, workspace-relative, ignore policy applied.
    fn local_files(&self) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        for entry in WalkDir::new(&self.cfg.workspace)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(rel) = self.relative_path(entry.path()) {
                files.insert(rel);
            }
        }
        files
    }

    fn write_file(&mut self, rel: &str, text: &str) {
        let abs = self.abs_path(rel);
        if let Some(parent) = abs.parent() {
            if let Err(error) = std::fs::create_dir_all(parent) {
                warn!(path = %rel, ?error, "create_parent_dirs_failed");
                return;
            }
        }
        // Quiet window first: the write below fires a watcher event that
        // must not loop back into a CRDT update.
        self.quiet
            .mark(rel, Instant::now() + self.cfg.quiet_window);
        if let Err(error) = std::fs::write(&abs, text.as_bytes()) {
            warn!(path = %rel, ?error, "disk_write_failed");
        } else {
            debug!(path = %rel, bytes = text.len(), "disk_write");
        }
    }

    fn read_local(&self, rel: &str) -> Option<String> {
        match std::fs::read_to_string(self.abs_path(rel)) {
            Ok(content) => Some(content),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                warn!(path = %rel, ?error, "disk_read_failed");
                None
            }
        }
    }

    /// Handles one `document-state` frame; returns frames to send back.
    fn apply_document_state(&mut self, rel: &str, state: &[u8]) -> Vec<WireMessage> {
        self.awaiting_state.remove(rel);
        let mut doc = match self.crdt.from_state(state) {
            Ok(doc) => doc,
            Err(error) => {
                warn!(path = %rel, %error, "document_state_rejected");
                return Vec::new();
            }
        };
        let server_text = doc.text();
        let local = self.read_local(rel);
        let mut out = Vec::new();
        match resolve_document_state(local.as_deref(), &server_text) {
            StateDecision::WriteDisk => {
                debug!(path = %rel, "document_state_server_wins");
                self.write_file(rel, &server_text);
            }
            StateDecision::PushLocal => {
                debug!(path = %rel, "document_state_local_wins");
                let local_text = local.unwrap_or_default();
                let update = doc.replace_text(&local_text);
                out.push(self.update_frame(rel, &update));
            }
            StateDecision::Nothing => {}
        }
        self.mirrors.insert(rel.to_string(), doc);
        out
    }

    /// Handles one remote `yjs-update`; the write to disk is debounced and
    /// cancelled by any filesystem event on the same path.
    fn apply_remote_update(&mut self, rel: &str, update: &[u8]) {
        let mirror = self
            .mirrors
            .entry(rel.to_string())
            .or_insert_with(|| self.crdt.create());
        if let Err(error) = mirror.apply_update(update) {
            warn!(path = %rel, %error, "remote_update_rejected");
            return;
        }
        let since = self.last_remote.get(rel).map(|t| t.elapsed());
        let delay = if is_significant(
            since,
            update.len(),
            self.cfg.significant_gap,
            self.cfg.significant_len,
        ) {
            self.cfg.short_debounce
        } else {
            self.cfg.long_debounce
        };
        let disk_hash = std::fs::read(self.abs_path(rel)).ok().map(|b| sha256_hex(&b));
        self.pending.schedule(rel, delay, disk_hash);
        self.last_remote.insert(rel.to_string(), Instant::now());
    }

    fn handle_frame(&mut self, frame: WireMessage) -> Vec<WireMessage> {
        match frame {
            WireMessage::DocumentState {
                file_path, state, ..
            } => {
                let Some(bytes) = protocol::decode_payload(&state) else {
                    warn!(path = %file_path, "document_state_payload_undecodable");
                    return Vec::new();
                };
                self.apply_document_state(&file_path, &bytes)
            }
            WireMessage::YjsUpdate {
                file_path, update, ..
            } => {
                let Some(bytes) = protocol::decode_payload(&update) else {
                    warn!(path = %file_path, "update_payload_undecodable");
                    return Vec::new();
                };
                self.apply_remote_update(&file_path, &bytes);
                Vec::new()
            }
            WireMessage::FileTreeChange {
                file_path, action, ..
            } => self.apply_tree_change(&file_path, action),
            WireMessage::Error { code, message, .. } => {
                warn!(%code, %message, "server_error_frame");
                Vec::new()
            }
            // Client-originated kinds are not expected inbound.
            other => {
                debug!(?other, "unexpected_inbound_frame");
                Vec::new()
            }
        }
    }

    fn apply_tree_change(&mut self, rel: &str, action: TreeAction) -> Vec<WireMessage> {
        match action {
            TreeAction::Create => {
                let abs = self.abs_path(rel);
                if !abs.exists() {
                    self.write_file(rel, "");
                }
                if self.subscribed.insert(rel.to_string()) {
                    return vec![self.subscribe_frame(rel)];
                }
                Vec::new()
            }
            TreeAction::Delete => {
                self.pending.cancel(rel);
                self.mirrors.remove(rel);
                self.subscribed.remove(rel);
                self.awaiting_state.remove(rel);
                // The unlink below fires a Remove event; keep it out of the
                // update path.
                self.quiet
                    .mark(rel, Instant::now() + self.cfg.quiet_window);
                let abs = self.abs_path(rel);
                match std::fs::remove_file(&abs) {
                    Ok(()) => info!(path = %rel, "file_deleted_by_peer"),
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                    Err(error) => warn!(path = %rel, ?error, "disk_delete_failed"),
                }
                Vec::new()
            }
        }
    }

    /// One watcher event. The filesystem is authoritative: any pending
    /// remote write for the path dies here.
    fn handle_fs_event(&mut self, event: FsEvent) -> Vec<WireMessage> {
        let Some(rel) = self.relative_path(&event.path) else {
            return Vec::new();
        };
        if self.quiet.is_quiet(&rel, Instant::now()) {
            debug!(path = %rel, "watcher_event_in_quiet_window");
            return Vec::new();
        }
        self.pending.cancel(&rel);

        match event.kind {
            FsEventKind::Add | FsEventKind::Change => {
                if !event.path.is_file() {
                    return Vec::new();
                }
                let Some(content) = self.read_local(&rel) else {
                    return Vec::new();
                };
                let newly_tracked = !self.mirrors.contains_key(&rel);
                let mirror = self
                    .mirrors
                    .entry(rel.clone())
                    .or_insert_with(|| self.crdt.create());
                if mirror.text() == content {
                    return Vec::new();
                }
                let update = mirror.replace_text(&content);
                let mut out = Vec::new();
                if newly_tracked && !self.subscribed.contains(&rel) {
                    out.push(WireMessage::FileTreeChange {
                        bucket_id: self.cfg.bucket,
                        file_path: rel.clone(),
                        action: TreeAction::Create,
                    });
                    out.push(self.subscribe_frame(&rel));
                    self.subscribed.insert(rel.clone());
                }
                out.push(self.update_frame(&rel, &update));
                out
            }
            FsEventKind::Delete => {
                let was_tracked =
                    self.mirrors.remove(&rel).is_some() | self.subscribed.remove(&rel);
                self.awaiting_state.remove(&rel);
                self.last_remote.remove(&rel);
                if was_tracked {
                    vec![WireMessage::FileTreeChange {
                        bucket_id: self.cfg.bucket,
                        file_path: rel,
                        action: TreeAction::Delete,
                    }]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Fires every pending write whose debounce window has elapsed. The
    /// disk hash recorded at schedule time must still match; otherwise the
    /// filesystem moved underneath us and its own event will resync.
    fn flush_due_at(&mut self, now: Instant) -> usize {
        let due = self.pending.drain_due(now);
        let mut written = 0;
        for (rel, pw) in due {
            let Some(mirror) = self.mirrors.get(&rel) else {
                continue;
            };
            let disk = std::fs::read(self.abs_path(&rel)).ok();
            let disk_hash = disk.as_deref().map(sha256_hex);
            if disk_hash != pw.expected_disk_hash {
                debug!(path = %rel, "pending_write_superseded_by_disk");
                continue;
            }
            let text = mirror.text();
            let matches_disk = disk
                .as_deref()
                .map(|bytes| bytes == text.as_bytes())
                .unwrap_or(false);
            if matches_disk {
                continue;
            }
            self.write_file(&rel, &text);
            written += 1;
        }
        written
    }

    /// Initial reconciliation is complete when every startup path has had
    /// its `document-state` processed, or after a hard timeout. Surfaced
    /// via a marker file so external supervisors can detect readiness.
    fn check_initial_sync(&mut self) {
        if self.initial_sync_done {
            return;
        }
        let timed_out = self.started.elapsed() > self.cfg.initial_sync_timeout;
        if !self.awaiting_state.is_empty() && !timed_out {
            return;
        }
        if timed_out && !self.awaiting_state.is_empty() {
            warn!(
                pending = self.awaiting_state.len(),
                "initial_sync_timed_out"
            );
        }
        self.initial_sync_done = true;
        let marker = self.cfg.workspace.join(SYNC_MARKER);
        if let Err(error) = std::fs::write(&marker, b"ok\n") {
            warn!(?error, "sync_marker_write_failed");
        } else {
            info!("initial_sync_complete");
        }
    }

    /// Paths to (re-)subscribe: everything known locally, from the startup
    /// list, or already tracked. Server-side subscribes are idempotent.
    fn known_paths(&self) -> BTreeSet<String> {
        let mut paths = self.local_files();
        paths.extend(self.subscribed.iter().cloned());
        paths.extend(self.awaiting_state.iter().cloned());
        paths.extend(self.mirrors.keys().cloned());
        paths
    }

    async fn send_frames(&self, ws_tx: &mut WsSink, frames: Vec<WireMessage>) -> anyhow::Result<()> {
        for frame in frames {
            ws_tx
                .send(Message::text(frame.encode()))
                .await
                .context("websocket send failed")?;
        }
        Ok(())
    }

    /// Drives one connected session until the socket drops. Handler
    /// failures are logged and the loop continues; only transport errors
    /// escape to trigger a reconnect.
    async fn run_connected(
        &mut self,
        stream: WsStream,
        fs_rx: &mut mpsc::Receiver<FsEvent>,
    ) -> anyhow::Result<()> {
        let (mut ws_tx, mut ws_rx) = stream.split();

        match connection::fetch_file_list(
            &self.http,
            &self.cfg.files_url(),
            &self.cfg.service_token,
        )
        .await
        {
            Ok(paths) => {
                for path in paths {
                    if ignore::is_ignored(&path) {
                        continue;
                    }
                    if !self.initial_sync_done && !self.mirrors.contains_key(&path) {
                        self.awaiting_state.insert(path.clone());
                    }
                    self.subscribed.insert(path);
                }
            }
            Err(error) => {
                warn!(?error, "file_list_fetch_failed");
            }
        }

        let known = self.known_paths();
        self.subscribed.extend(known.iter().cloned());
        let subscribe_now: Vec<WireMessage> =
            known.iter().map(|rel| self.subscribe_frame(rel)).collect();
        self.send_frames(&mut ws_tx, subscribe_now).await?;

        let mut resub = tokio::time::interval(self.cfg.resubscribe_interval);
        resub.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        resub.tick().await; // first tick completes immediately

        loop {
            let next_deadline = self.pending.next_deadline();
            let write_timer = async move {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                inbound = ws_rx.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(frame) = WireMessage::decode(text.as_str()) {
                                let out = self.handle_frame(frame);
                                self.send_frames(&mut ws_tx, out).await?;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(error)) => return Err(error.into()),
                    }
                }
                event = fs_rx.recv() => {
                    let Some(event) = event else {
                        anyhow::bail!("watcher channel closed");
                    };
                    let out = self.handle_fs_event(event);
                    self.send_frames(&mut ws_tx, out).await?;
                }
                _ = write_timer => {
                    self.flush_due_at(Instant::now());
                }
                _ = resub.tick() => {
                    let frames: Vec<WireMessage> = self
                        .known_paths()
                        .iter()
                        .map(|rel| self.subscribe_frame(rel))
                        .collect();
                    self.send_frames(&mut ws_tx, frames).await?;
                }
            }

            self.check_initial_sync();
        }
    }
}

/// Agent entrypoint: watch the workspace, mirror it against the server,
/// reconnect forever. Only a rejected handshake on the very first attempt
/// is fatal; server unreachability never is.
pub async fn run(cfg: AgentConfig) -> anyhow::Result<()> {
    info!(
        workspace = %cfg.workspace.display(),
        bucket = %cfg.bucket,
        container = %cfg.container_id,
        "agent starting"
    );

    let (fs_tx, mut fs_rx) = mpsc::channel(1024);
    let _watcher = watcher::spawn(&cfg.workspace, fs_tx)
        .with_context(|| format!("failed to watch {}", cfg.workspace.display()))?;

    let mut agent = Agent::new(cfg);
    let mut first_attempt = true;
    let mut attempt: u32 = 0;

    loop {
        match connection::connect(&agent.cfg.ws_url()).await {
            Ok(stream) => {
                first_attempt = false;
                attempt = 0;
                info!("connected to sync server");
                if let Err(error) = agent.run_connected(stream, &mut fs_rx).await {
                    warn!(?error, "session ended");
                } else {
                    info!("server closed the session");
                }
            }
            Err(ConnectError::Rejected(status)) if first_attempt => {
                anyhow::bail!("handshake rejected with status {status}");
            }
            Err(error) => {
                warn!(%error, "connect failed");
            }
        }
        attempt = attempt.saturating_add(1);
        let delay = connection::backoff_delay(attempt, agent.cfg.reconnect_max_backoff);
        debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff");
        sleep(delay).await;
    }
}
