//! Per-file synchronization engine.
//!
//! One [`SharedFile`] exists per shared file and owns the buffer-
//! reconciliation state machine:
//!
//! ```text
//! Unsynced ──► Syncing ──► Synced ──► Closed
//!    ▲            │           │
//!    │            │ (rename bypasses Closed)
//!    └── lazily created on first local or remote reference
//! ```
//!
//! Local edits apply optimistically and broadcast tagged with the locally
//! known server version; remote edits are offset-transformed past unseen
//! history and pending local edits before application. `server_version`
//! advances only on receipt of a `TextChange`, including the echo of one's
//! own.
//!
//! Files are keyed by an opaque [`FileHandle`]; the display name is a
//! mutable attribute, so a rename never re-keys a map.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::buffer::{self, BufferError, TextBuffer, TransformSide};
use crate::protocol::{content_hash, BusEvent, HistoryRecord, ParticipantId, SessionMessage, TextEdit};

/// History ring capacity per file.
pub const HISTORY_CAPACITY: usize = 1000;

/// Unacknowledged local edits are pruned after this long (non-fatal).
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Stable per-file identity, owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(u64);

/// Lifecycle of a shared file's sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No file client exists yet.
    Unsynced,
    /// A `FileOpenRequest` is outstanding.
    Syncing,
    /// Normal bidirectional edit flow.
    Synced,
    /// Terminal: document closed locally and not mid-rename.
    Closed,
}

/// A point-in-time baseline used to answer `FileOpenRequest`s cheaply.
///
/// Snapshots chain: each one records the previous snapshot's content hash
/// as its pre-image and the history composed since then as
/// `edits_from_baseline`. A joiner whose local content hashes to the
/// pre-image needs only those edits plus the post-snapshot history.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub pre_image_hash: String,
    pub server_version: i64,
    pub edits_from_baseline: Vec<TextEdit>,
    pub text: String,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
struct PendingEdit {
    edits: Vec<TextEdit>,
    sent_at: Instant,
}

/// Result of consuming a remote (or echoed) `TextChange`.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedRemote {
    /// True when this was the echo of one of our own edits; the buffer was
    /// not touched and `edits` is empty.
    pub own_echo: bool,
    /// Transformed edits, in application order, for the editor surface.
    pub edits: Vec<TextEdit>,
    pub server_version: i64,
}

/// Per-file sync state: buffer, history ring, ack tracking, snapshot.
#[derive(Debug)]
pub struct SharedFile {
    handle: FileHandle,
    file_name: String,
    state: SyncState,
    local_id: ParticipantId,
    server_version: i64,
    buffer: TextBuffer,
    history: VecDeque<HistoryRecord>,
    pending_local: BTreeMap<u64, PendingEdit>,
    deferred: VecDeque<BusEvent>,
    is_read_only: bool,
    snapshot: Option<Snapshot>,
}

impl SharedFile {
    /// Host side: the local document is authoritative from the start.
    fn host_open(handle: FileHandle, file_name: String, local_id: ParticipantId, text: String) -> Self {
        let mut file = Self {
            handle,
            file_name,
            state: SyncState::Synced,
            local_id,
            server_version: 0,
            buffer: TextBuffer::from_text(text),
            history: VecDeque::new(),
            pending_local: BTreeMap::new(),
            deferred: VecDeque::new(),
            is_read_only: false,
            snapshot: None,
        };
        file.take_snapshot();
        file
    }

    /// Guest side: no content until the open handshake completes.
    fn guest_open(handle: FileHandle, file_name: String, local_id: ParticipantId) -> Self {
        Self {
            handle,
            file_name,
            state: SyncState::Unsynced,
            local_id,
            server_version: -1,
            buffer: TextBuffer::new(),
            history: VecDeque::new(),
            pending_local: BTreeMap::new(),
            deferred: VecDeque::new(),
            is_read_only: false,
            snapshot: None,
        }
    }

    pub fn handle(&self) -> FileHandle {
        self.handle
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn server_version(&self) -> i64 {
        self.server_version
    }

    pub fn text(&self) -> &str {
        self.buffer.text()
    }

    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_local.len()
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// `Unsynced → Syncing`: a `FileOpenRequest` is about to go out.
    pub fn begin_sync(&mut self) {
        if self.state == SyncState::Unsynced {
            self.state = SyncState::Syncing;
        }
    }

    /// Park a bus event that arrived while the open handshake is pending.
    pub fn defer(&mut self, event: BusEvent) {
        self.deferred.push_back(event);
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Record a local edit that the editor has already applied, mirror it
    /// into our buffer, and produce the broadcast message tagged with the
    /// locally known server version.
    pub fn record_local_edit(
        &mut self,
        send_id: u64,
        edits: Vec<TextEdit>,
    ) -> Result<SessionMessage, EngineError> {
        if self.is_read_only {
            return Err(EngineError::ReadOnly(self.file_name.clone()));
        }
        if self.state != SyncState::Synced {
            return Err(EngineError::NotSynced {
                file_name: self.file_name.clone(),
                state: self.state,
            });
        }
        let edits = buffer::sequentialize(edits);
        self.buffer.apply_all(&edits)?;
        self.pending_local.insert(
            send_id,
            PendingEdit {
                edits: edits.clone(),
                sent_at: Instant::now(),
            },
        );
        Ok(SessionMessage::TextChange {
            file_name: self.file_name.clone(),
            server_version: self.server_version,
            edits,
        })
    }

    /// Consume a `TextChange` delivered by the bus.
    ///
    /// Our own echo clears the matching pending entry and advances the
    /// version without touching the buffer. A remote change is transformed
    /// past history the sender had not seen and past our pending edits,
    /// then applied.
    pub fn apply_remote_change(
        &mut self,
        sender_id: ParticipantId,
        send_id: u64,
        tagged_version: i64,
        edits: &[TextEdit],
    ) -> Result<AppliedRemote, EngineError> {
        if self.state != SyncState::Synced {
            return Err(EngineError::NotSynced {
                file_name: self.file_name.clone(),
                state: self.state,
            });
        }

        if sender_id == self.local_id {
            let pending = self.pending_local.remove(&send_id);
            if pending.is_none() {
                // Echo arrived after the 5s prune; state already degraded.
                log::warn!(
                    "{}: echo for unknown sendId {send_id} (already pruned?)",
                    self.file_name
                );
            }
            self.server_version += 1;
            let recorded = pending.map(|p| p.edits).unwrap_or_else(|| edits.to_vec());
            self.push_history(HistoryRecord {
                server_version: self.server_version,
                sender_id,
                send_id,
                edits: recorded,
            });
            return Ok(AppliedRemote {
                own_echo: true,
                edits: Vec::new(),
                server_version: self.server_version,
            });
        }

        let mut incoming = buffer::sequentialize(edits.to_vec());

        // Shift past accepted history the sender could not have seen.
        // History sorted earlier in server order, so it wins offset ties.
        for record in self.history.iter() {
            if record.server_version > tagged_version && record.sender_id != sender_id {
                incoming = buffer::transform_all(&incoming, &record.edits, TransformSide::Earlier);
            }
        }
        // Shift past our optimistic, not-yet-acknowledged edits. Those
        // will be sequenced AFTER this change, so the incoming edit keeps
        // the position on a tie.
        for pending in self.pending_local.values() {
            incoming = buffer::transform_all(&incoming, &pending.edits, TransformSide::Later);
        }

        self.buffer.apply_all(&incoming)?;
        self.server_version += 1;
        self.push_history(HistoryRecord {
            server_version: self.server_version,
            sender_id,
            send_id,
            edits: incoming.clone(),
        });

        // Keep pending offsets meaningful for the next transform; the
        // applied change sorted earlier, so pendings shift past it.
        for pending in self.pending_local.values_mut() {
            pending.edits = buffer::transform_all(&pending.edits, &incoming, TransformSide::Earlier);
        }

        Ok(AppliedRemote {
            own_echo: false,
            edits: incoming,
            server_version: self.server_version,
        })
    }

    /// Build the reply to a joiner's `FileOpenRequest`.
    ///
    /// A hash matching the latest snapshot (or its pre-image) gets the
    /// cheap edit replay; anything else gets the snapshot text as fallback
    /// plus the same post-snapshot history.
    pub fn answer_open_request(&self, joiner_id: ParticipantId, requested_hash: &str) -> SessionMessage {
        let post_snapshot_history = |after: i64| -> Vec<HistoryRecord> {
            if let Some(oldest) = self.history.front() {
                if oldest.server_version > after + 1 {
                    log::warn!(
                        "{}: history ring no longer reaches v{} (oldest retained v{}), open acknowledge will be gappy",
                        self.file_name,
                        after + 1,
                        oldest.server_version
                    );
                }
            }
            self.history
                .iter()
                .filter(|r| r.server_version > after)
                .cloned()
                .collect()
        };

        match &self.snapshot {
            Some(snap) if requested_hash == snap.content_hash => SessionMessage::FileOpenAcknowledge {
                file_name: self.file_name.clone(),
                joiner_id,
                snapshot_server_version: snap.server_version,
                first_history_version: snap.server_version + 1,
                snapshot_edits: Vec::new(),
                fallback_text: None,
                history: post_snapshot_history(snap.server_version),
                is_read_only: self.is_read_only,
            },
            Some(snap) if requested_hash == snap.pre_image_hash => SessionMessage::FileOpenAcknowledge {
                file_name: self.file_name.clone(),
                joiner_id,
                snapshot_server_version: snap.server_version,
                first_history_version: snap.server_version + 1,
                snapshot_edits: snap.edits_from_baseline.clone(),
                fallback_text: None,
                history: post_snapshot_history(snap.server_version),
                is_read_only: self.is_read_only,
            },
            Some(snap) => SessionMessage::FileOpenAcknowledge {
                file_name: self.file_name.clone(),
                joiner_id,
                snapshot_server_version: snap.server_version,
                first_history_version: snap.server_version + 1,
                snapshot_edits: Vec::new(),
                fallback_text: Some(snap.text.clone()),
                history: post_snapshot_history(snap.server_version),
                is_read_only: self.is_read_only,
            },
            None => SessionMessage::FileOpenAcknowledge {
                file_name: self.file_name.clone(),
                joiner_id,
                snapshot_server_version: self.server_version,
                first_history_version: self.server_version + 1,
                snapshot_edits: Vec::new(),
                fallback_text: Some(self.buffer.text().to_string()),
                history: Vec::new(),
                is_read_only: self.is_read_only,
            },
        }
    }

    /// `Syncing → Synced`: seed the buffer from the acknowledge, replay
    /// history up to the host's version, and hand back the events parked
    /// while syncing so the session can flush them in event order.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_open_acknowledge(
        &mut self,
        snapshot_server_version: i64,
        first_history_version: i64,
        snapshot_edits: &[TextEdit],
        fallback_text: Option<&str>,
        history: Vec<HistoryRecord>,
        is_read_only: bool,
        baseline: Option<&str>,
    ) -> Result<Vec<BusEvent>, EngineError> {
        if self.state == SyncState::Synced {
            log::debug!("{}: duplicate open acknowledge ignored", self.file_name);
            return Ok(Vec::new());
        }

        match fallback_text {
            Some(text) => self.buffer.set_text(text),
            None => {
                let base = baseline.ok_or_else(|| EngineError::MissingBaseline(self.file_name.clone()))?;
                self.buffer.set_text(base);
                self.buffer.apply_all(snapshot_edits)?;
            }
        }
        self.server_version = snapshot_server_version;

        let mut expected = first_history_version;
        for record in history {
            if record.server_version != expected {
                log::warn!(
                    "{}: history gap replaying open acknowledge (expected v{expected}, got v{})",
                    self.file_name,
                    record.server_version
                );
            }
            self.buffer.apply_all(&record.edits)?;
            self.server_version = record.server_version;
            expected = record.server_version + 1;
            self.push_history(record);
        }

        self.is_read_only = is_read_only;
        self.state = SyncState::Synced;
        self.take_snapshot();
        Ok(self.deferred.drain(..).collect())
    }

    /// Drop unacknowledged local edits older than `timeout`. The edits were
    /// already applied optimistically; this only clears tracking state and
    /// reports which send ids went stale.
    pub fn prune_unacknowledged(&mut self, timeout: Duration) -> Vec<u64> {
        let stale: Vec<u64> = self
            .pending_local
            .iter()
            .filter(|(_, p)| p.sent_at.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.pending_local.remove(id);
        }
        stale
    }

    /// Refresh the snapshot chain after a save (or at creation).
    pub fn take_snapshot(&mut self) {
        let hash = content_hash(self.buffer.text());
        let (pre_image_hash, edits_from_baseline) = match &self.snapshot {
            Some(prev) => {
                let edits = self
                    .history
                    .iter()
                    .filter(|r| r.server_version > prev.server_version)
                    .flat_map(|r| r.edits.iter().cloned())
                    .collect();
                (prev.content_hash.clone(), edits)
            }
            None => (hash.clone(), Vec::new()),
        };
        self.snapshot = Some(Snapshot {
            pre_image_hash,
            server_version: self.server_version,
            edits_from_baseline,
            text: self.buffer.text().to_string(),
            content_hash: hash,
        });
    }

    /// Whether the change identified by `(sender_id, send_id)` is already
    /// in the history ring. Used to drop re-deliveries when flushing
    /// events that were parked during the open handshake: the replayed
    /// acknowledge may have folded the change in already, and the tagged
    /// version alone cannot tell a replayed change from a concurrent one.
    pub fn has_incorporated(&self, sender_id: ParticipantId, send_id: u64) -> bool {
        self.history
            .iter()
            .any(|r| r.sender_id == sender_id && r.send_id == send_id)
    }

    /// Whether a local undo/redo must be suppressed: the top of history is
    /// a remote edit that must not go through the native undo stack.
    pub fn intercept_undo(&self) -> bool {
        self.history
            .back()
            .is_some_and(|r| r.sender_id != self.local_id)
    }

    /// Whether stale-state queries (language services and the like) may be
    /// answered on behalf of `requester`: no unacknowledged local edits,
    /// and nothing from another participant after the requester's last edit.
    pub fn can_service(&self, requester: ParticipantId) -> bool {
        if !self.pending_local.is_empty() {
            return false;
        }
        match self.history.back() {
            None => true,
            Some(record) => record.sender_id == requester,
        }
    }

    /// `Synced → Closed`. Pending state is discarded; so is the undo
    /// relationship (a reopen starts a fresh stack).
    pub fn close(&mut self) {
        self.state = SyncState::Closed;
        self.pending_local.clear();
        self.deferred.clear();
    }

    fn rename(&mut self, new_name: String) {
        log::info!("renaming shared file {} -> {new_name}", self.file_name);
        self.file_name = new_name;
        // A close matched to a pending rename bypasses Closed entirely.
        if self.state == SyncState::Closed {
            self.state = SyncState::Synced;
        }
    }

    fn push_history(&mut self, record: HistoryRecord) {
        self.history.push_back(record);
        if self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Engine: the per-session collection of shared files
// ───────────────────────────────────────────────────────────────────

/// Owns every [`SharedFile`] of a session, keyed by stable handle with a
/// name index on the side.
#[derive(Debug)]
pub struct SyncEngine {
    local_id: ParticipantId,
    files: HashMap<FileHandle, SharedFile>,
    by_name: HashMap<String, FileHandle>,
    next_handle: u64,
}

impl SyncEngine {
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            files: HashMap::new(),
            by_name: HashMap::new(),
            next_handle: 0,
        }
    }

    fn allocate(&mut self) -> FileHandle {
        self.next_handle += 1;
        FileHandle(self.next_handle)
    }

    /// Host side: share a file whose local content is authoritative.
    pub fn open_host(&mut self, file_name: &str, text: String) -> FileHandle {
        if let Some(handle) = self.by_name.get(file_name) {
            return *handle;
        }
        let handle = self.allocate();
        let file = SharedFile::host_open(handle, file_name.to_string(), self.local_id, text);
        self.by_name.insert(file_name.to_string(), handle);
        self.files.insert(handle, file);
        handle
    }

    /// Guest side: create the unsynced client for a file we just learned of.
    pub fn open_guest(&mut self, file_name: &str) -> FileHandle {
        if let Some(handle) = self.by_name.get(file_name) {
            return *handle;
        }
        let handle = self.allocate();
        let file = SharedFile::guest_open(handle, file_name.to_string(), self.local_id);
        self.by_name.insert(file_name.to_string(), handle);
        self.files.insert(handle, file);
        handle
    }

    pub fn handle_for(&self, file_name: &str) -> Option<FileHandle> {
        self.by_name.get(file_name).copied()
    }

    pub fn get(&self, file_name: &str) -> Option<&SharedFile> {
        self.by_name.get(file_name).and_then(|h| self.files.get(h))
    }

    pub fn get_mut(&mut self, file_name: &str) -> Option<&mut SharedFile> {
        let handle = *self.by_name.get(file_name)?;
        self.files.get_mut(&handle)
    }

    pub fn by_handle(&self, handle: FileHandle) -> Option<&SharedFile> {
        self.files.get(&handle)
    }

    /// Re-point the name index; the handle and all sync state survive.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<FileHandle, EngineError> {
        let handle = self
            .by_name
            .remove(old_name)
            .ok_or_else(|| EngineError::UnknownFile(old_name.to_string()))?;
        self.by_name.insert(new_name.to_string(), handle);
        if let Some(file) = self.files.get_mut(&handle) {
            file.rename(new_name.to_string());
        }
        Ok(handle)
    }

    /// Destroy a file client (close without pending rename).
    pub fn remove(&mut self, file_name: &str) -> Option<SharedFile> {
        let handle = self.by_name.remove(file_name)?;
        let mut file = self.files.remove(&handle)?;
        file.close();
        Some(file)
    }

    /// Names of every file with a live (non-closed) client.
    pub fn open_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .files
            .values()
            .filter(|f| f.state() != SyncState::Closed)
            .map(|f| f.file_name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Prune unacknowledged edits across all files; returns
    /// `(file_name, send_id)` pairs for telemetry.
    pub fn prune_unacknowledged(&mut self, timeout: Duration) -> Vec<(String, u64)> {
        let mut pruned = Vec::new();
        for file in self.files.values_mut() {
            for send_id in file.prune_unacknowledged(timeout) {
                pruned.push((file.file_name().to_string(), send_id));
            }
        }
        pruned
    }
}

/// Engine errors.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    UnknownFile(String),
    ReadOnly(String),
    NotSynced { file_name: String, state: SyncState },
    MissingBaseline(String),
    Buffer(BufferError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownFile(name) => write!(f, "no sync client for file {name}"),
            Self::ReadOnly(name) => write!(f, "file {name} is read-only"),
            Self::NotSynced { file_name, state } => {
                write!(f, "file {file_name} is not synced (state {state:?})")
            }
            Self::MissingBaseline(name) => {
                write!(f, "no local baseline to apply snapshot edits for {name}")
            }
            Self::Buffer(e) => write!(f, "buffer error: {e}"),
        }
    }
}

impl From<BufferError> for EngineError {
    fn from(e: BufferError) -> Self {
        EngineError::Buffer(e)
    }
}

impl std::error::Error for EngineError {}
