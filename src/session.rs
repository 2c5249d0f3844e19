//! Session client: the per-participant orchestrator.
//!
//! Everything the session does funnels through one mpsc queue and one
//! consumer task:
//!
//! ```text
//!   bus events ──┐
//!   editor hooks ─┤──▶ mpsc ──▶ SessionClient::run ──▶ engine / docs / bus
//!   timers ───────┘              (single consumer,
//!                                 strict FIFO)
//! ```
//!
//! The single-consumer shape is the concurrency model: handlers are plain
//! synchronous functions, so per-file state never needs its own locking and
//! message order is exactly arrival order. Inbound bus events, local editor
//! hooks (edits, selections, open/close/save), file-service change batches,
//! and the ack-prune tick all land in the same queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::editor::{DocumentError, DocumentStore};
use crate::engine::{EngineError, SyncEngine, SyncState, ACK_TIMEOUT};
use crate::follow::{FollowController, FollowError, Reveal};
use crate::position::{ParticipantPosition, PositionTracker};
use crate::protocol::{
    content_hash, BusEvent, Envelope, ParticipantId, SessionMessage, TextEdit, HOST_ID,
};

/// Queue depth for the session's event channel.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// View column used for jump-to navigation (the user's active pane).
const JUMP_COLUMN: usize = 0;

/// One participant as the session roster knows them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantProfile {
    pub id: ParticipantId,
    pub display_name: String,
}

/// Per-session identity and roster.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub local_id: ParticipantId,
    pub is_host: bool,
    /// Other participants, in join order. Never contains `local_id`.
    pub participants: Vec<ParticipantProfile>,
    /// The file the local user is editing, if any.
    pub active_file: Option<String>,
}

impl SessionContext {
    /// The sharing side. The host always takes the reserved first id.
    pub fn host() -> Self {
        Self {
            local_id: HOST_ID,
            is_host: true,
            participants: Vec::new(),
            active_file: None,
        }
    }

    /// A joining side with an assigned id.
    pub fn guest(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            is_host: local_id == HOST_ID,
            participants: Vec::new(),
            active_file: None,
        }
    }

    /// Roster ids with the local participant first.
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        let mut ids = vec![self.local_id];
        for p in &self.participants {
            if !ids.contains(&p.id) {
                ids.push(p.id);
            }
        }
        ids
    }
}

/// One entry from the workspace file service's change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Added(String),
    Deleted(String),
    Updated(String),
}

/// Everything that can land on the session's queue.
#[derive(Debug)]
pub enum SessionEvent {
    /// A bus-delivered message from any participant (including ourselves).
    Bus(BusEvent),
    /// Membership feed: someone joined the underlying transport.
    ParticipantJoined(ParticipantProfile),
    /// Membership feed: someone left; tear down everything keyed to them.
    ParticipantLeft(ParticipantId),
    /// Guest only: kick off the join handshake.
    RequestJoin,
    /// The local editor applied these edits to an open shared file.
    LocalEdit {
        file_name: String,
        edits: Vec<TextEdit>,
    },
    /// The local cursor/selection moved.
    LocalSelection {
        file_name: String,
        start: usize,
        length: usize,
        is_reversed: bool,
    },
    /// The local visible range changed.
    LocalScroll {
        file_name: String,
        start: usize,
        length: usize,
    },
    /// The local user opened a file into the session.
    LocalOpen { file_name: String },
    /// The local user closed a shared file's tab.
    LocalClose { file_name: String },
    /// The local editor finished persisting a file.
    SaveCompleted { file_name: String },
    /// A batch from the workspace file watcher.
    FileServiceBatch(Vec<FileChange>),
    /// The editor swapped the document shown in a view column.
    EditorDocumentChanged { column: usize, file_name: String },
    /// Pin a view column to a participant's cursor.
    PinRequest {
        column: usize,
        participant_id: ParticipantId,
    },
    /// Release a view column's pin.
    UnpinRequest { column: usize },
    /// One-shot jump to a participant's last known position.
    JumpRequest { participant_id: ParticipantId },
    /// Ask everyone else to jump to us.
    SummonRequest,
    /// Periodic maintenance (ack pruning).
    Tick,
}

/// Health counters, exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub messages_processed: u64,
    /// Bus event ids that failed to increase monotonically.
    pub ordering_anomalies: u64,
    /// Per-sender sendId gaps (lossy transport or missed messages).
    pub sequence_gaps: u64,
    pub handler_failures: u64,
    /// Local edits whose echo never arrived within the ack window.
    pub acks_pruned: u64,
}

/// The per-participant orchestrator.
///
/// Owns the per-file engines, the position tracker, and the follow
/// controller; talks to the editor through a [`DocumentStore`] and to the
/// other participants through a bus publisher.
pub struct SessionClient {
    ctx: SessionContext,
    engine: SyncEngine,
    positions: PositionTracker,
    follow: FollowController,
    docs: Arc<dyn DocumentStore>,
    publisher: crate::bus::BusPublisher,
    rx: mpsc::Receiver<SessionEvent>,

    /// Last sendId we allocated. Contiguous per sender by construction:
    /// an id is only consumed once the publish is certain.
    next_send_id: u64,
    highest_event_id: u64,
    /// Last sendId seen per sender, for gap detection.
    highest_send_id: HashMap<ParticipantId, u64>,
    /// Files we are saving because a remote `SaveFile` told us to, keyed
    /// lowercase. Their save-completed events must not re-broadcast.
    saving: HashSet<String>,
    /// Deleted-path -> added-path pairs from the file watcher, waiting for
    /// the editor to close the old tab.
    pending_renames: HashMap<String, String>,
    /// First roster entry from the join acknowledge; the UI's default
    /// follow target.
    initial_pin_target: Option<ParticipantId>,
    ack_timeout: Duration,
    /// Set when reconciliation failed unrecoverably; the embedder should
    /// prompt the user to rejoin.
    hard_desync: Option<String>,
    stats: SessionStats,
}

impl SessionClient {
    /// Build a client and the sender side of its event queue.
    pub fn new(
        ctx: SessionContext,
        docs: Arc<dyn DocumentStore>,
        publisher: crate::bus::BusPublisher,
    ) -> (Self, mpsc::Sender<SessionEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let local_id = ctx.local_id;
        let client = Self {
            ctx,
            engine: SyncEngine::new(local_id),
            positions: PositionTracker::new(),
            follow: FollowController::new(),
            docs,
            publisher,
            rx,
            next_send_id: 0,
            highest_event_id: 0,
            highest_send_id: HashMap::new(),
            saving: HashSet::new(),
            pending_renames: HashMap::new(),
            initial_pin_target: None,
            ack_timeout: ACK_TIMEOUT,
            hard_desync: None,
            stats: SessionStats::default(),
        };
        (client, tx)
    }

    /// Forward bus events into the session queue until either side closes.
    pub fn spawn_bus_pump(
        tx: mpsc::Sender<SessionEvent>,
        mut bus_rx: broadcast::Receiver<BusEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(event) => {
                        if tx.send(SessionEvent::Bus(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("bus receiver lagged, {n} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Consume the queue until every sender is dropped.
    pub async fn run(&mut self) {
        while let Some(event) = self.rx.recv().await {
            self.process(event);
        }
        log::info!("participant {}: session queue closed", self.ctx.local_id);
    }

    /// Dispatch a single event. Failures are counted and logged, never
    /// fatal to the loop; a hard desync is additionally latched for the
    /// embedder.
    pub fn process(&mut self, event: SessionEvent) {
        self.stats.messages_processed += 1;
        if let Err(err) = self.handle_event(event) {
            self.stats.handler_failures += 1;
            if let SessionError::HardDesync(detail) = &err {
                self.hard_desync = Some(detail.clone());
            }
            log::error!("participant {}: handler failed: {err}", self.ctx.local_id);
        }
    }

    // ─── queries ────────────────────────────────────────────────────────

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn positions(&self) -> &PositionTracker {
        &self.positions
    }

    pub fn follow(&self) -> &FollowController {
        &self.follow
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn initial_pin_target(&self) -> Option<ParticipantId> {
        self.initial_pin_target
    }

    pub fn hard_desync(&self) -> Option<&str> {
        self.hard_desync.as_deref()
    }

    pub fn set_ack_timeout(&mut self, timeout: Duration) {
        self.ack_timeout = timeout;
    }

    /// Whether a local undo on `file_name` must be intercepted instead of
    /// hitting the editor's native undo stack.
    pub fn intercept_undo(&self, file_name: &str) -> bool {
        self.engine
            .get(file_name)
            .is_some_and(|f| f.intercept_undo())
    }

    /// Whether stale-state queries on `file_name` may be serviced for
    /// `requester` right now.
    pub fn can_service(&self, file_name: &str, requester: ParticipantId) -> bool {
        self.engine
            .get(file_name)
            .is_some_and(|f| f.can_service(requester))
    }

    // ─── dispatch ───────────────────────────────────────────────────────

    fn handle_event(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        match event {
            SessionEvent::Bus(bus_event) => self.handle_bus(bus_event, false),
            SessionEvent::ParticipantJoined(profile) => {
                if profile.id != self.ctx.local_id
                    && !self.ctx.participants.iter().any(|p| p.id == profile.id)
                {
                    log::info!("participant {} ({}) joined", profile.id, profile.display_name);
                    self.ctx.participants.push(profile);
                }
                Ok(())
            }
            SessionEvent::ParticipantLeft(id) => {
                self.ctx.participants.retain(|p| p.id != id);
                self.positions.clear(id);
                let released = self.follow.unpin_participant(id);
                self.highest_send_id.remove(&id);
                log::info!("participant {id} left ({released} panes unpinned)");
                Ok(())
            }
            SessionEvent::RequestJoin => {
                self.publish(SessionMessage::JoinRequest {});
                Ok(())
            }
            SessionEvent::LocalEdit { file_name, edits } => self.on_local_edit(&file_name, edits),
            SessionEvent::LocalSelection {
                file_name,
                start,
                length,
                is_reversed,
            } => self.on_local_selection(file_name, start, length, is_reversed),
            SessionEvent::LocalScroll {
                file_name,
                start,
                length,
            } => {
                self.publish(SessionMessage::LayoutScroll {
                    file_name,
                    start,
                    length,
                });
                Ok(())
            }
            SessionEvent::LocalOpen { file_name } => self.on_local_open(file_name),
            SessionEvent::LocalClose { file_name } => self.on_local_close(&file_name),
            SessionEvent::SaveCompleted { file_name } => self.on_save_completed(&file_name),
            SessionEvent::FileServiceBatch(changes) => self.on_file_service_batch(changes),
            SessionEvent::EditorDocumentChanged { column, file_name } => {
                self.follow.on_document_changed(column, &file_name);
                Ok(())
            }
            SessionEvent::PinRequest {
                column,
                participant_id,
            } => {
                self.follow.pin(column, participant_id)?;
                // Snap to wherever they already are.
                if let Some(pos) = self.positions.position(participant_id).cloned() {
                    let reveals = self.follow.on_position(&pos);
                    self.execute_reveals(reveals)?;
                }
                Ok(())
            }
            SessionEvent::UnpinRequest { column } => {
                self.follow.unpin(column);
                Ok(())
            }
            SessionEvent::JumpRequest { participant_id } => self.jump_to(participant_id),
            SessionEvent::SummonRequest => {
                self.publish(SessionMessage::Summon {});
                Ok(())
            }
            SessionEvent::Tick => {
                for (file_name, send_id) in self.engine.prune_unacknowledged(self.ack_timeout) {
                    self.stats.acks_pruned += 1;
                    log::warn!(
                        "edit {send_id} on {file_name} unacknowledged after {:?}; tracking pruned",
                        self.ack_timeout
                    );
                }
                Ok(())
            }
        }
    }

    // ─── inbound bus messages ───────────────────────────────────────────

    /// `replay` marks events flushed from a per-file deferred queue after
    /// sync completes: sequencing checks are skipped (they already ran on
    /// first receipt) and stale flushed changes are dropped.
    fn handle_bus(&mut self, event: BusEvent, replay: bool) -> Result<(), SessionError> {
        let sender_id = event.envelope.sender_id;
        let send_id = event.envelope.send_id;

        if !replay {
            self.check_sequencing(event.event_id, sender_id, send_id);
        }

        // Our own messages are side effects we already performed, except
        // the echo of a text change, which drives version accounting.
        if sender_id == self.ctx.local_id
            && !matches!(event.envelope.message, SessionMessage::TextChange { .. })
        {
            return Ok(());
        }
        // Targeted acknowledgements addressed to someone else.
        if let Some(target) = event.envelope.message.target() {
            if target != self.ctx.local_id {
                return Ok(());
            }
        }

        let message = event.envelope.message.clone();
        match message {
            SessionMessage::TextChange {
                file_name,
                server_version,
                edits,
            } => self.on_text_change(event, sender_id, send_id, file_name, server_version, edits, replay),
            SessionMessage::SelectionChange {
                file_name,
                start,
                length,
                is_reversed,
                force_jump_for,
            } => self.on_selection_change(
                event,
                sender_id,
                file_name,
                start,
                length,
                is_reversed,
                force_jump_for,
                replay,
            ),
            SessionMessage::LayoutScroll {
                file_name,
                start,
                length,
            } => {
                let reveals = self.follow.on_scroll(sender_id, &file_name, start, length);
                self.execute_reveals(reveals)
            }
            SessionMessage::JoinRequest {} => self.on_join_request(sender_id),
            SessionMessage::JoinAcknowledge {
                participant_ids,
                open_files,
                ..
            } => self.on_join_acknowledge(participant_ids, open_files),
            SessionMessage::FileOpenRequest {
                file_name,
                content_hash,
                send_jump_to,
            } => self.on_file_open_request(sender_id, &file_name, &content_hash, send_jump_to),
            SessionMessage::FileOpenAcknowledge {
                file_name,
                snapshot_server_version,
                first_history_version,
                snapshot_edits,
                fallback_text,
                history,
                is_read_only,
                ..
            } => self.on_file_open_acknowledge(
                &file_name,
                snapshot_server_version,
                first_history_version,
                snapshot_edits,
                fallback_text,
                history,
                is_read_only,
            ),
            SessionMessage::SaveFile { file_name } => {
                self.saving.insert(file_name.to_lowercase());
                self.docs.save(&file_name)?;
                Ok(())
            }
            SessionMessage::Summon {} => self.jump_to(sender_id),
            SessionMessage::Unknown => {
                log::info!("ignoring unknown message type from participant {sender_id}");
                Ok(())
            }
        }
    }

    /// Event-id monotonicity and per-sender sendId contiguity. Violations
    /// are counted and logged; the event is still processed.
    fn check_sequencing(&mut self, event_id: u64, sender_id: ParticipantId, send_id: u64) {
        if event_id <= self.highest_event_id {
            self.stats.ordering_anomalies += 1;
            log::warn!(
                "event id {event_id} not above {}; processing anyway",
                self.highest_event_id
            );
        } else {
            self.highest_event_id = event_id;
        }
        if let Some(prev) = self.highest_send_id.get(&sender_id) {
            if send_id != prev + 1 {
                self.stats.sequence_gaps += 1;
                log::warn!(
                    "sendId gap from participant {sender_id}: {prev} -> {send_id}"
                );
            }
        }
        self.highest_send_id.insert(sender_id, send_id);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_text_change(
        &mut self,
        event: BusEvent,
        sender_id: ParticipantId,
        send_id: u64,
        file_name: String,
        server_version: i64,
        edits: Vec<TextEdit>,
        replay: bool,
    ) -> Result<(), SessionError> {
        if self.engine.get(&file_name).is_none() {
            if sender_id == self.ctx.local_id {
                log::warn!("echo for unshared file {file_name}");
                return Ok(());
            }
            self.ensure_file(&file_name)?;
        }
        let Some(state) = self.engine.get(&file_name).map(|f| f.state()) else {
            return Ok(());
        };
        match state {
            SyncState::Unsynced | SyncState::Syncing => {
                if let Some(file) = self.engine.get_mut(&file_name) {
                    file.defer(event);
                }
                Ok(())
            }
            SyncState::Closed => {
                log::debug!("{file_name}: change ignored, file closed locally");
                Ok(())
            }
            SyncState::Synced => {
                if replay {
                    // A change the open acknowledge already replayed shows
                    // up in history under the sender's sendId. The tagged
                    // version cannot decide this: a concurrent change from
                    // a lagging sender carries a stale version and is
                    // still new to us.
                    let incorporated = self
                        .engine
                        .get(&file_name)
                        .is_some_and(|f| f.has_incorporated(sender_id, send_id));
                    if incorporated {
                        log::trace!(
                            "{file_name}: flushed change {sender_id}/{send_id} already incorporated"
                        );
                        return Ok(());
                    }
                }
                let applied = match self.engine.get_mut(&file_name) {
                    Some(file) => file
                        .apply_remote_change(sender_id, send_id, server_version, &edits)
                        .map_err(|err| match err {
                            EngineError::Buffer(_) => SessionError::HardDesync(format!(
                                "reconciliation failed for {file_name}: {err}"
                            )),
                            other => SessionError::Engine(other),
                        })?,
                    None => return Ok(()),
                };
                if !applied.own_echo && !applied.edits.is_empty() {
                    self.docs
                        .apply_edits(&file_name, &applied.edits)
                        .map_err(|err| {
                            SessionError::HardDesync(format!(
                                "editor rejected reconciled edits for {file_name}: {err}"
                            ))
                        })?;
                }
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_selection_change(
        &mut self,
        event: BusEvent,
        sender_id: ParticipantId,
        file_name: String,
        start: usize,
        length: usize,
        is_reversed: bool,
        force_jump_for: Option<ParticipantId>,
        replay: bool,
    ) -> Result<(), SessionError> {
        let pos = ParticipantPosition {
            participant_id: sender_id,
            file_name: file_name.clone(),
            start,
            length,
            is_reversed,
        };

        if replay {
            // The tracker was already updated on first receipt; only the
            // pane side effects were parked.
            let reveals = self.follow.on_position(&pos);
            return self.execute_reveals(reveals);
        }

        // Presence works even before the file's content has synced.
        if let Some(switch) = self.positions.record(pos.clone()) {
            log::trace!(
                "participant {} moved to {} (from {:?})",
                switch.participant_id,
                switch.file_name,
                switch.previous
            );
        }

        if self.engine.get(&file_name).is_none() {
            self.ensure_file(&file_name)?;
        }
        match self.engine.get(&file_name).map(|f| f.state()) {
            Some(SyncState::Unsynced) | Some(SyncState::Syncing) => {
                if let Some(file) = self.engine.get_mut(&file_name) {
                    file.defer(event);
                }
            }
            _ => {
                let reveals = self.follow.on_position(&pos);
                self.execute_reveals(reveals)?;
            }
        }

        if force_jump_for == Some(self.ctx.local_id) && sender_id != self.ctx.local_id {
            self.jump_to(sender_id)?;
        }
        Ok(())
    }

    fn on_join_request(&mut self, joiner_id: ParticipantId) -> Result<(), SessionError> {
        if !self.ctx.is_host {
            return Ok(());
        }
        let mut participant_ids = self.ctx.participant_ids();
        if !participant_ids.contains(&joiner_id) {
            // Membership feed may lag behind the join message.
            participant_ids.push(joiner_id);
        }
        let open_files = self.open_files_active_first();
        log::info!(
            "answering join request from {joiner_id}: {} open file(s)",
            open_files.len()
        );
        self.publish(SessionMessage::JoinAcknowledge {
            joiner_id,
            participant_ids,
            open_files,
        });
        Ok(())
    }

    fn on_join_acknowledge(
        &mut self,
        participant_ids: Vec<ParticipantId>,
        open_files: Vec<String>,
    ) -> Result<(), SessionError> {
        // Host first in the roster: the natural default to follow.
        self.initial_pin_target = participant_ids
            .iter()
            .copied()
            .find(|id| *id != self.ctx.local_id);
        log::info!(
            "join acknowledged: {} participant(s), {} open file(s)",
            participant_ids.len(),
            open_files.len()
        );
        for (index, file_name) in open_files.iter().enumerate() {
            // The sharer's active file is first; ask to be jumped there.
            self.request_file_open(file_name, index == 0)?;
        }
        Ok(())
    }

    fn on_file_open_request(
        &mut self,
        joiner_id: ParticipantId,
        file_name: &str,
        requested_hash: &str,
        send_jump_to: bool,
    ) -> Result<(), SessionError> {
        // Only the authoritative side answers; otherwise every synced
        // participant would reply at once.
        if !self.ctx.is_host {
            return Ok(());
        }
        let Some(file) = self.engine.get(file_name) else {
            log::warn!("open request for unshared file {file_name}");
            return Ok(());
        };
        let ack = file.answer_open_request(joiner_id, requested_hash);
        self.publish(ack);

        if send_jump_to {
            let own_position = self
                .positions
                .position(self.ctx.local_id)
                .filter(|p| p.file_name == file_name)
                .cloned();
            if let Some(pos) = own_position {
                self.publish(SessionMessage::SelectionChange {
                    file_name: pos.file_name,
                    start: pos.start,
                    length: pos.length,
                    is_reversed: pos.is_reversed,
                    force_jump_for: Some(joiner_id),
                });
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_file_open_acknowledge(
        &mut self,
        file_name: &str,
        snapshot_server_version: i64,
        first_history_version: i64,
        snapshot_edits: Vec<TextEdit>,
        fallback_text: Option<String>,
        history: Vec<crate::protocol::HistoryRecord>,
        is_read_only: bool,
    ) -> Result<(), SessionError> {
        let baseline = self.docs.read(file_name).ok();
        let flushed = {
            let Some(file) = self.engine.get_mut(file_name) else {
                log::warn!("open acknowledge for unrequested file {file_name}");
                return Ok(());
            };
            file.apply_open_acknowledge(
                snapshot_server_version,
                first_history_version,
                &snapshot_edits,
                fallback_text.as_deref(),
                history,
                is_read_only,
                baseline.as_deref(),
            )?
        };

        if let Some(file) = self.engine.get(file_name) {
            self.docs.write(file_name, file.text())?;
            log::info!(
                "{file_name}: synced at v{} ({} deferred event(s) to flush)",
                file.server_version(),
                flushed.len()
            );
        }

        // Events that arrived mid-handshake, replayed in arrival order.
        // A failing event is contained like any other queue message so
        // the rest of the backlog still lands.
        for deferred in flushed {
            if let Err(err) = self.handle_bus(deferred, true) {
                self.stats.handler_failures += 1;
                if let SessionError::HardDesync(detail) = &err {
                    self.hard_desync = Some(detail.clone());
                }
                log::error!("{file_name}: deferred event failed after sync: {err}");
            }
        }
        Ok(())
    }

    // ─── local editor hooks ─────────────────────────────────────────────

    fn on_local_edit(
        &mut self,
        file_name: &str,
        edits: Vec<TextEdit>,
    ) -> Result<(), SessionError> {
        let Some(file) = self.engine.get_mut(file_name) else {
            log::debug!("edit to unshared file {file_name} ignored");
            return Ok(());
        };
        // Allocate the sendId only once the engine accepts the edit, so
        // sendIds stay contiguous even when an edit is rejected.
        let send_id = self.next_send_id + 1;
        let message = file.record_local_edit(send_id, edits)?;
        self.next_send_id = send_id;
        self.publisher
            .publish(Envelope::new(self.ctx.local_id, send_id, message));
        Ok(())
    }

    fn on_local_selection(
        &mut self,
        file_name: String,
        start: usize,
        length: usize,
        is_reversed: bool,
    ) -> Result<(), SessionError> {
        let pos = ParticipantPosition {
            participant_id: self.ctx.local_id,
            file_name: file_name.clone(),
            start,
            length,
            is_reversed,
        };
        self.positions.record(pos.clone());
        // Panes pinned to ourselves are unusual but legal.
        let reveals = self.follow.on_position(&pos);
        self.execute_reveals(reveals)?;
        self.publish(SessionMessage::SelectionChange {
            file_name,
            start,
            length,
            is_reversed,
            force_jump_for: None,
        });
        Ok(())
    }

    fn on_local_open(&mut self, file_name: String) -> Result<(), SessionError> {
        self.ctx.active_file = Some(file_name.clone());
        if self.ctx.is_host {
            if self.engine.get(&file_name).is_none() {
                let text = self.docs.read(&file_name)?;
                self.engine.open_host(&file_name, text);
                log::info!("{file_name}: shared into session");
            }
        } else {
            self.request_file_open(&file_name, false)?;
        }
        Ok(())
    }

    fn on_local_close(&mut self, file_name: &str) -> Result<(), SessionError> {
        if self.ctx.active_file.as_deref() == Some(file_name) {
            self.ctx.active_file = None;
        }
        if let Some(new_name) = self.pending_renames.remove(file_name) {
            // The close is the editor finishing a rename, not the user
            // leaving the file. Undo history survives.
            self.engine.rename(file_name, &new_name)?;
            return Ok(());
        }
        // A guest closing the tab of a file that still exists on disk is
        // not leaving the session's view of it.
        if !self.ctx.is_host && self.docs.exists(file_name) {
            log::debug!("{file_name}: close ignored, file still present locally");
            return Ok(());
        }
        // A close with no pending rename destroys the client outright, so
        // a later reopen starts a fresh handshake instead of hitting a
        // lingering Closed state.
        if self.engine.remove(file_name).is_some() {
            log::info!("{file_name}: closed locally, sync client destroyed");
        }
        Ok(())
    }

    fn on_save_completed(&mut self, file_name: &str) -> Result<(), SessionError> {
        // The snapshot taken here is what makes late joins cheap: a joiner
        // whose disk matches this save gets edits, not the whole file.
        if let Some(file) = self.engine.get_mut(file_name) {
            file.take_snapshot();
        }
        if self.saving.remove(&file_name.to_lowercase()) {
            // We saved because a peer asked; don't echo the request back.
            return Ok(());
        }
        self.publish(SessionMessage::SaveFile {
            file_name: file_name.to_string(),
        });
        Ok(())
    }

    /// Classify a watcher batch. A lone update is a save; an add/delete
    /// pair is a rename in flight. A batch mixing unrelated adds and
    /// deletes is indistinguishable from a rename here, so only the exact
    /// pair shape is treated as one.
    fn on_file_service_batch(&mut self, changes: Vec<FileChange>) -> Result<(), SessionError> {
        if let [FileChange::Updated(file_name)] = changes.as_slice() {
            let file_name = file_name.clone();
            return self.on_save_completed(&file_name);
        }
        if changes.len() == 2 {
            let added = changes.iter().find_map(|c| match c {
                FileChange::Added(name) => Some(name.clone()),
                _ => None,
            });
            let deleted = changes.iter().find_map(|c| match c {
                FileChange::Deleted(name) => Some(name.clone()),
                _ => None,
            });
            if let (Some(added), Some(deleted)) = (added, deleted) {
                log::debug!("rename detected: {deleted} -> {added}");
                self.pending_renames.insert(deleted, added);
                return Ok(());
            }
        }
        for change in changes {
            match change {
                FileChange::Updated(file_name) => self.on_save_completed(&file_name)?,
                FileChange::Added(file_name) => log::trace!("file added: {file_name}"),
                FileChange::Deleted(file_name) => log::trace!("file deleted: {file_name}"),
            }
        }
        Ok(())
    }

    // ─── plumbing ───────────────────────────────────────────────────────

    /// A message referenced a file we have no state for. The host re-opens
    /// from disk when possible; a guest starts the open handshake. Either
    /// way the message itself is then routed by its caller.
    fn ensure_file(&mut self, file_name: &str) -> Result<(), SessionError> {
        if self.engine.get(file_name).is_some() {
            return Ok(());
        }
        if self.ctx.is_host {
            if self.docs.exists(file_name) {
                let text = self.docs.read(file_name)?;
                self.engine.open_host(file_name, text);
            } else {
                log::warn!("message references unknown file {file_name}");
            }
        } else {
            self.request_file_open(file_name, false)?;
        }
        Ok(())
    }

    /// Guest side: create the file client and start the open handshake,
    /// offering the hash of whatever baseline we already hold.
    fn request_file_open(
        &mut self,
        file_name: &str,
        send_jump_to: bool,
    ) -> Result<(), SessionError> {
        self.engine.open_guest(file_name);
        let needs_request = self
            .engine
            .get(file_name)
            .is_some_and(|f| f.state() == SyncState::Unsynced);
        if !needs_request {
            // Handshake already in flight or completed.
            return Ok(());
        }
        if let Some(file) = self.engine.get_mut(file_name) {
            file.begin_sync();
        }
        let baseline_hash = match self.docs.read(file_name) {
            Ok(text) => content_hash(&text),
            Err(_) => content_hash(""),
        };
        self.publish(SessionMessage::FileOpenRequest {
            file_name: file_name.to_string(),
            content_hash: baseline_hash,
            send_jump_to,
        });
        Ok(())
    }

    fn open_files_active_first(&self) -> Vec<String> {
        let mut files = self.engine.open_files();
        if let Some(active) = &self.ctx.active_file {
            if let Some(index) = files.iter().position(|f| f == active) {
                let active = files.remove(index);
                files.insert(0, active);
            }
        }
        files
    }

    fn jump_to(&mut self, participant_id: ParticipantId) -> Result<(), SessionError> {
        let Some(pos) = self.positions.jump_target(participant_id) else {
            log::debug!("no known position for participant {participant_id}");
            return Ok(());
        };
        if self.docs.exists(&pos.file_name) {
            self.docs.open_in_column(JUMP_COLUMN, &pos.file_name)?;
        }
        self.docs
            .reveal_range(JUMP_COLUMN, &pos.file_name, pos.start, pos.length)?;
        Ok(())
    }

    fn execute_reveals(&mut self, reveals: Vec<Reveal>) -> Result<(), SessionError> {
        for reveal in reveals {
            if reveal.needs_document_swap {
                if !self.docs.exists(&reveal.file_name) {
                    log::debug!(
                        "cannot follow into {}: not present locally",
                        reveal.file_name
                    );
                    continue;
                }
                // The attribution flag is already set; the editor's
                // document-changed event will keep the pin.
                self.docs.open_in_column(reveal.column, &reveal.file_name)?;
            }
            self.docs
                .reveal_range(reveal.column, &reveal.file_name, reveal.start, reveal.length)?;
        }
        Ok(())
    }

    fn publish(&mut self, message: SessionMessage) -> u64 {
        self.next_send_id += 1;
        let envelope = Envelope::new(self.ctx.local_id, self.next_send_id, message);
        self.publisher.publish(envelope)
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("local_id", &self.ctx.local_id)
            .field("is_host", &self.ctx.is_host)
            .field("files", &self.engine.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Session-level failures.
#[derive(Debug)]
pub enum SessionError {
    Engine(EngineError),
    Document(DocumentError),
    Follow(FollowError),
    /// Reconciliation produced a state we cannot trust; the only recovery
    /// is leaving and rejoining the session.
    HardDesync(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine(err) => write!(f, "engine error: {err}"),
            Self::Document(err) => write!(f, "document error: {err}"),
            Self::Follow(err) => write!(f, "follow error: {err}"),
            Self::HardDesync(detail) => write!(f, "hard desync: {detail}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Engine(err) => Some(err),
            Self::Document(err) => Some(err),
            Self::Follow(err) => Some(err),
            Self::HardDesync(_) => None,
        }
    }
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

impl From<DocumentError> for SessionError {
    fn from(err: DocumentError) -> Self {
        Self::Document(err)
    }
}

impl From<FollowError> for SessionError {
    fn from(err: FollowError) -> Self {
        Self::Follow(err)
    }
}
