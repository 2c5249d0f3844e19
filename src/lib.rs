//! # tandem — Real-time co-editing session engine
//!
//! Per-file collaborative synchronization over an ordered message bus:
//! optimistic local edits, operational transformation of concurrent
//! remote edits, snapshot-based late-join bootstrap, and cursor
//! follow/pin across participants.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    ordered bus     ┌──────────────┐
//! │ SessionClient│ ◄─────────────────► │ SessionClient│
//! │ (participant)│   JSON envelopes    │ (participant)│
//! └──────┬───────┘                     └──────┬───────┘
//!        │ single mpsc queue                  │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ SyncEngine   │                     │ SyncEngine   │
//! │ (per-file OT)│                     │ (per-file OT)│
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ DocumentStore│                     │ DocumentStore│
//! │ (editor seam)│                     │ (editor seam)│
//! └──────────────┘                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (tagged message union, envelopes)
//! - [`buffer`] — Text buffer and edit transformation primitives
//! - [`engine`] — Per-file sync state machine (versions, history, acks)
//! - [`bus`] — In-process ordered broadcast bus
//! - [`session`] — Per-participant orchestrator and event loop
//! - [`position`] — Who-is-where tracking and jump targets
//! - [`follow`] — View-column pinning to a participant's cursor
//! - [`editor`] — Document-store capability over the embedding editor

pub mod buffer;
pub mod bus;
pub mod editor;
pub mod engine;
pub mod follow;
pub mod position;
pub mod protocol;
pub mod session;

// Re-exports for convenience
pub use buffer::{sequentialize, transform_all, transform_edit, BufferError, TextBuffer, TransformSide};
pub use bus::{BusPublisher, BusStats, LocalBus};
pub use editor::{DocumentError, DocumentStore, MemoryDocumentStore, RevealRecord};
pub use engine::{
    AppliedRemote, EngineError, FileHandle, SharedFile, Snapshot, SyncEngine, SyncState,
    ACK_TIMEOUT, HISTORY_CAPACITY,
};
pub use follow::{FollowController, FollowError, Reveal, ViewColumnPin, MAX_VIEW_COLUMNS};
pub use position::{FileSwitch, JumpStats, ParticipantPosition, PositionTracker};
pub use protocol::{
    content_hash, BusEvent, Envelope, HistoryRecord, ParticipantId, ProtocolError,
    SessionMessage, TextEdit, HOST_ID,
};
pub use session::{
    FileChange, ParticipantProfile, SessionClient, SessionContext, SessionError, SessionEvent,
    SessionStats,
};
