//! Last-known cursor/selection tracking per participant.
//!
//! Every selection change, inbound or outbound, lands here regardless of
//! whether the file is otherwise synced: knowing "who is where" must work
//! even before content sync completes. Positions are last-writer-wins per
//! participant and are cleared when the participant leaves.

use std::collections::HashMap;

use crate::protocol::ParticipantId;

/// A participant's last known selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantPosition {
    pub participant_id: ParticipantId,
    pub file_name: String,
    pub start: usize,
    pub length: usize,
    pub is_reversed: bool,
}

/// Emitted when a recorded position moves a participant to another file.
/// The follow controller uses this to swap pinned panes before revealing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSwitch {
    pub participant_id: ParticipantId,
    pub previous: Option<String>,
    pub file_name: String,
}

/// Explicit-jump outcome counters. A failure means the participant had no
/// recorded position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JumpStats {
    pub succeeded: u64,
    pub failed: u64,
}

/// The per-session position feed.
#[derive(Debug, Default)]
pub struct PositionTracker {
    positions: HashMap<ParticipantId, ParticipantPosition>,
    jumps: JumpStats,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a position (last-writer-wins). Returns a [`FileSwitch`] when
    /// the participant changed files, including the first position ever
    /// seen for them.
    pub fn record(&mut self, position: ParticipantPosition) -> Option<FileSwitch> {
        let participant_id = position.participant_id;
        let file_name = position.file_name.clone();
        let previous = self.positions.insert(participant_id, position);
        match previous {
            Some(prev) if prev.file_name == file_name => None,
            Some(prev) => Some(FileSwitch {
                participant_id,
                previous: Some(prev.file_name),
                file_name,
            }),
            None => Some(FileSwitch {
                participant_id,
                previous: None,
                file_name,
            }),
        }
    }

    pub fn position(&self, participant_id: ParticipantId) -> Option<&ParticipantPosition> {
        self.positions.get(&participant_id)
    }

    /// Tear down a departed participant's position.
    pub fn clear(&mut self, participant_id: ParticipantId) -> bool {
        self.positions.remove(&participant_id).is_some()
    }

    /// Resolve an explicit jump target, counting the outcome.
    pub fn jump_target(&mut self, participant_id: ParticipantId) -> Option<ParticipantPosition> {
        match self.positions.get(&participant_id) {
            Some(pos) => {
                self.jumps.succeeded += 1;
                Some(pos.clone())
            }
            None => {
                self.jumps.failed += 1;
                log::debug!("jump failed: no recorded position for participant {participant_id}");
                None
            }
        }
    }

    pub fn jump_stats(&self) -> JumpStats {
        self.jumps
    }

    pub fn tracked_participants(&self) -> usize {
        self.positions.len()
    }
}
