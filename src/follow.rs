//! Follow/pin: binding editor panes to another participant's cursor.
//!
//! A pin ties a view column to a participant; their position updates then
//! auto-reveal in that pane. The subtle part is attribution: when a pinned
//! participant switches files, this controller swaps the pane's document
//! itself, and the editor's resulting "document changed" event must not be
//! read as the user navigating away. `is_changing_document` is set *before*
//! the swap; a document change arriving with the flag clear is user intent
//! and auto-unpins the pane.

use crate::position::ParticipantPosition;
use crate::protocol::ParticipantId;

/// View columns are capped at a small fixed count, like the editors that
/// host them.
pub const MAX_VIEW_COLUMNS: usize = 9;

/// Pin state for one visible view column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewColumnPin {
    pub document: Option<String>,
    pub is_changing_document: bool,
    pub pinned_participant: Option<ParticipantId>,
}

/// A reveal the session must perform against the editor surface. When the
/// pane's document differs from `file_name`, the session opens the file in
/// the column first; the attribution flag is already set by then.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reveal {
    pub column: usize,
    pub file_name: String,
    pub start: usize,
    pub length: usize,
    /// True when the pane must swap documents before revealing.
    pub needs_document_swap: bool,
}

/// Per-session pin bindings.
#[derive(Debug)]
pub struct FollowController {
    pins: Vec<ViewColumnPin>,
}

impl Default for FollowController {
    fn default() -> Self {
        Self::new()
    }
}

impl FollowController {
    pub fn new() -> Self {
        Self {
            pins: vec![ViewColumnPin::default(); MAX_VIEW_COLUMNS],
        }
    }

    /// Pin a view column to a participant.
    pub fn pin(&mut self, column: usize, participant_id: ParticipantId) -> Result<(), FollowError> {
        let pin = self
            .pins
            .get_mut(column)
            .ok_or(FollowError::InvalidColumn(column))?;
        pin.pinned_participant = Some(participant_id);
        log::debug!("pinned column {column} to participant {participant_id}");
        Ok(())
    }

    pub fn unpin(&mut self, column: usize) {
        if let Some(pin) = self.pins.get_mut(column) {
            pin.pinned_participant = None;
        }
    }

    /// Tear down every pin bound to a departed participant. Returns how
    /// many panes were released.
    pub fn unpin_participant(&mut self, participant_id: ParticipantId) -> usize {
        let mut released = 0;
        for pin in &mut self.pins {
            if pin.pinned_participant == Some(participant_id) {
                pin.pinned_participant = None;
                released += 1;
            }
        }
        released
    }

    pub fn pinned(&self, column: usize) -> Option<ParticipantId> {
        self.pins.get(column).and_then(|p| p.pinned_participant)
    }

    pub fn pin_state(&self, column: usize) -> Option<&ViewColumnPin> {
        self.pins.get(column)
    }

    /// React to a position update: every pane pinned to this participant
    /// reveals the range. Panes showing a different document get their
    /// attribution flag set before the session performs the swap.
    pub fn on_position(&mut self, position: &ParticipantPosition) -> Vec<Reveal> {
        let mut reveals = Vec::new();
        for (column, pin) in self.pins.iter_mut().enumerate() {
            if pin.pinned_participant != Some(position.participant_id) {
                continue;
            }
            let needs_swap = pin.document.as_deref() != Some(position.file_name.as_str());
            if needs_swap {
                pin.is_changing_document = true;
            }
            reveals.push(Reveal {
                column,
                file_name: position.file_name.clone(),
                start: position.start,
                length: position.length,
                needs_document_swap: needs_swap,
            });
        }
        reveals
    }

    /// React to a scroll update: panes pinned to this participant that
    /// already show the file follow along. Scrolls never swap documents.
    pub fn on_scroll(
        &self,
        participant_id: ParticipantId,
        file_name: &str,
        start: usize,
        length: usize,
    ) -> Vec<Reveal> {
        self.pins
            .iter()
            .enumerate()
            .filter(|(_, pin)| {
                pin.pinned_participant == Some(participant_id)
                    && pin.document.as_deref() == Some(file_name)
            })
            .map(|(column, _)| Reveal {
                column,
                file_name: file_name.to_string(),
                start,
                length,
                needs_document_swap: false,
            })
            .collect()
    }

    /// The editor reported that a pane's document changed. Engine-initiated
    /// changes (flag set) keep the pin; anything else is the user
    /// navigating away and unpins. Returns true when the pane was unpinned.
    pub fn on_document_changed(&mut self, column: usize, document: &str) -> bool {
        let Some(pin) = self.pins.get_mut(column) else {
            return false;
        };
        let engine_initiated = std::mem::take(&mut pin.is_changing_document);
        pin.document = Some(document.to_string());
        if !engine_initiated && pin.pinned_participant.is_some() {
            let participant = pin.pinned_participant.take();
            log::debug!(
                "column {column} unpinned from participant {participant:?}: user changed document"
            );
            return true;
        }
        false
    }
}

/// Follow/pin errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowError {
    InvalidColumn(usize),
}

impl std::fmt::Display for FollowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidColumn(column) => {
                write!(f, "view column {column} out of range (max {MAX_VIEW_COLUMNS})")
            }
        }
    }
}

impl std::error::Error for FollowError {}
