//! Session message protocol and ordering envelope.
//!
//! Every message is a JSON object whose `messageType` field discriminates
//! the variant. A participant wraps each message in an [`Envelope`] carrying
//! its sender id and a per-sender monotonic `sendId`; the transport wraps
//! the envelope in a [`BusEvent`] carrying a session-global `eventId`:
//!
//! ```text
//! ┌─────────┬──────────┬────────┬───────────────────────────┐
//! │ eventId │ senderId │ sendId │ messageType + body fields │
//! └─────────┴──────────┴────────┴───────────────────────────┘
//! ```
//!
//! All messages go to one shared channel; the targeted acknowledgements
//! (`JoinAcknowledge`, `FileOpenAcknowledge`) carry a `joinerId` and are
//! filtered after receipt, not routed.

use serde::{Deserialize, Serialize};

/// Participant identity: a small session-scoped integer, stable for the
/// session's lifetime.
pub type ParticipantId = u32;

/// The owner/host is always participant 1.
pub const HOST_ID: ParticipantId = 1;

/// A single text edit against a known coordinate space.
///
/// Offsets are byte offsets into UTF-8 text. Edits inside one `TextChange`
/// share the message's coordinate space and are applied highest-offset
/// first so earlier entries never invalidate later ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEdit {
    pub offset: usize,
    pub delete_length: usize,
    pub insert_text: String,
}

impl TextEdit {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            delete_length: 0,
            insert_text: text.into(),
        }
    }

    pub fn delete(offset: usize, delete_length: usize) -> Self {
        Self {
            offset,
            delete_length,
            insert_text: String::new(),
        }
    }

    pub fn replace(offset: usize, delete_length: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            delete_length,
            insert_text: text.into(),
        }
    }

    /// Signed length change this edit causes.
    pub fn net_delta(&self) -> i64 {
        self.insert_text.len() as i64 - self.delete_length as i64
    }
}

/// One accepted `TextChange`, as stored in a file's history ring and as
/// replayed to late joiners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// The server version this change produced.
    pub server_version: i64,
    pub sender_id: ParticipantId,
    /// The sender's `sendId` for the originating `TextChange`; together
    /// with `sender_id` it identifies the change across replays.
    pub send_id: u64,
    /// Edits in application order (already sequentialized).
    pub edits: Vec<TextEdit>,
}

/// The tagged message union exchanged between participants.
///
/// Unknown/future variants decode to [`SessionMessage::Unknown`], which is
/// logged and ignored rather than mis-dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionMessage {
    /// Edits against the sender's known server coordinate space.
    TextChange {
        file_name: String,
        server_version: i64,
        edits: Vec<TextEdit>,
    },
    /// Cursor/selection update. `force_jump_for` asks one specific
    /// participant to jump to this range on receipt.
    SelectionChange {
        file_name: String,
        start: usize,
        length: usize,
        is_reversed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        force_jump_for: Option<ParticipantId>,
    },
    /// Visible-range update for the sender's active editor.
    LayoutScroll {
        file_name: String,
        start: usize,
        length: usize,
    },
    /// Guest asks to join the session.
    JoinRequest {},
    /// Host's reply to a `JoinRequest`, addressed to `joiner_id`.
    JoinAcknowledge {
        joiner_id: ParticipantId,
        /// Host first.
        participant_ids: Vec<ParticipantId>,
        /// Sharer's active file first.
        open_files: Vec<String>,
    },
    /// Joiner asks for a file's content, offering the hash of whatever
    /// baseline it already holds locally.
    FileOpenRequest {
        file_name: String,
        content_hash: String,
        send_jump_to: bool,
    },
    /// Host's reply to a `FileOpenRequest`, addressed to `joiner_id`.
    ///
    /// Either `snapshot_edits` (applied to the joiner's matching baseline)
    /// or `fallback_text` seeds the buffer at `snapshot_server_version`;
    /// `history` then replays in order, starting at `first_history_version`.
    FileOpenAcknowledge {
        file_name: String,
        joiner_id: ParticipantId,
        snapshot_server_version: i64,
        first_history_version: i64,
        snapshot_edits: Vec<TextEdit>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback_text: Option<String>,
        history: Vec<HistoryRecord>,
        is_read_only: bool,
    },
    /// Ask everyone holding this file to save it.
    SaveFile { file_name: String },
    /// Ask everyone to jump to the sender's position.
    Summon {},
    /// Forward-compatibility catch-all.
    #[serde(other)]
    Unknown,
}

impl SessionMessage {
    /// Short variant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionMessage::TextChange { .. } => "textChange",
            SessionMessage::SelectionChange { .. } => "selectionChange",
            SessionMessage::LayoutScroll { .. } => "layoutScroll",
            SessionMessage::JoinRequest {} => "joinRequest",
            SessionMessage::JoinAcknowledge { .. } => "joinAcknowledge",
            SessionMessage::FileOpenRequest { .. } => "fileOpenRequest",
            SessionMessage::FileOpenAcknowledge { .. } => "fileOpenAcknowledge",
            SessionMessage::SaveFile { .. } => "saveFile",
            SessionMessage::Summon {} => "summon",
            SessionMessage::Unknown => "unknown",
        }
    }

    /// The file this message refers to, if any.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            SessionMessage::TextChange { file_name, .. }
            | SessionMessage::SelectionChange { file_name, .. }
            | SessionMessage::LayoutScroll { file_name, .. }
            | SessionMessage::FileOpenRequest { file_name, .. }
            | SessionMessage::FileOpenAcknowledge { file_name, .. }
            | SessionMessage::SaveFile { file_name } => Some(file_name),
            _ => None,
        }
    }

    /// For targeted acknowledgements, the participant they are addressed to.
    pub fn target(&self) -> Option<ParticipantId> {
        match self {
            SessionMessage::JoinAcknowledge { joiner_id, .. }
            | SessionMessage::FileOpenAcknowledge { joiner_id, .. } => Some(*joiner_id),
            _ => None,
        }
    }
}

/// What a participant publishes: a message plus its ordering fields.
///
/// `send_id` values from a given sender are strictly increasing and
/// contiguous in the sender's send order; a gap is a logged desync signal,
/// never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub sender_id: ParticipantId,
    pub send_id: u64,
    #[serde(flatten)]
    pub message: SessionMessage,
}

impl Envelope {
    pub fn new(sender_id: ParticipantId, send_id: u64, message: SessionMessage) -> Self {
        Self {
            sender_id,
            send_id,
            message,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the JSON wire form.
    pub fn decode(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// What the transport delivers: an envelope stamped with the session-global
/// event id. `event_id` is strictly increasing session-wide; a regression is
/// a logged protocol violation and processing continues best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub event_id: u64,
    #[serde(flatten)]
    pub envelope: Envelope,
}

impl BusEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// FNV-1a 64-bit content hash, rendered as fixed-width hex.
///
/// `std::collections::hash_map::DefaultHasher` is randomized per process,
/// so snapshot baseline matching across participants uses FNV instead.
pub fn content_hash(text: &str) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    format!("{hash:016x}")
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_edit_net_delta() {
        assert_eq!(TextEdit::insert(0, "abc").net_delta(), 3);
        assert_eq!(TextEdit::delete(0, 2).net_delta(), -2);
        assert_eq!(TextEdit::replace(0, 2, "abcd").net_delta(), 2);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let msg = SessionMessage::TextChange {
            file_name: "main.py".into(),
            server_version: 3,
            edits: vec![TextEdit::insert(3, "\ny=2")],
        };
        let env = Envelope::new(2, 7, msg.clone());
        let json = env.encode().unwrap();
        let decoded = Envelope::decode(&json).unwrap();
        assert_eq!(decoded.sender_id, 2);
        assert_eq!(decoded.send_id, 7);
        assert_eq!(decoded.message, msg);
    }

    #[test]
    fn test_message_type_tag_on_wire() {
        let env = Envelope::new(1, 1, SessionMessage::SaveFile { file_name: "a.rs".into() });
        let json = env.encode().unwrap();
        assert!(json.contains("\"messageType\":\"saveFile\""), "got {json}");
        assert!(json.contains("\"senderId\":1"), "got {json}");
    }

    #[test]
    fn test_bus_event_roundtrip() {
        let env = Envelope::new(1, 4, SessionMessage::JoinRequest {});
        let event = BusEvent {
            event_id: 99,
            envelope: env.clone(),
        };
        let json = event.encode().unwrap();
        let decoded = BusEvent::decode(&json).unwrap();
        assert_eq!(decoded.event_id, 99);
        assert_eq!(decoded.envelope, env);
    }

    #[test]
    fn test_unknown_message_type_decodes() {
        let json = r#"{"senderId":3,"sendId":10,"messageType":"portForward","port":8080}"#;
        let decoded = Envelope::decode(json).unwrap();
        assert_eq!(decoded.message, SessionMessage::Unknown);
        assert_eq!(decoded.sender_id, 3);
    }

    #[test]
    fn test_selection_change_optional_force_jump() {
        let env = Envelope::new(
            2,
            1,
            SessionMessage::SelectionChange {
                file_name: "a.rs".into(),
                start: 5,
                length: 0,
                is_reversed: false,
                force_jump_for: None,
            },
        );
        let json = env.encode().unwrap();
        assert!(!json.contains("forceJumpFor"), "got {json}");

        let json = r#"{"senderId":2,"sendId":2,"messageType":"selectionChange","fileName":"a.rs","start":5,"length":3,"isReversed":true,"forceJumpFor":4}"#;
        match Envelope::decode(json).unwrap().message {
            SessionMessage::SelectionChange { force_jump_for, is_reversed, .. } => {
                assert_eq!(force_jump_for, Some(4));
                assert!(is_reversed);
            }
            other => panic!("expected SelectionChange, got {other:?}"),
        }
    }

    #[test]
    fn test_file_open_acknowledge_roundtrip() {
        let msg = SessionMessage::FileOpenAcknowledge {
            file_name: "main.py".into(),
            joiner_id: 2,
            snapshot_server_version: 3,
            first_history_version: 4,
            snapshot_edits: vec![TextEdit::insert(0, "c3")],
            fallback_text: None,
            history: vec![HistoryRecord {
                server_version: 4,
                sender_id: 1,
                send_id: 11,
                edits: vec![TextEdit::insert(2, "c4")],
            }],
            is_read_only: false,
        };
        let env = Envelope::new(1, 9, msg.clone());
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.message, msg);
    }

    #[test]
    fn test_message_target() {
        let ack = SessionMessage::JoinAcknowledge {
            joiner_id: 5,
            participant_ids: vec![1, 2, 5],
            open_files: vec![],
        };
        assert_eq!(ack.target(), Some(5));
        assert_eq!(SessionMessage::JoinRequest {}.target(), None);
        assert_eq!(SessionMessage::Summon {}.target(), None);
    }

    #[test]
    fn test_message_file_name() {
        let msg = SessionMessage::SaveFile { file_name: "x.txt".into() };
        assert_eq!(msg.file_name(), Some("x.txt"));
        assert_eq!(SessionMessage::JoinRequest {}.file_name(), None);
    }

    #[test]
    fn test_content_hash_deterministic() {
        assert_eq!(content_hash("x=1"), content_hash("x=1"));
        assert_ne!(content_hash("x=1"), content_hash("x=2"));
        // FNV-1a offset basis for the empty string
        assert_eq!(content_hash(""), "cbf29ce484222325");
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(Envelope::decode("{не json").is_err());
        assert!(BusEvent::decode("").is_err());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(
            SessionMessage::TextChange {
                file_name: "a".into(),
                server_version: 0,
                edits: vec![],
            }
            .kind(),
            "textChange"
        );
        assert_eq!(SessionMessage::Unknown.kind(), "unknown");
    }
}
