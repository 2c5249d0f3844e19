//! Text buffer primitive and the offset-transform core.
//!
//! The reconciliation algorithm in [`crate::engine`] is built on two pure
//! operations defined here:
//!
//! - applying a [`TextEdit`] to a buffer, bounds- and boundary-checked;
//! - transforming an edit's offset past another edit that sorts earlier in
//!   server order, shifting by that edit's net length delta.
//!
//! Everything is synchronous and allocation-light; concurrency safety comes
//! from the session client's single-consumer queue, not from locks here.

use crate::protocol::TextEdit;

/// A plain UTF-8 text buffer mirroring one shared file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    text: String,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Replace the whole content (late-join seeding).
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    /// Apply a single edit in place.
    pub fn apply(&mut self, edit: &TextEdit) -> Result<(), BufferError> {
        let end = edit
            .offset
            .checked_add(edit.delete_length)
            .filter(|end| *end <= self.text.len())
            .ok_or(BufferError::OutOfBounds {
                offset: edit.offset,
                delete_length: edit.delete_length,
                buffer_len: self.text.len(),
            })?;
        if !self.text.is_char_boundary(edit.offset) || !self.text.is_char_boundary(end) {
            return Err(BufferError::NotCharBoundary { offset: edit.offset });
        }
        self.text.replace_range(edit.offset..end, &edit.insert_text);
        Ok(())
    }

    /// Apply edits one after another, each against the buffer as left by
    /// the previous one.
    pub fn apply_all(&mut self, edits: &[TextEdit]) -> Result<(), BufferError> {
        for edit in edits {
            self.apply(edit)?;
        }
        Ok(())
    }
}

/// Convert a same-coordinate-space batch into sequential application order.
///
/// Edits inside one `TextChange` all reference the pre-change buffer.
/// Applying them highest-offset first is equivalent to sequential
/// application, because an edit never moves text below its own offset.
pub fn sequentialize(mut edits: Vec<TextEdit>) -> Vec<TextEdit> {
    edits.sort_by(|a, b| b.offset.cmp(&a.offset));
    edits
}

/// Where `against` sits relative to the transformed edit in server order.
///
/// The direction decides equal-offset ties: the edit sequenced earlier
/// keeps the position, the later one shifts past it. Getting this wrong
/// makes two replicas order same-offset inserts oppositely and diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformSide {
    /// `against` was sequenced before the edit; a tie shifts the edit.
    Earlier,
    /// `against` will be sequenced after the edit (an optimistic local
    /// edit not yet acknowledged); a tie leaves the edit in place.
    Later,
}

/// Transform `edit` past `against`. If `against` touches text before
/// `edit`'s offset (or at it, when `against` sorted earlier), the offset
/// shifts by `against`'s net length delta, clamped so a deletion spanning
/// the offset cannot push it before the deletion point.
pub fn transform_edit(edit: &TextEdit, against: &TextEdit, side: TransformSide) -> TextEdit {
    let shifts = match side {
        TransformSide::Earlier => against.offset <= edit.offset,
        TransformSide::Later => against.offset < edit.offset,
    };
    if !shifts {
        return edit.clone();
    }
    let shifted = (edit.offset as i64 + against.net_delta()).max(against.offset as i64);
    TextEdit {
        offset: shifted as usize,
        delete_length: edit.delete_length,
        insert_text: edit.insert_text.clone(),
    }
}

/// Transform a sequential edit list past every edit in `against`, in order.
pub fn transform_all(edits: &[TextEdit], against: &[TextEdit], side: TransformSide) -> Vec<TextEdit> {
    edits
        .iter()
        .map(|edit| {
            let mut out = edit.clone();
            for a in against {
                out = transform_edit(&out, a, side);
            }
            out
        })
        .collect()
}

/// Buffer application errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    OutOfBounds {
        offset: usize,
        delete_length: usize,
        buffer_len: usize,
    },
    NotCharBoundary {
        offset: usize,
    },
}

impl std::fmt::Display for BufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds {
                offset,
                delete_length,
                buffer_len,
            } => write!(
                f,
                "edit at offset {offset} deleting {delete_length} exceeds buffer of {buffer_len} bytes"
            ),
            Self::NotCharBoundary { offset } => {
                write!(f, "edit offset {offset} is not a char boundary")
            }
        }
    }
}

impl std::error::Error for BufferError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_insert() {
        let mut buf = TextBuffer::from_text("x=1");
        buf.apply(&TextEdit::insert(3, "\ny=2")).unwrap();
        assert_eq!(buf.text(), "x=1\ny=2");
    }

    #[test]
    fn test_apply_delete() {
        let mut buf = TextBuffer::from_text("hello world");
        buf.apply(&TextEdit::delete(5, 6)).unwrap();
        assert_eq!(buf.text(), "hello");
    }

    #[test]
    fn test_apply_replace() {
        let mut buf = TextBuffer::from_text("let x = 1;");
        buf.apply(&TextEdit::replace(8, 1, "42")).unwrap();
        assert_eq!(buf.text(), "let x = 42;");
    }

    #[test]
    fn test_apply_out_of_bounds() {
        let mut buf = TextBuffer::from_text("abc");
        let err = buf.apply(&TextEdit::delete(2, 5)).unwrap_err();
        assert!(matches!(err, BufferError::OutOfBounds { .. }));
        assert_eq!(buf.text(), "abc");
    }

    #[test]
    fn test_apply_overflow_range() {
        let mut buf = TextBuffer::from_text("abc");
        let err = buf.apply(&TextEdit::delete(usize::MAX, 2)).unwrap_err();
        assert!(matches!(err, BufferError::OutOfBounds { .. }));
    }

    #[test]
    fn test_apply_rejects_split_char() {
        let mut buf = TextBuffer::from_text("héllo");
        // 'é' occupies bytes 1..3
        let err = buf.apply(&TextEdit::insert(2, "x")).unwrap_err();
        assert!(matches!(err, BufferError::NotCharBoundary { .. }));
    }

    #[test]
    fn test_apply_all_sequential() {
        let mut buf = TextBuffer::from_text("ab");
        buf.apply_all(&[TextEdit::insert(2, "c"), TextEdit::insert(3, "d")])
            .unwrap();
        assert_eq!(buf.text(), "abcd");
    }

    #[test]
    fn test_sequentialize_orders_descending() {
        let edits = sequentialize(vec![
            TextEdit::insert(1, "x"),
            TextEdit::insert(5, "y"),
            TextEdit::insert(3, "z"),
        ]);
        let offsets: Vec<usize> = edits.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![5, 3, 1]);
    }

    #[test]
    fn test_batch_equals_sequential_application() {
        // Two same-space edits applied highest-first produce the same text
        // as naively editing at both original spots would intend.
        let mut buf = TextBuffer::from_text("0123456789");
        let batch = sequentialize(vec![TextEdit::insert(2, "A"), TextEdit::insert(7, "B")]);
        buf.apply_all(&batch).unwrap();
        assert_eq!(buf.text(), "01A23456B789");
    }

    #[test]
    fn test_transform_shifts_after_earlier_insert() {
        let earlier = TextEdit::insert(2, "abc");
        let incoming = TextEdit::insert(5, "x");
        let out = transform_edit(&incoming, &earlier, TransformSide::Earlier);
        assert_eq!(out.offset, 8);
    }

    #[test]
    fn test_transform_unaffected_by_later_edit() {
        let earlier = TextEdit::insert(9, "abc");
        let incoming = TextEdit::insert(5, "x");
        let out = transform_edit(&incoming, &earlier, TransformSide::Earlier);
        assert_eq!(out.offset, 5);
    }

    #[test]
    fn test_transform_shift_negative_for_delete() {
        let earlier = TextEdit::delete(0, 3);
        let incoming = TextEdit::insert(5, "x");
        let out = transform_edit(&incoming, &earlier, TransformSide::Earlier);
        assert_eq!(out.offset, 2);
    }

    #[test]
    fn test_transform_clamps_inside_deleted_range() {
        let earlier = TextEdit::delete(2, 6);
        let incoming = TextEdit::insert(4, "x");
        let out = transform_edit(&incoming, &earlier, TransformSide::Earlier);
        assert_eq!(out.offset, 2);
    }

    #[test]
    fn test_transform_tie_shifts_past_earlier_edit() {
        // Equal offsets: the edit that sorted earlier wins the spot, the
        // incoming one lands after its insertion.
        let earlier = TextEdit::insert(3, "ab");
        let incoming = TextEdit::insert(3, "x");
        let out = transform_edit(&incoming, &earlier, TransformSide::Earlier);
        assert_eq!(out.offset, 5);
    }

    #[test]
    fn test_transform_tie_holds_against_later_edit() {
        // Against a pending local edit that will be sequenced after us,
        // an equal offset must NOT shift: we hold the earlier position.
        let pending = TextEdit::insert(3, "ab");
        let incoming = TextEdit::insert(3, "x");
        let out = transform_edit(&incoming, &pending, TransformSide::Later);
        assert_eq!(out.offset, 3);
    }

    #[test]
    fn test_disjoint_edits_commute() {
        // Property from the reconciliation contract: non-overlapping edits
        // applied in either order with transform yield identical buffers.
        let a = TextEdit::insert(1, "AA");
        let b = TextEdit::delete(6, 2);
        let base = "0123456789";

        let mut left = TextBuffer::from_text(base);
        left.apply(&a).unwrap();
        left.apply(&transform_edit(&b, &a, TransformSide::Earlier)).unwrap();

        let mut right = TextBuffer::from_text(base);
        right.apply(&b).unwrap();
        right.apply(&transform_edit(&a, &b, TransformSide::Earlier)).unwrap();

        assert_eq!(left.text(), right.text());
    }

    #[test]
    fn test_same_offset_inserts_converge() {
        // Server order: a before b. The replica that authored b applies it
        // optimistically and transforms a with `Later`; the replica that
        // authored a transforms b with `Earlier`. Both must agree.
        let a = TextEdit::insert(0, "A");
        let b = TextEdit::insert(0, "B");
        let base = "abc";

        let mut authored_b = TextBuffer::from_text(base);
        authored_b.apply(&b).unwrap();
        authored_b
            .apply(&transform_edit(&a, &b, TransformSide::Later))
            .unwrap();

        let mut authored_a = TextBuffer::from_text(base);
        authored_a.apply(&a).unwrap();
        authored_a
            .apply(&transform_edit(&b, &a, TransformSide::Earlier))
            .unwrap();

        assert_eq!(authored_b.text(), authored_a.text());
        assert_eq!(authored_b.text(), "ABabc");
    }

    #[test]
    fn test_transform_all_compounds() {
        let history = vec![TextEdit::insert(0, "aa"), TextEdit::insert(1, "b")];
        let incoming = vec![TextEdit::insert(4, "x")];
        let out = transform_all(&incoming, &history, TransformSide::Earlier);
        assert_eq!(out[0].offset, 7);
    }
}
