//! Document-store capability: the engine's view of the host editor.
//!
//! The engine never owns a text widget or a filesystem. Everything it needs
//! from its environment — read a file, apply edits to an open document,
//! save, reveal a range in a view column — goes through [`DocumentStore`].
//! [`MemoryDocumentStore`] is the in-memory implementation used by tests
//! and local tooling; a real embedding adapts its editor here.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::buffer::TextBuffer;
use crate::protocol::TextEdit;

/// A reveal performed against the editor surface, recorded for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealRecord {
    pub column: usize,
    pub file_name: String,
    pub start: usize,
    pub length: usize,
}

/// Capability interface over the embedding editor/filesystem.
///
/// Implementations use interior mutability: the session client holds a
/// shared reference and calls from its single consumer task.
pub trait DocumentStore: Send + Sync {
    /// Read a file's current content. Missing files are an error; use
    /// [`DocumentStore::exists`] to check first.
    fn read(&self, file_name: &str) -> Result<String, DocumentError>;

    /// Create or replace a document's content wholesale (late-join seed).
    fn write(&self, file_name: &str, text: &str) -> Result<(), DocumentError>;

    /// Apply edits to an open document, in the given order.
    fn apply_edits(&self, file_name: &str, edits: &[TextEdit]) -> Result<(), DocumentError>;

    /// Persist a document.
    fn save(&self, file_name: &str) -> Result<(), DocumentError>;

    /// Show `file_name` in `column`, replacing whatever document the pane
    /// held.
    fn open_in_column(&self, column: usize, file_name: &str) -> Result<(), DocumentError>;

    /// Scroll a range into view in `column`.
    fn reveal_range(
        &self,
        column: usize,
        file_name: &str,
        start: usize,
        length: usize,
    ) -> Result<(), DocumentError>;

    fn exists(&self, file_name: &str) -> bool;

    /// Remove a document (rename plumbing, local close).
    fn remove(&self, file_name: &str) -> Result<(), DocumentError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    docs: HashMap<String, TextBuffer>,
    saved: HashMap<String, String>,
    reveals: Vec<RevealRecord>,
    column_docs: HashMap<usize, String>,
}

/// In-memory document store.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<MemoryState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document, as if the user had it open already.
    pub fn insert(&self, file_name: &str, text: &str) {
        let mut state = self.state.lock().expect("document store poisoned");
        state
            .docs
            .insert(file_name.to_string(), TextBuffer::from_text(text));
    }

    /// Current text of a document, for assertions.
    pub fn text(&self, file_name: &str) -> Option<String> {
        let state = self.state.lock().expect("document store poisoned");
        state.docs.get(file_name).map(|b| b.text().to_string())
    }

    /// Last saved text of a document, for assertions.
    pub fn saved_text(&self, file_name: &str) -> Option<String> {
        let state = self.state.lock().expect("document store poisoned");
        state.saved.get(file_name).cloned()
    }

    /// Every reveal performed so far, in order.
    pub fn reveals(&self) -> Vec<RevealRecord> {
        let state = self.state.lock().expect("document store poisoned");
        state.reveals.clone()
    }

    /// The document a view column currently shows.
    pub fn column_document(&self, column: usize) -> Option<String> {
        let state = self.state.lock().expect("document store poisoned");
        state.column_docs.get(&column).cloned()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn read(&self, file_name: &str) -> Result<String, DocumentError> {
        let state = self.state.lock().expect("document store poisoned");
        state
            .docs
            .get(file_name)
            .map(|b| b.text().to_string())
            .ok_or_else(|| DocumentError::NotFound(file_name.to_string()))
    }

    fn write(&self, file_name: &str, text: &str) -> Result<(), DocumentError> {
        let mut state = self.state.lock().expect("document store poisoned");
        state
            .docs
            .insert(file_name.to_string(), TextBuffer::from_text(text));
        Ok(())
    }

    fn apply_edits(&self, file_name: &str, edits: &[TextEdit]) -> Result<(), DocumentError> {
        let mut state = self.state.lock().expect("document store poisoned");
        let buffer = state
            .docs
            .get_mut(file_name)
            .ok_or_else(|| DocumentError::NotFound(file_name.to_string()))?;
        buffer
            .apply_all(edits)
            .map_err(|e| DocumentError::EditFailed(file_name.to_string(), e.to_string()))
    }

    fn save(&self, file_name: &str) -> Result<(), DocumentError> {
        let mut state = self.state.lock().expect("document store poisoned");
        let text = state
            .docs
            .get(file_name)
            .map(|b| b.text().to_string())
            .ok_or_else(|| DocumentError::NotFound(file_name.to_string()))?;
        state.saved.insert(file_name.to_string(), text);
        Ok(())
    }

    fn open_in_column(&self, column: usize, file_name: &str) -> Result<(), DocumentError> {
        let mut state = self.state.lock().expect("document store poisoned");
        if !state.docs.contains_key(file_name) {
            return Err(DocumentError::NotFound(file_name.to_string()));
        }
        state.column_docs.insert(column, file_name.to_string());
        Ok(())
    }

    fn reveal_range(
        &self,
        column: usize,
        file_name: &str,
        start: usize,
        length: usize,
    ) -> Result<(), DocumentError> {
        let mut state = self.state.lock().expect("document store poisoned");
        state.reveals.push(RevealRecord {
            column,
            file_name: file_name.to_string(),
            start,
            length,
        });
        Ok(())
    }

    fn exists(&self, file_name: &str) -> bool {
        let state = self.state.lock().expect("document store poisoned");
        state.docs.contains_key(file_name)
    }

    fn remove(&self, file_name: &str) -> Result<(), DocumentError> {
        let mut state = self.state.lock().expect("document store poisoned");
        state
            .docs
            .remove(file_name)
            .map(|_| ())
            .ok_or_else(|| DocumentError::NotFound(file_name.to_string()))
    }
}

/// Document capability errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    NotFound(String),
    EditFailed(String, String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "document not found: {name}"),
            Self::EditFailed(name, reason) => write!(f, "edit to {name} failed: {reason}"),
        }
    }
}

impl std::error::Error for DocumentError {}
