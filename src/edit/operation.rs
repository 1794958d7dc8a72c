//! Queued container modifications.

use crate::{EntryPath, Result};

/// Adds an entry, or replaces it if the container already holds one with
/// the same normalized path.
///
/// There are no delete or rename edits: the layer above only ever puts
/// content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryEdit {
    /// Target entry.
    pub path: EntryPath,
    /// New content.
    pub data: Vec<u8>,
}

impl EntryEdit {
    /// Creates an edit.
    pub fn new(path: EntryPath, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path,
            data: data.into(),
        }
    }

    /// Creates an edit from a path string, normalizing separators.
    pub fn parse(path: &str, data: impl Into<Vec<u8>>) -> Result<Self> {
        Ok(Self::new(EntryPath::normalize(path)?, data))
    }

    /// Returns the number of content bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the new content is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
