//! Batched container editor.

use crate::container::ContainerDescriptor;
use crate::format::RewriteSummary;
use crate::progress::{NoProgress, ProgressReporter};
use crate::{EntryPath, Result};

use super::operation::EntryEdit;

/// Queues edits for one container and applies them in a single atomic
/// rewrite.
///
/// Queuing several puts for the same path keeps the last one.
#[derive(Debug)]
pub struct ContainerEditor {
    container: ContainerDescriptor,
    edits: Vec<EntryEdit>,
}

impl ContainerEditor {
    /// Creates an editor for `container`.
    pub fn new(container: ContainerDescriptor) -> Self {
        Self {
            container,
            edits: Vec::new(),
        }
    }

    /// Queues an add-or-replace of the entry at `path`.
    ///
    /// `path` may use either separator.
    pub fn put(&mut self, path: &str, data: impl Into<Vec<u8>>) -> Result<&mut Self> {
        self.edits.push(EntryEdit::parse(path, data)?);
        Ok(self)
    }

    /// Queues an add-or-replace with an already validated path.
    pub fn put_entry(&mut self, path: EntryPath, data: impl Into<Vec<u8>>) -> &mut Self {
        self.edits.push(EntryEdit::new(path, data));
        self
    }

    /// Returns the number of queued edits.
    pub fn pending_edits(&self) -> usize {
        self.edits.len()
    }

    /// Returns whether any edits are queued.
    pub fn has_pending_edits(&self) -> bool {
        !self.edits.is_empty()
    }

    /// Drops all queued edits.
    pub fn clear(&mut self) {
        self.edits.clear();
    }

    /// Returns the container being edited.
    pub fn container(&self) -> &ContainerDescriptor {
        &self.container
    }

    /// Applies all queued edits.
    pub fn apply(self) -> Result<RewriteSummary> {
        self.apply_with_progress(&mut NoProgress)
    }

    /// Applies all queued edits, reporting progress per entry.
    ///
    /// Without queued edits the container is not touched and an empty
    /// summary is returned.
    pub fn apply_with_progress(self, progress: &mut dyn ProgressReporter) -> Result<RewriteSummary> {
        if self.edits.is_empty() {
            return Ok(RewriteSummary::default());
        }
        self.container.apply(&self.edits, progress)
    }
}
