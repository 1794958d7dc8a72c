//! Container editing.
//!
//! Edits are queued on a [`ContainerEditor`] and applied in one rewrite.
//! Applying is all-or-nothing:
//!
//! 1. The container's current bytes are read (a missing container is empty)
//! 2. The codec streams a complete new container into a temporary sibling
//! 3. The sibling is synced and renamed over the original
//! 4. The container's generation is bumped, invalidating cached streams
//!
//! A failure or cancellation at any step before the rename leaves the
//! original untouched and removes the sibling. For a container nested in
//! another, the new inner bytes are written back as an edit of the outer
//! container, so the same guarantee holds at the outermost file.
//!
//! # Example
//!
//! ```rust,no_run
//! use archfs::ResourceHandlerFactory;
//! use archfs::edit::ContainerEditor;
//!
//! let factory = ResourceHandlerFactory::default();
//! let container = factory.container("/library/books.zip")?;
//!
//! let mut editor = ContainerEditor::new(container);
//! editor.put("meta/info.xml", b"<info/>".to_vec())?;
//! editor.put("meta/cover.jpg", std::fs::read("cover.jpg")?)?;
//! let summary = editor.apply()?;
//!
//! println!("replaced {}, added {}", summary.entries_replaced, summary.entries_added);
//! # Ok::<(), archfs::Error>(())
//! ```

pub(crate) mod atomic;
mod editor;
mod operation;

pub use editor::ContainerEditor;
pub use operation::EntryEdit;
