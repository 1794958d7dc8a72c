//! # archfs
//!
//! An archive-aware virtual resource layer.
//!
//! Applications that keep books and comics in zip-based formats (EPUB, CBZ)
//! and RAR archives (CBR) want to address `library/book.epub/OEBPS/cover.jpg`
//! the same way they address `library/notes.txt`. This crate provides one
//! handle type for plain files, archive entries and entries of archives
//! nested in archives. Entries are extracted lazily, written back through
//! crash-safe container rewrites, and can be staged on disk when a real path
//! is required.
//!
//! ## Quick Start
//!
//! ### Reading an Entry
//!
//! ```rust,no_run
//! use archfs::{ResourceHandlerFactory, Result};
//!
//! fn main() -> Result<()> {
//!     let factory = ResourceHandlerFactory::default();
//!
//!     let mut opf = factory.resolve("/library/book.epub/OEBPS/content.opf")?;
//!     let xml = String::from_utf8_lossy(&opf.read_bytes()?).into_owned();
//!     println!("{} bytes of metadata", xml.len());
//!     Ok(())
//! }
//! ```
//!
//! ### Writing into a Container
//!
//! ```rust,no_run
//! use archfs::{ResourceHandlerFactory, Result};
//!
//! fn main() -> Result<()> {
//!     let factory = ResourceHandlerFactory::default();
//!
//!     // Replaces the entry in position, or appends it.
//!     let mut info = factory.resolve("/library/books.zip/meta/info.xml")?;
//!     info.write(b"<info rating=\"5\"/>")?;
//!
//!     // Or address the container and name the entry.
//!     let mut comic = factory.resolve("/comics/issue1.cbr")?;
//!     let summary = comic.write_entry("ComicInfo.xml", b"<ComicInfo/>".to_vec())?;
//!     println!("{} entries", summary.total_entries());
//!     Ok(())
//! }
//! ```
//!
//! ### Staging a Container on Disk
//!
//! ```rust,no_run
//! use archfs::{ResourceHandlerFactory, Result};
//!
//! fn main() -> Result<()> {
//!     let factory = ResourceHandlerFactory::default();
//!     let _scope = factory.scope();
//!
//!     let page = factory.resolve("/comics/issue1.cbz/001.png")?;
//!     let staged = page.materialize()?;
//!     println!("open {}", staged.display());
//!     Ok(())
//! } // the scope's checkpoint deletes the staging directory
//! ```
//!
//! ## Formats
//!
//! | Format | Extensions | Read | Write |
//! |--------|------------|------|-------|
//! | Zip | `zip`, `epub`, `cbz`, `jar` | store, deflate, zip64 | store, deflate |
//! | RAR 1.5-4.x | `rar`, `cbr` | list all, extract store | store |
//! | RAR 5 | `rar`, `cbr` | list all, extract store | no |
//!
//! Formats are sniffed from the container's signature, so a zip archive
//! named `.cbr` is still read as zip. Extensions are configurable through
//! [`ResolverConfig`].
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `deflate` | Yes | Deflate support for zip entries |
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`]. Failures are never reported as empty
//! content:
//!
//! ```rust,no_run
//! use archfs::{Error, ResourceHandlerFactory};
//!
//! fn cover(factory: &ResourceHandlerFactory, book: &str) -> archfs::Result<Option<Vec<u8>>> {
//!     let mut handle = factory.resolve(&format!("{}/cover.jpg", book))?;
//!     match handle.read_bytes() {
//!         Ok(bytes) => Ok(Some(bytes)),
//!         Err(Error::EntryNotFound { .. }) => Ok(None),
//!         Err(e @ Error::UnsupportedCompressionMethod { .. }) => {
//!             eprintln!("cannot unpack: {}", e);
//!             Ok(None)
//!         }
//!         Err(e) => Err(e),
//!     }
//! }
//! ```
//!
//! ## Minimum Supported Rust Version (MSRV)
//!
//! This crate requires **Rust 1.85** or later.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod archive_path;
pub mod checkpoint;
pub mod config;
pub mod container;
pub mod edit;
pub mod error;
pub mod format;
pub mod handle;
pub mod mount;
pub mod progress;
pub mod resolve;
pub mod safety;
pub mod stream;
pub mod timestamp;

mod factory;

pub use archive_path::EntryPath;
pub use checkpoint::OperationScope;
pub use config::ResolverConfig;
pub use container::{ContainerDescriptor, ContainerLocation};
pub use edit::{ContainerEditor, EntryEdit};
pub use error::{Error, Result};
pub use factory::ResourceHandlerFactory;
pub use format::{ArchiveCodec, CompressionMethod, ContainerFormat, EntryInfo, RewriteSummary};
pub use handle::{Materialized, ResourceHandle, ResourceReader};
pub use mount::{MountLease, MountRegistry, unmount_all};
pub use progress::{AtomicProgress, NoProgress, ProgressReporter, progress_fn};
pub use resolve::{PathKind, PathResolver, ResourcePath};
pub use safety::LimitedReader;
pub use stream::{EntrySource, LazyEntryStream};
pub use timestamp::DosDateTime;
