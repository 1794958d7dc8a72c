//! Error types for the virtual resource layer.
//!
//! This module provides the [`Error`] enum which represents every failure a
//! caller of this crate can observe, along with a convenient [`Result<T>`]
//! type alias.
//!
//! # Propagation
//!
//! Path classification and codec failures always surface as typed errors.
//! Nothing in this crate answers a failed extraction with empty content,
//! because a caller could not tell an empty entry from a broken one.
//!
//! ```rust,no_run
//! use archfs::{Error, ResourceHandlerFactory};
//!
//! fn read_metadata(path: &str) -> archfs::Result<Option<Vec<u8>>> {
//!     let factory = ResourceHandlerFactory::default();
//!     let mut handle = factory.resolve(path)?;
//!     match handle.read_bytes() {
//!         Ok(bytes) => Ok(Some(bytes)),
//!         Err(Error::EntryNotFound { .. }) => Ok(None),
//!         Err(e) => Err(e),
//!     }
//! }
//! ```

use std::io;

/// The main error type for resource resolution, archive access and mounts.
///
/// # Error Categories
///
/// | Category | Variants | Typical Cause |
/// |----------|----------|---------------|
/// | Addressing | [`InvalidPathKind`][Self::InvalidPathKind], [`EntryNotFound`][Self::EntryNotFound] | Bad logical path, missing entry |
/// | Format | [`CorruptContainer`][Self::CorruptContainer] | Damaged archive |
/// | Compatibility | [`UnsupportedCompressionMethod`][Self::UnsupportedCompressionMethod], [`UnsupportedFeature`][Self::UnsupportedFeature] | Method or format variant not handled |
/// | Storage | [`Io`][Self::Io] | File system operations |
/// | Mounts | [`MountBusy`][Self::MountBusy] | Readers still hold a mount at a checkpoint |
/// | Security | [`PathTraversal`][Self::PathTraversal], [`ResourceLimitExceeded`][Self::ResourceLimitExceeded] | Hostile archives |
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A logical path cannot be classified.
    ///
    /// Returned for empty paths, for an archive segment followed by an
    /// empty segment (`books.zip//page.xml`), for `.` or `..` inside an
    /// entry path, and for operations that do not apply to the handle kind
    /// (for example `write_entry` on a handle that is not a container).
    #[error("Invalid resource path '{path}': {reason}")]
    InvalidPathKind {
        /// The offending logical path.
        path: String,
        /// Why the path was rejected.
        reason: String,
    },

    /// An entry was not found in the container.
    ///
    /// Lookups compare normalized forward-slash paths exactly; there is no
    /// globbing and no case folding.
    ///
    /// ```rust,ignore
    /// use archfs::Error;
    ///
    /// if let Err(Error::EntryNotFound { container, path }) = handle.read_bytes() {
    ///     eprintln!("{} has no entry {}", container, path);
    /// }
    /// ```
    #[error("Entry not found in {container}: {path}")]
    EntryNotFound {
        /// Logical path of the container that was searched.
        container: String,
        /// The entry path that was not found.
        path: String,
    },

    /// The container's structure is damaged.
    ///
    /// This covers bad signatures, truncated headers, header checksum
    /// failures and CRC mismatches of extracted data. The offset points at
    /// the structure that failed to parse, or at the entry's local header
    /// for data checksum failures.
    ///
    /// # Recovery
    ///
    /// Re-acquire the file if possible. Other entries of the same container
    /// may still be readable.
    #[error("Corrupt container at offset {offset:#x}: {reason}")]
    CorruptContainer {
        /// The byte offset where corruption was detected.
        offset: u64,
        /// A description of the corruption.
        reason: String,
    },

    /// An entry uses a compression method this build cannot decode.
    ///
    /// Zip entries support store and deflate (with the `deflate` feature).
    /// Rar entries support store only. Encrypted entries are reported here
    /// too.
    #[error("Unsupported compression method: {method}")]
    UnsupportedCompressionMethod {
        /// Human readable method description, e.g. `zip method 14`.
        method: String,
    },

    /// A container feature this crate does not handle.
    ///
    /// For example writing into a RAR 5 archive, or writing zip entries
    /// larger than 4 GiB.
    #[error("Unsupported feature: {feature}")]
    UnsupportedFeature {
        /// The name of the unsupported feature.
        feature: &'static str,
    },

    /// An I/O error from the underlying storage.
    ///
    /// ```rust
    /// use archfs::Error;
    /// use std::io::ErrorKind;
    ///
    /// fn handle_io_error(error: &Error) {
    ///     if let Error::Io(e) = error {
    ///         match e.kind() {
    ///             ErrorKind::NotFound => println!("File not found"),
    ///             ErrorKind::PermissionDenied => println!("Access denied"),
    ///             _ => println!("I/O error: {}", e),
    ///         }
    ///     }
    /// }
    /// ```
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Mounts were still referenced when a checkpoint timed out.
    ///
    /// The listed containers stay mounted and are swept again at the next
    /// checkpoint. All other mounts were released.
    #[error("Mounts still in use after checkpoint timeout: {}", containers.join(", "))]
    MountBusy {
        /// Logical paths of the containers that could not be unmounted.
        containers: Vec<String>,
    },

    /// An entry path would escape the staging directory of a mount.
    #[error("Path traversal detected in entry: {path}")]
    PathTraversal {
        /// The entry path that contains traversal.
        path: String,
    },

    /// A resource limit was exceeded.
    ///
    /// Entries are fully buffered in memory, so decompression is capped by
    /// [`ResolverConfig::max_entry_size`](crate::ResolverConfig::max_entry_size).
    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    /// The operation was cancelled through a [`ProgressReporter`].
    ///
    /// The container being rewritten is left untouched.
    ///
    /// [`ProgressReporter`]: crate::progress::ProgressReporter
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Creates a [`CorruptContainer`](Self::CorruptContainer) error.
    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptContainer {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an [`InvalidPathKind`](Self::InvalidPathKind) error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPathKind {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an [`EntryNotFound`](Self::EntryNotFound) error.
    pub fn entry_not_found(container: impl Into<String>, path: impl Into<String>) -> Self {
        Self::EntryNotFound {
            container: container.into(),
            path: path.into(),
        }
    }

    /// Returns `true` if the error indicates damaged container data.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::CorruptContainer { .. })
    }

    /// Returns `true` if the error is caused by something this build does
    /// not support rather than by bad data.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedCompressionMethod { .. } | Error::UnsupportedFeature { .. }
        )
    }

    /// Returns `true` if the addressed resource does not exist.
    ///
    /// Both missing entries and missing files count.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::EntryNotFound { .. } => true,
            Error::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Fills in the container of an [`EntryNotFound`](Self::EntryNotFound)
    /// raised by a codec, which does not know the container's name.
    pub(crate) fn with_container(self, name: &str) -> Self {
        match self {
            Error::EntryNotFound { container, path } if container.is_empty() => Error::EntryNotFound {
                container: name.to_string(),
                path,
            },
            other => other,
        }
    }

    /// Produces an equivalent error value.
    ///
    /// `Error` is not `Clone` because [`io::Error`] is not. A load failure
    /// shared by several waiting readers is handed to each of them through
    /// this method; I/O errors keep their kind and message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Error::InvalidPathKind { path, reason } => Error::InvalidPathKind {
                path: path.clone(),
                reason: reason.clone(),
            },
            Error::EntryNotFound { container, path } => Error::EntryNotFound {
                container: container.clone(),
                path: path.clone(),
            },
            Error::CorruptContainer { offset, reason } => Error::CorruptContainer {
                offset: *offset,
                reason: reason.clone(),
            },
            Error::UnsupportedCompressionMethod { method } => {
                Error::UnsupportedCompressionMethod {
                    method: method.clone(),
                }
            }
            Error::UnsupportedFeature { feature } => Error::UnsupportedFeature { feature: *feature },
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::MountBusy { containers } => Error::MountBusy {
                containers: containers.clone(),
            },
            Error::PathTraversal { path } => Error::PathTraversal { path: path.clone() },
            Error::ResourceLimitExceeded(msg) => Error::ResourceLimitExceeded(msg.clone()),
            Error::Cancelled => Error::Cancelled,
        }
    }
}

/// A specialized [`Result`](std::result::Result) type for this crate.
///
/// ```rust
/// use archfs::Result;
///
/// fn my_function() -> Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_not_found());
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_corrupt_container_display() {
        let err = Error::corrupt(0x1234, "bad signature");
        assert_eq!(
            err.to_string(),
            "Corrupt container at offset 0x1234: bad signature"
        );
        assert!(err.is_corruption());
    }

    #[test]
    fn test_entry_not_found() {
        let err = Error::entry_not_found("books.zip", "meta/info.xml");
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "Entry not found in books.zip: meta/info.xml"
        );
    }

    #[test]
    fn test_mount_busy_lists_containers() {
        let err = Error::MountBusy {
            containers: vec!["a.zip".into(), "b.zip".into()],
        };
        assert!(err.to_string().ends_with("a.zip, b.zip"));
    }

    #[test]
    fn test_unsupported() {
        let err = Error::UnsupportedCompressionMethod {
            method: "zip method 14".into(),
        };
        assert!(err.is_unsupported());
        assert!(
            Error::UnsupportedFeature {
                feature: "RAR 5 writing"
            }
            .is_unsupported()
        );
        assert!(!Error::Cancelled.is_unsupported());
    }

    #[test]
    fn test_duplicate_preserves_io_kind() {
        let err = Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        match err.duplicate() {
            Error::Io(e) => {
                assert_eq!(e.kind(), io::ErrorKind::PermissionDenied);
                assert!(e.to_string().contains("denied"));
            }
            other => panic!("expected Io, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_structured() {
        let err = Error::corrupt(7, "crc");
        match err.duplicate() {
            Error::CorruptContainer { offset, reason } => {
                assert_eq!(offset, 7);
                assert_eq!(reason, "crc");
            }
            other => panic!("expected CorruptContainer, got {:?}", other),
        }
    }
}
