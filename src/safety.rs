//! Safety and resource limit utilities.
//!
//! This module provides staging path validation for mounts and a size-limited
//! reader used while decompressing entries into memory.

use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use crate::{EntryPath, Error, Result};

/// Resolves an entry path below a staging directory.
///
/// [`EntryPath`] already rejects `..` and absolute paths; this additionally
/// verifies, after canonicalizing the deepest existing ancestor, that the
/// target stays inside `root`. That catches symlinks planted in a staging
/// directory by earlier entries.
///
/// # Errors
///
/// Returns [`Error::PathTraversal`] if the path escapes `root`, or an I/O
/// error if `root` cannot be canonicalized.
pub fn validate_staging_path(entry: &EntryPath, root: &Path) -> Result<PathBuf> {
    let path_str = entry.as_str();
    let full_path = root.join(path_str);

    if !full_path
        .strip_prefix(root)
        .map(|rel| rel.components().all(|c| matches!(c, Component::Normal(_))))
        .unwrap_or(false)
    {
        return Err(Error::PathTraversal {
            path: path_str.to_string(),
        });
    }

    let canonical_root = root.canonicalize()?;

    // Walk up to the deepest existing ancestor
    let mut ancestor = full_path.as_path();
    let mut pending = Vec::new();
    while !ancestor.exists() {
        match (ancestor.file_name(), ancestor.parent()) {
            (Some(name), Some(parent)) => {
                pending.push(name.to_os_string());
                ancestor = parent;
            }
            _ => {
                return Err(Error::PathTraversal {
                    path: path_str.to_string(),
                });
            }
        }
    }

    let mut resolved = ancestor.canonicalize()?;
    for name in pending.into_iter().rev() {
        resolved.push(name);
    }

    if !resolved.starts_with(&canonical_root) {
        return Err(Error::PathTraversal {
            path: path_str.to_string(),
        });
    }

    Ok(full_path)
}

/// A reader wrapper that enforces a maximum decompressed size.
///
/// Exceeding the limit yields an [`io::Error`] wrapping
/// [`Error::ResourceLimitExceeded`]; [`read_to_vec_limited`] unwraps it again.
pub struct LimitedReader<R> {
    inner: R,
    max_entry_bytes: u64,
    bytes_read: u64,
}

impl<R> LimitedReader<R> {
    /// Creates a new limited reader with no limit.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_entry_bytes: u64::MAX,
            bytes_read: 0,
        }
    }

    /// Sets the maximum bytes for this entry.
    pub fn max_entry_bytes(mut self, max: u64) -> Self {
        self.max_entry_bytes = max;
        self
    }

    /// Returns the number of bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Returns the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            return Ok(0);
        }

        self.bytes_read += n as u64;
        if self.bytes_read > self.max_entry_bytes {
            return Err(io::Error::other(Error::ResourceLimitExceeded(format!(
                "Entry size {} exceeds limit {}",
                self.bytes_read, self.max_entry_bytes
            ))));
        }

        Ok(n)
    }
}

/// Reads `reader` to the end under a size limit.
///
/// `size_hint` only pre-sizes the buffer and is capped by the limit, so a
/// lying header cannot force a huge allocation.
pub(crate) fn read_to_vec_limited<R: Read>(reader: R, limit: u64, size_hint: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size_hint.min(limit).min(64 * 1024 * 1024) as usize);
    let mut limited = LimitedReader::new(reader).max_entry_bytes(limit);
    limited.read_to_end(&mut out).map_err(unwrap_io_error)?;
    Ok(out)
}

/// Recovers a crate error smuggled through an [`io::Error`].
pub(crate) fn unwrap_io_error(e: io::Error) -> Error {
    if e.get_ref().is_some_and(|inner| inner.is::<Error>()) {
        match e.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            _ => Error::Io(io::Error::other("error lost while unwrapping")),
        }
    } else {
        Error::Io(e)
    }
}
