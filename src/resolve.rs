//! Logical path classification.
//!
//! A logical path is a filesystem path that may continue into archives:
//! `/library/books.zip/chapter1/page.xml` names `chapter1/page.xml` inside
//! `/library/books.zip`. Any non-terminal segment whose extension is a
//! registered archive extension is an archive boundary. Several boundaries
//! address nested archives.
//!
//! ```rust
//! use archfs::{PathKind, PathResolver, ResolverConfig};
//!
//! let resolver = PathResolver::new(ResolverConfig::default());
//!
//! let path = resolver.classify("/library/books.zip/chapter1/page.xml")?;
//! assert_eq!(path.kind(), PathKind::ArchiveEntry);
//! assert_eq!(path.container_path(), Some("/library/books.zip"));
//! assert_eq!(path.entry_paths()[0].as_str(), "chapter1/page.xml");
//!
//! // Ending at the archive itself addresses the file.
//! let path = resolver.classify("/library/books.zip")?;
//! assert_eq!(path.kind(), PathKind::Plain);
//! # Ok::<(), archfs::Error>(())
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::path::{MAIN_SEPARATOR, PathBuf};
use std::sync::Arc;

use crate::format::ContainerFormat;
use crate::{EntryPath, Error, ResolverConfig, Result};

fn is_separator(c: char) -> bool {
    c == '/' || c == MAIN_SEPARATOR
}

/// How a logical path is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// A file or directory on the real filesystem.
    Plain,
    /// An entry of an archive file.
    ArchiveEntry,
    /// An entry of an archive stored inside another archive.
    NestedArchiveEntry,
}

/// One archive boundary of a [`ResourcePath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary {
    /// Index of the archive's own segment.
    pub segment_index: usize,
    /// Format registered for the archive's extension.
    pub format: ContainerFormat,
    /// Path inside the archive, up to and including the next archive
    /// segment if there is one.
    pub entry: EntryPath,
}

/// Classifies logical paths.
///
/// Cheap to clone; clones share the configuration.
#[derive(Debug, Clone)]
pub struct PathResolver {
    config: Arc<ResolverConfig>,
}

impl PathResolver {
    /// Creates a resolver for the config's archive extensions.
    pub fn new(config: ResolverConfig) -> Self {
        Self::shared(Arc::new(config))
    }

    pub(crate) fn shared(config: Arc<ResolverConfig>) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Parses and classifies a logical path.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPathKind`] for the empty string, an archive segment
    /// followed by an empty segment, or `.`/`..` inside an entry path.
    pub fn classify(&self, path: &str) -> Result<ResourcePath> {
        if path.is_empty() {
            return Err(Error::invalid_path(path, "empty path"));
        }

        // One trailing separator is allowed and ignored.
        let mut analyzed = path;
        if analyzed.len() > 1 {
            if let Some(last) = analyzed.chars().next_back().filter(|c| is_separator(*c)) {
                analyzed = &analyzed[..analyzed.len() - last.len_utf8()];
            }
        }

        let mut segments: Vec<Range<usize>> = Vec::new();
        let mut archive_segments: Vec<(usize, ContainerFormat)> = Vec::new();
        let mut start = 0;
        let bounds = analyzed
            .char_indices()
            .filter(|(_, c)| is_separator(*c))
            .map(|(i, c)| (i, i + c.len_utf8()))
            .chain(std::iter::once((analyzed.len(), analyzed.len())));

        for (end, next) in bounds {
            let span = start..end;
            start = next;
            let text = &analyzed[span.clone()];
            let inside_archive = !archive_segments.is_empty();

            if text.is_empty() {
                if inside_archive {
                    return Err(Error::invalid_path(path, "empty segment after archive"));
                }
                continue;
            }
            if inside_archive && (text == "." || text == "..") {
                return Err(Error::invalid_path(
                    path,
                    format!("'{}' segment inside an archive", text),
                ));
            }
            if let Some(format) = self.config.format_for_name(text) {
                archive_segments.push((segments.len(), format));
            }
            segments.push(span);
        }

        // An archive named last is addressed as a plain file.
        if archive_segments
            .last()
            .is_some_and(|(index, _)| *index + 1 == segments.len())
        {
            archive_segments.pop();
        }

        let mut boundaries = Vec::with_capacity(archive_segments.len());
        for (k, (index, format)) in archive_segments.iter().enumerate() {
            let last = archive_segments
                .get(k + 1)
                .map_or(segments.len() - 1, |(next, _)| *next);
            let joined = segments[index + 1..=last]
                .iter()
                .map(|span| &analyzed[span.clone()])
                .collect::<Vec<_>>()
                .join("/");
            let entry = EntryPath::new(&joined).map_err(|e| match e {
                Error::InvalidPathKind { reason, .. } => Error::invalid_path(path, reason),
                other => other,
            })?;
            boundaries.push(Boundary {
                segment_index: *index,
                format: *format,
                entry,
            });
        }

        Ok(ResourcePath {
            original: path.to_string(),
            segments,
            boundaries,
            resolver: self.clone(),
        })
    }
}

/// A classified logical path.
///
/// Keeps the original string, so plain paths round-trip exactly.
#[derive(Clone)]
pub struct ResourcePath {
    original: String,
    segments: Vec<Range<usize>>,
    boundaries: Vec<Boundary>,
    resolver: PathResolver,
}

impl ResourcePath {
    /// Returns the path as given.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Returns the classification.
    pub fn kind(&self) -> PathKind {
        match self.boundaries.len() {
            0 => PathKind::Plain,
            1 => PathKind::ArchiveEntry,
            _ => PathKind::NestedArchiveEntry,
        }
    }

    /// Returns the non-empty segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|span| &self.original[span.clone()])
    }

    /// Returns the byte range of segment `index` in [`as_str`](Self::as_str).
    pub fn segment_span(&self, index: usize) -> Option<Range<usize>> {
        self.segments.get(index).cloned()
    }

    /// Returns the archive boundaries, outermost first.
    pub fn boundaries(&self) -> &[Boundary] {
        &self.boundaries
    }

    /// Returns the filesystem path of the outermost archive.
    ///
    /// `None` for plain paths.
    pub fn container_path(&self) -> Option<&str> {
        let first = self.boundaries.first()?;
        let span = &self.segments[first.segment_index];
        Some(&self.original[..span.end])
    }

    /// Returns the entry path within each archive, outermost first.
    pub fn entry_paths(&self) -> Vec<&EntryPath> {
        self.boundaries.iter().map(|b| &b.entry).collect()
    }

    /// Returns the entry path within the innermost archive.
    pub fn innermost_entry(&self) -> Option<&EntryPath> {
        self.boundaries.last().map(|b| &b.entry)
    }

    /// Returns the last segment.
    pub fn file_name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Returns the filesystem path for plain paths.
    pub fn to_path_buf(&self) -> Option<PathBuf> {
        match self.kind() {
            PathKind::Plain => Some(PathBuf::from(&self.original)),
            _ => None,
        }
    }

    /// Returns the path without its last segment.
    ///
    /// The parent of an entry at an archive's top level is the archive
    /// file itself, classified as plain.
    pub fn parent(&self) -> Option<ResourcePath> {
        let last = self.segments.last()?;
        let head = self.original[..last.start].trim_end_matches(is_separator);
        let parent = if head.is_empty() {
            let root = &self.original[..last.start];
            if root.is_empty() {
                return None;
            }
            &root[..root.chars().next().map_or(0, char::len_utf8)]
        } else {
            head
        };
        self.resolver.classify(parent).ok()
    }

    /// Appends a relative path and classifies the result.
    pub fn join(&self, child: &str) -> Result<ResourcePath> {
        let child = child.trim_start_matches(is_separator);
        if child.is_empty() {
            return Err(Error::invalid_path(child, "empty child name"));
        }
        let base = self.original.trim_end_matches(is_separator);
        let joined = if base.is_empty() && self.original.starts_with(is_separator) {
            format!("/{}", child)
        } else {
            format!("{}/{}", base, child)
        };
        self.resolver.classify(&joined)
    }
}

impl fmt::Debug for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePath")
            .field("path", &self.original)
            .field("kind", &self.kind())
            .field("boundaries", &self.boundaries)
            .finish()
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl PartialEq for ResourcePath {
    fn eq(&self, other: &Self) -> bool {
        self.original == other.original
    }
}

impl Eq for ResourcePath {}

impl Hash for ResourcePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.original.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        PathResolver::new(ResolverConfig::default())
    }

    fn entries(path: &ResourcePath) -> Vec<&str> {
        path.entry_paths().into_iter().map(EntryPath::as_str).collect()
    }

    #[test]
    fn test_plain_paths() {
        for p in ["/library/notes.txt", "relative/dir", "/", "a//b", "/library/books.zip"] {
            let path = resolver().classify(p).unwrap();
            assert_eq!(path.kind(), PathKind::Plain, "{}", p);
            assert_eq!(path.as_str(), p);
            assert_eq!(path.to_string(), p);
        }
    }

    #[test]
    fn test_trailing_separator_after_archive_is_plain() {
        let path = resolver().classify("/library/books.zip/").unwrap();
        assert_eq!(path.kind(), PathKind::Plain);
        assert_eq!(path.as_str(), "/library/books.zip/");
    }

    #[test]
    fn test_archive_entry() {
        let path = resolver().classify("/library/books.zip/chapter1/page.xml").unwrap();
        assert_eq!(path.kind(), PathKind::ArchiveEntry);
        assert_eq!(path.container_path(), Some("/library/books.zip"));
        assert_eq!(entries(&path), vec!["chapter1/page.xml"]);
        assert_eq!(path.boundaries()[0].format, ContainerFormat::Zip);
        assert_eq!(path.boundaries()[0].segment_index, 1);
    }

    #[test]
    fn test_extension_is_case_insensitive() {
        let path = resolver().classify("comics/Issue1.CBR/p01.png").unwrap();
        assert_eq!(path.kind(), PathKind::ArchiveEntry);
        assert_eq!(path.boundaries()[0].format, ContainerFormat::Rar);
    }

    #[test]
    fn test_nested_archive_entry() {
        let path = resolver().classify("/data/outer.zip/sub/inner.cbz/page.txt").unwrap();
        assert_eq!(path.kind(), PathKind::NestedArchiveEntry);
        assert_eq!(path.container_path(), Some("/data/outer.zip"));
        assert_eq!(entries(&path), vec!["sub/inner.cbz", "page.txt"]);
        assert_eq!(path.innermost_entry().unwrap().as_str(), "page.txt");
    }

    #[test]
    fn test_invalid_paths() {
        for p in ["", "a.zip//b", "a.zip//", "a.zip/x/../y", "a.zip/./y"] {
            let err = resolver().classify(p).unwrap_err();
            assert!(matches!(err, Error::InvalidPathKind { .. }), "{}", p);
        }
    }

    #[test]
    fn test_dot_segments_allowed_before_archive() {
        let path = resolver().classify("../library/books.zip/a.xml").unwrap();
        assert_eq!(path.container_path(), Some("../library/books.zip"));
    }

    #[test]
    fn test_custom_extensions() {
        let config = ResolverConfig::new()
            .archive_extension("fb2.zip", ContainerFormat::Zip)
            .without_archive_extension("jar");
        let resolver = PathResolver::new(config);
        assert_eq!(resolver.classify("lib/app.jar/x").unwrap().kind(), PathKind::Plain);
        assert_eq!(
            resolver.classify("book.fb2.zip/book.fb2").unwrap().kind(),
            PathKind::ArchiveEntry
        );
    }

    #[test]
    fn test_parent_walks_out_of_archive() {
        let path = resolver().classify("/library/books.zip/meta/info.xml").unwrap();
        let parent = path.parent().unwrap();
        assert_eq!(parent.as_str(), "/library/books.zip/meta");
        assert_eq!(parent.kind(), PathKind::ArchiveEntry);
        let archive = parent.parent().unwrap();
        assert_eq!(archive.as_str(), "/library/books.zip");
        assert_eq!(archive.kind(), PathKind::Plain);
        assert_eq!(archive.parent().unwrap().as_str(), "/library");
        assert_eq!(resolver().classify("/library").unwrap().parent().unwrap().as_str(), "/");
        assert!(resolver().classify("/").unwrap().parent().is_none());
        assert!(resolver().classify("book.epub").unwrap().parent().is_none());
    }

    #[test]
    fn test_join_enters_archive() {
        let archive = resolver().classify("/library/books.zip").unwrap();
        let entry = archive.join("meta/info.xml").unwrap();
        assert_eq!(entry.kind(), PathKind::ArchiveEntry);
        assert_eq!(entries(&entry), vec!["meta/info.xml"]);
        assert_eq!(resolver().classify("/").unwrap().join("x").unwrap().as_str(), "/x");
        assert!(archive.join("").is_err());
    }

    #[test]
    fn test_segments_and_spans() {
        let path = resolver().classify("/a/b.zip/c").unwrap();
        assert_eq!(path.segments().collect::<Vec<_>>(), vec!["a", "b.zip", "c"]);
        assert_eq!(path.segment_span(1), Some(3..8));
        assert_eq!(path.file_name(), Some("c"));
    }
}
