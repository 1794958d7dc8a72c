//! Entry path type with normalization for separator-agnostic lookups.

use crate::{Error, Result};
use std::fmt;

/// Maximum length for entry paths (in bytes).
///
/// Both zip and rar store name lengths in 16 bits, so nothing longer can be
/// written back into a container.
const MAX_PATH_LENGTH: usize = u16::MAX as usize;

/// Rewrites a stored entry name into forward-slash form.
///
/// Archives written on Windows frequently store `\` separators, and some
/// writers prefix names with `/` or `./`. Directory entries carry a
/// trailing slash that is dropped here; codecs report directories through a
/// separate flag.
///
/// This does not validate; see [`EntryPath::normalize`].
///
/// ```
/// use archfs::archive_path::normalize_name;
///
/// assert_eq!(normalize_name("OEBPS\\text\\ch1.xhtml"), "OEBPS/text/ch1.xhtml");
/// assert_eq!(normalize_name("./META-INF/"), "META-INF");
/// assert_eq!(normalize_name("/cover.jpg"), "cover.jpg");
/// ```
pub fn normalize_name(raw: &str) -> String {
    let mut name = raw.replace('\\', "/");
    loop {
        if let Some(rest) = name.strip_prefix("./") {
            name = rest.to_string();
        } else if let Some(rest) = name.strip_prefix('/') {
            name = rest.to_string();
        } else {
            break;
        }
    }
    while name.ends_with('/') {
        name.pop();
    }
    name
}

/// A validated path of an entry inside a container.
///
/// `EntryPath` always uses forward slashes and guarantees that:
/// - No NUL bytes are present
/// - The path is not empty and not absolute
/// - No empty segments exist (no `//` or trailing `/`)
/// - No `.` or `..` segments are present
///
/// # Examples
///
/// ```
/// use archfs::EntryPath;
///
/// let path = EntryPath::new("META-INF/container.xml").unwrap();
/// assert_eq!(path.as_str(), "META-INF/container.xml");
///
/// // Lenient construction accepts foreign separators
/// let path = EntryPath::normalize("OEBPS\\content.opf").unwrap();
/// assert_eq!(path.as_str(), "OEBPS/content.opf");
///
/// assert!(EntryPath::new("../secret").is_err());
/// assert!(EntryPath::new("/absolute/path").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryPath(String);

impl EntryPath {
    /// Creates a new `EntryPath` from a string already in forward-slash form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPathKind`] if the path:
    /// - Contains NUL bytes
    /// - Is an absolute path (starts with `/`)
    /// - Contains empty segments (e.g., `a//b`) or a trailing slash
    /// - Contains `.` or `..` segments
    /// - Is empty
    pub fn new(s: &str) -> Result<Self> {
        Self::validate(s)?;
        Ok(Self(s.to_string()))
    }

    /// Creates an `EntryPath` after applying [`normalize_name`].
    ///
    /// Use this for names read from containers and for user input that may
    /// carry platform separators.
    pub fn normalize(s: &str) -> Result<Self> {
        let normalized = normalize_name(s);
        Self::validate(&normalized).map_err(|e| match e {
            Error::InvalidPathKind { reason, .. } => Error::invalid_path(s, reason),
            other => other,
        })?;
        Ok(Self(normalized))
    }

    fn validate(s: &str) -> Result<()> {
        if s.contains('\0') {
            return Err(Error::invalid_path(s, "contains NUL byte"));
        }

        if s.is_empty() {
            return Err(Error::invalid_path(s, "empty entry path"));
        }

        if s.len() > MAX_PATH_LENGTH {
            return Err(Error::invalid_path(
                s,
                format!("entry path exceeds maximum length of {} bytes", MAX_PATH_LENGTH),
            ));
        }

        if s.starts_with('/') {
            return Err(Error::invalid_path(s, "absolute entry path not allowed"));
        }

        if s.ends_with('/') {
            return Err(Error::invalid_path(s, "trailing slash not allowed"));
        }

        for segment in s.split('/') {
            if segment.is_empty() {
                return Err(Error::invalid_path(s, "empty segment (consecutive slashes)"));
            }
            if segment == "." {
                return Err(Error::invalid_path(s, "'.' segment not allowed"));
            }
            if segment == ".." {
                return Err(Error::invalid_path(
                    s,
                    "'..' segment not allowed (path traversal)",
                ));
            }
        }

        Ok(())
    }

    /// Returns the path as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Joins this path with another segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting path would be invalid.
    pub fn join(&self, other: &str) -> Result<Self> {
        Self::new(&format!("{}/{}", self.0, other))
    }

    /// Returns the parent directory of this path, if any.
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rfind('/')
            .map(|idx| Self(self.0[..idx].to_string()))
    }

    /// Returns the file name (last segment) of this path.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Returns the file extension, if any.
    ///
    /// A leading dot does not start an extension (`.opf-hidden` has none).
    pub fn extension(&self) -> Option<&str> {
        let file_name = self.file_name();
        let dot_pos = file_name.rfind('.')?;
        if dot_pos == 0 {
            None
        } else {
            Some(&file_name[dot_pos + 1..])
        }
    }

    /// Returns an iterator over the path segments.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Returns true if `self` lies below the directory `dir`.
    ///
    /// This is a component-wise comparison: `"OEBPS/a.xhtml"` is inside
    /// `"OEBPS"` but not inside `"OEB"`.
    pub fn is_inside(&self, dir: &str) -> bool {
        let dir = dir.trim_end_matches('/');
        if dir.is_empty() {
            return true;
        }
        self.0.len() > dir.len() && self.0.starts_with(dir) && self.0.as_bytes()[dir.len()] == b'/'
    }
}

impl AsRef<str> for EntryPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for EntryPath {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for EntryPath {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}
