//! Container formats and the codec contract.
//!
//! An [`ArchiveCodec`] is a set of stateless functions over a container's raw
//! bytes: list the entries, extract one entry, and rewrite the container with
//! entries added or replaced. Two implementations exist:
//!
//! - [`zip::ZipCodec`] for zip based containers (`.zip`, `.epub`, `.cbz`, ...)
//! - [`rar::RarCodec`] for RAR 4 and RAR 5 containers (`.rar`, `.cbr`)
//!
//! Codecs never touch the filesystem. Making a rewrite atomic on disk is the
//! job of [`crate::edit`].
//!
//! # Example
//!
//! ```rust
//! use archfs::EntryPath;
//! use archfs::format::{CodecOptions, ContainerFormat, codec_for};
//!
//! let codec = codec_for(ContainerFormat::Zip, &CodecOptions::default());
//!
//! let mut container = Vec::new();
//! let entry = EntryPath::new("meta/info.xml")?;
//! let _summary = codec.append_or_replace(&[], &entry, &mut &b"<m/>"[..], &mut container)?;
//!
//! assert_eq!(codec.list(&container)?.len(), 1);
//! assert_eq!(codec.extract(&container, &entry)?, b"<m/>");
//! # Ok::<(), archfs::Error>(())
//! ```

pub mod detect;
pub mod rar;
pub mod zip;

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use crate::edit::EntryEdit;
use crate::progress::{NoProgress, ProgressReporter};
use crate::{EntryPath, Error, ResolverConfig, Result};

pub use detect::{detect_file, sniff};

/// The container formats this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    /// PKWARE zip (also EPUB, CBZ, JAR).
    Zip,
    /// RAR 1.5-4.x or RAR 5.
    Rar,
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zip => write!(f, "zip"),
            Self::Rar => write!(f, "rar"),
        }
    }
}

/// How an entry's data is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// Uncompressed.
    Stored,
    /// Raw deflate (zip method 8).
    Deflate,
    /// Anything else; the value is the format's native method number.
    Other(u16),
}

/// One entry as listed by a codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Normalized forward-slash path, without a trailing slash.
    pub path: String,
    /// The name as decoded from the container, before normalization.
    pub raw_name: String,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Stored (compressed) size in bytes.
    pub compressed_size: u64,
    /// Last modification time, if recorded.
    pub last_modified: Option<SystemTime>,
    /// Whether this entry is a directory marker.
    pub is_directory: bool,
    /// Compression method of the entry's data.
    pub method: CompressionMethod,
}

impl EntryInfo {
    /// Returns true if this is a file entry whose normalized path equals
    /// `entry`.
    pub fn matches(&self, entry: &EntryPath) -> bool {
        !self.is_directory && self.path == entry.as_str()
    }
}

/// Counts reported by a rewrite.
#[must_use = "rewrite summary should be checked to verify operation completed as expected"]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    /// Entries copied unchanged.
    pub entries_kept: usize,
    /// Entries whose data was replaced in position.
    pub entries_replaced: usize,
    /// Entries appended at the end.
    pub entries_added: usize,
    /// Size of the new container in bytes.
    pub bytes_written: u64,
}

impl RewriteSummary {
    /// Returns the number of entries in the new container.
    pub fn total_entries(&self) -> usize {
        self.entries_kept + self.entries_replaced + self.entries_added
    }
}

/// Options shared by all codecs.
#[derive(Debug, Clone, Copy)]
pub struct CodecOptions {
    /// Deflate level (0-9) for written zip entries.
    pub compression_level: u32,
    /// Largest entry that will be decompressed.
    pub max_entry_size: u64,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self::from(&ResolverConfig::default())
    }
}

impl From<&ResolverConfig> for CodecOptions {
    fn from(config: &ResolverConfig) -> Self {
        Self {
            compression_level: config.compression_level,
            max_entry_size: config.max_entry_size,
        }
    }
}

/// Callback of [`ArchiveCodec::for_each_entry`]: an entry's metadata and a
/// reader that decompresses its data on demand.
pub type EntryVisitor<'a> = dyn FnMut(&EntryInfo, &dyn Fn() -> Result<Vec<u8>>) -> Result<()> + 'a;

/// The codec contract.
///
/// All methods take the complete container as a byte slice. A zero-length
/// slice is an empty container: it lists nothing, and a rewrite of it
/// produces a brand new container.
pub trait ArchiveCodec: Send + Sync + fmt::Debug {
    /// The format this codec handles.
    fn format(&self) -> ContainerFormat;

    /// Lists entries in container-native physical order.
    fn list(&self, container: &[u8]) -> Result<Vec<EntryInfo>>;

    /// Extracts one entry's bytes, verifying its checksum.
    ///
    /// # Errors
    ///
    /// [`Error::EntryNotFound`] if no file entry normalizes to `entry`. The
    /// error's `container` field is left empty for the caller to fill in.
    fn extract(&self, container: &[u8], entry: &EntryPath) -> Result<Vec<u8>>;

    /// Visits every listed entry in physical order.
    ///
    /// Data is only decompressed when the visitor calls the reader. The
    /// default goes through [`extract`](Self::extract), which parses the
    /// container once per read; codecs override it to parse once in total.
    fn for_each_entry(&self, container: &[u8], visit: &mut EntryVisitor<'_>) -> Result<()> {
        for info in self.list(container)? {
            let read = || self.extract(container, &EntryPath::normalize(&info.path)?);
            visit(&info, &read)?;
        }
        Ok(())
    }

    /// Writes a new container to `out`: existing entries in their original
    /// order with edited ones replaced in position, then new entries.
    ///
    /// `progress` is consulted between entries.
    fn rewrite(
        &self,
        container: &[u8],
        edits: &[EntryEdit],
        out: &mut dyn Write,
        progress: &mut dyn ProgressReporter,
    ) -> Result<RewriteSummary>;

    /// Adds `entry`, or replaces it if present.
    fn append_or_replace(
        &self,
        container: &[u8],
        entry: &EntryPath,
        data: &mut dyn Read,
        out: &mut dyn Write,
    ) -> Result<RewriteSummary> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        let edits = [EntryEdit::new(entry.clone(), buf)];
        self.rewrite(container, &edits, out, &mut NoProgress)
    }
}

/// Returns the codec for `format`.
pub fn codec_for(format: ContainerFormat, options: &CodecOptions) -> Arc<dyn ArchiveCodec> {
    match format {
        ContainerFormat::Zip => Arc::new(zip::ZipCodec::new(*options)),
        ContainerFormat::Rar => Arc::new(rar::RarCodec::new(*options)),
    }
}

/// Finds the first file entry matching `entry`.
pub(crate) fn find_entry<'a>(entries: &'a [EntryInfo], entry: &EntryPath) -> Option<&'a EntryInfo> {
    entries.iter().find(|e| e.matches(entry))
}

/// Builds the "not found" error codecs return.
pub(crate) fn not_found(entry: &EntryPath) -> Error {
    Error::entry_not_found(String::new(), entry.as_str())
}

/// Collapses an edit list so each path appears once, last edit winning,
/// keeping the position of its first occurrence.
pub(crate) fn dedupe_edits(edits: &[EntryEdit]) -> Vec<&EntryEdit> {
    let mut out: Vec<&EntryEdit> = Vec::with_capacity(edits.len());
    for edit in edits {
        match out.iter_mut().find(|e| e.path == edit.path) {
            Some(slot) => *slot = edit,
            None => out.push(edit),
        }
    }
    out
}

/// Code page 437, bytes 0x80-0xFF.
const CP437_HIGH: &str = "ÇüéâäàåçêëèïîìÄÅÉæÆôöòûùÿÖÜ¢£¥₧ƒáíóúñÑªº¿⌐¬½¼¡«»░▒▓│┤╡╢╖╕╣║╗╝╜╛┐└┴┬├─┼╞╟╚╔╩╦╠═╬╧╨╤╥╙╘╒╓╫╪┘┌█▄▌▐▀αßΓπΣσµτΦΘΩδ∞φε∩≡±≥≤⌠⌡÷≈°∙·√ⁿ²■\u{a0}";

/// Decodes a legacy (non-UTF-8) entry name.
///
/// Valid UTF-8 is taken as is, since many writers emit UTF-8 without
/// setting the format's "names are UTF-8" flag. Anything else is read as
/// code page 437, the DOS default both zip and RAR 4 fall back to.
pub(crate) fn decode_legacy_name(raw: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(raw) {
        return s.to_string();
    }
    raw.iter()
        .map(|&b| {
            if b < 0x80 {
                b as char
            } else {
                CP437_HIGH.chars().nth((b - 0x80) as usize).unwrap_or('\u{fffd}')
            }
        })
        .collect()
}
