//! RAR codec.
//!
//! Lists RAR 1.5-4.x and RAR 5 archives and extracts entries written with
//! the "store" method. Writing produces stored RAR 4 blocks; a missing or
//! empty container becomes a new RAR 4 archive. Decompression of packed
//! entries is not provided.

mod rar4;
mod rar5;

use std::io::Write;

use super::{
    ArchiveCodec, CodecOptions, ContainerFormat, EntryInfo, EntryVisitor, RewriteSummary, not_found,
};
use crate::edit::EntryEdit;
use crate::progress::ProgressReporter;
use crate::{EntryPath, Error, Result};

use rar4::Rar4Archive;
use rar5::Rar5Archive;

pub(crate) const RAR4_SIGNATURE: &[u8] = b"Rar!\x1a\x07\x00";
pub(crate) const RAR5_SIGNATURE: &[u8] = b"Rar!\x1a\x07\x01\x00";

pub(crate) const ENCRYPTED_ENTRY: &str = "encrypted RAR entry";

/// How far into a file a self-extractor's marker is searched for.
const MAX_SFX_SIZE: usize = 1024 * 1024;

enum Parsed {
    Empty,
    V4(Rar4Archive),
    V5(Rar5Archive),
}

fn parse(container: &[u8]) -> Result<Parsed> {
    if container.is_empty() {
        return Ok(Parsed::Empty);
    }
    let window = &container[..container.len().min(MAX_SFX_SIZE)];
    let marker = window
        .windows(RAR4_SIGNATURE.len())
        .position(|w| w == RAR4_SIGNATURE || w.starts_with(&RAR5_SIGNATURE[..RAR4_SIGNATURE.len()]))
        .ok_or_else(|| Error::corrupt(0, "RAR signature not found"))?;
    if marker > 0 {
        log::debug!("RAR marker at offset {} (self-extracting stub)", marker);
    }
    if container[marker..].starts_with(RAR5_SIGNATURE) {
        Ok(Parsed::V5(Rar5Archive::parse(container, marker)?))
    } else if container[marker..].starts_with(RAR4_SIGNATURE) {
        Ok(Parsed::V4(Rar4Archive::parse(container, marker)?))
    } else {
        Err(Error::UnsupportedFeature {
            feature: "unknown RAR format version",
        })
    }
}

/// The RAR [`ArchiveCodec`].
#[derive(Debug, Clone, Copy)]
pub struct RarCodec {
    options: CodecOptions,
}

impl RarCodec {
    /// Creates a RAR codec.
    pub fn new(options: CodecOptions) -> Self {
        Self { options }
    }
}

impl Default for RarCodec {
    fn default() -> Self {
        Self::new(CodecOptions::default())
    }
}

impl ArchiveCodec for RarCodec {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Rar
    }

    fn list(&self, container: &[u8]) -> Result<Vec<EntryInfo>> {
        Ok(match parse(container)? {
            Parsed::Empty => Vec::new(),
            Parsed::V4(archive) => archive.list(),
            Parsed::V5(archive) => archive.list(),
        })
    }

    fn extract(&self, container: &[u8], entry: &EntryPath) -> Result<Vec<u8>> {
        let limit = self.options.max_entry_size;
        match parse(container)? {
            Parsed::Empty => Err(not_found(entry)),
            Parsed::V4(archive) => {
                let file = archive.find(entry.as_str()).ok_or_else(|| not_found(entry))?;
                rar4::extract(container, file, limit)
            }
            Parsed::V5(archive) => {
                let file = archive.find(entry.as_str()).ok_or_else(|| not_found(entry))?;
                rar5::extract(container, file, limit)
            }
        }
    }

    fn for_each_entry(&self, container: &[u8], visit: &mut EntryVisitor<'_>) -> Result<()> {
        let limit = self.options.max_entry_size;
        match parse(container)? {
            Parsed::Empty => {}
            Parsed::V4(archive) => {
                for file in archive.files() {
                    if let Some(info) = file.info() {
                        visit(&info, &|| rar4::extract(container, file, limit))?;
                    }
                }
            }
            Parsed::V5(archive) => {
                for file in &archive.files {
                    if let Some(info) = file.info() {
                        visit(&info, &|| rar5::extract(container, file, limit))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn rewrite(
        &self,
        container: &[u8],
        edits: &[EntryEdit],
        out: &mut dyn Write,
        progress: &mut dyn ProgressReporter,
    ) -> Result<RewriteSummary> {
        match parse(container)? {
            Parsed::Empty => rar4::rewrite(container, None, edits, out, progress),
            Parsed::V4(archive) => rar4::rewrite(container, Some(&archive), edits, out, progress),
            Parsed::V5(_) => Err(Error::UnsupportedFeature {
                feature: "writing RAR 5 archives",
            }),
        }
    }
}
