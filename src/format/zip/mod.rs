//! Zip codec.
//!
//! Reads stored and deflated entries (including zip64 archives and archives
//! with a self-extractor stub in front), and rewrites containers without
//! recompressing untouched entries.

mod method;
mod reader;
mod structures;
mod writer;

use std::io::Write;

use super::{
    ArchiveCodec, CodecOptions, ContainerFormat, EntryInfo, EntryVisitor, RewriteSummary, not_found,
};
use crate::edit::EntryEdit;
use crate::progress::ProgressReporter;
use crate::{EntryPath, Result};

use reader::ZipArchive;

/// The zip [`ArchiveCodec`].
#[derive(Debug, Clone, Copy)]
pub struct ZipCodec {
    options: CodecOptions,
}

impl ZipCodec {
    /// Creates a zip codec.
    pub fn new(options: CodecOptions) -> Self {
        Self { options }
    }
}

impl Default for ZipCodec {
    fn default() -> Self {
        Self::new(CodecOptions::default())
    }
}

impl ArchiveCodec for ZipCodec {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Zip
    }

    fn list(&self, container: &[u8]) -> Result<Vec<EntryInfo>> {
        let archive = ZipArchive::parse(container)?;
        Ok(archive.entries.iter().filter_map(reader::entry_info).collect())
    }

    fn extract(&self, container: &[u8], entry: &EntryPath) -> Result<Vec<u8>> {
        let archive = ZipArchive::parse(container)?;
        let index = archive.position(entry.as_str()).ok_or_else(|| not_found(entry))?;
        reader::extract(container, &archive.entries[index], self.options.max_entry_size)
    }

    fn for_each_entry(&self, container: &[u8], visit: &mut EntryVisitor<'_>) -> Result<()> {
        let archive = ZipArchive::parse(container)?;
        for entry in &archive.entries {
            let Some(info) = reader::entry_info(entry) else {
                continue;
            };
            visit(&info, &|| reader::extract(container, entry, self.options.max_entry_size))?;
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
        writer::rewrite(container, edits, self.options.compression_level, out, progress)
    }
}
