//! Zip container rewriting.
//!
//! A rewrite streams a complete new container: every surviving entry is
//! copied as raw compressed bytes (no recompression), edited entries are
//! re-encoded in position, new entries follow, then a fresh central
//! directory. Output is always a 32-bit zip.

use std::io::{self, Write};

use super::method;
use super::reader::ZipArchive;
use super::structures::{
    CentralEntry, EndOfCentralDirectory, LocalHeader, METHOD_STORED, flags, slice_at,
    strip_zip64_extra, version_needed,
};
use crate::archive_path::normalize_name;
use crate::edit::EntryEdit;
use crate::format::{RewriteSummary, dedupe_edits};
use crate::progress::{ProgressReporter, RewriteTicker};
use crate::timestamp::DosDateTime;
use crate::{Error, Result};

/// Version made by: Unix host, APPNOTE 2.0.
const VERSION_MADE_BY_UNIX: u16 = (3 << 8) | 20;
/// Regular file, mode 0644.
const DEFAULT_EXTERNAL_ATTR: u32 = 0o100644 << 16;

enum Slot<'a> {
    Keep(&'a CentralEntry),
    Replace(&'a CentralEntry, &'a EntryEdit),
    Add(&'a EntryEdit),
}

/// Tracks the output position for header offsets.
struct CountingWriter<'a> {
    inner: &'a mut dyn Write,
    count: u64,
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn zip64_unsupported() -> Error {
    Error::UnsupportedFeature {
        feature: "zip64 writing",
    }
}

fn check_fits(header: &CentralEntry) -> Result<()> {
    let limit = u32::MAX as u64;
    if header.compressed_size >= limit || header.uncompressed_size >= limit || header.lfh_offset >= limit {
        return Err(zip64_unsupported());
    }
    Ok(())
}

/// Builds the output plan: existing entries in order with edits replacing
/// the first match, then unmatched edits.
fn plan<'a>(archive: &'a ZipArchive, edits: &[&'a EntryEdit]) -> Vec<Slot<'a>> {
    let mut used = vec![false; edits.len()];
    let mut slots = Vec::with_capacity(archive.entries.len() + edits.len());
    for entry in &archive.entries {
        let hit = if entry.is_directory() {
            None
        } else {
            let path = normalize_name(&entry.name());
            edits.iter().position(|e| e.path.as_str() == path)
        };
        match hit {
            Some(i) if used[i] => {
                log::debug!("dropping duplicate zip entry '{}'", edits[i].path);
            }
            Some(i) => {
                used[i] = true;
                slots.push(Slot::Replace(entry, edits[i]));
            }
            None => slots.push(Slot::Keep(entry)),
        }
    }
    for (edit, used) in edits.iter().zip(used) {
        if !used {
            slots.push(Slot::Add(*edit));
        }
    }
    slots
}

/// Header for freshly encoded data, based on `template` when replacing.
fn encoded_header(template: Option<&CentralEntry>, edit: &EntryEdit, encoded: &method::Encoded, offset: u64) -> CentralEntry {
    let name = edit.path.as_str();
    let mut header = match template {
        Some(existing) => {
            let mut h = existing.clone();
            h.flags &= !(flags::DATA_DESCRIPTOR | flags::ENCRYPTED);
            h.extra = Vec::new();
            h
        }
        None => CentralEntry {
            version_made_by: VERSION_MADE_BY_UNIX,
            version_needed: 0,
            flags: if name.is_ascii() { 0 } else { flags::UTF8 },
            method: 0,
            modified: DosDateTime::MIN,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            internal_attr: 0,
            external_attr: DEFAULT_EXTERNAL_ATTR,
            lfh_offset: 0,
            raw_name: name.as_bytes().to_vec(),
            extra: Vec::new(),
            comment: Vec::new(),
        },
    };
    header.method = encoded.method;
    header.version_needed = version_needed(encoded.method);
    header.modified = DosDateTime::now();
    header.crc32 = crc32fast::hash(&edit.data);
    header.compressed_size = encoded.data.len() as u64;
    header.uncompressed_size = edit.data.len() as u64;
    header.lfh_offset = offset;
    header
}

/// Writes a new container built from `data` and `edits` to `out`.
pub(crate) fn rewrite(
    data: &[u8],
    edits: &[EntryEdit],
    compression_level: u32,
    out: &mut dyn Write,
    progress: &mut dyn ProgressReporter,
) -> Result<RewriteSummary> {
    let archive = ZipArchive::parse(data)?;
    let edits = dedupe_edits(edits);
    let slots = plan(&archive, &edits);

    let mut ticker = RewriteTicker::new(progress, slots.len() as u64);
    let mut out = CountingWriter { inner: out, count: 0 };
    let mut central = Vec::with_capacity(slots.len());
    let mut summary = RewriteSummary::default();

    for slot in &slots {
        let offset = out.count;
        let header = match slot {
            Slot::Keep(entry) => {
                ticker.begin(&entry.name(), entry.uncompressed_size)?;
                let local = LocalHeader::parse(data, entry.lfh_offset)?;
                let raw = slice_at(data, local.data_offset, entry.compressed_size, "entry data")?;
                let mut header = (*entry).clone();
                header.flags &= !flags::DATA_DESCRIPTOR;
                header.extra = strip_zip64_extra(&header.extra);
                header.lfh_offset = offset;
                check_fits(&header)?;
                header.write_local(&strip_zip64_extra(&local.extra), &mut out)?;
                out.write_all(raw)?;
                summary.entries_kept += 1;
                header
            }
            Slot::Replace(entry, edit) => {
                ticker.begin(edit.path.as_str(), edit.data.len() as u64)?;
                let encoded = method::encode(&edit.data, compression_level, entry.method == METHOD_STORED)?;
                let header = encoded_header(Some(*entry), edit, &encoded, offset);
                check_fits(&header)?;
                header.write_local(&[], &mut out)?;
                out.write_all(&encoded.data)?;
                summary.entries_replaced += 1;
                header
            }
            Slot::Add(edit) => {
                ticker.begin(edit.path.as_str(), edit.data.len() as u64)?;
                let encoded = method::encode(&edit.data, compression_level, false)?;
                let header = encoded_header(None, edit, &encoded, offset);
                check_fits(&header)?;
                header.write_local(&[], &mut out)?;
                out.write_all(&encoded.data)?;
                summary.entries_added += 1;
                header
            }
        };
        central.push(header);
        ticker.finish();
    }

    let cd_offset = out.count;
    for header in &central {
        header.write_central(&mut out)?;
    }
    let cd_size = out.count - cd_offset;
    if central.len() >= 0xFFFF || cd_offset >= u32::MAX as u64 || cd_size >= u32::MAX as u64 {
        return Err(zip64_unsupported());
    }

    EndOfCentralDirectory {
        disk_entries: central.len() as u16,
        total_entries: central.len() as u16,
        cd_size: cd_size as u32,
        cd_offset: cd_offset as u32,
        comment: archive.comment,
    }
    .write(&mut out)?;
    out.flush()?;

    summary.bytes_written = out.count;
    log::debug!(
        "zip rewrite: {} kept, {} replaced, {} added, {} bytes",
        summary.entries_kept,
        summary.entries_replaced,
        summary.entries_added,
        summary.bytes_written
    );
    Ok(summary)
}
