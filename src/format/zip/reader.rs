//! Zip central directory parsing and entry extraction.

use super::method;
use super::structures::{
    CentralEntry, EOCD_SIGNATURE, EOCD_SIZE, EndOfCentralDirectory, LocalHeader,
    ZIP64_EOCD_MIN_SIZE, ZIP64_LOCATOR_SIZE, Zip64EndOfCentralDirectory, Zip64Locator,
};
use crate::archive_path::normalize_name;
use crate::format::{CompressionMethod, EntryInfo};
use crate::{Error, Result};

/// Longest comment the end record can announce.
const MAX_COMMENT_LEN: usize = u16::MAX as usize;

/// A parsed zip container.
#[derive(Debug, Default)]
pub(crate) struct ZipArchive {
    /// Entries in central directory order, local header offsets already
    /// corrected to absolute positions.
    pub entries: Vec<CentralEntry>,
    /// The archive comment.
    pub comment: Vec<u8>,
}

impl ZipArchive {
    /// Parses a container. Zero-length data is an empty archive.
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }

        let eocd_offset = find_eocd(data)?;
        let eocd = EndOfCentralDirectory::parse(data, eocd_offset)?;

        let (total_entries, cd_size, cd_offset, cd_end) = if eocd.is_zip64() {
            let locator_offset = eocd_offset
                .checked_sub(ZIP64_LOCATOR_SIZE as u64)
                .ok_or_else(|| Error::corrupt(eocd_offset, "missing zip64 locator"))?;
            let locator = Zip64Locator::parse(data, locator_offset)?
                .ok_or_else(|| Error::corrupt(locator_offset, "missing zip64 locator"))?;
            // The locator's offset is relative to the zip data; try it as is
            // first, then where the record must be when nothing precedes it.
            let eocd64_offset = match Zip64EndOfCentralDirectory::parse(data, locator.eocd64_offset) {
                Ok(_) => locator.eocd64_offset,
                Err(_) => locator_offset
                    .checked_sub(ZIP64_EOCD_MIN_SIZE as u64)
                    .ok_or_else(|| Error::corrupt(locator_offset, "missing zip64 end record"))?,
            };
            let eocd64 = Zip64EndOfCentralDirectory::parse(data, eocd64_offset)?;
            (eocd64.total_entries, eocd64.cd_size, eocd64.cd_offset, eocd64_offset)
        } else {
            (
                eocd.total_entries as u64,
                eocd.cd_size as u64,
                eocd.cd_offset as u64,
                eocd_offset,
            )
        };

        // Self-extracting archives have a stub in front of the zip data; the
        // recorded offsets do not count it.
        let actual_cd_start = cd_end
            .checked_sub(cd_size)
            .ok_or_else(|| Error::corrupt(cd_end, "central directory size exceeds archive"))?;
        let base = actual_cd_start.checked_sub(cd_offset).unwrap_or(0);
        if base > 0 {
            log::debug!("zip data starts at offset {} (self-extracting stub)", base);
        }

        let mut entries = Vec::with_capacity(total_entries.min(65_536) as usize);
        let mut pos = cd_offset + base;
        for _ in 0..total_entries {
            let (mut entry, next) = CentralEntry::parse(data, pos)?;
            entry.lfh_offset += base;
            entries.push(entry);
            pos = next;
        }

        Ok(Self {
            entries,
            comment: eocd.comment,
        })
    }

    /// Finds the first file entry whose normalized name is `path`.
    pub(crate) fn position(&self, path: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !e.is_directory() && normalize_name(&e.name()) == path)
    }
}

/// Scans backwards for the end of central directory record.
///
/// A record whose comment length reaches exactly to the end of the data is
/// preferred; otherwise the last signature found is taken, which tolerates
/// trailing garbage.
fn find_eocd(data: &[u8]) -> Result<u64> {
    if data.len() < EOCD_SIZE {
        return Err(Error::corrupt(0, "too short for a zip archive"));
    }
    let last = data.len() - EOCD_SIZE;
    let first = last.saturating_sub(MAX_COMMENT_LEN);
    let mut fallback = None;
    for pos in (first..=last).rev() {
        if &data[pos..pos + 4] != EOCD_SIGNATURE {
            continue;
        }
        let comment_len = u16::from_le_bytes([data[pos + 20], data[pos + 21]]) as usize;
        if pos + EOCD_SIZE + comment_len == data.len() {
            return Ok(pos as u64);
        }
        fallback.get_or_insert(pos as u64);
    }
    fallback.ok_or_else(|| Error::corrupt(data.len() as u64, "end of central directory not found"))
}

/// Returns the raw (possibly compressed) data of an entry.
pub(crate) fn raw_data<'a>(data: &'a [u8], entry: &CentralEntry) -> Result<&'a [u8]> {
    let local = LocalHeader::parse(data, entry.lfh_offset)?;
    super::structures::slice_at(data, local.data_offset, entry.compressed_size, "entry data")
}

/// Extracts and verifies an entry.
pub(crate) fn extract(data: &[u8], entry: &CentralEntry, limit: u64) -> Result<Vec<u8>> {
    if entry.is_encrypted() {
        return Err(Error::UnsupportedCompressionMethod {
            method: "encrypted zip entry".into(),
        });
    }
    if entry.uncompressed_size > limit {
        return Err(Error::ResourceLimitExceeded(format!(
            "Entry size {} exceeds limit {}",
            entry.uncompressed_size, limit
        )));
    }
    let raw = raw_data(data, entry)?;
    let out = method::decode(entry.method, raw, entry.uncompressed_size, limit)?;

    if out.len() as u64 != entry.uncompressed_size {
        return Err(Error::corrupt(
            entry.lfh_offset,
            format!(
                "size mismatch for '{}': header says {}, got {}",
                entry.name(),
                entry.uncompressed_size,
                out.len()
            ),
        ));
    }
    let crc = crc32fast::hash(&out);
    if crc != entry.crc32 {
        return Err(Error::corrupt(
            entry.lfh_offset,
            format!(
                "CRC mismatch for '{}': expected {:08x}, got {:08x}",
                entry.name(),
                entry.crc32,
                crc
            ),
        ));
    }
    Ok(out)
}

/// Converts a central entry into the codec-neutral listing form.
///
/// Returns `None` for names that normalize to nothing (`/`, `./`).
pub(crate) fn entry_info(entry: &CentralEntry) -> Option<EntryInfo> {
    let raw_name = entry.name();
    let path = normalize_name(&raw_name);
    if path.is_empty() {
        return None;
    }
    Some(EntryInfo {
        path,
        raw_name,
        size: entry.uncompressed_size,
        compressed_size: entry.compressed_size,
        last_modified: Some(entry.modified.to_system_time()),
        is_directory: entry.is_directory(),
        method: match entry.method {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            other => CompressionMethod::Other(other),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_data_is_empty_archive() {
        let archive = ZipArchive::parse(&[]).unwrap();
        assert!(archive.entries.is_empty());
        assert!(archive.comment.is_empty());
    }

    #[test]
    fn test_minimal_empty_zip() {
        let mut data = b"PK\x05\x06".to_vec();
        data.extend_from_slice(&[0; 18]);
        let archive = ZipArchive::parse(&data).unwrap();
        assert!(archive.entries.is_empty());
    }

    #[test]
    fn test_empty_zip_with_comment() {
        let mut data = b"PK\x05\x06".to_vec();
        data.extend_from_slice(&[0; 16]);
        data.extend_from_slice(&5u16.to_le_bytes());
        data.extend_from_slice(b"hello");
        let archive = ZipArchive::parse(&data).unwrap();
        assert_eq!(archive.comment, b"hello");
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let err = ZipArchive::parse(b"this is definitely not a zip archive").unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_short_data_is_corrupt() {
        let err = ZipArchive::parse(b"PK").unwrap_err();
        assert!(err.is_corruption());
    }
}
