//! RAR 5.0 block structure (read only).
//!
//! Each block is `CRC32 | header size (vint) | header`, where the header
//! starts with its type, flags, and optional extra-area and data sizes.
//! Variable-length integers store seven bits per byte, low bits first.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};

use super::{ENCRYPTED_ENTRY, RAR5_SIGNATURE};
use crate::archive_path::normalize_name;
use crate::format::{CompressionMethod, EntryInfo};
use crate::{Error, Result};

const HEAD_MAIN: u64 = 1;
const HEAD_FILE: u64 = 2;
const HEAD_ENCRYPTION: u64 = 4;
const HEAD_END: u64 = 5;

const HFL_EXTRA: u64 = 0x0001;
const HFL_DATA: u64 = 0x0002;
const HFL_SPLIT_BEFORE: u64 = 0x0008;
const HFL_SPLIT_AFTER: u64 = 0x0010;

const FHFL_DIRECTORY: u64 = 0x0001;
const FHFL_UTIME: u64 = 0x0002;
const FHFL_CRC32: u64 = 0x0004;

const EXTRA_ENCRYPTION: u64 = 0x01;

/// Cursor over a header, reporting truncation against the archive offset.
struct HeaderReader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> HeaderReader<'a> {
    fn new(buf: &'a [u8], base: usize) -> Self {
        Self { buf, pos: 0, base }
    }

    fn truncated(&self) -> Error {
        Error::corrupt((self.base + self.pos) as u64, "truncated RAR 5 header")
    }

    fn vint(&mut self) -> Result<u64> {
        let (value, len) = read_vint(&self.buf[self.pos.min(self.buf.len())..])
            .ok_or_else(|| self.truncated())?;
        self.pos += len;
        Ok(value)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let slice = self
            .pos
            .checked_add(len)
            .and_then(|end| self.buf.get(self.pos..end))
            .ok_or_else(|| self.truncated())?;
        self.pos += len;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        self.bytes(4).map(LittleEndian::read_u32)
    }
}

/// Decodes a vint, returning the value and its encoded length.
fn read_vint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &b) in buf.iter().enumerate().take(10) {
        value |= ((b & 0x7F) as u64) << (7 * i);
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

#[derive(Debug, Clone)]
pub(crate) struct FileHeader {
    pub name: String,
    pub is_directory: bool,
    pub unp_size: u64,
    pub pack_size: u64,
    pub modified: Option<SystemTime>,
    pub crc32: Option<u32>,
    pub method: u8,
    pub encrypted: bool,
    pub split: bool,
    pub data_offset: usize,
}

impl FileHeader {
    pub(crate) fn info(&self) -> Option<EntryInfo> {
        let path = normalize_name(&self.name);
        if path.is_empty() {
            return None;
        }
        Some(EntryInfo {
            path,
            raw_name: self.name.clone(),
            size: self.unp_size,
            compressed_size: self.pack_size,
            last_modified: self.modified,
            is_directory: self.is_directory,
            method: match self.method {
                0 => CompressionMethod::Stored,
                m => CompressionMethod::Other(m as u16),
            },
        })
    }
}

/// A parsed RAR 5 archive: its file headers in physical order.
#[derive(Debug)]
pub(crate) struct Rar5Archive {
    pub files: Vec<FileHeader>,
}

impl Rar5Archive {
    pub(crate) fn parse(data: &[u8], marker_offset: usize) -> Result<Self> {
        let mut pos = marker_offset + RAR5_SIGNATURE.len();
        let mut files = Vec::new();

        while pos < data.len() {
            let crc_bytes = data
                .get(pos..pos + 4)
                .ok_or_else(|| Error::corrupt(pos as u64, "truncated block"))?;
            let stored_crc = LittleEndian::read_u32(crc_bytes);
            let (header_size, size_len) = read_vint(&data[pos + 4..])
                .ok_or_else(|| Error::corrupt(pos as u64, "truncated header size"))?;
            let header_start = pos + 4 + size_len;
            let header = usize::try_from(header_size)
                .ok()
                .and_then(|size| data.get(header_start..header_start.checked_add(size)?))
                .ok_or_else(|| Error::corrupt(pos as u64, "truncated block header"))?;
            if crc32fast::hash(&data[pos + 4..header_start + header.len()]) != stored_crc {
                return Err(Error::corrupt(pos as u64, "block header CRC mismatch"));
            }

            let mut r = HeaderReader::new(header, header_start);
            let kind = r.vint()?;
            let flags = r.vint()?;
            let extra_size = if flags & HFL_EXTRA != 0 { r.vint()? } else { 0 };
            let data_size = if flags & HFL_DATA != 0 { r.vint()? } else { 0 };

            let data_offset = header_start + header.len();
            let block_end = usize::try_from(data_size)
                .ok()
                .and_then(|d| data_offset.checked_add(d))
                .filter(|&end| end <= data.len())
                .ok_or_else(|| Error::corrupt(pos as u64, "block data exceeds archive"))?;

            match kind {
                HEAD_ENCRYPTION => {
                    return Err(Error::UnsupportedFeature {
                        feature: "encrypted RAR headers",
                    });
                }
                HEAD_FILE => {
                    let extra_start = header
                        .len()
                        .checked_sub(extra_size as usize)
                        .ok_or_else(|| Error::corrupt(pos as u64, "extra area exceeds header"))?;
                    let mut file = parse_file_fields(&mut r)?;
                    file.encrypted = has_encryption_record(&header[extra_start..]);
                    file.split = flags & (HFL_SPLIT_BEFORE | HFL_SPLIT_AFTER) != 0;
                    file.pack_size = data_size;
                    file.data_offset = data_offset;
                    files.push(file);
                }
                HEAD_END => break,
                HEAD_MAIN => {}
                other => log::trace!("skipping RAR 5 block type {} at {}", other, pos),
            }
            pos = block_end;
        }

        Ok(Self { files })
    }

    pub(crate) fn list(&self) -> Vec<EntryInfo> {
        self.files.iter().filter_map(FileHeader::info).collect()
    }

    pub(crate) fn find(&self, path: &str) -> Option<&FileHeader> {
        self.files
            .iter()
            .find(|f| !f.is_directory && normalize_name(&f.name) == path)
    }
}

fn parse_file_fields(r: &mut HeaderReader<'_>) -> Result<FileHeader> {
    let file_flags = r.vint()?;
    let unp_size = r.vint()?;
    let _attributes = r.vint()?;
    let modified = if file_flags & FHFL_UTIME != 0 {
        Some(UNIX_EPOCH + Duration::from_secs(r.u32()? as u64))
    } else {
        None
    };
    let crc32 = if file_flags & FHFL_CRC32 != 0 {
        Some(r.u32()?)
    } else {
        None
    };
    let compression = r.vint()?;
    let _host_os = r.vint()?;
    let name_len = r.vint()? as usize;
    let name = String::from_utf8_lossy(r.bytes(name_len)?).into_owned();

    Ok(FileHeader {
        name,
        is_directory: file_flags & FHFL_DIRECTORY != 0,
        unp_size,
        pack_size: 0,
        modified,
        crc32,
        method: ((compression >> 7) & 0x07) as u8,
        encrypted: false,
        split: false,
        data_offset: 0,
    })
}

fn has_encryption_record(mut extra: &[u8]) -> bool {
    while let Some((size, len)) = read_vint(extra) {
        let Some(end) = usize::try_from(size).ok().and_then(|s| s.checked_add(len)) else {
            return false;
        };
        let Some(record) = extra.get(len..end) else {
            return false;
        };
        if matches!(read_vint(record), Some((EXTRA_ENCRYPTION, _))) {
            return true;
        }
        extra = &extra[end..];
    }
    false
}

/// Extracts a stored entry, verifying its CRC when one is recorded.
pub(crate) fn extract(data: &[u8], file: &FileHeader, limit: u64) -> Result<Vec<u8>> {
    if file.encrypted {
        return Err(Error::UnsupportedCompressionMethod {
            method: ENCRYPTED_ENTRY.into(),
        });
    }
    if file.split {
        return Err(Error::UnsupportedFeature {
            feature: "RAR entries split across volumes",
        });
    }
    if file.method != 0 {
        return Err(Error::UnsupportedCompressionMethod {
            method: format!("RAR 5 method {}", file.method),
        });
    }
    if file.unp_size > limit {
        return Err(Error::ResourceLimitExceeded(format!(
            "Entry size {} exceeds limit {}",
            file.unp_size, limit
        )));
    }
    if file.pack_size != file.unp_size {
        return Err(Error::corrupt(
            file.data_offset as u64,
            "stored entry with differing packed and unpacked sizes",
        ));
    }
    let out = data[file.data_offset..file.data_offset + file.pack_size as usize].to_vec();
    if let Some(expected) = file.crc32 {
        let crc = crc32fast::hash(&out);
        if crc != expected {
            return Err(Error::corrupt(
                file.data_offset as u64,
                format!(
                    "CRC mismatch for '{}': expected {:08x}, got {:08x}",
                    file.name, expected, crc
                ),
            ));
        }
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn vint(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let b = (v & 0x7F) as u8;
            v >>= 7;
            if v == 0 {
                out.push(b);
                return;
            }
            out.push(b | 0x80);
        }
    }

    fn block(header: &[u8], data: &[u8]) -> Vec<u8> {
        let mut size = Vec::new();
        vint(header.len() as u64, &mut size);
        let mut crc_input = size.clone();
        crc_input.extend_from_slice(header);
        let mut out = crc32fast::hash(&crc_input).to_le_bytes().to_vec();
        out.extend(crc_input);
        out.extend_from_slice(data);
        out
    }

    /// Builds a RAR 5 archive holding stored files.
    pub(crate) fn build_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = RAR5_SIGNATURE.to_vec();
        out.extend(block(&[HEAD_MAIN as u8, 0, 0], &[]));
        for (name, data) in files {
            let mut h = Vec::new();
            vint(HEAD_FILE, &mut h);
            vint(HFL_DATA, &mut h);
            vint(data.len() as u64, &mut h);
            vint(FHFL_UTIME | FHFL_CRC32, &mut h);
            vint(data.len() as u64, &mut h);
            vint(0x20, &mut h);
            h.extend_from_slice(&1_700_000_000u32.to_le_bytes());
            h.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
            vint(0, &mut h);
            vint(0, &mut h);
            vint(name.len() as u64, &mut h);
            h.extend_from_slice(name.as_bytes());
            out.extend(block(&h, data));
        }
        out.extend(block(&[HEAD_END as u8, 0, 0], &[]));
        out
    }

    #[test]
    fn test_read_vint() {
        assert_eq!(read_vint(&[0x05]), Some((5, 1)));
        assert_eq!(read_vint(&[0x80, 0x01]), Some((128, 2)));
        assert_eq!(read_vint(&[0x80]), None);
    }

    #[test]
    fn test_list_and_extract() {
        let archive_bytes = build_archive(&[("pages/01.png", b"png"), ("info.txt", b"hello")]);
        let archive = Rar5Archive::parse(&archive_bytes, 0).unwrap();
        let listed = archive.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, "pages/01.png");
        assert_eq!(
            listed[1].last_modified,
            Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
        );
        let file = archive.find("info.txt").unwrap();
        assert_eq!(extract(&archive_bytes, file, u64::MAX).unwrap(), b"hello");
    }

    #[test]
    fn test_crc_mismatch() {
        let mut archive_bytes = build_archive(&[("a.txt", b"hello")]);
        let archive = Rar5Archive::parse(&archive_bytes, 0).unwrap();
        let offset = archive.files[0].data_offset;
        archive_bytes[offset] ^= 0xFF;
        let archive = Rar5Archive::parse(&archive_bytes, 0).unwrap();
        let err = extract(&archive_bytes, &archive.files[0], u64::MAX).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_encryption_record() {
        let mut extra = Vec::new();
        vint(3, &mut extra);
        extra.extend_from_slice(&[EXTRA_ENCRYPTION as u8, 0, 0]);
        assert!(has_encryption_record(&extra));
        assert!(!has_encryption_record(&[]));
    }
}
