//! Zip on-disk records.
//!
//! All multi-byte fields are little-endian. Offsets stored in records are
//! relative to the start of the zip data, which is not the start of the file
//! for self-extracting archives; the reader corrects for that.

use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::timestamp::DosDateTime;
use crate::{Error, Result};

pub(crate) const LFH_SIGNATURE: &[u8; 4] = b"PK\x03\x04";
pub(crate) const CDFH_SIGNATURE: &[u8; 4] = b"PK\x01\x02";
pub(crate) const EOCD_SIGNATURE: &[u8; 4] = b"PK\x05\x06";
pub(crate) const ZIP64_EOCD_SIGNATURE: &[u8; 4] = b"PK\x06\x06";
pub(crate) const ZIP64_LOCATOR_SIGNATURE: &[u8; 4] = b"PK\x06\x07";

pub(crate) const LFH_SIZE: usize = 30;
pub(crate) const CDFH_MIN_SIZE: usize = 46;
pub(crate) const EOCD_SIZE: usize = 22;
pub(crate) const ZIP64_LOCATOR_SIZE: usize = 20;
pub(crate) const ZIP64_EOCD_MIN_SIZE: usize = 56;

pub(crate) const METHOD_STORED: u16 = 0;
pub(crate) const METHOD_DEFLATE: u16 = 8;

/// General purpose bit flags.
pub(crate) mod flags {
    pub(crate) const ENCRYPTED: u16 = 0x0001;
    pub(crate) const DATA_DESCRIPTOR: u16 = 0x0008;
    pub(crate) const UTF8: u16 = 0x0800;
}

const ZIP64_EXTRA_ID: u16 = 0x0001;

/// Version needed to extract: 1.0 for stored, 2.0 for deflate/directories.
pub(crate) fn version_needed(method: u16) -> u16 {
    if method == METHOD_STORED { 10 } else { 20 }
}

/// Returns `data[offset..offset + len]` or a truncation error.
pub(crate) fn slice_at<'a>(data: &'a [u8], offset: u64, len: u64, what: &str) -> Result<&'a [u8]> {
    let range = usize::try_from(offset)
        .ok()
        .zip(usize::try_from(len).ok())
        .and_then(|(start, len)| Some(start..start.checked_add(len)?));
    range
        .and_then(|r| data.get(r))
        .ok_or_else(|| Error::corrupt(offset, format!("truncated {}", what)))
}

/// End of central directory record.
#[derive(Debug, Clone)]
pub(crate) struct EndOfCentralDirectory {
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment: Vec<u8>,
}

impl EndOfCentralDirectory {
    /// Parses the record at `offset`; the comment is clamped to the data.
    pub(crate) fn parse(data: &[u8], offset: u64) -> Result<Self> {
        let fixed = slice_at(data, offset, EOCD_SIZE as u64, "end of central directory")?;
        if &fixed[..4] != EOCD_SIGNATURE {
            return Err(Error::corrupt(offset, "bad end of central directory signature"));
        }
        let mut c = Cursor::new(&fixed[4..]);
        let _disk_number = c.read_u16::<LittleEndian>()?;
        let _disk_with_cd = c.read_u16::<LittleEndian>()?;
        let disk_entries = c.read_u16::<LittleEndian>()?;
        let total_entries = c.read_u16::<LittleEndian>()?;
        let cd_size = c.read_u32::<LittleEndian>()?;
        let cd_offset = c.read_u32::<LittleEndian>()?;
        let comment_len = c.read_u16::<LittleEndian>()? as usize;

        let comment_start = offset as usize + EOCD_SIZE;
        let comment_end = (comment_start + comment_len).min(data.len());
        Ok(Self {
            disk_entries,
            total_entries,
            cd_size,
            cd_offset,
            comment: data[comment_start..comment_end].to_vec(),
        })
    }

    pub(crate) fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFF_FFFF
            || self.cd_offset == 0xFFFF_FFFF
    }

    pub(crate) fn write(&self, out: &mut dyn Write) -> std::io::Result<()> {
        out.write_all(EOCD_SIGNATURE)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(self.disk_entries)?;
        out.write_u16::<LittleEndian>(self.total_entries)?;
        out.write_u32::<LittleEndian>(self.cd_size)?;
        out.write_u32::<LittleEndian>(self.cd_offset)?;
        out.write_u16::<LittleEndian>(self.comment.len() as u16)?;
        out.write_all(&self.comment)
    }
}

/// Zip64 end of central directory locator.
pub(crate) struct Zip64Locator {
    pub eocd64_offset: u64,
}

impl Zip64Locator {
    pub(crate) fn parse(data: &[u8], offset: u64) -> Result<Option<Self>> {
        let Ok(fixed) = slice_at(data, offset, ZIP64_LOCATOR_SIZE as u64, "zip64 locator") else {
            return Ok(None);
        };
        if &fixed[..4] != ZIP64_LOCATOR_SIGNATURE {
            return Ok(None);
        }
        let mut c = Cursor::new(&fixed[4..]);
        let _disk_with_eocd64 = c.read_u32::<LittleEndian>()?;
        let eocd64_offset = c.read_u64::<LittleEndian>()?;
        Ok(Some(Self { eocd64_offset }))
    }
}

/// Zip64 end of central directory record.
pub(crate) struct Zip64EndOfCentralDirectory {
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EndOfCentralDirectory {
    pub(crate) fn parse(data: &[u8], offset: u64) -> Result<Self> {
        let fixed = slice_at(data, offset, ZIP64_EOCD_MIN_SIZE as u64, "zip64 end of central directory")?;
        if &fixed[..4] != ZIP64_EOCD_SIGNATURE {
            return Err(Error::corrupt(offset, "bad zip64 end of central directory signature"));
        }
        let mut c = Cursor::new(&fixed[4..]);
        let _record_size = c.read_u64::<LittleEndian>()?;
        let _version_made_by = c.read_u16::<LittleEndian>()?;
        let _version_needed = c.read_u16::<LittleEndian>()?;
        let _disk_number = c.read_u32::<LittleEndian>()?;
        let _disk_with_cd = c.read_u32::<LittleEndian>()?;
        let _disk_entries = c.read_u64::<LittleEndian>()?;
        let total_entries = c.read_u64::<LittleEndian>()?;
        let cd_size = c.read_u64::<LittleEndian>()?;
        let cd_offset = c.read_u64::<LittleEndian>()?;
        Ok(Self {
            total_entries,
            cd_size,
            cd_offset,
        })
    }
}

/// A central directory file header.
#[derive(Debug, Clone)]
pub(crate) struct CentralEntry {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub modified: DosDateTime,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub internal_attr: u16,
    pub external_attr: u32,
    /// Offset of the local header, relative to the zip data start.
    pub lfh_offset: u64,
    pub raw_name: Vec<u8>,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
}

impl CentralEntry {
    /// Parses the header at `offset`, returning it and the offset of the
    /// next header.
    pub(crate) fn parse(data: &[u8], offset: u64) -> Result<(Self, u64)> {
        let fixed = slice_at(data, offset, CDFH_MIN_SIZE as u64, "central directory header")?;
        if &fixed[..4] != CDFH_SIGNATURE {
            return Err(Error::corrupt(offset, "bad central directory header signature"));
        }
        let mut c = Cursor::new(&fixed[4..]);
        let version_made_by = c.read_u16::<LittleEndian>()?;
        let version_needed = c.read_u16::<LittleEndian>()?;
        let flags = c.read_u16::<LittleEndian>()?;
        let method = c.read_u16::<LittleEndian>()?;
        let time = c.read_u16::<LittleEndian>()?;
        let date = c.read_u16::<LittleEndian>()?;
        let crc32 = c.read_u32::<LittleEndian>()?;
        let compressed_size = c.read_u32::<LittleEndian>()?;
        let uncompressed_size = c.read_u32::<LittleEndian>()?;
        let name_len = c.read_u16::<LittleEndian>()? as u64;
        let extra_len = c.read_u16::<LittleEndian>()? as u64;
        let comment_len = c.read_u16::<LittleEndian>()? as u64;
        let _disk_start = c.read_u16::<LittleEndian>()?;
        let internal_attr = c.read_u16::<LittleEndian>()?;
        let external_attr = c.read_u32::<LittleEndian>()?;
        let lfh_offset = c.read_u32::<LittleEndian>()?;

        let var_start = offset + CDFH_MIN_SIZE as u64;
        let raw_name = slice_at(data, var_start, name_len, "entry name")?.to_vec();
        let extra = slice_at(data, var_start + name_len, extra_len, "extra field")?.to_vec();
        let comment =
            slice_at(data, var_start + name_len + extra_len, comment_len, "entry comment")?.to_vec();

        let mut entry = Self {
            version_made_by,
            version_needed,
            flags,
            method,
            modified: DosDateTime { date, time },
            crc32,
            compressed_size: compressed_size as u64,
            uncompressed_size: uncompressed_size as u64,
            internal_attr,
            external_attr,
            lfh_offset: lfh_offset as u64,
            raw_name,
            extra,
            comment,
        };
        entry.apply_zip64_extra(offset)?;

        Ok((entry, var_start + name_len + extra_len + comment_len))
    }

    /// Replaces saturated 32-bit fields with their zip64 extra values.
    fn apply_zip64_extra(&mut self, header_offset: u64) -> Result<()> {
        let needs_usize = self.uncompressed_size == 0xFFFF_FFFF;
        let needs_csize = self.compressed_size == 0xFFFF_FFFF;
        let needs_offset = self.lfh_offset == 0xFFFF_FFFF;
        if !(needs_usize || needs_csize || needs_offset) {
            return Ok(());
        }
        let Some(field) = find_extra(&self.extra, ZIP64_EXTRA_ID) else {
            return Err(Error::corrupt(header_offset, "missing zip64 extra field"));
        };
        let mut c = Cursor::new(field);
        let mut next = |present: bool, current: u64| -> Result<u64> {
            if !present {
                return Ok(current);
            }
            c.read_u64::<LittleEndian>()
                .map_err(|_| Error::corrupt(header_offset, "short zip64 extra field"))
        };
        self.uncompressed_size = next(needs_usize, self.uncompressed_size)?;
        self.compressed_size = next(needs_csize, self.compressed_size)?;
        self.lfh_offset = next(needs_offset, self.lfh_offset)?;
        Ok(())
    }

    pub(crate) fn is_encrypted(&self) -> bool {
        self.flags & flags::ENCRYPTED != 0
    }

    /// Directory entries end with a slash, or carry the DOS directory
    /// attribute.
    pub(crate) fn is_directory(&self) -> bool {
        matches!(self.raw_name.last(), Some(b'/') | Some(b'\\'))
            || (self.version_made_by >> 8 == 0 && self.external_attr & 0x10 != 0)
    }

    /// Decodes the stored name.
    pub(crate) fn name(&self) -> String {
        if self.flags & flags::UTF8 != 0 {
            String::from_utf8_lossy(&self.raw_name).into_owned()
        } else {
            crate::format::decode_legacy_name(&self.raw_name)
        }
    }

    /// Writes this entry as a central directory header.
    ///
    /// Sizes and offset must fit 32 bits; callers check.
    pub(crate) fn write_central(&self, out: &mut dyn Write) -> std::io::Result<()> {
        out.write_all(CDFH_SIGNATURE)?;
        out.write_u16::<LittleEndian>(self.version_made_by)?;
        out.write_u16::<LittleEndian>(self.version_needed)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        out.write_u16::<LittleEndian>(self.method)?;
        out.write_u16::<LittleEndian>(self.modified.time)?;
        out.write_u16::<LittleEndian>(self.modified.date)?;
        out.write_u32::<LittleEndian>(self.crc32)?;
        out.write_u32::<LittleEndian>(self.compressed_size as u32)?;
        out.write_u32::<LittleEndian>(self.uncompressed_size as u32)?;
        out.write_u16::<LittleEndian>(self.raw_name.len() as u16)?;
        out.write_u16::<LittleEndian>(self.extra.len() as u16)?;
        out.write_u16::<LittleEndian>(self.comment.len() as u16)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(self.internal_attr)?;
        out.write_u32::<LittleEndian>(self.external_attr)?;
        out.write_u32::<LittleEndian>(self.lfh_offset as u32)?;
        out.write_all(&self.raw_name)?;
        out.write_all(&self.extra)?;
        out.write_all(&self.comment)
    }

    /// Writes the matching local file header.
    pub(crate) fn write_local(&self, local_extra: &[u8], out: &mut dyn Write) -> std::io::Result<()> {
        out.write_all(LFH_SIGNATURE)?;
        out.write_u16::<LittleEndian>(self.version_needed)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        out.write_u16::<LittleEndian>(self.method)?;
        out.write_u16::<LittleEndian>(self.modified.time)?;
        out.write_u16::<LittleEndian>(self.modified.date)?;
        out.write_u32::<LittleEndian>(self.crc32)?;
        out.write_u32::<LittleEndian>(self.compressed_size as u32)?;
        out.write_u32::<LittleEndian>(self.uncompressed_size as u32)?;
        out.write_u16::<LittleEndian>(self.raw_name.len() as u16)?;
        out.write_u16::<LittleEndian>(local_extra.len() as u16)?;
        out.write_all(&self.raw_name)?;
        out.write_all(local_extra)
    }

    /// Bytes the local header written by [`write_local`](Self::write_local)
    /// occupies.
    pub(crate) fn local_header_len(&self, local_extra: &[u8]) -> u64 {
        (LFH_SIZE + self.raw_name.len() + local_extra.len()) as u64
    }
}

/// A local file header, reduced to what locating the data needs.
pub(crate) struct LocalHeader {
    pub extra: Vec<u8>,
    pub data_offset: u64,
}

impl LocalHeader {
    pub(crate) fn parse(data: &[u8], offset: u64) -> Result<Self> {
        let fixed = slice_at(data, offset, LFH_SIZE as u64, "local file header")?;
        if &fixed[..4] != LFH_SIGNATURE {
            return Err(Error::corrupt(offset, "bad local file header signature"));
        }
        let mut c = Cursor::new(&fixed[26..]);
        let name_len = c.read_u16::<LittleEndian>()? as u64;
        let extra_len = c.read_u16::<LittleEndian>()? as u64;
        let extra_start = offset + LFH_SIZE as u64 + name_len;
        let extra = slice_at(data, extra_start, extra_len, "local extra field")?.to_vec();
        Ok(Self {
            extra,
            data_offset: extra_start + extra_len,
        })
    }
}

/// Returns the payload of the first extra record with `id`.
fn find_extra(extra: &[u8], id: u16) -> Option<&[u8]> {
    extra_records(extra).find(|(rid, _)| *rid == id).map(|(_, d)| d)
}

fn extra_records(extra: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        let header = extra.get(pos..pos + 4)?;
        let id = u16::from_le_bytes([header[0], header[1]]);
        let len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let body = extra.get(pos + 4..pos + 4 + len)?;
        pos += 4 + len;
        Some((id, body))
    })
}

/// Drops zip64 records from an extra field.
///
/// Rewritten containers are plain 32-bit zips, so a stale zip64 record
/// would contradict the header it is attached to.
pub(crate) fn strip_zip64_extra(extra: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(extra.len());
    for (id, body) in extra_records(extra) {
        if id == ZIP64_EXTRA_ID {
            continue;
        }
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(body.len() as u16).to_le_bytes());
        out.extend_from_slice(body);
    }
    out
}
